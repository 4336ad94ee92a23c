use crate::config::SchedulerSettings;
use crate::error::SyncError;
use crate::intake::UpdateTrigger;
use crate::models::{Account, AccountId};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

/// The per-account work a scheduled run performs.
#[async_trait]
pub trait AccountUpdater: Send + Sync {
    async fn accounts(&self) -> Result<Vec<Account>, SyncError>;
    async fn account(&self, id: AccountId) -> Result<Option<Account>, SyncError>;
    async fn update_account(&self, account: &Account) -> Result<(), SyncError>;
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

struct ScheduledJob {
    id: u64,
    fire_at: Instant,
    /// `None` runs every account.
    target: Option<AccountId>,
    /// Cancel and start race on this with compare-exchange; exactly one wins.
    state: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct JobSlot {
    current: Option<ScheduledJob>,
    /// Narrows the next scheduled run to one account. Consumed when a job is scheduled.
    target_account: Option<AccountId>,
    next_id: u64,
}

struct Inner {
    slot: Mutex<JobSlot>,
    updater: Arc<dyn AccountUpdater>,
    settings: SchedulerSettings,
    shut_down: AtomicBool,
}

/// Keeps at most one update job scheduled or running per process.
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<Inner>,
}

impl UpdateScheduler {
    pub fn new(updater: Arc<dyn AccountUpdater>, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(JobSlot::default()),
                updater,
                settings,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Schedules a run after the short coalescing delay. False if the live job could not be cancelled.
    pub fn schedule_soon(&self) -> bool {
        self.inner.try_schedule(self.inner.settings.soon_delay(), None)
    }

    pub fn schedule_steady(&self) -> bool {
        self.inner
            .try_schedule(self.inner.settings.steady_interval(), None)
    }

    /// Time until the pending job fires, if one is waiting.
    pub fn pending_delay(&self) -> Option<Duration> {
        let slot = self.inner.lock();
        slot.current
            .as_ref()
            .filter(|job| job.state.load(Ordering::SeqCst) == PENDING)
            .map(|job| job.fire_at.saturating_duration_since(Instant::now()))
    }

    pub fn is_running(&self) -> bool {
        let slot = self.inner.lock();
        slot.current
            .as_ref()
            .is_some_and(|job| job.state.load(Ordering::SeqCst) == RUNNING)
    }

    /// Drops the pending job and stops re-arming. A running job finishes its pass.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let mut slot = self.inner.lock();
        if let Some(job) = slot.current.take() {
            if job
                .state
                .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                job.handle.abort();
            } else {
                slot.current = Some(job);
            }
        }
        info!("Update scheduler shut down");
    }
}

impl UpdateTrigger for UpdateScheduler {
    fn request_update(&self, account_id: AccountId) -> bool {
        self.inner
            .try_schedule(self.inner.settings.soon_delay(), Some(account_id))
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, JobSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_schedule(self: &Arc<Self>, delay: Duration, account: Option<AccountId>) -> bool {
        let mut slot = self.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }

        let replaced_target = match self.try_cancel(&mut slot) {
            Ok(replaced) => replaced,
            Err(reason) => {
                debug!("Not rescheduling: live job is {}", reason);
                return false;
            }
        };

        if account.is_some() {
            slot.target_account = account;
        }
        let target = match (replaced_target, slot.target_account.take()) {
            // Two different accounts asked; cover both.
            (Some(previous), Some(requested)) if previous != requested => None,
            (_, requested) => requested,
        };

        self.spawn_job(&mut slot, delay, target);
        true
    }

    /// Clears the slot unless the live job is running or about to fire.
    /// On success returns the target of a cancelled pending job, if it had one.
    fn try_cancel(&self, slot: &mut JobSlot) -> Result<Option<AccountId>, &'static str> {
        let Some(job) = slot.current.as_ref() else {
            return Ok(None);
        };

        match job.state.load(Ordering::SeqCst) {
            RUNNING => return Err("running"),
            PENDING => {
                let remaining = job.fire_at.saturating_duration_since(Instant::now());
                if remaining <= self.settings.cancel_guard() {
                    return Err("about to fire");
                }
                if job
                    .state
                    .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err("starting");
                }
                job.handle.abort();
                debug!("Cancelled pending job {}", job.id);
            }
            _ => {}
        }

        Ok(slot.current.take().and_then(|job| job.target))
    }

    fn spawn_job(self: &Arc<Self>, slot: &mut JobSlot, delay: Duration, target: Option<AccountId>) {
        slot.next_id += 1;
        let id = slot.next_id;
        let fire_at = Instant::now() + delay;
        let state = Arc::new(AtomicU8::new(PENDING));

        let handle = tokio::spawn(Arc::clone(self).run_job(id, fire_at, target, Arc::clone(&state)));

        debug!(
            "Scheduled job {} in {:?} for {}",
            id,
            delay,
            target.map_or("all accounts".to_string(), |a| format!("account {a}"))
        );
        slot.current = Some(ScheduledJob {
            id,
            fire_at,
            target,
            state,
            handle,
        });
    }

    async fn run_job(
        self: Arc<Self>,
        id: u64,
        fire_at: Instant,
        target: Option<AccountId>,
        state: Arc<AtomicU8>,
    ) {
        sleep_until(fire_at).await;
        if state
            .compare_exchange(PENDING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("Update job {} started", id);
        if AssertUnwindSafe(self.run_accounts(target))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("Update job {} panicked outside any account", id);
        }
        state.store(DONE, Ordering::SeqCst);
        info!("Update job {} finished", id);

        self.rearm(id);
    }

    async fn run_accounts(&self, target: Option<AccountId>) {
        let accounts = match target {
            Some(account_id) => match self.updater.account(account_id).await {
                Ok(Some(account)) => vec![account],
                Ok(None) => {
                    warn!("{}", SyncError::UnknownAccount(account_id));
                    Vec::new()
                }
                Err(e) => {
                    error!("Could not load account {}: {}", account_id, e);
                    Vec::new()
                }
            },
            None => match self.updater.accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    error!("Could not load accounts: {}", e);
                    Vec::new()
                }
            },
        };

        for account in &accounts {
            let outcome = AssertUnwindSafe(self.updater.update_account(account))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => debug!("Updated {}", account.identity),
                Ok(Err(e)) if e.is_transient() => {
                    warn!("Update of {} failed, retrying next run: {}", account.identity, e)
                }
                Ok(Err(e)) => error!("Update of {} failed: {}", account.identity, e),
                Err(_) => error!("Update of {} panicked; skipping it this run", account.identity),
            }
        }
    }

    /// A finished job replaces itself with the next steady-state run.
    fn rearm(self: &Arc<Self>, finished: u64) {
        let mut slot = self.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if slot.current.as_ref().is_some_and(|job| job.id != finished) {
            return;
        }
        let target = slot.target_account.take();
        self.spawn_job(&mut slot, self.settings.steady_interval(), target);
    }
}

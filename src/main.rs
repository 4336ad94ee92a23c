use anyhow::Context;
use mailpulse::auth::{Authenticator, RingStorage};
use mailpulse::chart::{ChartAggregator, ChartView};
use mailpulse::config::{Config, SETTINGS_FILE};
use mailpulse::db::Database;
use mailpulse::gmail::{GmailProvider, SCOPES};
use mailpulse::intake::{
    NotificationIntake, NotificationSender, Reply, UpdateTrigger, notification_bus,
};
use mailpulse::models::Account;
use mailpulse::scheduler::UpdateScheduler;
use mailpulse::sync::MailboxSync;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, settings_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();
    if let Some(e) = settings_error {
        warn!("Ignoring {}: {}", SETTINGS_FILE, e);
    }

    if std::env::args().any(|arg| arg == "--reset-token") {
        RingStorage.clear_token()?;
        println!("Token cleared. Restart without --reset-token to authorize again.");
        return Ok(());
    }

    // Store first; nothing else starts without it.
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;

    let secret = Authenticator::load_secret(&config.client_secret_path).await?;
    let auth = Authenticator::authenticate(secret).await?;
    auth.token(SCOPES)
        .await
        .context("Authorization did not complete")?;

    let provider = Arc::new(GmailProvider::new());
    let (identity, current_history) = GmailProvider::profile(&auth).await?;
    let account = db
        .find_or_create_account(&identity, chrono::Utc::now().timestamp_millis())
        .await?;
    provider.register(&identity, auth);
    info!(
        "Monitoring {} (account {}, provider history {:?})",
        account.identity, account.id, current_history
    );

    let sync = Arc::new(MailboxSync::new(
        db.clone(),
        provider.clone(),
        config.sync.clone(),
    ));
    let scheduler = UpdateScheduler::new(sync, config.scheduler.clone());
    scheduler.schedule_soon();

    let intake = Arc::new(NotificationIntake::new(
        db.clone(),
        Arc::new(scheduler.clone()),
        config.sync.catch_up_threshold_ms,
    ));
    let (sender, deliveries) = notification_bus(64);
    let listener = tokio::spawn(intake.listen(deliveries));

    let chart = ChartAggregator::new(db.clone());
    let console = tokio::spawn(read_console(sender, chart, scheduler.clone(), account));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for ctrl-c")?;
            info!("Interrupted; shutting down");
        }
        _ = console => info!("Input closed; shutting down"),
    }

    scheduler.shutdown();
    listener.abort();
    Ok(())
}

/// Each stdin line is a notification payload, or one of `status`, `senders`, `chart`, `update`.
async fn read_console(
    sender: NotificationSender,
    chart: ChartAggregator,
    scheduler: UpdateScheduler,
    account: Account,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };
        let line = line.trim();

        match line {
            "" => {}
            "status" => match chart.status_report(account.id, scheduler.pending_delay()).await {
                Ok(report) => println!(
                    "last event: {}\nlast sample: {}\nnext update: {}",
                    report.since_last_event.as_deref().unwrap_or("never"),
                    report.since_last_sample.as_deref().unwrap_or("never"),
                    report.next_update_in.as_deref().unwrap_or("running"),
                ),
                Err(e) => error!("Status unavailable: {}", e),
            },
            "senders" => match chart.sender_stats(account.id, None).await {
                Ok(stats) => {
                    for stat in stats.iter().take(20) {
                        println!("{:>5}  {}", stat.messages, stat.sender);
                    }
                }
                Err(e) => error!("Sender statistics unavailable: {}", e),
            },
            "chart" => match chart.chart(account.id, None).await {
                Ok(ChartView::NoData) => println!("no data yet"),
                Ok(ChartView::Ready(data)) => {
                    println!("bucket: {} ms", data.bucket_ms);
                    for point in &data.samples {
                        println!("{}  total {}  unread {}", point.timestamp, point.total, point.unread);
                    }
                    println!("{} change segments", data.segments.len());
                }
                Err(e) => error!("Chart unavailable: {}", e),
            },
            "update" => {
                if !scheduler.request_update(account.id) {
                    println!("An update is already under way");
                }
            }
            payload => match sender.deliver(payload.as_bytes().to_vec()).await {
                Some(Reply::Ack) => info!("Notification accepted"),
                Some(Reply::Nack) => warn!("Notification rejected"),
                None => {
                    error!("Notification listener is gone");
                    break;
                }
            },
        }
    }
}

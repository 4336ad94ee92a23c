use crate::error::ProviderError;
use crate::models::{
    Account, HistoryDelta, HistoryPage, LabelChange, LabelCounts, MessageDetail, MessagePage,
    MessageRef, SequenceNumber,
};
use crate::provider::{MailProvider, ProviderResult};
use async_trait::async_trait;
use google_gmail1::api;
use google_gmail1::hyper::client::HttpConnector;
use google_gmail1::hyper_rustls::HttpsConnector;
use google_gmail1::{Gmail, hyper, hyper_rustls, oauth2};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

pub type Connector = HttpsConnector<HttpConnector>;
pub type GmailHub = Gmail<Connector>;
pub type GmailAuthenticator = oauth2::authenticator::Authenticator<Connector>;

pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.metadata"];

const USER: &str = "me";
const METADATA_FORMAT: &str = "metadata";

#[derive(Clone)]
struct Session {
    hub: GmailHub,
    auth: GmailAuthenticator,
}

/// Gmail-backed provider. Holds one authorized session per mailbox identity.
#[derive(Default)]
pub struct GmailProvider {
    sessions: RwLock<HashMap<String, Session>>,
}

pub fn https_connector() -> Connector {
    hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .expect("failed to load native root certificates")
        .https_only()
        .enable_http1()
        .build()
}

pub fn build_hub(auth: GmailAuthenticator) -> GmailHub {
    Gmail::new(hyper::Client::builder().build(https_connector()), auth)
}

impl GmailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Email address and current history id of the mailbox behind `auth`.
    pub async fn profile(auth: &GmailAuthenticator) -> ProviderResult<(String, Option<SequenceNumber>)> {
        let hub = build_hub(auth.clone());
        let (_, profile) = hub
            .users()
            .get_profile(USER)
            .doit()
            .await
            .map_err(|e| classify(e, "profile"))?;

        let email = profile
            .email_address
            .ok_or_else(|| ProviderError::Other("profile has no email address".to_string()))?;
        Ok((email, profile.history_id.and_then(to_sequence)))
    }

    pub fn register(&self, identity: &str, auth: GmailAuthenticator) {
        let session = Session {
            hub: build_hub(auth.clone()),
            auth,
        };
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(identity.to_string(), session);
        }
    }

    fn session(&self, account: &Account) -> ProviderResult<Session> {
        self.sessions
            .read()
            .ok()
            .and_then(|s| s.get(&account.identity).cloned())
            .ok_or_else(|| ProviderError::Unauthorized(account.identity.clone()))
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn list_messages(
        &self,
        account: &Account,
        label: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> ProviderResult<MessagePage> {
        let session = self.session(account)?;
        let mut req = session.hub.users().messages_list(USER).add_label_ids(label);
        if let Some(token) = page_token {
            req = req.page_token(token);
        }
        if let Some(max) = max_results {
            req = req.max_results(max);
        }

        let (_, list) = req.doit().await.map_err(|e| classify(e, "messages.list"))?;

        Ok(MessagePage {
            messages: list
                .messages
                .unwrap_or_default()
                .iter()
                .map(message_ref)
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_message(
        &self,
        account: &Account,
        message_id: &str,
    ) -> ProviderResult<MessageDetail> {
        let session = self.session(account)?;
        let (_, msg) = session
            .hub
            .users()
            .messages_get(USER, message_id)
            .format(METADATA_FORMAT)
            .add_metadata_headers("From")
            .doit()
            .await
            .map_err(|e| classify(e, &format!("message {message_id}")))?;

        Ok(message_detail(msg))
    }

    async fn list_history_since(
        &self,
        account: &Account,
        since: SequenceNumber,
        page_token: Option<&str>,
    ) -> ProviderResult<HistoryPage> {
        let session = self.session(account)?;
        let start = u64::try_from(since)
            .map_err(|_| ProviderError::Other(format!("negative history id {since}")))?;
        let mut req = session.hub.users().history_list(USER).start_history_id(start);
        if let Some(token) = page_token {
            req = req.page_token(token);
        }

        let (_, response) = req
            .doit()
            .await
            .map_err(|e| classify(e, &format!("history since {since}")))?;

        let deltas = response
            .history
            .unwrap_or_default()
            .into_iter()
            .filter_map(history_delta)
            .collect();

        Ok(HistoryPage {
            deltas,
            next_page_token: response.next_page_token,
        })
    }

    async fn is_authorization_valid(&self, account: &Account) -> bool {
        let Ok(session) = self.session(account) else {
            return false;
        };
        match session.auth.token(SCOPES).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Authorization for {} unusable: {}", account.identity, e);
                false
            }
        }
    }

    async fn get_label_counts(&self, account: &Account, label: &str) -> ProviderResult<LabelCounts> {
        let session = self.session(account)?;
        let (_, found) = session
            .hub
            .users()
            .labels_get(USER, label)
            .doit()
            .await
            .map_err(|e| classify(e, &format!("label {label}")))?;

        Ok(LabelCounts {
            label_name: found.name.unwrap_or_else(|| label.to_string()),
            messages_total: found.messages_total.unwrap_or(0).into(),
            messages_unread: found.messages_unread.unwrap_or(0).into(),
            threads_total: found.threads_total.unwrap_or(0).into(),
            threads_unread: found.threads_unread.unwrap_or(0).into(),
        })
    }
}

fn to_sequence(id: u64) -> Option<SequenceNumber> {
    SequenceNumber::try_from(id).ok()
}

fn message_ref(msg: &api::Message) -> MessageRef {
    MessageRef {
        id: msg.id.clone().unwrap_or_default(),
        thread_id: msg.thread_id.clone().unwrap_or_default(),
        label_ids: msg.label_ids.clone().unwrap_or_default(),
    }
}

fn label_change(message: Option<&api::Message>, label_ids: Option<&Vec<String>>) -> LabelChange {
    LabelChange {
        message: message.map(message_ref).unwrap_or_default(),
        label_ids: label_ids.cloned().unwrap_or_default(),
    }
}

fn message_detail(msg: api::Message) -> MessageDetail {
    let header_from = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .and_then(|headers| {
            headers
                .iter()
                .find(|h| h.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case("From")))
                .and_then(|h| h.value.clone())
        });

    MessageDetail {
        id: msg.id.unwrap_or_default(),
        thread_id: msg.thread_id.unwrap_or_default(),
        history_id: msg.history_id.and_then(to_sequence),
        internal_date: msg.internal_date,
        header_from,
    }
}

fn history_delta(history: api::History) -> Option<HistoryDelta> {
    let Some(id) = history.id.and_then(to_sequence) else {
        warn!("Skipping history record without a usable id");
        return None;
    };
    let raw = serde_json::to_string(&history).unwrap_or_default();

    Some(HistoryDelta {
        id,
        labels_added: history
            .labels_added
            .unwrap_or_default()
            .iter()
            .map(|l| label_change(l.message.as_ref(), l.label_ids.as_ref()))
            .collect(),
        labels_removed: history
            .labels_removed
            .unwrap_or_default()
            .iter()
            .map(|l| label_change(l.message.as_ref(), l.label_ids.as_ref()))
            .collect(),
        messages_added: history
            .messages_added
            .unwrap_or_default()
            .iter()
            .filter_map(|m| m.message.as_ref().map(message_ref))
            .collect(),
        messages_deleted: history
            .messages_deleted
            .unwrap_or_default()
            .iter()
            .filter_map(|m| m.message.as_ref().map(message_ref))
            .collect(),
        raw,
    })
}

fn classify(err: google_gmail1::Error, context: &str) -> ProviderError {
    use google_gmail1::Error;

    match err {
        Error::HttpError(e) => ProviderError::Transient(format!("{context}: {e}")),
        Error::Io(e) => ProviderError::Transient(format!("{context}: {e}")),
        Error::BadRequest(body) => classify_status(status_code(&body), format!("{context}: {body}")),
        Error::Failure(resp) => {
            let status = resp.status().as_u16();
            classify_status(Some(status), format!("{context}: HTTP {status}"))
        }
        Error::MissingToken(e) => ProviderError::Unauthorized(format!("{context}: {e}")),
        other => ProviderError::Other(format!("{context}: {other}")),
    }
}

fn status_code(body: &serde_json::Value) -> Option<u16> {
    body.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok())
}

fn classify_status(status: Option<u16>, message: String) -> ProviderError {
    match status {
        Some(404) => ProviderError::NotFound(message),
        Some(401) | Some(403) => ProviderError::Unauthorized(message),
        Some(429) | Some(500..=599) => ProviderError::Transient(message),
        _ => ProviderError::Other(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LABEL_INBOX, LABEL_UNREAD};

    fn message(id: &str, labels: &[&str]) -> api::Message {
        api::Message {
            id: Some(id.to_string()),
            thread_id: Some(format!("t-{id}")),
            label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn history_record_is_flattened_with_its_raw_payload() {
        let history = api::History {
            id: Some(1234),
            labels_removed: Some(vec![api::HistoryLabelRemoved {
                label_ids: Some(vec![LABEL_UNREAD.to_string()]),
                message: Some(message("m1", &[LABEL_INBOX])),
            }]),
            messages_added: Some(vec![api::HistoryMessageAdded {
                message: Some(message("m2", &[LABEL_INBOX, LABEL_UNREAD])),
            }]),
            ..Default::default()
        };

        let delta = history_delta(history).expect("has id");
        assert_eq!(delta.id, 1234);
        assert_eq!(delta.labels_removed[0].message.id, "m1");
        assert!(delta.labels_removed[0].touches(LABEL_UNREAD));
        assert!(delta.messages_added[0].has_label(LABEL_UNREAD));
        assert!(delta.messages_deleted.is_empty());
        assert!(delta.raw.contains("m2"));
    }

    #[test]
    fn history_record_without_id_is_dropped() {
        assert!(history_delta(api::History::default()).is_none());
    }

    #[test]
    fn sender_is_read_from_metadata_headers() {
        let msg = api::Message {
            id: Some("m1".to_string()),
            thread_id: Some("t1".to_string()),
            history_id: Some(99),
            internal_date: Some(1_700_000_000_000),
            payload: Some(api::MessagePart {
                headers: Some(vec![
                    api::MessagePartHeader {
                        name: Some("Subject".to_string()),
                        value: Some("hello".to_string()),
                    },
                    api::MessagePartHeader {
                        name: Some("from".to_string()),
                        value: Some("Ada <ada@example.com>".to_string()),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let detail = message_detail(msg);
        assert_eq!(detail.history_id, Some(99));
        assert_eq!(detail.internal_date, Some(1_700_000_000_000));
        assert_eq!(detail.header_from.as_deref(), Some("Ada <ada@example.com>"));
    }

    #[test]
    fn expired_history_id_maps_to_not_found() {
        let body = serde_json::json!({"error": {"code": 404, "message": "Requested entity was not found."}});
        let err = classify(google_gmail1::Error::BadRequest(body), "history since 5");
        assert!(matches!(err, ProviderError::NotFound(_)));

        let err = classify(
            google_gmail1::Error::Io(std::io::Error::other("reset")),
            "labels",
        );
        assert!(matches!(err, ProviderError::Transient(_)));
    }
}

use std::sync::atomic::{AtomicU32, Ordering};
use crate::store::Store;
use crate::schema::AuditAction;
use crate::{models, ClientMeta};

/// Consecutive failed audit writes before each further failure is logged as
/// an error instead of a warning.
pub const ALERT_THRESHOLD: u32 = 3;

pub struct AuditEvent<'a> {
    pub action: AuditAction,
    pub document_id: Option<uuid::Uuid>,
    pub template_id: Option<uuid::Uuid>,
    pub user_id: Option<i64>,
    pub details: serde_json::Value,
    pub client: Option<&'a ClientMeta>,
}

impl<'a> AuditEvent<'a> {
    pub fn document(action: AuditAction, document_id: uuid::Uuid) -> Self {
        AuditEvent {
            action,
            document_id: Some(document_id),
            template_id: None,
            user_id: None,
            details: serde_json::json!({}),
            client: None,
        }
    }

    pub fn template(action: AuditAction, template_id: uuid::Uuid) -> Self {
        AuditEvent {
            action,
            document_id: None,
            template_id: Some(template_id),
            user_id: None,
            details: serde_json::json!({}),
            client: None,
        }
    }

    pub fn by(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_template(mut self, template_id: uuid::Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn from_client(mut self, client: &'a ClientMeta) -> Self {
        self.client = Some(client);
        self
    }
}

/// Appends audit rows in their own transaction once the business change has
/// committed. Failures are logged and swallowed.
#[derive(Default)]
pub struct AuditWriter {
    consecutive_failures: AtomicU32,
}

impl AuditWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<S: Store>(&self, store: &S, event: AuditEvent) {
        let entry = models::AuditLogEntry {
            id: uuid::Uuid::new_v4(),
            document_id: event.document_id,
            template_id: event.template_id,
            user_id: event.user_id,
            action: event.action,
            details: event.details,
            ip_address: event.client.map(|c| ipnetwork::IpNetwork::from(c.ip)),
            user_agent: event.client.map(|c| c.user_agent.clone()),
            created_at: chrono::Utc::now().naive_utc(),
        };

        match store.transaction(|tx| tx.insert_audit_entry(&entry)) {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= ALERT_THRESHOLD {
                    error!(
                        "Audit log unavailable ({} consecutive failures), dropped {:?} for document {:?} template {:?}: {} {}",
                        failures, entry.action, entry.document_id, entry.template_id, err, err.detail()
                    );
                } else {
                    warn!(
                        "Unable to write audit entry {:?} for document {:?} template {:?}: {} {}",
                        entry.action, entry.document_id, entry.template_id, err, err.detail()
                    );
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn failures_are_counted_and_reset() {
        let store = MemoryStore::new();
        let writer = AuditWriter::new();
        let doc = uuid::Uuid::new_v4();

        store.fail_audit_writes(true);
        for _ in 0..ALERT_THRESHOLD + 1 {
            writer.record(&store, AuditEvent::document(AuditAction::DocumentViewed, doc));
        }
        assert_eq!(writer.consecutive_failures(), ALERT_THRESHOLD + 1);

        store.fail_audit_writes(false);
        let client = ClientMeta {
            ip: "192.0.2.7".parse().unwrap(),
            user_agent: "test-agent".to_string(),
        };
        writer.record(&store, AuditEvent::document(AuditAction::DocumentViewed, doc).by(4).from_client(&client));
        assert_eq!(writer.consecutive_failures(), 0);

        let entries = store.transaction(|tx| tx.audit_entries(doc)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, Some(4));
        assert_eq!(entries[0].user_agent.as_deref(), Some("test-agent"));
        assert_eq!(entries[0].ip_address.map(|ip| ip.ip().to_string()).as_deref(), Some("192.0.2.7"));
    }
}

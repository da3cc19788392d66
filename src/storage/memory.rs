use crate::error::{MailError, Result};
use crate::storage::{split_message, IncomingMessage, MailStore, StoredMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// A recorded spam report.
#[derive(Debug, Clone)]
pub struct AbuseReport {
    pub source_host: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

/// In-process [`MailStore`] backend.
///
/// Mailboxes are kept newest-first so retrieval ordinals follow reverse
/// chronological order without sorting on every fetch. The fault-injection
/// knobs exist for exercising the pipeline's reconnect-and-retry policy.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, String>>,
    mailboxes: Mutex<HashMap<String, Vec<StoredMessage>>>,
    abuse: Mutex<Vec<AbuseReport>>,
    fail_writes: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox with its secret.
    pub fn add_user(&self, mailbox: &str, secret: &str) {
        self.users
            .lock()
            .expect("users lock")
            .insert(mailbox.to_string(), secret.to_string());
    }

    /// Make the next `n` writes fail with a transient storage error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of times the pipeline asked for a reconnect.
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn abuse_reports(&self) -> Vec<AbuseReport> {
        self.abuse.lock().expect("abuse lock").clone()
    }

    pub fn message_count(&self, mailbox: &str) -> usize {
        self.mailboxes
            .lock()
            .expect("mailboxes lock")
            .get(mailbox)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn hash_message(msg: &IncomingMessage, received_at: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(msg.from.as_bytes());
        for to in &msg.to {
            hasher.update(to.as_bytes());
        }
        hasher.update(msg.data.as_bytes());
        hasher.update(received_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn write(&self, msg: &IncomingMessage) -> Result<String> {
        let pending = self.fail_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_writes.store(pending - 1, Ordering::SeqCst);
            warn!("Injected transient write failure ({} remaining)", pending - 1);
            return Err(MailError::StorageUnavailable(
                "connection reset by peer".to_string(),
            ));
        }

        let received_at = Utc::now();
        let id = Self::hash_message(msg, received_at);
        let (headers, body) = split_message(&msg.data);

        let mut mailboxes = self.mailboxes.lock().expect("mailboxes lock");
        for recipient in &msg.to {
            let stored = StoredMessage {
                id: id.clone(),
                from: msg.from.clone(),
                headers: headers.clone(),
                body: body.clone(),
                received_at,
            };
            // Newest first keeps fetch_all in reverse chronological order.
            mailboxes
                .entry(recipient.clone())
                .or_default()
                .insert(0, stored);
        }

        info!("Stored message <{}> for {} recipient(s)", id, msg.to.len());
        Ok(id)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&self, mailbox: &str, secret: &str) -> Result<bool> {
        let users = self.users.lock().expect("users lock");
        Ok(users.get(mailbox).is_some_and(|s| s == secret))
    }

    async fn mailbox_exists(&self, mailbox: &str) -> Result<bool> {
        Ok(self.users.lock().expect("users lock").contains_key(mailbox))
    }

    async fn fetch_all(&self, mailbox: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .mailboxes
            .lock()
            .expect("mailboxes lock")
            .get(mailbox)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_abuse_report(&self, source_host: &str, sender: &str) -> Result<()> {
        self.abuse.lock().expect("abuse lock").push(AbuseReport {
            source_host: source_host.to_string(),
            sender: sender.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(to: &str, data: &str) -> IncomingMessage {
        IncomingMessage {
            helo: "client.example.com".to_string(),
            from: "sender@example.org".to_string(),
            to: vec![to.to_string()],
            data: data.to_string(),
            host: "10.0.0.1".to_string(),
            domain: "example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn write_then_fetch_reverse_chronological() {
        let store = MemoryStore::new();
        let first = store
            .write(&incoming("u@example.com", "Subject: one\n\nfirst"))
            .await
            .unwrap();
        let second = store
            .write(&incoming("u@example.com", "Subject: two\n\nsecond"))
            .await
            .unwrap();

        let msgs = store.fetch_all("u@example.com").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].id, second, "newest message comes first");
        assert_eq!(msgs[1].id, first);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);

        let err = store
            .write(&incoming("u@example.com", "Subject: x\n\ny"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Next write goes through.
        assert!(store
            .write(&incoming("u@example.com", "Subject: x\n\ny"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn directory_checks() {
        let store = MemoryStore::new();
        store.add_user("u@example.com", "secret");

        assert!(store.mailbox_exists("u@example.com").await.unwrap());
        assert!(!store.mailbox_exists("nobody@example.com").await.unwrap());
        assert!(store.authenticate("u@example.com", "secret").await.unwrap());
        assert!(!store.authenticate("u@example.com", "wrong").await.unwrap());
    }
}

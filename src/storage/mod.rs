//! Mail storage collaborator.
//!
//! The server only ever talks to storage through [`MailStore`]; backends are
//! swappable (the in-process [`memory::MemoryStore`] ships with the crate,
//! a document store would implement the same trait). `reconnect` exists so
//! the delivery pipeline can rebuild a broken backend handle exactly once
//! per failure before giving up on a write.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message as accepted by the submission protocol, before storage.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub helo: String,
    pub from: String,
    pub to: Vec<String>,
    /// Raw message text: headers, blank line, body.
    pub data: String,
    /// Remote host the message was submitted from.
    pub host: String,
    /// Domain of the accepting server.
    pub domain: String,
}

/// A message at rest, as the retrieval protocol sees it.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Stable identifier (content hash), reported by UIDL.
    pub id: String,
    pub from: String,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailStore: Send + Sync {
    /// Persist a message for every recipient mailbox it names and return
    /// the generated identifier.
    async fn write(&self, msg: &IncomingMessage) -> Result<String>;

    /// Rebuild the backend handle after a transient failure.
    async fn reconnect(&self) -> Result<()>;

    /// Check a mailbox/secret pair against the directory.
    async fn authenticate(&self, mailbox: &str, secret: &str) -> Result<bool>;

    /// Whether the mailbox name is known to the directory.
    async fn mailbox_exists(&self, mailbox: &str) -> Result<bool>;

    /// All messages for a mailbox, newest first. Retrieval ordinals are
    /// 1-based positions into this ordering.
    async fn fetch_all(&self, mailbox: &str) -> Result<Vec<StoredMessage>>;

    /// Record a spam report against a submitting host/sender pair.
    async fn save_abuse_report(&self, source_host: &str, sender: &str) -> Result<()>;
}

/// Per-message listing entry for LIST/UIDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub ordinal: usize,
    pub uid: String,
    pub size: usize,
}

impl StoredMessage {
    /// Character count of all header values.
    pub fn header_chars(&self) -> usize {
        self.headers.iter().map(|(_, v)| v.len()).sum()
    }

    /// Reported per-message size: `(header chars + body chars) * 8`. The
    /// scaling is a compatibility quirk of the original accounting, kept
    /// as-is.
    pub fn octet_size(&self) -> usize {
        (self.header_chars() + self.body.len()) * 8
    }
}

/// Mailbox totals for STAT and the LIST/UIDL summary line: the message
/// count and the sum of per-message octet sizes.
pub fn mailbox_stats(messages: &[StoredMessage]) -> (usize, usize) {
    let total: usize = messages.iter().map(StoredMessage::octet_size).sum();
    (messages.len(), total)
}

/// Listing entries in mailbox order, ordinals starting at 1.
pub fn list_mailbox(messages: &[StoredMessage]) -> Vec<MessageHead> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| MessageHead {
            ordinal: i + 1,
            uid: m.id.clone(),
            size: m.octet_size(),
        })
        .collect()
}

/// Split raw message text into ordered headers and body at the first blank
/// line. This is deliberately not a MIME parser: a header line is anything
/// of the form `Name: value`, and malformed lines are skipped.
pub fn split_message(data: &str) -> (Vec<(String, String)>, String) {
    let mut headers = Vec::new();
    let mut lines = data.lines();

    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let body: Vec<&str> = lines.collect();
    (headers, body.join("\n"))
}

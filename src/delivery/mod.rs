//! Asynchronous mail delivery pipeline.
//!
//! Sessions hand accepted mail to the [`Mailer`] through a bounded queue and
//! block (with their own timeout) on a one-shot completion signal. A small
//! fixed pool of workers routes each recipient either to the storage
//! collaborator or to a remote mail exchanger.

pub mod pipeline;

pub use pipeline::Mailer;

use tokio::sync::{mpsc, oneshot};

/// Outcome of a delivery job, sent back to the waiting session exactly once.
#[derive(Debug)]
pub enum DeliveryStatus {
    /// Message persisted; carries the generated identifier.
    Stored { id: String },
    Failed,
}

/// Fire-and-forget event for external observers (web push, metrics, ...).
#[derive(Debug, Clone)]
pub enum DeliveryNotice {
    /// A message was persisted under this identifier.
    Stored(String),
    /// A message was accepted but not persisted; unix timestamp.
    Received(i64),
}

pub type NoticeSender = mpsc::UnboundedSender<DeliveryNotice>;

/// One accepted message on its way through the pipeline. Owned by the
/// submitting session until enqueued, then by the worker that dequeues it.
#[derive(Debug)]
pub struct DeliveryJob {
    pub helo: String,
    pub from: String,
    pub to: Vec<String>,
    pub data: String,
    /// Remote host of the submitting client.
    pub host: String,
    /// Domain of the accepting server; recipients outside it are relayed.
    pub domain: String,
    /// Completion signal back to the submitting session.
    pub done: oneshot::Sender<DeliveryStatus>,
}

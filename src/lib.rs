//! mta-rs: small mail transfer and retrieval service
//!
//! Accepts mail over SMTP, stores it for local recipients or relays it to
//! remote exchangers, and serves stored mail back over POP3.
//!
//! # Features
//!
//! - **SMTP submission**: state-machine dialogue with STARTTLS, size and
//!   recipient limits, and spam pattern reporting
//! - **POP3 retrieval**: authenticated mailbox snapshots with STAT, LIST,
//!   UIDL, RETR and TOP
//! - **Async delivery**: a bounded queue feeding a fixed worker pool that
//!   stores locally or relays via MX lookup
//! - **Admission control**: per-listener connection caps that throttle the
//!   accept loops instead of refusing clients
//!
//! # Example
//!
//! ```no_run
//! use mta_rs::config::Config;
//! use mta_rs::delivery::Mailer;
//! use mta_rs::smtp::SmtpServer;
//! use mta_rs::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let (notices, _events) = tokio::sync::mpsc::unbounded_channel();
//!
//!     let mailer = Mailer::start(store.clone(), config.server.domain.clone(), notices.clone());
//!     let server = SmtpServer::new(&config.server, &config.smtp, store, mailer, notices);
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod pop3;
pub mod security;
pub mod smtp;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};

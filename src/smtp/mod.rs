//! SMTP submission: command parsing, the per-connection protocol machine,
//! the listener that feeds it, and the outbound relay client.

pub mod commands;
pub mod relay;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::SmtpSession;

//! POP3 retrieval: command parsing, the per-connection protocol machine,
//! and the listener that feeds it.

pub mod commands;
pub mod server;
pub mod session;

pub use commands::Pop3Command;
pub use server::Pop3Server;
pub use session::Pop3Session;

//! TLS credential loading for the STARTTLS upgrade path.

pub mod tls;

pub use tls::TlsConfig;

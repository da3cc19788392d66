//! Utility modules
//!
//! - [`dns`]: MX record lookup for outbound relay
//! - [`email`]: envelope address validation

pub mod dns;
pub mod email;

pub use email::parse_email_address;

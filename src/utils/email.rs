use crate::error::{MailError, Result};
use regex::Regex;
use std::sync::LazyLock;

// Either a bare local part or a quoted one, then a domain with at least one
// dot. Compiled once; envelope validation runs on every MAIL/RCPT.
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"[^"]+"|[^@"<>\s]+)@([A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z0-9-]+)$"#)
        .expect("address regex")
});

/// Validate an envelope address and split it into (local part, domain).
///
/// Quoted local parts (`"john doe"@example.com`) are permitted; anything
/// else must be a plain `local@domain` with a dotted domain.
pub fn parse_email_address(address: &str) -> Result<(String, String)> {
    if address.is_empty() {
        return Err(MailError::InvalidAddress("empty address".to_string()));
    }

    if !ADDRESS_RE.is_match(address) {
        return Err(MailError::InvalidAddress(address.to_string()));
    }

    let at = address
        .rfind('@')
        .ok_or_else(|| MailError::InvalidAddress(address.to_string()))?;

    Ok((address[..at].to_string(), address[at + 1..].to_string()))
}

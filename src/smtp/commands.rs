use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// MAIL argument shape: `FROM:<address>[ params]`. The address group admits
/// escaped `>` inside plain local parts and fully quoted local parts.
pub static FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^FROM:\s*<((?:\\>|[^>])+|"[^"]+"@[^>]+)>( [\w= ]+)?$"#)
        .expect("MAIL FROM regex")
});

static ESMTP_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" (\w+)=(\w+)").expect("ESMTP param regex"));

/// One parsed command line of the submission dialogue. Argument validation
/// stays with the session handlers so each rejection keeps its own reply.
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    Mail(String),
    Rcpt(String),
    Data(String),
    Rset,
    Vrfy,
    Noop,
    Quit,
    Auth(String),
    StartTls,
    /// Declared by the dialogue but answered "not implemented".
    NotImplemented(String),
    /// Bare CRLF.
    Empty,
    Unknown(String),
}

impl SmtpCommand {
    /// Parse one input line. Returns `None` for lines too mangled to answer
    /// (dropped without a reply): shorter than a verb, or verb not followed
    /// by a space.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        // Prefix match before any length checks.
        if line.starts_with("STARTTLS") {
            return Some(SmtpCommand::StartTls);
        }

        let (verb, arg) = match line.len() {
            0 => return Some(SmtpCommand::Empty),
            1..=3 | 5 => return None,
            4 => (line.to_uppercase(), String::new()),
            _ => {
                if line.as_bytes()[4] != b' ' {
                    return None;
                }
                (
                    line[0..4].to_uppercase(),
                    line[5..].trim_matches([' ', '\r', '\n']).to_string(),
                )
            }
        };

        Some(match verb.as_str() {
            "HELO" => SmtpCommand::Helo(arg),
            "EHLO" => SmtpCommand::Ehlo(arg),
            "MAIL" => SmtpCommand::Mail(arg),
            "RCPT" => SmtpCommand::Rcpt(arg),
            "DATA" => SmtpCommand::Data(arg),
            "RSET" => SmtpCommand::Rset,
            "VRFY" => SmtpCommand::Vrfy,
            "NOOP" => SmtpCommand::Noop,
            "QUIT" => SmtpCommand::Quit,
            "AUTH" => SmtpCommand::Auth(arg),
            "SEND" | "SOML" | "SAML" | "EXPN" | "HELP" | "TURN" => {
                SmtpCommand::NotImplemented(verb)
            }
            _ => SmtpCommand::Unknown(verb),
        })
    }
}

/// Extract the domain token from a HELO/EHLO argument: everything up to the
/// first space. Empty means the argument was missing.
pub fn parse_hello_argument(arg: &str) -> Option<String> {
    let domain = arg.split(' ').next().unwrap_or("");
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

/// Parse ESMTP parameters trailing a MAIL argument, e.g. " BODY=8BITMIME
/// SIZE=1024" (leading space mandatory). Keys are uppercased.
pub fn parse_esmtp_args(arg: &str) -> Option<HashMap<String, String>> {
    let mut args = HashMap::new();
    for cap in ESMTP_PARAM_RE.captures_iter(arg) {
        args.insert(cap[1].to_uppercase(), cap[2].to_string());
    }

    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_helo() {
        assert_eq!(
            SmtpCommand::parse("HELO example.com\r\n"),
            Some(SmtpCommand::Helo("example.com".to_string()))
        );
    }

    #[test]
    fn parses_mail_with_raw_argument() {
        assert_eq!(
            SmtpCommand::parse("MAIL FROM:<a@b.com>"),
            Some(SmtpCommand::Mail("FROM:<a@b.com>".to_string()))
        );
    }

    #[test]
    fn verb_is_case_insensitive() {
        assert_eq!(SmtpCommand::parse("quit"), Some(SmtpCommand::Quit));
        assert_eq!(
            SmtpCommand::parse("rcpt TO:<a@b.com>"),
            Some(SmtpCommand::Rcpt("TO:<a@b.com>".to_string()))
        );
    }

    #[test]
    fn starttls_matches_as_prefix() {
        assert_eq!(SmtpCommand::parse("STARTTLS\r\n"), Some(SmtpCommand::StartTls));
    }

    #[test]
    fn mangled_lines_are_dropped() {
        assert_eq!(SmtpCommand::parse("HI\r\n"), None);
        assert_eq!(SmtpCommand::parse("HELLO\r\n"), None);
        assert_eq!(SmtpCommand::parse("HELOx example.com"), None);
    }

    #[test]
    fn empty_line_is_its_own_command() {
        assert_eq!(SmtpCommand::parse("\r\n"), Some(SmtpCommand::Empty));
    }

    #[test]
    fn legacy_verbs_are_not_implemented() {
        assert_eq!(
            SmtpCommand::parse("HELP"),
            Some(SmtpCommand::NotImplemented("HELP".to_string()))
        );
        assert_eq!(
            SmtpCommand::parse("TURN"),
            Some(SmtpCommand::NotImplemented("TURN".to_string()))
        );
    }

    #[test]
    fn from_regex_accepts_plain_and_quoted() {
        let caps = FROM_RE.captures("FROM:<user@example.com>").unwrap();
        assert_eq!(&caps[1], "user@example.com");

        let caps = FROM_RE.captures("from:<\"john doe\"@example.com>").unwrap();
        assert_eq!(&caps[1], "\"john doe\"@example.com");
    }

    #[test]
    fn from_regex_captures_trailing_params() {
        let caps = FROM_RE
            .captures("FROM:<user@example.com> BODY=8BITMIME SIZE=1024")
            .unwrap();
        assert_eq!(&caps[1], "user@example.com");
        assert_eq!(&caps[2], " BODY=8BITMIME SIZE=1024");
    }

    #[test]
    fn from_regex_rejects_bare_address() {
        assert!(FROM_RE.captures("FROM:user@example.com").is_none());
        assert!(FROM_RE.captures("TO:<user@example.com>").is_none());
    }

    #[test]
    fn esmtp_params_uppercase_keys() {
        let args = parse_esmtp_args(" body=8BITMIME size=512").unwrap();
        assert_eq!(args.get("SIZE").map(String::as_str), Some("512"));
        assert_eq!(args.get("BODY").map(String::as_str), Some("8BITMIME"));
        assert!(parse_esmtp_args("garbage").is_none());
    }
}

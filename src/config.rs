use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Domain this server accepts mail for; recipients outside it are relayed.
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub listen_addr: String,
    pub max_clients: usize,
    pub max_recipients: usize,
    pub max_idle_secs: u64,
    pub max_message_bytes: usize,
    /// When false, accepted mail is acknowledged and signalled to observers
    /// but never persisted.
    pub store_messages: bool,
    pub spam_regex: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pop3Config {
    pub listen_addr: String,
    pub max_clients: usize,
    pub max_idle_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::MailError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| crate::error::MailError::Config(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                domain: "localhost".to_string(),
            },
            smtp: SmtpConfig {
                listen_addr: "0.0.0.0:2525".to_string(),
                max_clients: 500,
                max_recipients: 100,
                max_idle_secs: 300,
                max_message_bytes: 20 * 1024 * 1024,
                store_messages: true,
                spam_regex: r"(?i)viagra|cheap rolex".to_string(),
                tls_cert_path: None,
                tls_key_path: None,
            },
            pop3: Pop3Config {
                listen_addr: "0.0.0.0:11000".to_string(),
                max_clients: 500,
                max_idle_secs: 300,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

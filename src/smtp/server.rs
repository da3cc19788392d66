use crate::config::{ServerConfig, SmtpConfig};
use crate::delivery::{Mailer, NoticeSender};
use crate::error::Result;
use crate::security::TlsConfig;
use crate::smtp::session::SmtpSession;
use crate::storage::MailStore;
use regex::Regex;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Initial backoff after a transient accept failure; doubles up to
/// [`ACCEPT_BACKOFF_CAP`].
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Shared, read-only context every SMTP session hangs on to.
pub struct SmtpServerState {
    pub domain: String,
    pub max_clients: usize,
    pub max_recipients: usize,
    pub max_message_bytes: usize,
    pub max_idle: Duration,
    pub store_messages: bool,
    pub spam_re: Option<Regex>,
    pub tls: Option<TlsConfig>,
    pub store: Arc<dyn MailStore>,
    pub mailer: Mailer,
    pub notices: NoticeSender,
    /// Admission gate; a permit is held for the lifetime of each session.
    pub gate: Arc<Semaphore>,
}

/// The SMTP submission listener.
pub struct SmtpServer {
    state: Arc<SmtpServerState>,
    listen_addr: String,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl SmtpServer {
    pub fn new(
        server_cfg: &ServerConfig,
        cfg: &SmtpConfig,
        store: Arc<dyn MailStore>,
        mailer: Mailer,
        notices: NoticeSender,
    ) -> Self {
        let spam_re = if cfg.spam_regex.is_empty() {
            None
        } else {
            match Regex::new(&cfg.spam_regex) {
                Ok(re) => Some(re),
                Err(e) => {
                    error!("Invalid spam regex {:?}, filtering disabled: {}", cfg.spam_regex, e);
                    None
                }
            }
        };

        // A broken certificate setup downgrades to plain SMTP rather than
        // keeping the server from starting.
        let tls = match (&cfg.tls_cert_path, &cfg.tls_key_path) {
            (Some(cert), Some(key)) => match TlsConfig::from_pem_files(cert, key) {
                Ok(tls) => Some(tls),
                Err(e) => {
                    error!("Cannot load TLS material, STARTTLS disabled: {}", e);
                    None
                }
            },
            _ => None,
        };

        let state = SmtpServerState {
            domain: server_cfg.domain.clone(),
            max_clients: cfg.max_clients,
            max_recipients: cfg.max_recipients,
            max_message_bytes: cfg.max_message_bytes,
            max_idle: Duration::from_secs(cfg.max_idle_secs),
            store_messages: cfg.store_messages,
            spam_re,
            tls,
            store,
            mailer,
            notices,
            gate: Arc::new(Semaphore::new(cfg.max_clients)),
        };

        Self {
            state: Arc::new(state),
            listen_addr: cfg.listen_addr.clone(),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// Bind the configured address and run the accept loop.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Transient accept failures
    /// back off and retry; anything else is fatal and surfaces to the caller.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("SMTP listening on {}", addr);
        }

        let mut backoff = ACCEPT_BACKOFF;
        let mut client_id: u64 = 0;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let (socket, addr) = match accepted {
                Ok(conn) => {
                    backoff = ACCEPT_BACKOFF;
                    conn
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("Transient accept failure, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_CAP);
                    continue;
                }
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    error!("SMTP accept loop failed: {}", e);
                    return Err(e.into());
                }
            };

            // Holding the permit here throttles the accept loop once the
            // server is full.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                permit = self.state.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Only possible if the semaphore is closed, which we never do.
                    Err(_) => return Ok(()),
                },
            };

            client_id += 1;
            info!("SMTP connection #{} from {}", client_id, addr);

            let session = SmtpSession::new(self.state.clone(), client_id, addr.ip().to_string());
            self.sessions.spawn(async move {
                if let Err(e) = session.handle(socket).await {
                    error!("SMTP session error: {}", e);
                }
                drop(permit);
            });
        }
    }

    /// Signal the accept loop to stop taking new connections.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for all in-flight sessions to finish. Call [`stop`] first.
    ///
    /// [`stop`]: SmtpServer::stop
    pub async fn drain(&self) {
        self.sessions.close();
        self.sessions.wait().await;
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

use crate::config::{Pop3Config, ServerConfig};
use crate::error::Result;
use crate::pop3::session::Pop3Session;
use crate::storage::MailStore;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Shared, read-only context for POP3 sessions.
pub struct Pop3ServerState {
    pub domain: String,
    pub max_clients: usize,
    pub max_idle: Duration,
    pub store: Arc<dyn MailStore>,
    pub gate: Arc<Semaphore>,
}

/// The POP3 retrieval listener.
pub struct Pop3Server {
    state: Arc<Pop3ServerState>,
    listen_addr: String,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl Pop3Server {
    pub fn new(server_cfg: &ServerConfig, cfg: &Pop3Config, store: Arc<dyn MailStore>) -> Self {
        let state = Pop3ServerState {
            domain: server_cfg.domain.clone(),
            max_clients: cfg.max_clients,
            max_idle: Duration::from_secs(cfg.max_idle_secs),
            store,
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

    /// Accept loop over an already-bound listener; same admission and
    /// backoff policy as the SMTP listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("POP3 listening on {}", addr);
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
                    error!("POP3 accept loop failed: {}", e);
                    return Err(e.into());
                }
            };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                permit = self.state.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
            };

            client_id += 1;
            info!("POP3 connection #{} from {}", client_id, addr);

            let session = Pop3Session::new(self.state.clone(), client_id);
            self.sessions.spawn(async move {
                if let Err(e) = session.handle(socket).await {
                    error!("POP3 session error: {}", e);
                }
                drop(permit);
            });
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

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

use anyhow::Context;
use mta_rs::config::Config;
use mta_rs::delivery::{DeliveryNotice, Mailer};
use mta_rs::pop3::Pop3Server;
use mta_rs::smtp::SmtpServer;
use mta_rs::storage::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Grace period for in-flight sessions after shutdown is requested.
const DRAIN_DEADLINE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so its level feeds the log filter.
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None if std::path::Path::new("config.toml").exists() => Config::from_file("config.toml")?,
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting mta-rs");
    info!("  Domain: {}", config.server.domain);
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  POP3 listening on: {}", config.pop3.listen_addr);

    let store = Arc::new(MemoryStore::new());

    // Delivery events are logged here; a web frontend would subscribe instead.
    let (notices, mut events) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DeliveryNotice::Stored(id) => info!("Delivered message <{}>", id),
                DeliveryNotice::Received(ts) => info!("Accepted message at {}", ts),
            }
        }
    });

    let mailer = Mailer::start(store.clone(), config.server.domain.clone(), notices.clone());

    let smtp = Arc::new(SmtpServer::new(
        &config.server,
        &config.smtp,
        store.clone(),
        mailer,
        notices,
    ));
    let pop3 = Arc::new(Pop3Server::new(&config.server, &config.pop3, store.clone()));

    let smtp_handle = {
        let smtp = smtp.clone();
        tokio::spawn(async move { smtp.start().await })
    };
    let pop3_handle = {
        let pop3 = pop3.clone();
        tokio::spawn(async move { pop3.start().await })
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        _ = sigterm.recv() => info!("Termination requested"),
        result = smtp_handle => {
            match result {
                Ok(Ok(())) => info!("SMTP listener exited"),
                Ok(Err(e)) => error!("SMTP listener failed: {}", e),
                Err(e) => error!("SMTP task panicked: {}", e),
            }
        }
        result = pop3_handle => {
            match result {
                Ok(Ok(())) => info!("POP3 listener exited"),
                Ok(Err(e)) => error!("POP3 listener failed: {}", e),
                Err(e) => error!("POP3 task panicked: {}", e),
            }
        }
    }

    info!("Shutting down, draining sessions");
    smtp.stop();
    pop3.stop();

    let drain = async {
        smtp.drain().await;
        pop3.drain().await;
    };
    if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
        warn!("Sessions still open after {:?}, exiting anyway", DRAIN_DEADLINE);
    }

    info!("Goodbye");
    Ok(())
}

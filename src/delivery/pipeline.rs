use crate::delivery::{DeliveryJob, DeliveryNotice, DeliveryStatus, NoticeSender};
use crate::error::{MailError, Result};
use crate::smtp::relay::{RelayClient, SUBMISSION_PORTS};
use crate::storage::{IncomingMessage, MailStore};
use crate::utils::dns::lookup_mx;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Queue depth; producers (sessions) block when the queue is full.
const QUEUE_CAPACITY: usize = 256;

/// Number of long-lived delivery workers.
const WORKERS: usize = 3;

/// Handle to the delivery pipeline. Cloneable; every clone feeds the same
/// bounded queue.
#[derive(Clone)]
pub struct Mailer {
    jobs: mpsc::Sender<DeliveryJob>,
}

impl Mailer {
    /// Spawn the worker pool and return the submission handle.
    pub fn start(store: Arc<dyn MailStore>, domain: String, notices: NoticeSender) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..WORKERS {
            let worker = Worker {
                id,
                store: store.clone(),
                domain: domain.clone(),
                notices: notices.clone(),
                retried: false,
            };
            tokio::spawn(worker.run(rx.clone()));
        }

        Self { jobs: tx }
    }

    /// Enqueue a job, waiting for queue space if necessary (backpressure).
    pub async fn submit(&self, job: DeliveryJob) -> Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| MailError::Delivery("delivery queue closed".to_string()))
    }
}

struct Worker {
    id: usize,
    store: Arc<dyn MailStore>,
    domain: String,
    notices: NoticeSender,
    /// Reconnect-and-retry latch: set after the single allowed retry,
    /// cleared again by the next successful write.
    retried: bool,
}

impl Worker {
    async fn run(mut self, rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>) {
        debug!("Delivery worker #{} running", self.id);

        loop {
            let job = { rx.lock().await.recv().await };
            let Some(job) = job else {
                debug!("Delivery worker #{} stopping, queue closed", self.id);
                return;
            };
            self.process(job).await;
        }
    }

    async fn process(&mut self, job: DeliveryJob) {
        let mut outcome: Option<DeliveryStatus> = None;

        for recipient in &job.to {
            if self.is_local(recipient) {
                let result = self.store_local(&job, recipient).await;
                // The first local write decides the reply the session sees.
                if outcome.is_none() {
                    outcome = Some(match &result {
                        Ok(id) => DeliveryStatus::Stored { id: id.clone() },
                        Err(_) => DeliveryStatus::Failed,
                    });
                }
                if let Ok(id) = result {
                    let _ = self.notices.send(DeliveryNotice::Stored(id));
                }
            } else {
                // Relay outcomes are logged and abandoned; they never reach
                // the submitting session.
                self.relay(&job, recipient).await;
            }
        }

        if let Some(status) = outcome {
            let _ = job.done.send(status);
        }
    }

    fn is_local(&self, recipient: &str) -> bool {
        recipient
            .split_once('@')
            .is_some_and(|(_, domain)| domain.eq_ignore_ascii_case(&self.domain))
    }

    /// One write attempt, plus a single reconnect-and-retry when the failure
    /// is of the connection-reset class and this worker has not yet used its
    /// retry. Any other failure, or a second one, surfaces immediately.
    async fn store_local(&mut self, job: &DeliveryJob, recipient: &str) -> Result<String> {
        let msg = IncomingMessage {
            helo: job.helo.clone(),
            from: job.from.clone(),
            to: vec![recipient.to_string()],
            data: job.data.clone(),
            host: job.host.clone(),
            domain: job.domain.clone(),
        };

        match self.store.write(&msg).await {
            Ok(id) => {
                self.retried = false;
                debug!("Stored message <{}> for <{}>", id, recipient);
                Ok(id)
            }
            Err(e) if e.is_transient() && !self.retried => {
                warn!("Storage write failed ({}), reconnecting once", e);
                self.retried = true;

                if let Err(e) = self.store.reconnect().await {
                    error!("Storage reconnect failed: {}", e);
                    return Err(e);
                }

                match self.store.write(&msg).await {
                    Ok(id) => {
                        debug!("Stored message <{}> for <{}> after retry", id, recipient);
                        Ok(id)
                    }
                    Err(e) => {
                        error!("Error storing message for <{}>: {}", recipient, e);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                error!("Error storing message for <{}>: {}", recipient, e);
                Err(e)
            }
        }
    }

    async fn relay(&self, job: &DeliveryJob, recipient: &str) {
        let Some((_, domain)) = recipient.split_once('@') else {
            error!("Invalid relay recipient address: <{}>", recipient);
            return;
        };

        let exchangers = match lookup_mx(domain).await {
            Ok(hosts) if !hosts.is_empty() => hosts,
            Ok(_) => {
                error!("No mail exchangers for {}", domain);
                return;
            }
            Err(e) => {
                error!("Cannot look up mail exchangers for {}: {}", domain, e);
                return;
            }
        };

        let client = match RelayClient::connect(&exchangers, &SUBMISSION_PORTS).await {
            Ok(client) => client,
            Err(e) => {
                error!("Cannot reach any exchanger for <{}>: {}", recipient, e);
                return;
            }
        };

        match client.send(&job.from, recipient, &job.data).await {
            Ok(()) => info!("Relayed message for <{}>", recipient),
            Err(e) => error!("Relay to <{}> failed: {}", recipient, e),
        }
    }
}

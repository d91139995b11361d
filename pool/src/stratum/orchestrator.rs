//! Stratum orchestrator
//!
//! Wires the upstream node, job manager, TCP transport and protocol adapter together.
//! Owns the block submission path and the domain event stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::adapter::{self, Dispatch, ProtocolAdapter};
use super::client::{Client, ClientInfo};
use super::error::MessageError;
use super::protocol::StratumRequest;
use super::server;
use crate::algorithm::Algorithm;
use crate::config::Config;
use crate::events::{EventBus, StratumEvent};
use crate::jobs::{Job, JobManager, NextJob};
use crate::metrics::prometheus as metrics;
use crate::shares::Share;
use crate::upstream::UpstreamClient;

/// Authorization policy for workers. Deployments plug in allow/deny rules here.
#[async_trait]
pub trait WorkerAuthorizer: Send + Sync {
    async fn authorize(&self, client: &ClientInfo) -> Result<bool>;
}

/// Authorizes every worker.
pub struct AllowAll;

#[async_trait]
impl WorkerAuthorizer for AllowAll {
    async fn authorize(&self, _client: &ClientInfo) -> Result<bool> {
        Ok(true)
    }
}

pub struct Stratum {
    config: Config,
    algorithm: Algorithm,
    upstream: Arc<dyn UpstreamClient>,
    jobs: Arc<JobManager>,
    adapter: Arc<dyn ProtocolAdapter>,
    authorizer: Arc<dyn WorkerAuthorizer>,
    events: EventBus,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Stratum {
    pub fn new(config: Config, algorithm: Algorithm, upstream: Arc<dyn UpstreamClient>) -> Self {
        let adapter = adapter::for_dialect(config.dialect, algorithm.multiplier);
        let jobs = Arc::new(JobManager::new(algorithm.multiplier));
        Self {
            config,
            algorithm,
            upstream,
            jobs,
            adapter,
            authorizer: Arc::new(AllowAll),
            events: EventBus::default(),
            clients: RwLock::new(HashMap::new()),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn WorkerAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamClient> {
        &self.upstream
    }

    pub fn adapter(&self) -> &Arc<dyn ProtocolAdapter> {
        &self.adapter
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StratumEvent> {
        self.events.subscribe()
    }

    /// Address the transport is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }

    /// Connect upstream, obtain the first job, open the listener and start job fan-out.
    ///
    /// Any failure here is fatal: miners are never served without a job.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.upstream
            .connect()
            .await
            .context("Failed to connect to upstream node")?;

        self.jobs
            .start(self.upstream.clone(), self.config.first_job_timeout())
            .await
            .context("Failed to start stratum server: no first job")?;

        let listener = server::bind(&self.config.listen_addr())
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr()))?;
        let addr = listener.local_addr().context("Listener has no local address")?;
        *self.local_addr.lock() = Some(addr);

        let mut tasks = server::spawn(self.clone(), listener);

        let mut next_jobs = self.jobs.subscribe();
        let stratum = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match next_jobs.recv().await {
                    Ok(next) => stratum.on_next_job(next),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Job fan-out lagged, skipped {} jobs", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        self.tasks.lock().extend(tasks);

        tracing::info!(
            "Stratum ({} dialect, {}) listening on {}",
            self.adapter.dialect(),
            self.algorithm.name,
            addr
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.jobs.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for client in self.clients() {
            client.disconnect("Server stopping");
        }
        self.upstream.close().await;
        tracing::info!("Stratum stopped");
    }

    fn on_next_job(&self, next: NextJob) {
        self.events.emit(StratumEvent::NextJob {
            job: next.job.clone(),
            is_new_block: next.is_new_block,
        });
        if next.is_new_block {
            self.events.emit(StratumEvent::NewBlock { job: next.job.clone() });
        }
        self.broadcast_job(&next.job, next.is_new_block);
    }

    /// Push `job` to every authorized client.
    pub fn broadcast_job(&self, job: &Job, is_new_block: bool) {
        let mut sent = 0u64;
        for client in self.clients() {
            if client.is_authorized() && !client.is_disconnected() {
                self.adapter.push_job(&client, job, is_new_block);
                sent += 1;
            }
        }
        metrics::inc_job_broadcasts_by(sent);
        tracing::debug!("Job {} sent to {} clients", job.id(), sent);
    }

    pub fn register_client(&self, client: Arc<Client>) {
        let info = client.info();
        self.clients
            .write()
            .insert(client.session_id().to_string(), client);
        metrics::inc_connections();
        self.events.emit(StratumEvent::ClientConnect { client: info });
    }

    pub fn remove_client(&self, session_id: &str, reason: &str) {
        let removed = self.clients.write().remove(session_id);
        if let Some(client) = removed {
            metrics::dec_connections();
            self.events.emit(StratumEvent::ClientDisconnect {
                client: client.info(),
                reason: reason.to_string(),
            });
        }
    }

    /// Entry point for one raw line from the transport.
    pub fn handle_line(self: &Arc<Self>, client: &Arc<Client>, line: &str) {
        match StratumRequest::parse(line) {
            Ok(request) => self.handle_message(client, &request),
            Err(e) => self.report_malformed(client, line.to_string(), &e),
        }
    }

    pub fn handle_message(self: &Arc<Self>, client: &Arc<Client>, request: &StratumRequest) {
        if client.is_disconnected() {
            return;
        }
        match self.adapter.handle_message(self, client, request) {
            Ok(Dispatch::Handled) => {}
            Ok(Dispatch::Unhandled) => {
                tracing::debug!(
                    "Unknown method {} from {}",
                    request.method,
                    client.peer_addr()
                );
                self.events.emit(StratumEvent::ClientUnknownMethod {
                    client: client.info(),
                    method: request.method.clone(),
                });
            }
            Err(e) => {
                let raw = serde_json::to_string(request).unwrap_or_else(|_| request.method.clone());
                self.report_malformed(client, raw, &e);
            }
        }
    }

    pub fn report_malformed(&self, client: &Client, message: String, error: &MessageError) {
        tracing::debug!("Malformed message from {}: {}", client.peer_addr(), error);
        metrics::inc_malformed_messages();
        self.events.emit(StratumEvent::ClientMalformedMessage {
            client: client.info(),
            message,
            reason: error.to_string(),
        });
    }

    pub fn client_subscribed(&self, client: &Client) {
        client.set_subscribed(true);
        self.events.emit(StratumEvent::ClientSubscribe { client: client.info() });
    }

    /// Ask the authorization policy about this client's worker.
    pub async fn authorize_worker(&self, client: &Client) -> Result<bool> {
        self.authorizer.authorize(&client.info()).await
    }

    /// Mark `client` authorized and start it on the current job.
    pub fn worker_authorized(&self, client: &Client) {
        client.set_authorized(true);
        self.events.emit(StratumEvent::ClientAuthorize {
            client: client.info(),
            worker_name: client.worker_name().unwrap_or_default(),
        });
        if let Some(job) = self.jobs.current_job() {
            self.adapter.push_job(client, &job, true);
        }
    }

    pub fn validate_share(&self, share: &mut Share) -> bool {
        share.validate(&self.jobs, &self.algorithm)
    }

    /// Forward block candidates upstream, then publish the share.
    pub fn submit_share(self: &Arc<Self>, client: &Arc<Client>, share: Share) {
        if !share.is_valid_block() {
            self.emit_share(client, &share);
            return;
        }

        let stratum = Arc::clone(self);
        let client = Arc::clone(client);
        tokio::spawn(async move {
            let mut share = share;
            stratum.submit_block(&mut share).await;
            stratum.emit_share(&client, &share);
        });
    }

    /// One attempt. Anything but an upstream accept demotes the share.
    async fn submit_block(&self, share: &mut Share) {
        metrics::inc_block_submit_attempts();
        let upstream_job_id = share.upstream_job_id().to_string();

        match self
            .upstream
            .submit_solution(&upstream_job_id, share.nonce_hex(), share.output_hex())
            .await
        {
            Ok(outcome) if outcome.accepted => {
                metrics::inc_blocks_accepted();
                tracing::info!(
                    "Block accepted at height {} (hash {})",
                    share.job_height(),
                    outcome.block_hash.as_deref().unwrap_or("-")
                );
                share.set_block_id(outcome.block_hash);
            }
            Ok(outcome) => {
                metrics::inc_block_submit_rejected();
                tracing::warn!(
                    "Upstream rejected a supposedly valid block for job {}: {}",
                    upstream_job_id,
                    outcome.description
                );
                share.demote_block();
            }
            Err(e) => {
                metrics::inc_block_submit_rejected();
                tracing::error!("Error while submitting block to upstream: {}", e);
                share.demote_block();
            }
        }
    }

    fn emit_share(&self, client: &Client, share: &Share) {
        self.events.emit(StratumEvent::ShareSubmitted {
            client: client.info(),
            share: share.summary(),
        });
    }
}

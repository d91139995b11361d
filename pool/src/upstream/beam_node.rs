//! Beam node stratum API client
//!
//! Line-delimited JSON over TCP. The node pushes `job` notifications after login and
//! answers each `solution` with a `result` message carrying the same id.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use super::{SubmitOutcome, UpstreamClient, UpstreamError, UpstreamJob};
use crate::algorithm::difficulty;

const LOGIN_ID: &str = "login";
const ACCEPTED_CODE: i64 = 1;

type Pending = Arc<Mutex<HashMap<String, VecDeque<oneshot::Sender<Value>>>>>;

#[derive(Default)]
struct NodeState {
    current_job: Option<UpstreamJob>,
    handshake: Map<String, Value>,
}

pub struct BeamNodeClient {
    address: String,
    api_key: String,
    timeout: Duration,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: Arc<RwLock<NodeState>>,
    pending: Pending,
    job_tx: broadcast::Sender<UpstreamJob>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BeamNodeClient {
    pub fn new(host: &str, port: u16, api_key: impl Into<String>, timeout: Duration) -> Self {
        let (job_tx, _) = broadcast::channel(64);
        Self {
            address: format!("{}:{}", host, port),
            api_key: api_key.into(),
            timeout,
            writer: tokio::sync::Mutex::new(None),
            state: Arc::new(RwLock::new(NodeState::default())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            job_tx,
            reader: Mutex::new(None),
        }
    }

    async fn write_message(&self, message: &Value) -> Result<(), UpstreamError> {
        let mut payload = serde_json::to_string(message)?;
        payload.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(UpstreamError::NotConnected)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send `message` and wait for the `result` reply carrying `id`.
    async fn request(&self, id: &str, message: &Value) -> Result<Value, UpstreamError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().entry(id.to_string()).or_default().push_back(tx);

        if let Err(e) = self.write_message(message).await {
            drop_pending(&self.pending, id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(UpstreamError::NotConnected),
            Err(_) => {
                drop_pending(&self.pending, id);
                Err(UpstreamError::Timeout)
            }
        }
    }
}

fn drop_pending(pending: &Pending, id: &str) {
    let mut pending = pending.lock();
    if let Some(queue) = pending.get_mut(id) {
        queue.retain(|tx| !tx.is_closed());
        if queue.is_empty() {
            pending.remove(id);
        }
    }
}

/// Convert a node `job` notification into an [`UpstreamJob`].
pub fn parse_job(message: &Value) -> Result<UpstreamJob, UpstreamError> {
    let id = match message.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(UpstreamError::Protocol("job without id".to_string())),
    };
    let height = message
        .get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| UpstreamError::Protocol(format!("job {} without height", id)))?;
    let packed = message
        .get("difficulty")
        .and_then(Value::as_u64)
        .and_then(|d| u32::try_from(d).ok())
        .ok_or_else(|| UpstreamError::Protocol(format!("job {} without packed difficulty", id)))?;
    let input = message
        .get("input")
        .and_then(Value::as_str)
        .ok_or_else(|| UpstreamError::Protocol(format!("job {} without input", id)))?;

    Ok(UpstreamJob {
        id,
        height,
        difficulty: difficulty::unpack(packed),
        input: input.to_string(),
    })
}

/// Interpret a `result` reply to a submitted solution.
pub fn parse_submit_result(reply: &Value) -> SubmitOutcome {
    let code = reply.get("code").and_then(Value::as_i64).unwrap_or_default();
    let description = reply
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let block_hash = reply
        .get("blockhash")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .map(str::to_string);

    SubmitOutcome {
        accepted: code == ACCEPTED_CODE,
        block_hash,
        description,
    }
}

fn handle_node_line(
    line: &str,
    state: &RwLock<NodeState>,
    pending: &Pending,
    job_tx: &broadcast::Sender<UpstreamJob>,
) {
    let message: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring unparseable node message: {} ({})", line, e);
            return;
        }
    };

    match message.get("method").and_then(Value::as_str) {
        Some("job") => match parse_job(&message) {
            Ok(job) => {
                tracing::debug!("Node job {} at height {}", job.id, job.height);
                state.write().current_job = Some(job.clone());
                let _ = job_tx.send(job);
            }
            Err(e) => tracing::warn!("Invalid job from node: {}", e),
        },
        Some("result") => {
            let id = match message.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return,
            };
            let waiter = {
                let mut pending = pending.lock();
                let waiter = pending.get_mut(&id).and_then(VecDeque::pop_front);
                if pending.get(&id).is_some_and(VecDeque::is_empty) {
                    pending.remove(&id);
                }
                waiter
            };
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => tracing::debug!("Unsolicited node result for id {}", id),
            }
        }
        Some(other) => tracing::debug!("Unhandled node method: {}", other),
        None => tracing::debug!("Node message without method: {}", line),
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    state: Arc<RwLock<NodeState>>,
    pending: Pending,
    job_tx: broadcast::Sender<UpstreamJob>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    handle_node_line(line, &state, &pending, &job_tx);
                }
            }
            Ok(None) => {
                tracing::error!("Upstream node closed the connection");
                break;
            }
            Err(e) => {
                tracing::error!("Upstream node read error: {}", e);
                break;
            }
        }
    }
    // Wake every waiter with a closed channel
    pending.lock().clear();
}

#[async_trait]
impl UpstreamClient for BeamNodeClient {
    async fn connect(&self) -> Result<(), UpstreamError> {
        tracing::info!("Connecting to upstream node at {}", self.address);

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let handle = tokio::spawn(read_loop(
            read_half,
            self.state.clone(),
            self.pending.clone(),
            self.job_tx.clone(),
        ));
        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }

        let login = json!({
            "method": "login",
            "api_key": self.api_key,
            "id": LOGIN_ID,
            "jsonrpc": "2.0",
        });
        let reply = self.request(LOGIN_ID, &login).await?;

        let code = reply.get("code").and_then(Value::as_i64).unwrap_or_default();
        if code != 0 {
            let description = reply
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description")
                .to_string();
            return Err(UpstreamError::LoginRejected(description));
        }

        if let Some(fields) = reply.as_object() {
            let handshake: Map<String, Value> = fields
                .iter()
                .filter(|(k, _)| k.starts_with("forkheight"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.state.write().handshake = handshake;
        }

        tracing::info!("Logged in to upstream node {}", self.address);
        Ok(())
    }

    fn current_job(&self) -> Option<UpstreamJob> {
        self.state.read().current_job.clone()
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<UpstreamJob> {
        self.job_tx.subscribe()
    }

    async fn submit_solution(
        &self,
        upstream_job_id: &str,
        nonce_hex: &str,
        output_hex: &str,
    ) -> Result<SubmitOutcome, UpstreamError> {
        let message = json!({
            "method": "solution",
            "id": upstream_job_id,
            "nonce": nonce_hex,
            "output": output_hex,
            "jsonrpc": "2.0",
        });
        let reply = self.request(upstream_job_id, &message).await?;
        Ok(parse_submit_result(&reply))
    }

    fn handshake_fields(&self) -> Map<String, Value> {
        self.state.read().handshake.clone()
    }

    async fn close(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.pending.lock().clear();
    }
}

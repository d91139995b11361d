//! Upstream node communication
//!
//! The node pushes job notifications and accepts candidate blocks. The pool only
//! depends on [`UpstreamClient`]; [`BeamNodeClient`] is the concrete TCP client.

pub mod beam_node;

pub use beam_node::BeamNodeClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

/// Work unit as delivered by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamJob {
    pub id: String,
    pub height: u64,
    /// Network difficulty, already unpacked.
    pub difficulty: f64,
    /// Hex encoded job input.
    pub input: String,
}

/// Node verdict on a submitted solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub block_hash: Option<String>,
    pub description: String,
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not connected to upstream node")]
    NotConnected,

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout waiting for upstream response")]
    Timeout,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Connect and authenticate. Must succeed before jobs flow.
    async fn connect(&self) -> Result<(), UpstreamError>;

    /// Job currently held by the client, if one has arrived.
    fn current_job(&self) -> Option<UpstreamJob>;

    /// Stream of job notifications.
    fn subscribe_jobs(&self) -> broadcast::Receiver<UpstreamJob>;

    /// Submit a solution once. Failure is terminal for that solution.
    async fn submit_solution(
        &self,
        upstream_job_id: &str,
        nonce_hex: &str,
        output_hex: &str,
    ) -> Result<SubmitOutcome, UpstreamError>;

    /// Extra fields merged into login success replies (fork heights and similar).
    fn handshake_fields(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn close(&self) {}
}

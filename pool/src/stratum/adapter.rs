//! Protocol adapter seam
//!
//! One adapter per wire dialect. The reader half drives the client state machine
//! (unsubscribed, subscribed, authorized); the writer half encodes replies and job
//! pushes. Everything else in the pool is dialect-agnostic.

use std::sync::Arc;

use super::beam::BeamAdapter;
use super::classic::ClassicAdapter;
use super::client::Client;
use super::error::MessageError;
use super::orchestrator::Stratum;
use super::protocol::StratumRequest;
use crate::config::Dialect;
use crate::jobs::Job;

/// Whether the reader recognised the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Unhandled,
}

pub trait ProtocolAdapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Process one client message. Runs synchronously; round-trips to collaborators
    /// are spawned. `Err` means the message was malformed and nothing was validated.
    fn handle_message(
        &self,
        stratum: &Arc<Stratum>,
        client: &Arc<Client>,
        request: &StratumRequest,
    ) -> Result<Dispatch, MessageError>;

    /// Send `job` to one client.
    fn push_job(&self, client: &Client, job: &Job, is_new_block: bool);
}

pub fn for_dialect(dialect: Dialect, multiplier: f64) -> Arc<dyn ProtocolAdapter> {
    match dialect {
        Dialect::Classic => Arc::new(ClassicAdapter::new(multiplier)),
        Dialect::Beam => Arc::new(BeamAdapter::new(multiplier)),
    }
}

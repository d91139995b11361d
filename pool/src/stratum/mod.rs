pub mod error;
pub mod protocol;
pub mod client;

// Dialects behind the adapter seam
pub mod adapter;
pub mod classic;
pub mod beam;

pub mod orchestrator;
pub mod server;

// Re-exports
pub use adapter::{for_dialect, Dispatch, ProtocolAdapter};
pub use client::{Client, ClientInfo, Outbound};
pub use error::{MessageError, StratumError, StratumErrorKind};
pub use orchestrator::{AllowAll, Stratum, WorkerAuthorizer};
pub use protocol::StratumRequest;

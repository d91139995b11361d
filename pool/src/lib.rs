pub mod algorithm;
pub mod config;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod shares;
pub mod stratum;
pub mod upstream;

pub use algorithm::{Algorithm, PowVerifier};
pub use config::{Config, Dialect};
pub use events::{EventBus, StratumEvent};
pub use stratum::Stratum;

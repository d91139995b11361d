//! Domain events published by the stratum core
//!
//! Consumers (payouts, stats, operator consoles) subscribe to the [`EventBus`].
//! Names are stable and each variant carries a fixed payload.

use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::jobs::Job;
use crate::shares::ShareSummary;
use crate::stratum::client::ClientInfo;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum StratumEvent {
    ClientConnect {
        client: ClientInfo,
    },
    ClientDisconnect {
        client: ClientInfo,
        reason: String,
    },
    ClientSubscribe {
        client: ClientInfo,
    },
    ClientAuthorize {
        client: ClientInfo,
        #[serde(rename = "workerName")]
        worker_name: String,
    },
    ClientTimeout {
        client: ClientInfo,
        reason: String,
    },
    ClientSocketError {
        client: ClientInfo,
        error: String,
    },
    ClientMalformedMessage {
        client: ClientInfo,
        message: String,
        reason: String,
    },
    ClientUnknownMethod {
        client: ClientInfo,
        method: String,
    },
    ShareSubmitted {
        client: ClientInfo,
        share: ShareSummary,
    },
    NextJob {
        #[serde(serialize_with = "serialize_job")]
        job: Arc<Job>,
        #[serde(rename = "isNewBlock")]
        is_new_block: bool,
    },
    NewBlock {
        #[serde(serialize_with = "serialize_job")]
        job: Arc<Job>,
    },
}

fn serialize_job<S: Serializer>(job: &Arc<Job>, serializer: S) -> Result<S::Ok, S::Error> {
    job.as_ref().serialize(serializer)
}

impl StratumEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StratumEvent::ClientConnect { .. } => "client-connect",
            StratumEvent::ClientDisconnect { .. } => "client-disconnect",
            StratumEvent::ClientSubscribe { .. } => "client-subscribe",
            StratumEvent::ClientAuthorize { .. } => "client-authorize",
            StratumEvent::ClientTimeout { .. } => "client-timeout",
            StratumEvent::ClientSocketError { .. } => "client-socket-error",
            StratumEvent::ClientMalformedMessage { .. } => "client-malformed-message",
            StratumEvent::ClientUnknownMethod { .. } => "client-unknown-method",
            StratumEvent::ShareSubmitted { .. } => "share-submitted",
            StratumEvent::NextJob { .. } => "next-job",
            StratumEvent::NewBlock { .. } => "new-block",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StratumEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every current subscriber. Events with no subscriber are dropped.
    pub fn emit(&self, event: StratumEvent) {
        tracing::trace!("event {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StratumEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamJob;

    fn job() -> Arc<Job> {
        Arc::new(Job::new(
            "3".to_string(),
            &UpstreamJob {
                id: "u".to_string(),
                height: 9,
                difficulty: 2.0,
                input: "00".to_string(),
            },
            1.0,
        ))
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = StratumEvent::NextJob { job: job(), is_new_block: true };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "next-job");
        assert_eq!(json["isNewBlock"], true);
        assert_eq!(json["job"]["height"], 9);
        assert_eq!(event.name(), "next-job");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        bus.emit(StratumEvent::NewBlock { job: job() });

        let mut rx = bus.subscribe();
        bus.emit(StratumEvent::NewBlock { job: job() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "new-block");
        assert!(rx.try_recv().is_err());
    }
}

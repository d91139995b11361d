//! Per-connection miner state
//!
//! Tracks:
//! - Subscription / authorization flags
//! - Worker name and assigned difficulty
//! - Activity for idle detection
//! - Outbound frames to the socket writer

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Frames handed to the connection writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(String),
    Close(String),
}

#[derive(Debug, Clone)]
struct ClientState {
    is_subscribed: bool,
    is_authorized: bool,
    worker_name: Option<String>,
    difficulty: f64,
    last_activity: Instant,
}

pub struct Client {
    session_id: String,
    peer_addr: SocketAddr,
    /// Nonce prefix / extranonce1, doubles as the subscription id
    subscription_id: String,
    connected_at: Instant,
    state: Mutex<ClientState>,
    disconnected: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Snapshot of a client for event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub session_id: String,
    pub remote_address: String,
    pub subscription_id: String,
    pub worker_name: Option<String>,
    pub difficulty: f64,
    pub is_subscribed: bool,
    pub is_authorized: bool,
}

impl Client {
    pub fn new(
        session_id: String,
        peer_addr: SocketAddr,
        difficulty: f64,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        // 4 random bytes, unique enough per pool instance
        let subscription_id = hex::encode(&uuid::Uuid::new_v4().as_bytes()[..4]);

        let now = Instant::now();
        Self {
            session_id,
            peer_addr,
            subscription_id,
            connected_at: now,
            state: Mutex::new(ClientState {
                is_subscribed: false,
                is_authorized: false,
                worker_name: None,
                difficulty,
                last_activity: now,
            }),
            disconnected: AtomicBool::new(false),
            outbound,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn nonce_prefix(&self) -> &str {
        &self.subscription_id
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().is_subscribed
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.state.lock().is_subscribed = subscribed;
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().is_authorized
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.state.lock().is_authorized = authorized;
    }

    pub fn worker_name(&self) -> Option<String> {
        self.state.lock().worker_name.clone()
    }

    pub fn set_worker_name(&self, worker: impl Into<String>) {
        self.state.lock().worker_name = Some(worker.into());
    }

    pub fn difficulty(&self) -> f64 {
        self.state.lock().difficulty
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.state.lock().difficulty = difficulty;
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Queue a JSON message. Dropped silently once the client is gone.
    pub fn send(&self, message: &Value) {
        if self.is_disconnected() {
            return;
        }
        match serde_json::to_string(message) {
            Ok(mut payload) => {
                payload.push('\n');
                let _ = self.outbound.send(Outbound::Message(payload));
            }
            Err(e) => tracing::error!("Failed to encode message for {}: {}", self.session_id, e),
        }
    }

    /// Ask the transport to drop the connection. Returns false if already disconnected.
    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reason = reason.into();
        tracing::debug!("Disconnecting {} ({}): {}", self.session_id, self.peer_addr, reason);
        let _ = self.outbound.send(Outbound::Close(reason));
        true
    }

    pub fn info(&self) -> ClientInfo {
        let state = self.state.lock();
        ClientInfo {
            session_id: self.session_id.clone(),
            remote_address: self.peer_addr.to_string(),
            subscription_id: self.subscription_id.clone(),
            worker_name: state.worker_name.clone(),
            difficulty: state.difficulty,
            is_subscribed: state.is_subscribed,
            is_authorized: state.is_authorized,
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_id", &self.session_id)
            .field("peer_addr", &self.peer_addr)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn client() -> (Client, mpsc::UnboundedReceiver<Outbound>) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345);
        let (tx, rx) = mpsc::unbounded_channel();
        (Client::new("test-session".to_string(), addr, 1024.0, tx), rx)
    }

    #[test]
    fn test_client_creation() {
        let (client, _rx) = client();
        assert!(!client.is_subscribed());
        assert!(!client.is_authorized());
        assert!(client.worker_name().is_none());
        assert_eq!(client.difficulty(), 1024.0);
        assert_eq!(client.nonce_prefix().len(), 8);
        assert!(hex::decode(client.nonce_prefix()).is_ok());
    }

    #[test]
    fn test_send_appends_newline() {
        let (client, mut rx) = client();
        client.send(&serde_json::json!({"id": 1}));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Message("{\"id\":1}\n".to_string()));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (client, mut rx) = client();
        assert!(client.disconnect("bye"));
        assert!(!client.disconnect("again"));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close("bye".to_string()));
        assert!(rx.try_recv().is_err());

        client.send(&serde_json::json!({"id": 2}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_idle_detection() {
        let (client, _rx) = client();
        assert!(!client.is_idle(Duration::from_secs(60)));
        client.touch();
        assert!(client.idle_for() < Duration::from_secs(1));
    }
}

/// Stratum TCP transport
///
/// Line-delimited JSON over plain TCP. Each connection gets a reader loop feeding the
/// orchestrator one line at a time and a writer task draining the client's outbound
/// channel. A sweeper disconnects idle clients.

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::client::{Client, Outbound};
use super::orchestrator::Stratum;
use crate::events::StratumEvent;

/// Bind with SO_REUSEADDR so restarts don't trip over TIME_WAIT sockets.
pub fn bind(addr: &str) -> Result<TcpListener> {
    let sock_addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow!("Invalid address '{}': {}", addr, e))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(sock_addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(sock_addr))?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Start the accept loop and the idle sweeper.
pub fn spawn(stratum: Arc<Stratum>, listener: TcpListener) -> Vec<JoinHandle<()>> {
    let sweeper = {
        let stratum = Arc::clone(&stratum);
        tokio::spawn(async move { idle_sweeper(stratum).await })
    };

    let acceptor = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("New connection from {}", peer_addr);
                    let stratum = Arc::clone(&stratum);
                    tokio::spawn(async move {
                        handle_connection(stratum, socket, peer_addr).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    });

    vec![acceptor, sweeper]
}

async fn handle_connection(stratum: Arc<Stratum>, socket: TcpStream, peer_addr: SocketAddr) {
    let _ = socket.set_nodelay(true);
    let session_id = Uuid::new_v4().to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client = Arc::new(Client::new(
        session_id.clone(),
        peer_addr,
        stratum.config().difficulty,
        tx,
    ));
    stratum.register_client(client.clone());

    let (reader, mut writer) = socket.into_split();

    // Ends with the close reason when the core asked for a disconnect
    let mut writer_task: JoinHandle<Option<String>> = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Message(msg) => {
                    if writer.write_all(msg.as_bytes()).await.is_err() {
                        return None;
                    }
                    let _ = writer.flush().await;
                }
                Outbound::Close(reason) => {
                    let _ = writer.shutdown().await;
                    return Some(reason);
                }
            }
        }
        None
    });

    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        tokio::select! {
            closed = &mut writer_task => {
                break match closed {
                    Ok(Some(reason)) => reason,
                    _ => "Write failed".to_string(),
                };
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    tracing::trace!("Received from {}: {}", peer_addr, trimmed);
                    stratum.handle_line(&client, trimmed);
                }
                Ok(None) => break "Connection closed by client".to_string(),
                Err(e) => {
                    tracing::debug!("Socket error from {}: {}", peer_addr, e);
                    stratum.events().emit(StratumEvent::ClientSocketError {
                        client: client.info(),
                        error: e.to_string(),
                    });
                    break format!("Socket error: {}", e);
                }
            }
        }
    };

    client.disconnect(reason.clone());
    writer_task.abort();
    stratum.remove_client(&session_id, &reason);
    tracing::debug!("Connection closed: {} ({}): {}", session_id, peer_addr, reason);
}

async fn idle_sweeper(stratum: Arc<Stratum>) {
    let timeout = stratum.config().client_idle_timeout();
    let period = (timeout / 2).clamp(Duration::from_millis(100), Duration::from_secs(30));
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;

        for client in stratum.clients() {
            if client.is_disconnected() || !client.is_idle(timeout) {
                continue;
            }
            let reason = format!("Idle for more than {}s", timeout.as_secs());
            tracing::debug!("Client {} timed out", client.peer_addr());
            stratum.events().emit(StratumEvent::ClientTimeout {
                client: client.info(),
                reason: reason.clone(),
            });
            client.disconnect(reason);
        }
    }
}

//! The line-oriented TCP server. Accepts connections, never blocks the
//! accept loop on device latency, and hands each line to the trigger
//! table before submitting the resulting tasks to the device engine.

use crate::connection::ConnectionManager;
use grblproxy_core::ClientId;
use grblproxy_device::{DeviceHandle, ResponseSink};
use grblproxy_triggers::TriggerTable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const READ_CHUNK: usize = 4096;

/// A running TCP server. Dropping this without calling [`stop`](Self::stop)
/// leaves the accept loop running; always stop it explicitly during
/// service shutdown.
pub struct TcpServer {
    shutdown: Arc<Notify>,
    accept_task: JoinHandle<()>,
}

impl TcpServer {
    pub async fn bind(
        addr: SocketAddr,
        connections: ConnectionManager,
        device: DeviceHandle,
        triggers: Arc<TriggerTable>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "tcp server listening");
        let shutdown = Arc::new(Notify::new());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            connections,
            device,
            triggers,
            shutdown.clone(),
        ));
        Ok(Self { shutdown, accept_task })
    }

    /// Stop accepting new connections and cancel every in-flight
    /// connection task. Idempotent.
    pub async fn stop(self) {
        self.shutdown.notify_waiters();
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: ConnectionManager,
    device: DeviceHandle,
    triggers: Arc<TriggerTable>,
    shutdown: Arc<Notify>,
) {
    let mut clients: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                for c in clients {
                    c.abort();
                }
                break;
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(error = %e, "failed to set TCP_NODELAY");
                }
                let connections = connections.clone();
                let device = device.clone();
                let triggers = triggers.clone();
                clients.retain(|h| !h.is_finished());
                clients.push(tokio::spawn(async move {
                    handle_connection(stream, peer, connections, device, triggers).await;
                }));
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connections: ConnectionManager,
    device: DeviceHandle,
    triggers: Arc<TriggerTable>,
) {
    let (mut read_half, write_half) = stream.into_split();
    let client_id = connections.register(write_half).await;
    tracing::info!(%client_id, %peer, "client connected");

    let mut buf = vec![0u8; READ_CHUNK];
    let mut leftover = String::new();

    loop {
        let read = tokio::time::timeout(IDLE_TIMEOUT, read_half.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(%client_id, error = %e, "read error, closing connection");
                break;
            }
            Err(_) => {
                tracing::debug!(%client_id, "idle timeout, closing connection");
                break;
            }
        };
        if n == 0 {
            break; // EOF
        }

        leftover.push_str(&String::from_utf8_lossy(&buf[..n]).replace("\r\n", "\n"));
        while let Some(pos) = leftover.find('\n') {
            let line: String = leftover.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                dispatch_command(line, client_id, &connections, &device, &triggers);
            }
        }
    }

    connections.unregister(client_id);
    tracing::info!(%client_id, "client disconnected");
}

fn dispatch_command(
    line: &str,
    client_id: ClientId,
    connections: &ConnectionManager,
    device: &DeviceHandle,
    triggers: &TriggerTable,
) {
    if device.queue_full() {
        connections.unicast(
            Some(client_id),
            &format!("error: command queue is full (limit: {})", device.queue_limit()),
        );
        return;
    }

    let status = device.current_status();
    for task in triggers.build_tasks_for_gcode(line, status, Some(client_id)) {
        if let Err(e) = device.submit(task) {
            tracing::warn!(%client_id, error = %e, "failed to submit task to device engine");
        }
    }
}

//! The client registry and outbound-write actor.
//!
//! A single task owns every client's write half, following the
//! teacher's `io_task` idiom of one task per channel rather than a
//! lock shared across connections: all sends go through it, which is
//! what gives per-connection (and here, global) write serialization
//! for free.

use grblproxy_core::ClientId;
use grblproxy_device::ResponseSink;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};

enum Command {
    Register(OwnedWriteHalf, oneshot::Sender<ClientId>),
    Unregister(ClientId),
    Send(Option<ClientId>, String),
    Close(Option<ClientId>),
    SendAndClose(Option<ClientId>, String),
    Shutdown,
}

/// Handle to the connection-registry actor. Cheap to clone; every
/// clone talks to the same underlying task.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Register a newly-accepted connection's write half and mint it a
    /// [`ClientId`].
    pub async fn register(&self, writer: OwnedWriteHalf) -> ClientId {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Register(writer, reply_tx));
        reply_rx.await.expect("connection manager task is gone")
    }

    pub fn unregister(&self, client: ClientId) {
        let _ = self.tx.send(Command::Unregister(client));
    }

    pub fn close(&self, target: Option<ClientId>) {
        let _ = self.tx.send(Command::Close(target));
    }

    pub fn send_and_close(&self, target: Option<ClientId>, data: String) {
        let _ = self.tx.send(Command::SendAndClose(target, data));
    }

    /// Close every writer and stop the actor. Idempotent: a second
    /// call after the actor has already exited is a silent no-op.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

impl ResponseSink for ConnectionManager {
    fn unicast(&self, client: Option<ClientId>, line: &str) {
        let _ = self.tx.send(Command::Send(client, line.to_string()));
    }

    fn broadcast(&self, line: &str) {
        let _ = self.tx.send(Command::Send(None, line.to_string()));
    }
}

fn newline_terminated(data: &str) -> String {
    if data.ends_with('\n') {
        data.to_string()
    } else {
        format!("{data}\n")
    }
}

async fn write_to(writers: &mut HashMap<ClientId, OwnedWriteHalf>, target: Option<ClientId>, data: &str) {
    let line = newline_terminated(data);
    let mut failed = Vec::new();
    match target {
        Some(id) => {
            if let Some(w) = writers.get_mut(&id) {
                if w.write_all(line.as_bytes()).await.is_err() {
                    failed.push(id);
                }
            }
        }
        None => {
            for (&id, w) in writers.iter_mut() {
                if w.write_all(line.as_bytes()).await.is_err() {
                    failed.push(id);
                }
            }
        }
    }
    for id in failed {
        tracing::warn!(client = %id, "write failed, dropping connection");
        writers.remove(&id);
    }
}

async fn close_one_or_all(writers: &mut HashMap<ClientId, OwnedWriteHalf>, target: Option<ClientId>) {
    match target {
        Some(id) => {
            if let Some(mut w) = writers.remove(&id) {
                let _ = w.shutdown().await;
            }
        }
        None => {
            for (_, mut w) in writers.drain() {
                let _ = w.shutdown().await;
            }
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut writers: HashMap<ClientId, OwnedWriteHalf> = HashMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Register(writer, reply) => {
                let id = ClientId::new();
                writers.insert(id, writer);
                let _ = reply.send(id);
            }
            Command::Unregister(id) => {
                writers.remove(&id);
            }
            Command::Send(target, data) => write_to(&mut writers, target, &data).await,
            Command::Close(target) => close_one_or_all(&mut writers, target).await,
            Command::SendAndClose(target, data) => {
                write_to(&mut writers, target, &data).await;
                close_one_or_all(&mut writers, target).await;
            }
            Command::Shutdown => {
                close_one_or_all(&mut writers, None).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (OwnedWriteHalf, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let (_, write_half) = server_stream.into_split();
        (write_half, client)
    }

    #[tokio::test]
    async fn unicast_reaches_only_the_target_client() {
        let manager = ConnectionManager::spawn();
        let (w1, mut c1) = connected_pair().await;
        let (w2, mut c2) = connected_pair().await;
        let id1 = manager.register(w1).await;
        let _id2 = manager.register(w2).await;

        manager.unicast(Some(id1), "ok");

        let mut buf = [0u8; 16];
        let n = c1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok\n");

        tokio::select! {
            _ = c2.read(&mut buf) => panic!("client 2 should not have received anything"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let manager = ConnectionManager::spawn();
        let (w1, mut c1) = connected_pair().await;
        let (w2, mut c2) = connected_pair().await;
        manager.register(w1).await;
        manager.register(w2).await;

        manager.broadcast("<Idle|MPos:0,0,0>");

        let mut buf = [0u8; 32];
        let n1 = c1.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n1], b"<Idle|MPos:0,0,0>\n");
        let n2 = c2.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b"<Idle|MPos:0,0,0>\n");
    }

    #[tokio::test]
    async fn already_newline_terminated_lines_are_not_doubled() {
        let manager = ConnectionManager::spawn();
        let (w, mut c) = connected_pair().await;
        let id = manager.register(w).await;
        manager.unicast(Some(id), "ok\n");
        let mut buf = [0u8; 16];
        let n = c.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ok\n");
    }
}

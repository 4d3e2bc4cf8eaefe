use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use sim_runtime::Response;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::session;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Fan-out target for the per-tick notification.
pub trait TickBroadcast: Send + Sync {
    /// Deliver `TICK <n>` to every live connection; returns how many received it.
    fn broadcast_tick(&self, tick: u64) -> usize;
}

/// Live connections and their outgoing line queues.
///
/// Each connection drains its own queue on a writer thread, so broadcasting
/// only enqueues and never waits on a socket.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<Vec<(ConnectionId, Sender<String>)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. The returned sender is for direct replies.
    pub fn register(&self) -> (ConnectionId, Sender<String>, Receiver<String>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded();
        self.connections
            .lock()
            .expect("connection registry mutex poisoned")
            .push((id, sender.clone()));
        (id, sender, receiver)
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.connections
            .lock()
            .expect("connection registry mutex poisoned")
            .retain(|(existing, _)| *existing != id);
    }

    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .expect("connection registry mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a line on every connection, dropping those whose writer is gone.
    pub fn broadcast_line(&self, line: &str) -> usize {
        let mut guard = self
            .connections
            .lock()
            .expect("connection registry mutex poisoned");
        guard.retain(|(id, sender)| match sender.send(line.to_string()) {
            Ok(()) => true,
            Err(_) => {
                debug!(target: "surge::net", connection = id.0, "connection.pruned");
                false
            }
        });
        guard.len()
    }
}

impl TickBroadcast for ConnectionRegistry {
    fn broadcast_tick(&self, tick: u64) -> usize {
        self.broadcast_line(&Response::Tick(tick).to_string())
    }
}

/// Accept connections forever, one reader and one writer thread per client.
pub fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    registry: Arc<ConnectionRegistry>,
) -> io::Result<()> {
    info!(target: "surge::net", addr = %listener.local_addr()?, "server.listening");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let engine = Arc::clone(&engine);
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &engine, &registry) {
                        warn!(target: "surge::net", %err, "connection.failed");
                    }
                });
            }
            Err(err) => warn!(target: "surge::net", %err, "accept.failed"),
        }
    }
    Ok(())
}

fn handle_connection(
    stream: TcpStream,
    engine: &Engine,
    registry: &ConnectionRegistry,
) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    if let Err(err) = stream.set_nodelay(true) {
        warn!(target: "surge::net", %peer, %err, "Failed to set TCP_NODELAY");
    }
    let writer_stream = stream.try_clone()?;
    let (id, replies, outgoing) = registry.register();
    info!(target: "surge::net", %peer, connection = id.0, "client.connected");

    let writer = thread::spawn(move || write_lines(writer_stream, outgoing, peer));
    let result = read_lines(stream, engine, &replies);

    registry.unregister(id);
    drop(replies);
    let _ = writer.join();
    info!(target: "surge::net", %peer, connection = id.0, "client.disconnected");
    result
}

fn read_lines(stream: TcpStream, engine: &Engine, replies: &Sender<String>) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buffer);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!(target: "surge::intake", request = trimmed, "request.received");
        let response = session::handle_line(engine, trimmed);
        if replies.send(response.to_string()).is_err() {
            return Ok(());
        }
    }
}

fn write_lines(mut stream: TcpStream, outgoing: Receiver<String>, peer: SocketAddr) {
    for line in outgoing {
        let mut payload = line.into_bytes();
        payload.push(b'\n');
        if let Err(err) = stream.write_all(&payload) {
            warn!(target: "surge::net", %peer, %err, "Dropping client");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
    }
}

//! Control socket for remote front-ends.
//!
//! Frames are a 4-byte big-endian length followed by a JSON `Message`.  A new
//! client receives `Hello` with the full state, then the current song if one
//! is known.  `GetState` is answered on the same connection; every other
//! command goes to the core loop.

use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use deepradio_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use deepradio_proto::state::StateManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Frames above this size are treated as a broken client.
const MAX_FRAME: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ControlServer {
    state: Arc<StateManager>,
    events: mpsc::Sender<DaemonEvent>,
    broadcasts: broadcast::Sender<BroadcastMessage>,
    connected: Arc<AtomicUsize>,
}

impl ControlServer {
    pub fn new(
        state: Arc<StateManager>,
        events: mpsc::Sender<DaemonEvent>,
        broadcasts: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            state,
            events,
            broadcasts,
            connected: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn spawn(self, bind_address: String, port: u16) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let addr = format!("{}:{}", bind_address, port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("Control socket listening at {}", addr);
                    self.serve(listener).await;
                }
                Err(e) => error!("Failed to bind control socket {}: {}", addr, e),
            }
        })
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(self, listener: TcpListener) {
        let mut next_id = 0usize;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            next_id += 1;
            let id = next_id;
            let count = self.connected.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Client {} connected from {} ({} connected)", id, peer, count);

            let server = self.clone();
            tokio::spawn(async move {
                server.handle(id, stream).await;
                let count = server.connected.fetch_sub(1, Ordering::SeqCst) - 1;
                info!("Client {} disconnected ({} connected)", id, count);
            });
        }
    }

    async fn handle(&self, id: usize, stream: TcpStream) {
        let (mut reader, writer) = stream.into_split();
        let mut updates = self.broadcasts.subscribe();
        let mut session = ClientSession {
            id,
            writer,
            state: self.state.clone(),
        };
        if let Err(e) = session.greet().await {
            debug!("Client {}: greeting failed: {}", id, e);
            return;
        }

        let mut tmp = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                read = reader.read(&mut tmp) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!("Client {}: read error: {}", id, e);
                            break;
                        }
                    };
                    pending.extend_from_slice(&tmp[..n]);
                    match self.drain_frames(&mut session, &mut pending).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            debug!("Client {}: write failed: {}", id, e);
                            break;
                        }
                    }
                }
                update = updates.recv() => {
                    let Some(frame) = session.relay(update).await else {
                        break;
                    };
                    if let Err(e) = session.send(frame).await {
                        debug!("Client {}: write failed: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    /// Handle every complete frame in `pending`.  `Ok(false)` ends the
    /// connection.
    async fn drain_frames(
        &self,
        session: &mut ClientSession,
        pending: &mut Vec<u8>,
    ) -> anyhow::Result<bool> {
        while let Some(len) = frame_len(pending) {
            if len > MAX_FRAME {
                warn!("Client {}: oversized frame ({} bytes)", session.id, len);
                return Ok(false);
            }
            if pending.len() < 4 + len {
                break;
            }
            let frame: Vec<u8> = pending.drain(..4 + len).collect();
            match Message::decode(&frame) {
                Ok((Message::Command(Command::GetState), _)) => session.send_state().await?,
                Ok((Message::Command(cmd), _)) => {
                    info!("Client {} sent command: {:?}", session.id, cmd);
                    if self.events.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                        warn!("Core event channel closed");
                        return Ok(false);
                    }
                }
                Ok((Message::Broadcast(_), _)) => {
                    debug!("Client {}: ignoring broadcast frame", session.id);
                }
                Err(e) => {
                    warn!("Client {}: bad frame: {}", session.id, e);
                    session
                        .send(Broadcast::Error {
                            message: format!("malformed message: {}", e),
                        })
                        .await?;
                }
            }
        }
        Ok(true)
    }
}

fn frame_len(pending: &[u8]) -> Option<usize> {
    let header: [u8; 4] = pending.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

struct ClientSession {
    id: usize,
    writer: OwnedWriteHalf,
    state: Arc<StateManager>,
}

impl ClientSession {
    async fn greet(&mut self) -> anyhow::Result<()> {
        let state = self.state.get_state().await;
        let metadata = state.metadata.clone();
        self.send(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: state.rev,
            state,
        })
        .await?;
        if !metadata.is_empty() {
            self.send(Broadcast::Metadata { metadata }).await?;
        }
        Ok(())
    }

    async fn send_state(&mut self) -> anyhow::Result<()> {
        let data = self.state.get_state().await;
        self.send(Broadcast::State { data }).await
    }

    /// Turn a core broadcast into the frame for this client.  `None` once
    /// the broadcast channel is gone.
    async fn relay(&self, update: Result<BroadcastMessage, RecvError>) -> Option<Broadcast> {
        match update {
            Ok(BroadcastMessage::StateUpdated) => Some(Broadcast::State {
                data: self.state.get_state().await,
            }),
            Ok(BroadcastMessage::MetadataUpdated(metadata)) => {
                Some(Broadcast::Metadata { metadata })
            }
            Ok(BroadcastMessage::Log(message)) => Some(Broadcast::Log { message }),
            Err(RecvError::Lagged(n)) => {
                // Whatever was skipped is covered by a fresh snapshot
                warn!("Client {} missed {} updates", self.id, n);
                Some(Broadcast::State {
                    data: self.state.get_state().await,
                })
            }
            Err(RecvError::Closed) => None,
        }
    }

    async fn send(&mut self, broadcast: Broadcast) -> anyhow::Result<()> {
        let encoded = Message::Broadcast(broadcast).encode()?;
        self.writer.write_all(&encoded).await?;
        Ok(())
    }
}

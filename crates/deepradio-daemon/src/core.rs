//! DaemonCore: single-owner event loop for all mutable playback state.
//!
//! Client commands (TCP, HTTP, signal handlers) and completions of
//! background work (readiness, stabilization, metadata, prebuffer pool
//! changes, primitive faults) all arrive as `DaemonEvent`s on one channel.
//! DaemonCore owns the `PlaybackController` exclusively; no other task
//! touches the selection or the active primitive.
//!
//! After each event that changed the observable state, DaemonCore
//! broadcasts `BroadcastMessage::StateUpdated` to all listeners.
use std::sync::Arc;

use deepradio_proto::config::Config;
use deepradio_proto::protocol::{Command, SongMetadata, Station};
use deepradio_proto::state::{load_stations, StateManager, StationList};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::controller::{Collaborators, PlaybackController};
use crate::error::{MetadataError, PrimitiveError};
use crate::focus::GrantingFocus;
use crate::metadata::HttpMetadataSource;
use crate::mpv::MpvFactory;
use crate::primitive::{PrimitiveFault, PrimitiveId};
use crate::surface::TracingSurface;
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a TCP client, the HTTP API or a platform shim.
    ClientCommand(Command),
    /// Readiness of the primitive `id`, prepared in controller session `session`.
    Prepared {
        session: u64,
        id: PrimitiveId,
        result: Result<(), PrimitiveError>,
    },
    /// Buffered-mode stabilization delay elapsed.
    Stabilized { session: u64, id: PrimitiveId },
    /// One metadata poll, tagged with the polling session.
    Metadata {
        session: u64,
        result: Result<SongMetadata, MetadataError>,
    },
    /// A primitive failed after preparation.
    Fault(PrimitiveFault),
    /// The prebuffer pool changed in the background.
    PoolChanged,
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    controller: PlaybackController,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl DaemonCore {
    /// Production wiring: stations from config, mpv outputs, HTTP metadata.
    pub async fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let stations = load_stations(&config).await?;
        let collaborators = Collaborators {
            factory: Arc::new(MpvFactory),
            metadata: Arc::new(HttpMetadataSource::new(&config.metadata)?),
            focus: Box::new(GrantingFocus::default()),
            surface: Box::new(TracingSurface::default()),
        };
        Self::with_collaborators(config, stations, collaborators, broadcast_tx, event_tx).await
    }

    pub async fn with_collaborators(
        config: Config,
        stations: Vec<Station>,
        collaborators: Collaborators,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        info!("DaemonCore: {} stations", stations.len());
        let state_manager = Arc::new(StateManager::new(
            config.daemon.state_file.clone(),
            stations,
            config.playback.default_mode,
            config.playback.default_volume,
        ));
        // Favourite flags come from the persisted state
        let station_list = StationList::new(state_manager.get_state().await.stations)
            .with_custom_file(config.stations.custom_stations.clone());

        // Faults from any primitive, active or pooled, funnel into the loop
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<PrimitiveFault>();
        let core_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(fault) = fault_rx.recv().await {
                if core_tx.send(DaemonEvent::Fault(fault)).await.is_err() {
                    break;
                }
            }
        });

        let controller = PlaybackController::new(
            &config,
            Arc::clone(&state_manager),
            station_list,
            collaborators,
            event_tx,
            fault_tx,
            broadcast_tx.clone(),
        )
        .await;

        Ok(Self {
            controller,
            state_manager,
            broadcast_tx,
        })
    }

    /// Borrow the state manager (for the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Handle one event.  Returns `false` once shutdown was requested.
    pub async fn dispatch(&mut self, event: DaemonEvent) -> bool {
        let rev_before = self.state_manager.rev().await;

        let result = match event {
            DaemonEvent::Shutdown => {
                info!("DaemonCore: shutdown requested");
                return false;
            }
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                self.controller.handle_command(cmd).await
            }
            DaemonEvent::Prepared {
                session,
                id,
                result,
            } => self.controller.on_prepared(session, id, result).await,
            DaemonEvent::Stabilized { session, id } => {
                self.controller.on_stabilized(session, id).await
            }
            DaemonEvent::Metadata { session, result } => {
                self.controller.on_metadata(session, result).await
            }
            DaemonEvent::Fault(fault) => self.controller.on_fault(fault).await,
            DaemonEvent::PoolChanged => self.controller.on_pool_changed().await,
        };

        if let Err(e) = result {
            error!("DaemonCore: {}", e);
        }

        if self.state_manager.rev().await != rev_before {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
        true
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every event sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        while let Some(event) = event_rx.recv().await {
            if !self.dispatch(event).await {
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop playback and release every primitive.
    pub async fn shutdown(&mut self) {
        info!("DaemonCore: releasing outputs");
        self.controller.shutdown().await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

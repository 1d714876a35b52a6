//! Playback controller: the only owner of the current selection and the
//! active output primitive.
//!
//! Every method runs on the core loop.  Anything that waits (readiness,
//! Buffered stabilization, metadata) runs in a spawned task and comes back
//! as a `DaemonEvent` tagged with the session and primitive id it belongs
//! to, so completions for a superseded session are simply dropped.
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use deepradio_proto::config::{Config, PlaybackConfig};
use deepradio_proto::protocol::{
    Command, FocusChange, NowPlaying, PlaybackMode, PlaybackStatus, SongMetadata, Station,
};
use deepradio_proto::state::{next_index, prev_index, StateManager, StationList};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::DaemonEvent;
use crate::error::{MetadataError, PrimitiveError};
use crate::focus::{AudioFocus, FocusRequest};
use crate::metadata::MetadataSource;
use crate::poller::MetadataPoller;
use crate::prebuffer::PrebufferManager;
use crate::primitive::{
    await_ready, BoxedPrimitive, FaultSender, PrimitiveFactory, PrimitiveFault, PrimitiveId,
};
use crate::surface::PlaybackSurface;
use crate::BroadcastMessage;

/// Platform pieces the controller drives but does not own the behaviour of.
pub struct Collaborators {
    pub factory: Arc<dyn PrimitiveFactory>,
    pub metadata: Arc<dyn MetadataSource>,
    pub focus: Box<dyn AudioFocus>,
    pub surface: Box<dyn PlaybackSurface>,
}

struct ActivePrimitive {
    primitive: BoxedPrimitive,
    station_url: String,
    prepared: bool,
    /// Set once output is running; `start` is never sent twice.
    started: bool,
}

pub struct PlaybackController {
    config: PlaybackConfig,
    prepare_timeout: Duration,
    state: Arc<StateManager>,
    stations: StationList,
    factory: Arc<dyn PrimitiveFactory>,
    focus: Box<dyn AudioFocus>,
    surface: Box<dyn PlaybackSurface>,
    prebuffer: PrebufferManager,
    poller: MetadataPoller,
    events: mpsc::Sender<DaemonEvent>,
    faults: FaultSender,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,

    active: Option<ActivePrimitive>,
    current: Option<usize>,
    status: PlaybackStatus,
    mode: PlaybackMode,
    volume: f32,
    ducked: bool,
    /// Paused by a transient focus loss; focus gain resumes.
    paused_by_focus: bool,
    session: u64,
    stabilizing: Option<CancellationToken>,
}

impl PlaybackController {
    pub async fn new(
        config: &Config,
        state: Arc<StateManager>,
        stations: StationList,
        collaborators: Collaborators,
        events: mpsc::Sender<DaemonEvent>,
        faults: FaultSender,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let snapshot = state.get_state().await;

        let mut prebuffer = PrebufferManager::new(
            config.prebuffer.clone(),
            Arc::clone(&collaborators.factory),
            faults.clone(),
            events.clone(),
        );
        prebuffer.start_sweeper();

        let poller = MetadataPoller::new(
            collaborators.metadata,
            config.metadata.poll_interval(),
            events.clone(),
        );

        if let Some(station) = snapshot.current() {
            info!("Restored selection: {}", station.name);
        }

        Self {
            config: config.playback.clone(),
            prepare_timeout: config.prebuffer.prepare_timeout(),
            state,
            stations,
            factory: collaborators.factory,
            focus: collaborators.focus,
            surface: collaborators.surface,
            prebuffer,
            poller,
            events,
            faults,
            broadcast_tx,
            active: None,
            current: snapshot.current_station,
            status: PlaybackStatus::Idle,
            mode: snapshot.playback_mode,
            volume: snapshot.volume,
            ducked: false,
            paused_by_focus: false,
            session: 0,
            stabilizing: None,
        }
    }

    pub async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play { station_idx } => self.play(Some(station_idx)).await,
            Command::PlayUrl { url } => {
                let idx = self
                    .stations
                    .index_of(&url)
                    .ok_or_else(|| anyhow!("no station with URL {}", url))?;
                self.play(Some(idx)).await
            }
            Command::Resume => self.play(None).await,
            Command::Pause => {
                self.paused_by_focus = false;
                self.pause().await
            }
            Command::TogglePause => {
                if matches!(self.status, PlaybackStatus::Playing | PlaybackStatus::Preparing) {
                    self.paused_by_focus = false;
                    self.pause().await
                } else {
                    self.play(None).await
                }
            }
            Command::Stop => self.stop().await,
            Command::Next => self.skip_to_next().await,
            Command::Prev => self.skip_to_previous().await,
            Command::SetMode { mode } => self.set_playback_mode(mode).await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::Focus { change } => self.on_focus_change(change).await,
            Command::OutputDisconnected => self.on_output_disconnected().await,
            Command::AddStation { station } => self.add_station(station).await,
            Command::ToggleFavorite { url } => self.toggle_favorite(&url).await,
            Command::GetState => Ok(()),
        }
    }

    // ── transport ─────────────────────────────────────────────────────────────

    /// Play the station at `idx`, or resume the current selection when `idx`
    /// is `None` or already selected.
    pub async fn play(&mut self, idx: Option<usize>) -> anyhow::Result<()> {
        let Some(idx) = idx else {
            return self.resume().await;
        };
        let station = self
            .stations
            .get(idx)
            .cloned()
            .ok_or_else(|| anyhow!("no station at index {}", idx))?;
        if self.current == Some(idx) {
            return self.resume().await;
        }

        info!("Switching to {}", station.name);
        self.end_session().await;
        self.current = Some(idx);
        if let Err(e) = self.state.set_selection(Some(idx)).await {
            warn!("Failed to persist station selection: {}", e);
        }

        if self.mode == PlaybackMode::Smart {
            if let Some(entry) = self.prebuffer.take(&station.url).await {
                info!("Using prebuffered stream for {}", station.name);
                self.publish_pool().await;
                return self.adopt(&station, entry.primitive).await;
            }
        }

        self.begin_preparation(&station).await;
        Ok(())
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        let Some(station) = self.current.and_then(|idx| self.stations.get(idx)).cloned() else {
            debug!("Nothing selected, ignoring resume");
            return Ok(());
        };
        if matches!(self.status, PlaybackStatus::Playing | PlaybackStatus::Preparing) {
            return Ok(());
        }

        match self.active.as_ref().map(|a| a.prepared) {
            Some(true) => {
                self.request_focus();
                self.poller.start(&station);
                self.start_active().await;
            }
            Some(false) => {
                // Paused before readiness arrived; the pending readiness starts it
                self.request_focus();
                self.set_status(PlaybackStatus::Preparing).await;
                self.state.set_buffering(true).await;
                self.poller.start(&station);
                self.refresh_surface().await;
            }
            None => {
                self.session += 1;
                self.begin_preparation(&station).await;
            }
        }
        Ok(())
    }

    pub async fn pause(&mut self) -> anyhow::Result<()> {
        if !matches!(self.status, PlaybackStatus::Playing | PlaybackStatus::Preparing) {
            debug!("Not playing, ignoring pause");
            return Ok(());
        }

        self.cancel_stabilization();
        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.primitive.pause().await {
                warn!("Pause failed on {}: {}", active.station_url, e);
            }
            active.started = false;
        }
        self.set_status(PlaybackStatus::Paused).await;
        self.state.set_buffering(false).await;
        self.poller.stop();

        if self.mode != PlaybackMode::Smart {
            self.prebuffer.clear().await;
            self.publish_pool().await;
        }
        self.refresh_surface().await;
        info!("Paused");
        Ok(())
    }

    pub async fn stop(&mut self) -> anyhow::Result<()> {
        self.end_session().await;
        self.prebuffer.clear().await;
        self.focus.abandon();

        self.current = None;
        self.status = PlaybackStatus::Idle;
        self.ducked = false;
        self.state.set_stopped().await;
        self.surface.deactivate();
        info!("Stopped");
        Ok(())
    }

    pub async fn skip_to_next(&mut self) -> anyhow::Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        match next_index(current, self.stations.len()) {
            Some(idx) => self.play(Some(idx)).await,
            None => Ok(()),
        }
    }

    pub async fn skip_to_previous(&mut self) -> anyhow::Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        match prev_index(current, self.stations.len()) {
            Some(idx) => self.play(Some(idx)).await,
            None => Ok(()),
        }
    }

    // ── settings ──────────────────────────────────────────────────────────────

    pub async fn set_playback_mode(&mut self, mode: PlaybackMode) -> anyhow::Result<()> {
        self.mode = mode;
        if let Err(e) = self.state.set_mode(mode).await {
            warn!("Failed to persist playback mode: {}", e);
        }

        self.prebuffer.clear().await;
        self.publish_pool().await;
        if mode == PlaybackMode::Smart && self.status == PlaybackStatus::Playing {
            self.schedule_prebuffer();
        }
        info!("Playback mode: {}", mode.label());
        Ok(())
    }

    pub async fn set_volume(&mut self, value: f32) -> anyhow::Result<()> {
        self.volume = value.clamp(0.0, 1.0);
        if let Err(e) = self.state.set_volume(self.volume).await {
            warn!("Failed to persist volume: {}", e);
        }
        self.apply_volume().await;
        Ok(())
    }

    pub async fn add_station(&mut self, station: Station) -> anyhow::Result<()> {
        let name = station.name.clone();
        let idx = self.stations.add_custom(station)?;
        self.state.set_stations(self.stations.all().to_vec()).await;
        info!("Added station {} at {}", name, idx);
        Ok(())
    }

    pub async fn toggle_favorite(&mut self, url: &str) -> anyhow::Result<()> {
        let favorite = self
            .stations
            .toggle_favorite(url)
            .ok_or_else(|| anyhow!("no station with URL {}", url))?;
        self.state.set_stations(self.stations.all().to_vec()).await;
        if let Err(e) = self.state.set_favorite(url, favorite).await {
            warn!("Failed to persist favourite: {}", e);
        }
        debug!("{} favourite: {}", url, favorite);
        Ok(())
    }

    // ── platform signals ──────────────────────────────────────────────────────

    pub async fn on_focus_change(&mut self, change: FocusChange) -> anyhow::Result<()> {
        info!("Audio focus change: {:?}", change);
        match change {
            FocusChange::Loss => self.stop().await,
            FocusChange::LossTransient => {
                if matches!(self.status, PlaybackStatus::Playing | PlaybackStatus::Preparing) {
                    self.pause().await?;
                    self.paused_by_focus = true;
                }
                Ok(())
            }
            FocusChange::LossTransientCanDuck => {
                self.ducked = true;
                self.state.set_ducked(true).await;
                self.apply_volume().await;
                Ok(())
            }
            FocusChange::Gain => {
                if self.ducked {
                    self.ducked = false;
                    self.state.set_ducked(false).await;
                    self.apply_volume().await;
                }
                if self.paused_by_focus && self.status == PlaybackStatus::Paused {
                    self.paused_by_focus = false;
                    self.resume().await?;
                }
                Ok(())
            }
        }
    }

    pub async fn on_output_disconnected(&mut self) -> anyhow::Result<()> {
        info!("Audio output disconnected");
        self.paused_by_focus = false;
        self.pause().await
    }

    // ── completions ───────────────────────────────────────────────────────────

    pub async fn on_prepared(
        &mut self,
        session: u64,
        id: PrimitiveId,
        result: Result<(), PrimitiveError>,
    ) -> anyhow::Result<()> {
        if !self.is_live(session, id) {
            debug!("Dropping stale readiness of {}", id);
            return Ok(());
        }
        if let Err(e) = result {
            self.fail(e.to_string()).await;
            return Ok(());
        }

        if let Some(active) = self.active.as_mut() {
            active.prepared = true;
        }
        match self.status {
            PlaybackStatus::Preparing => match self.mode {
                PlaybackMode::Buffered => self.arm_stabilization(id),
                PlaybackMode::Instant | PlaybackMode::Smart => self.start_active().await,
            },
            PlaybackStatus::Paused => self.state.set_buffering(false).await,
            _ => {}
        }
        Ok(())
    }

    pub async fn on_stabilized(&mut self, session: u64, id: PrimitiveId) -> anyhow::Result<()> {
        if !self.is_live(session, id) || self.stabilizing.take().is_none() {
            debug!("Dropping stale stabilization of {}", id);
            return Ok(());
        }
        if self.status == PlaybackStatus::Preparing {
            self.start_active().await;
        }
        Ok(())
    }

    pub async fn on_fault(&mut self, fault: PrimitiveFault) -> anyhow::Result<()> {
        if self.active.as_ref().map(|a| a.primitive.id()) == Some(fault.id) {
            self.fail(fault.message).await;
        } else if self.prebuffer.evict(fault.id).await {
            self.publish_pool().await;
        } else {
            debug!("Ignoring fault from released primitive {}", fault.id);
        }
        Ok(())
    }

    pub async fn on_metadata(
        &mut self,
        session: u64,
        result: Result<SongMetadata, MetadataError>,
    ) -> anyhow::Result<()> {
        if !self.poller.is_current(session) {
            debug!("Dropping metadata from polling session {}", session);
            return Ok(());
        }
        match result {
            Ok(metadata) => {
                if self.state.get_state().await.metadata != metadata {
                    self.state.set_metadata(metadata.clone()).await;
                    let _ = self
                        .broadcast_tx
                        .send(BroadcastMessage::MetadataUpdated(metadata));
                    self.refresh_surface().await;
                }
            }
            Err(e) => debug!("Keeping previous metadata: {}", e),
        }
        Ok(())
    }

    pub async fn on_pool_changed(&mut self) -> anyhow::Result<()> {
        self.publish_pool().await;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop().await {
            error!("Stop during shutdown failed: {}", e);
        }
        self.prebuffer.shutdown().await;
    }

    // ── internals ─────────────────────────────────────────────────────────────

    fn is_live(&self, session: u64, id: PrimitiveId) -> bool {
        session == self.session && self.active.as_ref().map(|a| a.primitive.id()) == Some(id)
    }

    /// Tear down everything tied to the current station session.
    async fn end_session(&mut self) {
        self.session += 1;
        self.cancel_stabilization();
        self.poller.stop();
        self.prebuffer.cancel_cycle();
        self.release_active().await;
        self.paused_by_focus = false;
    }

    async fn release_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            if active.started {
                if let Err(e) = active.primitive.stop().await {
                    debug!("Stop before release failed: {}", e);
                }
            }
            active.primitive.release().await;
        }
    }

    async fn begin_preparation(&mut self, station: &Station) {
        self.request_focus();

        let mut primitive = match self.factory.create(self.faults.clone()).await {
            Ok(p) => p,
            Err(e) => {
                self.fail(format!("cannot create output: {}", e)).await;
                return;
            }
        };
        let id = primitive.id();

        let prepared: Result<_, PrimitiveError> = async {
            primitive.set_source(&station.url).await?;
            primitive.prepare().await
        }
        .await;
        let readiness = match prepared {
            Ok(readiness) => readiness,
            Err(e) => {
                primitive.release().await;
                self.fail(e.to_string()).await;
                return;
            }
        };

        debug!("Preparing {} on {}", station.name, id);
        self.active = Some(ActivePrimitive {
            primitive,
            station_url: station.url.clone(),
            prepared: false,
            started: false,
        });
        self.apply_volume().await;

        self.set_status(PlaybackStatus::Preparing).await;
        self.state.set_buffering(true).await;
        self.state.set_error(None).await;

        let session = self.session;
        let events = self.events.clone();
        let timeout = self.prepare_timeout;
        tokio::spawn(async move {
            let result = await_ready(readiness, Some(timeout)).await;
            let _ = events
                .send(DaemonEvent::Prepared {
                    session,
                    id,
                    result,
                })
                .await;
        });

        self.activate_surface().await;
        self.poller.start(station);
    }

    /// Take over an already prepared primitive and start it right away.
    async fn adopt(&mut self, station: &Station, primitive: BoxedPrimitive) -> anyhow::Result<()> {
        self.request_focus();
        self.active = Some(ActivePrimitive {
            primitive,
            station_url: station.url.clone(),
            prepared: true,
            started: false,
        });
        self.apply_volume().await;
        self.start_active().await;
        self.activate_surface().await;
        self.poller.start(station);
        Ok(())
    }

    async fn start_active(&mut self) {
        let (id, result) = match self.active.as_mut() {
            None => return,
            Some(active) if active.started => {
                debug!("{} already started", active.primitive.id());
                return;
            }
            Some(active) => {
                let result = active.primitive.start().await;
                if result.is_ok() {
                    active.started = true;
                }
                (active.primitive.id(), result)
            }
        };
        if let Err(e) = result {
            self.fail(format!("start failed: {}", e)).await;
            return;
        }

        self.paused_by_focus = false;
        self.set_status(PlaybackStatus::Playing).await;
        self.state.set_buffering(false).await;
        self.refresh_surface().await;
        info!("Output {} playing", id);

        if self.mode == PlaybackMode::Smart {
            self.schedule_prebuffer();
        }
    }

    fn arm_stabilization(&mut self, id: PrimitiveId) {
        self.cancel_stabilization();
        let token = CancellationToken::new();
        self.stabilizing = Some(token.clone());

        let delay = self.config.buffered_delay();
        let session = self.session;
        let events = self.events.clone();
        debug!("Holding {} for {:?} before start", id, delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(DaemonEvent::Stabilized { session, id }).await;
                }
            }
        });
    }

    fn cancel_stabilization(&mut self) {
        if let Some(token) = self.stabilizing.take() {
            token.cancel();
        }
    }

    /// Errors land in Idle with the selection kept.  No retry.
    async fn fail(&mut self, message: String) {
        error!("Playback failed: {}", message);
        self.session += 1;
        self.cancel_stabilization();
        self.poller.stop();
        self.release_active().await;
        self.set_status(PlaybackStatus::Idle).await;
        self.state.set_buffering(false).await;
        self.state.set_error(Some(message)).await;
        self.refresh_surface().await;
    }

    fn schedule_prebuffer(&mut self) {
        if let Some(idx) = self.current {
            self.prebuffer.schedule(self.stations.neighbours(idx));
        }
    }

    async fn publish_pool(&self) {
        self.state.set_prebuffered(self.prebuffer.urls().await).await;
    }

    async fn set_status(&mut self, status: PlaybackStatus) {
        self.status = status;
        self.state.set_status(status).await;
    }

    fn request_focus(&mut self) {
        match self.focus.request() {
            FocusRequest::Granted => {}
            other => warn!("Audio focus request {:?}, playing anyway", other),
        }
    }

    async fn apply_volume(&mut self) {
        let level = if self.ducked {
            self.config.duck_volume.min(self.volume)
        } else {
            self.volume
        };
        if let Some(active) = self.active.as_mut() {
            if let Err(e) = active.primitive.set_volume(level, level).await {
                warn!("Volume change failed: {}", e);
            }
        }
    }

    async fn now_playing(&self) -> Option<NowPlaying> {
        let snapshot = self.state.get_state().await;
        snapshot
            .current()
            .map(|station| NowPlaying::new(station, &snapshot.metadata, snapshot.is_playing))
    }

    async fn activate_surface(&mut self) {
        if let Some(now_playing) = self.now_playing().await {
            self.surface.activate(&now_playing);
        }
    }

    async fn refresh_surface(&mut self) {
        if let Some(now_playing) = self.now_playing().await {
            self.surface.update(&now_playing);
        }
    }
}

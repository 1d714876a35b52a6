//! Shared fakes and an engine harness for the daemon integration tests.
//!
//! The harness drives `DaemonCore::dispatch` directly so a test can look at
//! the state right after a single command.  Background completions are
//! delivered by `settle`, which lets tokio's paused clock run forward and
//! then feeds every queued event back into the core.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deepradio_daemon::controller::Collaborators;
use deepradio_daemon::core::{DaemonCore, DaemonEvent};
use deepradio_daemon::error::{MetadataError, PrimitiveError};
use deepradio_daemon::focus::{AudioFocus, FocusRequest};
use deepradio_daemon::metadata::MetadataSource;
use deepradio_daemon::primitive::{
    AudioPrimitive, BoxedPrimitive, FaultSender, PrimitiveFactory, PrimitiveFault, PrimitiveId,
    Readiness,
};
use deepradio_daemon::surface::PlaybackSurface;
use deepradio_daemon::BroadcastMessage;
use deepradio_proto::config::Config;
use deepradio_proto::protocol::{Command, EngineState, NowPlaying, SongMetadata, Station};
use deepradio_proto::state::StateManager;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, oneshot};

// ── stations / config ─────────────────────────────────────────────────────────

pub fn station(name: &str) -> Station {
    let slug = name.to_lowercase();
    Station {
        name: name.to_string(),
        url: format!("http://radio.test/{}", slug),
        api_url: format!("http://radio.test/{}.json", slug),
        categories: vec!["Deep".to_string()],
        ..Default::default()
    }
}

pub fn stations(names: &[&str]) -> Vec<Station> {
    names.iter().map(|n| station(n)).collect()
}

pub fn url(name: &str) -> String {
    station(name).url
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.daemon.state_file = dir.join("state.json");
    config.stations.custom_stations = dir.join("custom_stations.toml");
    config.http.enabled = false;
    config
}

// ── fake primitive ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Shared {
    auto_ready: bool,
    failing: HashSet<String>,
    created: Vec<PrimitiveId>,
    sources: HashMap<PrimitiveId, String>,
    pending: HashMap<PrimitiveId, oneshot::Sender<Result<(), PrimitiveError>>>,
    faults: HashMap<PrimitiveId, FaultSender>,
    calls: Vec<(PrimitiveId, &'static str)>,
    volumes: HashMap<PrimitiveId, f32>,
    released: HashSet<PrimitiveId>,
}

/// Primitive factory whose outputs only record what they were asked to do.
#[derive(Clone)]
pub struct FakeFactory {
    shared: Arc<Mutex<Shared>>,
}

impl FakeFactory {
    /// Every preparation succeeds immediately.
    pub fn auto_ready() -> Self {
        let factory = Self::manual();
        factory.shared.lock().unwrap().auto_ready = true;
        factory
    }

    /// Preparations stay pending until `ready` or `fail` is called.
    pub fn manual() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Preparations of `url` fail.
    pub fn fail_url(&self, url: &str) {
        self.shared.lock().unwrap().failing.insert(url.to_string());
    }

    pub fn ready(&self, id: PrimitiveId) -> bool {
        let tx = self.shared.lock().unwrap().pending.remove(&id);
        tx.map(|tx| tx.send(Ok(())).is_ok()).unwrap_or(false)
    }

    pub fn fail(&self, id: PrimitiveId, message: &str) -> bool {
        let tx = self.shared.lock().unwrap().pending.remove(&id);
        tx.map(|tx| tx.send(Err(PrimitiveError::Prepare(message.into()))).is_ok())
            .unwrap_or(false)
    }

    /// Report a mid-stream fault from `id`.
    pub fn fault(&self, id: PrimitiveId, message: &str) {
        let sender = self.shared.lock().unwrap().faults.get(&id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(PrimitiveFault {
                id,
                message: message.to_string(),
            });
        }
    }

    pub fn created(&self) -> usize {
        self.shared.lock().unwrap().created.len()
    }

    /// Primitives given `url` as source, in creation order.
    pub fn ids_for(&self, url: &str) -> Vec<PrimitiveId> {
        let shared = self.shared.lock().unwrap();
        shared
            .created
            .iter()
            .filter(|id| shared.sources.get(id).map(String::as_str) == Some(url))
            .copied()
            .collect()
    }

    pub fn last_for(&self, url: &str) -> Option<PrimitiveId> {
        self.ids_for(url).last().copied()
    }

    pub fn count(&self, id: PrimitiveId, op: &str) -> usize {
        self.shared
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(i, o)| *i == id && *o == op)
            .count()
    }

    pub fn is_released(&self, id: PrimitiveId) -> bool {
        self.shared.lock().unwrap().released.contains(&id)
    }

    /// Primitives created and not yet released.
    pub fn live(&self) -> usize {
        let shared = self.shared.lock().unwrap();
        shared
            .created
            .iter()
            .filter(|id| !shared.released.contains(id))
            .count()
    }

    pub fn volume(&self, id: PrimitiveId) -> Option<f32> {
        self.shared.lock().unwrap().volumes.get(&id).copied()
    }
}

#[async_trait]
impl PrimitiveFactory for FakeFactory {
    async fn create(&self, faults: FaultSender) -> Result<BoxedPrimitive, PrimitiveError> {
        let id = PrimitiveId::next();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.created.push(id);
            shared.faults.insert(id, faults);
        }
        Ok(Box::new(FakePrimitive {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakePrimitive {
    id: PrimitiveId,
    shared: Arc<Mutex<Shared>>,
}

impl FakePrimitive {
    fn record(&self, op: &'static str) {
        self.shared.lock().unwrap().calls.push((self.id, op));
    }
}

#[async_trait]
impl AudioPrimitive for FakePrimitive {
    fn id(&self) -> PrimitiveId {
        self.id
    }

    async fn set_source(&mut self, url: &str) -> Result<(), PrimitiveError> {
        self.record("set_source");
        self.shared
            .lock()
            .unwrap()
            .sources
            .insert(self.id, url.to_string());
        Ok(())
    }

    async fn prepare(&mut self) -> Result<Readiness, PrimitiveError> {
        self.record("prepare");
        let (tx, rx) = oneshot::channel();
        let mut shared = self.shared.lock().unwrap();
        let source = shared.sources.get(&self.id).cloned().unwrap_or_default();
        if shared.failing.contains(&source) {
            let _ = tx.send(Err(PrimitiveError::Prepare(format!("{} unreachable", source))));
        } else if shared.auto_ready {
            let _ = tx.send(Ok(()));
        } else {
            shared.pending.insert(self.id, tx);
        }
        Ok(rx)
    }

    async fn start(&mut self) -> Result<(), PrimitiveError> {
        self.record("start");
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), PrimitiveError> {
        self.record("pause");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PrimitiveError> {
        self.record("stop");
        Ok(())
    }

    async fn set_volume(&mut self, left: f32, _right: f32) -> Result<(), PrimitiveError> {
        self.record("set_volume");
        self.shared.lock().unwrap().volumes.insert(self.id, left);
        Ok(())
    }

    async fn release(&mut self) {
        self.record("release");
        let mut shared = self.shared.lock().unwrap();
        shared.released.insert(self.id);
        shared.pending.remove(&self.id);
    }
}

// ── fake metadata ─────────────────────────────────────────────────────────────

pub struct FakeMetadataSource {
    response: Mutex<Result<SongMetadata, u16>>,
    fetches: AtomicUsize,
}

impl FakeMetadataSource {
    pub fn new() -> Self {
        Self {
            response: Mutex::new(Ok(SongMetadata::default())),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn respond(&self, title: &str, artist: &str) {
        *self.response.lock().unwrap() = Ok(SongMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
            ..Default::default()
        });
    }

    pub fn fail_with(&self, status: u16) {
        *self.response.lock().unwrap() = Err(status);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for FakeMetadataSource {
    async fn fetch(&self, _station: &Station) -> Result<SongMetadata, MetadataError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(MetadataError::Status)
    }
}

// ── focus / surface recorders ─────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn last(&self, prefix: &str) -> Option<String> {
        self.entries().into_iter().rev().find(|e| e.starts_with(prefix))
    }
}

struct RecordingFocus(Recorder);

impl AudioFocus for RecordingFocus {
    fn request(&mut self) -> FocusRequest {
        self.0.push("focus:request".into());
        FocusRequest::Granted
    }

    fn abandon(&mut self) {
        self.0.push("focus:abandon".into());
    }
}

struct RecordingSurface(Recorder);

impl RecordingSurface {
    fn describe(np: &NowPlaying) -> String {
        format!("{} / {} / {}", np.title, np.artist, np.is_playing)
    }
}

impl PlaybackSurface for RecordingSurface {
    fn activate(&mut self, now_playing: &NowPlaying) {
        self.0.push(format!("surface:activate {}", Self::describe(now_playing)));
    }

    fn update(&mut self, now_playing: &NowPlaying) {
        self.0.push(format!("surface:update {}", Self::describe(now_playing)));
    }

    fn deactivate(&mut self) {
        self.0.push("surface:deactivate".into());
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub core: DaemonCore,
    pub events: mpsc::Receiver<DaemonEvent>,
    pub factory: FakeFactory,
    pub metadata: Arc<FakeMetadataSource>,
    pub recorder: Recorder,
    pub state: Arc<StateManager>,
    pub broadcasts: broadcast::Receiver<BroadcastMessage>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(stations: Vec<Station>, factory: FakeFactory) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        Self::build(config, dir, stations, factory).await
    }

    /// Start from an existing data directory (persisted settings).
    pub async fn build(
        config: Config,
        dir: TempDir,
        stations: Vec<Station>,
        factory: FakeFactory,
    ) -> Self {
        let (event_tx, events) = mpsc::channel(256);
        let (broadcast_tx, broadcasts) = broadcast::channel(1024);
        let metadata = Arc::new(FakeMetadataSource::new());
        let recorder = Recorder::default();

        let collaborators = Collaborators {
            factory: Arc::new(factory.clone()),
            metadata: metadata.clone(),
            focus: Box::new(RecordingFocus(recorder.clone())),
            surface: Box::new(RecordingSurface(recorder.clone())),
        };
        let core = DaemonCore::with_collaborators(
            config,
            stations,
            collaborators,
            broadcast_tx,
            event_tx,
        )
        .await
        .expect("core");
        let state = core.state_manager();

        Self {
            core,
            events,
            factory,
            metadata,
            recorder,
            state,
            broadcasts,
            dir,
        }
    }

    pub async fn command(&mut self, cmd: Command) {
        assert!(self.core.dispatch(DaemonEvent::ClientCommand(cmd)).await);
    }

    pub async fn dispatch(&mut self, event: DaemonEvent) {
        self.core.dispatch(event).await;
    }

    /// Let `duration` of (paused) time pass, then deliver queued events.
    pub async fn settle(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
        self.pump().await;
    }

    /// Deliver every event that is ready without moving the clock.
    pub async fn pump(&mut self) {
        loop {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            let mut delivered = 0;
            while let Ok(event) = self.events.try_recv() {
                self.core.dispatch(event).await;
                delivered += 1;
            }
            if delivered == 0 {
                break;
            }
        }
    }

    pub async fn snapshot(&self) -> EngineState {
        self.state.get_state().await
    }

    /// Play `idx` and let an auto-ready primitive come up.
    pub async fn play_and_settle(&mut self, idx: usize) {
        self.command(Command::Play { station_idx: idx }).await;
        self.settle(Duration::ZERO).await;
    }

    pub fn drain_broadcasts(&mut self) -> Vec<BroadcastMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.broadcasts.try_recv() {
            out.push(msg);
        }
        out
    }
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

use anyhow::Context;
use crate::config::Config;
use crate::protocol::{EngineState, PlaybackMode, PlaybackStatus, SongMetadata, Station};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    pub last_station_idx: Option<usize>,
    pub playback_mode: Option<PlaybackMode>,
    pub volume: f32,
    /// Stream URLs marked as favourite.
    #[serde(default)]
    pub favorites: Vec<String>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            last_station_idx: None,
            playback_mode: None,
            volume: 1.0,
            favorites: Vec::new(),
        }
    }
}

/// Owner of the observable `EngineState` snapshot.
///
/// Only the playback controller mutates through this; everyone else reads
/// snapshots via `get_state`.  Every mutation bumps `rev`.  Mode, volume,
/// favourites and the last selected station index are persisted as flat JSON.
pub struct StateManager {
    state: Arc<RwLock<EngineState>>,
    persistent: Mutex<PersistentState>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(
        state_file: PathBuf,
        mut stations: Vec<Station>,
        default_mode: PlaybackMode,
        default_volume: f32,
    ) -> Self {
        let mut persistent = Self::load_persistent(&state_file);
        if persistent.playback_mode.is_none() {
            persistent.playback_mode = Some(default_mode);
        }
        if !state_file.exists() {
            persistent.volume = default_volume;
        }

        for station in &mut stations {
            station.is_favorite = persistent.favorites.contains(&station.url);
        }

        // A stale index from a longer station list is dropped
        let current_station = persistent
            .last_station_idx
            .filter(|idx| *idx < stations.len());

        let state = EngineState {
            rev: 1,
            stations,
            current_station,
            status: PlaybackStatus::Idle,
            is_playing: false,
            is_paused: false,
            is_buffering: false,
            metadata: SongMetadata::default(),
            playback_mode: persistent.playback_mode.unwrap_or(default_mode),
            volume: persistent.volume.clamp(0.0, 1.0),
            ducked: false,
            prebuffered: Vec::new(),
            last_error: None,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            persistent: Mutex::new(persistent),
            state_file,
        }
    }

    pub async fn get_state(&self) -> EngineState {
        self.state.read().await.clone()
    }

    pub async fn rev(&self) -> u64 {
        self.state.read().await.rev
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut EngineState),
    {
        let mut state = self.state.write().await;
        f(&mut state);
        state.rev += 1;
    }

    /// Select a station (or clear the selection).  Metadata and the last
    /// error belong to the previous selection and are dropped.
    pub async fn set_selection(&self, idx: Option<usize>) -> anyhow::Result<()> {
        self.update(|state| {
            state.current_station = idx;
            state.metadata = SongMetadata::default();
            state.last_error = None;
        })
        .await;
        if let Some(idx) = idx {
            self.persistent.lock().await.last_station_idx = Some(idx);
            self.save().await?;
        }
        Ok(())
    }

    pub async fn set_status(&self, status: PlaybackStatus) {
        self.update(|state| {
            state.is_playing = status == PlaybackStatus::Playing;
            state.is_paused = status == PlaybackStatus::Paused;
            state.status = status;
        })
        .await;
    }

    pub async fn set_buffering(&self, buffering: bool) {
        self.update(|state| state.is_buffering = buffering).await;
    }

    pub async fn set_metadata(&self, metadata: SongMetadata) {
        self.update(|state| state.metadata = metadata).await;
    }

    pub async fn set_error(&self, error: Option<String>) {
        self.update(|state| state.last_error = error).await;
    }

    pub async fn set_ducked(&self, ducked: bool) {
        self.update(|state| state.ducked = ducked).await;
    }

    pub async fn set_prebuffered(&self, urls: Vec<String>) {
        self.update(|state| state.prebuffered = urls).await;
    }

    pub async fn set_stations(&self, stations: Vec<Station>) {
        self.update(|state| state.stations = stations).await;
    }

    pub async fn set_mode(&self, mode: PlaybackMode) -> anyhow::Result<()> {
        self.update(|state| state.playback_mode = mode).await;
        self.persistent.lock().await.playback_mode = Some(mode);
        self.save().await
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        self.update(|state| state.volume = volume).await;
        self.persistent.lock().await.volume = volume;
        self.save().await
    }

    /// Back to the empty defaults: no selection, no metadata, not buffering.
    /// The persisted last-station index is kept for the next start.
    pub async fn set_favorite(&self, url: &str, favorite: bool) -> anyhow::Result<()> {
        {
            let mut persistent = self.persistent.lock().await;
            persistent.favorites.retain(|u| u != url);
            if favorite {
                persistent.favorites.push(url.to_string());
            }
        }
        self.save().await
    }

    pub async fn set_stopped(&self) {
        self.update(|state| {
            state.current_station = None;
            state.status = PlaybackStatus::Idle;
            state.is_playing = false;
            state.is_paused = false;
            state.is_buffering = false;
            state.metadata = SongMetadata::default();
            state.ducked = false;
            state.prebuffered.clear();
        })
        .await;
    }

    pub async fn persisted(&self) -> PersistentState {
        self.persistent.lock().await.clone()
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = self.persistent.lock().await.clone();

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}

// ── Station list ──────────────────────────────────────────────────────────────

/// Index after `current`, wrapping to the start.
pub fn next_index(current: usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some((current + 1) % len)
}

/// Index before `current`, wrapping to the end.
pub fn prev_index(current: usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(if current == 0 || current >= len {
        len - 1
    } else {
        current - 1
    })
}

/// Ordered station list: the static list plus user-added entries.
#[derive(Debug, Clone, Default)]
pub struct StationList {
    stations: Vec<Station>,
    custom_file: Option<PathBuf>,
}

impl StationList {
    pub fn new(stations: Vec<Station>) -> Self {
        Self {
            stations,
            custom_file: None,
        }
    }

    /// Stations added through `add_custom` are appended to `path`.
    pub fn with_custom_file(mut self, path: PathBuf) -> Self {
        self.custom_file = Some(path);
        self
    }

    pub fn all(&self) -> &[Station] {
        &self.stations
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Station> {
        self.stations.get(idx)
    }

    pub fn index_of(&self, url: &str) -> Option<usize> {
        self.stations.iter().position(|s| s.url == url)
    }

    /// Cyclic previous and next stations of `idx`, without duplicates and
    /// without the station at `idx` itself.
    pub fn neighbours(&self, idx: usize) -> Vec<Station> {
        let len = self.stations.len();
        let mut out: Vec<Station> = Vec::with_capacity(2);
        for n in [prev_index(idx, len), next_index(idx, len)].into_iter().flatten() {
            if n == idx {
                continue;
            }
            let station = &self.stations[n];
            if !out.iter().any(|s| s.url == station.url) {
                out.push(station.clone());
            }
        }
        out
    }

    /// Append a user station.  Duplicate stream URLs are rejected.
    pub fn add_custom(&mut self, station: Station) -> anyhow::Result<usize> {
        if station.url.trim().is_empty() {
            anyhow::bail!("station '{}' has no stream URL", station.name);
        }
        if self.index_of(&station.url).is_some() {
            anyhow::bail!("station with URL {} already exists", station.url);
        }
        if let Some(path) = &self.custom_file {
            // An unreadable file is reported, never replaced
            let mut saved = if path.exists() {
                load_stations_from_toml(path)
                    .with_context(|| format!("reading {}", path.display()))?
            } else {
                Vec::new()
            };
            saved.push(station.clone());
            save_stations_to_toml(path, &saved)?;
        }
        self.stations.push(station);
        Ok(self.stations.len() - 1)
    }

    pub fn toggle_favorite(&mut self, url: &str) -> Option<bool> {
        let station = self.stations.iter_mut().find(|s| s.url == url)?;
        station.is_favorite = !station.is_favorite;
        Some(station.is_favorite)
    }
}

// ── Loaders ───────────────────────────────────────────────────────────────────

pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());

        stations.push(Station {
            name,
            url,
            ..Station::default()
        });
    }

    Ok(stations)
}

pub fn load_stations_from_m3u(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

/// Shape of the `[[station]]` TOML table.  Kept apart from `Station` so the
/// file schema and the wire struct can evolve independently.
#[derive(Debug, Serialize, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TomlStation {
    name: String,
    url: String,
    #[serde(default)]
    api_url: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    icon: String,
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| Station {
            name: s.name,
            url: s.url,
            api_url: s.api_url,
            categories: s.categories,
            icon: s.icon,
            is_favorite: false,
        })
        .collect();
    Ok(stations)
}

pub fn save_stations_to_toml(path: &Path, stations: &[Station]) -> anyhow::Result<()> {
    let file = TomlStationFile {
        station: stations
            .iter()
            .map(|s| TomlStation {
                name: s.name.clone(),
                url: s.url.clone(),
                api_url: s.api_url.clone(),
                categories: s.categories.clone(),
                icon: s.icon.clone(),
            })
            .collect(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&file)?)?;
    Ok(())
}

/// Build the startup station list: the static list (TOML, then m3u) followed
/// by user-added stations.
pub async fn load_stations(config: &Config) -> anyhow::Result<Vec<Station>> {
    let mut stations = load_static_stations(config).await;

    let custom_path = &config.stations.custom_stations;
    if custom_path.exists() {
        match load_stations_from_toml(custom_path) {
            Ok(custom) => {
                info!("Loaded {} custom stations from {}", custom.len(), custom_path.display());
                for station in custom {
                    if !stations.iter().any(|s| s.url == station.url) {
                        stations.push(station);
                    }
                }
            }
            Err(e) => warn!("Failed to parse custom stations ({}): {}", custom_path.display(), e),
        }
    }

    Ok(stations)
}

async fn load_static_stations(config: &Config) -> Vec<Station> {
    // 1. Configured TOML file (highest priority)
    let toml_path = &config.stations.stations_toml;
    if toml_path.exists() {
        match load_stations_from_toml(toml_path) {
            Ok(stations) => {
                info!("Loaded {} stations from TOML: {}", stations.len(), toml_path.display());
                return stations;
            }
            Err(e) => warn!("Failed to parse TOML stations ({}): {}", toml_path.display(), e),
        }
    } else {
        info!("TOML stations file not found ({}), trying m3u", toml_path.display());
    }

    // 2. stations.toml in the working directory
    let local_toml = PathBuf::from("stations.toml");
    if local_toml.exists() {
        match load_stations_from_toml(&local_toml) {
            Ok(stations) => {
                info!("Loaded {} stations from local stations.toml", stations.len());
                return stations;
            }
            Err(e) => warn!("Failed to parse local stations.toml: {}", e),
        }
    }

    // 3. m3u URL or file
    let source = config.stations.m3u_url.trim();
    if source.is_empty() {
        info!("No m3u source configured, starting with empty static list");
        return Vec::new();
    }

    info!("Loading stations from m3u: {}", source);
    if source.starts_with("http://") || source.starts_with("https://") {
        match fetch_m3u_url(source).await {
            Ok(stations) => {
                info!("Loaded {} stations from URL", stations.len());
                return stations;
            }
            Err(e) => warn!("Failed to fetch stations from URL ({}): {}", source, e),
        }
    } else {
        let path = PathBuf::from(source);
        match load_stations_from_m3u(&path) {
            Ok(stations) => {
                info!("Loaded {} stations from m3u file", stations.len());
                return stations;
            }
            Err(e) => warn!("Failed to read m3u file ({}): {}", source, e),
        }
    }

    Vec::new()
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<Station>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    parse_m3u_from_str(&text)
}

use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Name shown as the artist when a station publishes no metadata.
pub const APP_NAME: &str = "Deep Radio";

/// Messages sent from a client (UI, platform shim) to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { station_idx: usize },
    /// Play the station whose stream URL matches (media-id style lookup).
    PlayUrl { url: String },
    /// Resume the current selection.
    Resume,
    Pause,
    TogglePause,
    Stop,
    Next,
    Prev,
    SetMode { mode: PlaybackMode },
    Volume { value: f32 },
    /// Audio-focus change reported by the platform.
    Focus { change: FocusChange },
    /// The audio output device went away (headset unplugged, bluetooth dropped).
    OutputDisconnected,
    AddStation { station: Station },
    ToggleFavorite { url: String },
    GetState,
}

/// Messages sent from daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: EngineState,
    },
    State {
        data: EngineState,
    },
    Metadata {
        metadata: SongMetadata,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// How a station is brought from "ready" to audible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Start output as soon as the stream is prepared.
    #[default]
    Instant,
    /// Wait a fixed stabilization delay after prepare before starting.
    Buffered,
    /// Instant, plus speculative preparation of the neighbouring stations.
    Smart,
}

impl PlaybackMode {
    pub const ALL: [PlaybackMode; 3] = [
        PlaybackMode::Instant,
        PlaybackMode::Buffered,
        PlaybackMode::Smart,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PlaybackMode::Instant => "Instant",
            PlaybackMode::Buffered => "Buffered",
            PlaybackMode::Smart => "Smart",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PlaybackMode::Instant => "Start playing as soon as the stream is ready",
            PlaybackMode::Buffered => "Let the stream settle before playing, for weak networks",
            PlaybackMode::Smart => "Prepare neighbouring stations ahead for instant switching",
        }
    }
}

impl std::str::FromStr for PlaybackMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Ok(PlaybackMode::Instant),
            "buffered" => Ok(PlaybackMode::Buffered),
            "smart" => Ok(PlaybackMode::Smart),
            other => anyhow::bail!("unknown playback mode '{}'", other),
        }
    }
}

/// Playback status of the current station session.
///
/// Transitions:
///   Idle -> Preparing -> Playing <-> Paused -> Idle (stop)
///   Preparing | Playing -> Idle on any primitive failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Preparing,
    Playing,
    Paused,
}

/// UI-facing play/pause pair.  Always derived from `PlaybackStatus`, so
/// `is_playing` and `is_paused` are never both true.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub is_paused: bool,
}

impl From<PlaybackStatus> for PlaybackState {
    fn from(status: PlaybackStatus) -> Self {
        Self {
            is_playing: status == PlaybackStatus::Playing,
            is_paused: status == PlaybackStatus::Paused,
        }
    }
}

/// Audio-focus callbacks, as reported by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FocusChange {
    Gain,
    Loss,
    LossTransient,
    LossTransientCanDuck,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SongMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub genre: String,
}

impl SongMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.artist.is_empty()
            && self.album.is_empty()
            && self.genre.is_empty()
    }
}

/// What the foreground surface shows for the current station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlaying {
    pub station: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub is_playing: bool,
}

impl NowPlaying {
    /// Blank metadata fields fall back to the station's own details.
    pub fn new(station: &Station, metadata: &SongMetadata, is_playing: bool) -> Self {
        let or = |value: &str, fallback: String| {
            if value.trim().is_empty() {
                fallback
            } else {
                value.to_string()
            }
        };
        Self {
            station: station.name.clone(),
            title: or(&metadata.title, station.name.clone()),
            artist: or(&metadata.artist, APP_NAME.to_string()),
            album: station.name.clone(),
            genre: or(&metadata.genre, station.categories.join(", ")),
            is_playing,
        }
    }

    /// One-line summary, used for notifications and sharing.
    pub fn summary(&self, metadata: &SongMetadata) -> String {
        if metadata.title.trim().is_empty() {
            format!("Listening to: {}", self.station)
        } else {
            format!(
                "Now playing: {} - {} on {}",
                metadata.artist, metadata.title, self.station
            )
        }
    }
}

/// Full observable state of the engine.  `rev` is a monotonically increasing
/// counter incremented every time the state changes.  Clients can use it to
/// detect missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineState {
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    pub current_station: Option<usize>,
    pub status: PlaybackStatus,
    pub is_playing: bool,
    pub is_paused: bool,
    pub is_buffering: bool,
    #[serde(default)]
    pub metadata: SongMetadata,
    #[serde(default)]
    pub playback_mode: PlaybackMode,
    pub volume: f32,
    /// Output volume lowered because another app holds transient focus.
    #[serde(default)]
    pub ducked: bool,
    /// Stream URLs currently held ready by the prebuffer pool.
    #[serde(default)]
    pub prebuffered: Vec<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl EngineState {
    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState {
            is_playing: self.is_playing,
            is_paused: self.is_paused,
        }
    }

    pub fn current(&self) -> Option<&Station> {
        self.current_station.and_then(|idx| self.stations.get(idx))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Station {
    pub name: String,
    /// Stream URL.  Also the station's identity.
    pub url: String,
    /// Now-playing JSON endpoint; blank when the station has none.
    #[serde(default)]
    pub api_url: String,
    /// Searchable tags (genre, style, language, etc.)
    #[serde(default)]
    pub categories: Vec<String>,
    /// Icon reference (file name or URL)
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub is_favorite: bool,
}

impl Station {
    pub fn has_metadata_api(&self) -> bool {
        !self.api_url.trim().is_empty()
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

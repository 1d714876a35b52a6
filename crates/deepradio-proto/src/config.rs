use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::protocol::PlaybackMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub prebuffer: PrebufferConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub stations: StationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Persisted settings: playback mode, last station index, volume.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Mode used when no mode has been persisted yet.
    #[serde(default)]
    pub default_mode: PlaybackMode,
    /// Buffered mode: delay between "prepared" and "start".
    #[serde(default = "default_buffered_delay_ms")]
    pub buffered_delay_ms: u64,
    /// Output volume while another app holds duckable focus.
    #[serde(default = "default_duck_volume")]
    pub duck_volume: f32,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrebufferConfig {
    #[serde(default = "default_prebuffer_capacity")]
    pub capacity: usize,
    #[serde(default = "default_prebuffer_ttl_secs")]
    pub ttl_secs: u64,
    /// Delay after playback starts before neighbours are prepared.
    #[serde(default = "default_prebuffer_trigger_delay_ms")]
    pub trigger_delay_ms: u64,
    #[serde(default = "default_prebuffer_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,
    #[serde(default = "default_prebuffer_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_metadata_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_metadata_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Station list sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to a local TOML station file (highest priority).
    /// Defaults to `$XDG_CONFIG_HOME/deepradio/stations.toml`.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// URL or file path for an m3u station list (fallback when TOML not
    /// found).  Empty disables the fallback.
    #[serde(default)]
    pub m3u_url: String,
    /// Stations added at runtime are appended here.
    #[serde(default = "default_custom_stations")]
    pub custom_stations: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_mode: PlaybackMode::default(),
            buffered_delay_ms: default_buffered_delay_ms(),
            duck_volume: default_duck_volume(),
            default_volume: default_volume(),
        }
    }
}

impl PlaybackConfig {
    pub fn buffered_delay(&self) -> Duration {
        Duration::from_millis(self.buffered_delay_ms)
    }
}

impl Default for PrebufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_prebuffer_capacity(),
            ttl_secs: default_prebuffer_ttl_secs(),
            trigger_delay_ms: default_prebuffer_trigger_delay_ms(),
            prepare_timeout_ms: default_prebuffer_prepare_timeout_ms(),
            sweep_interval_secs: default_prebuffer_sweep_interval_secs(),
        }
    }
}

impl PrebufferConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_metadata_poll_interval_secs(),
            connect_timeout_ms: default_metadata_timeout_ms(),
            read_timeout_ms: default_metadata_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl MetadataConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: String::new(),
            custom_stations: default_custom_stations(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_buffered_delay_ms() -> u64 {
    2000
}

fn default_duck_volume() -> f32 {
    0.3
}

fn default_volume() -> f32 {
    1.0
}

fn default_prebuffer_capacity() -> usize {
    3
}

fn default_prebuffer_ttl_secs() -> u64 {
    120
}

fn default_prebuffer_trigger_delay_ms() -> u64 {
    3000
}

fn default_prebuffer_prepare_timeout_ms() -> u64 {
    15_000
}

fn default_prebuffer_sweep_interval_secs() -> u64 {
    30
}

fn default_metadata_poll_interval_secs() -> u64 {
    10
}

fn default_metadata_timeout_ms() -> u64 {
    1200
}

fn default_user_agent() -> String {
    "DeepRadio/2.0".to_string()
}

fn default_stations_toml() -> PathBuf {
    // On Windows, check for portable stations.toml in executable directory
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_stations = exe_dir.join("stations.toml");
                if portable_stations.exists() {
                    return portable_stations;
                }
            }
        }
    }

    platform::config_dir().join("stations.toml")
}

fn default_custom_stations() -> PathBuf {
    platform::data_dir().join("custom_stations.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

//! Now-playing metadata from station JSON endpoints.
//!
//! Station APIs return arbitrary JSON.  Fields are found heuristically by
//! walking the document in order and matching a few well-known key names.
use async_trait::async_trait;
use deepradio_proto::config::MetadataConfig;
use deepradio_proto::protocol::{SongMetadata, Station};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::MetadataError;

const TITLE_KEYS: &[&str] = &[
    "title",
    "song",
    "name",
    "track_title",
    "iName",
    "song_name",
    "name_translit",
];
const ARTIST_KEYS: &[&str] = &["artist", "singer", "iArtist", "track_artist", "artist_name"];
const ALBUM_KEYS: &[&str] = &["album", "album_name", "disc"];
const GENRE_KEYS: &[&str] = &["genre", "style", "category"];

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch what the station is playing right now.  A station without a
    /// metadata API yields empty metadata and no I/O.
    async fn fetch(&self, station: &Station) -> Result<SongMetadata, MetadataError>;
}

pub struct HttpMetadataSource {
    client: reqwest::Client,
}

impl HttpMetadataSource {
    pub fn new(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    /// Like `fetch`, but every failure becomes empty metadata.
    pub async fn fetch_or_empty(&self, station: &Station) -> SongMetadata {
        match self.fetch(station).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Metadata fetch for {} failed: {}", station.name, e);
                SongMetadata::default()
            }
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch(&self, station: &Station) -> Result<SongMetadata, MetadataError> {
        if !station.has_metadata_api() {
            return Ok(SongMetadata::default());
        }

        let response = self.client.get(station.api_url.trim()).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(MetadataError::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        let text = decode_body(&body);
        let json = parse_document(&text)?;
        let metadata = extract(&json);
        debug!("Metadata for {}: {:?}", station.name, metadata);
        Ok(metadata)
    }
}

// ── decoding ──────────────────────────────────────────────────────────────────

fn looks_clean(text: &str) -> bool {
    !text.contains('\u{FFFD}') && !text.contains("\\u")
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Decode a response body of unknown charset.
///
/// Tries UTF-8, Windows-1251 and ISO-8859-1 in that order and keeps the
/// first result without replacement characters or literal `\u` escapes.
/// Falls back to lossy UTF-8.
pub fn decode_body(bytes: &[u8]) -> String {
    let utf8 = String::from_utf8_lossy(bytes);
    if looks_clean(&utf8) {
        return utf8.into_owned();
    }

    let (cp1251, _, _) = encoding_rs::WINDOWS_1251.decode(bytes);
    if looks_clean(&cp1251) {
        return cp1251.into_owned();
    }

    let latin1 = decode_latin1(bytes);
    if looks_clean(&latin1) {
        return latin1;
    }

    utf8.into_owned()
}

/// Accept a JSON object or a JSON array; anything else is not metadata.
pub fn parse_document(text: &str) -> Result<Value, MetadataError> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Ok(value),
        _ => Err(MetadataError::NotJson),
    }
}

// ── extraction ────────────────────────────────────────────────────────────────

/// Walk a document in key order.  Every nested value is searched on its own
/// and only fills the fields its parent has not found yet.
pub fn extract(value: &Value) -> SongMetadata {
    let mut found = SongMetadata::default();
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::String(s) if !s.trim().is_empty() => fill(&mut found, key, s),
                    Value::Object(_) | Value::Array(_) => merge_missing(&mut found, extract(value)),
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            // Stops at the first element that completes title and artist for
            // this array, not for the whole document
            for item in items {
                merge_missing(&mut found, extract(item));
                if !found.title.is_empty() && !found.artist.is_empty() {
                    break;
                }
            }
        }
        _ => {}
    }
    found
}

fn merge_missing(found: &mut SongMetadata, nested: SongMetadata) {
    for (slot, value) in [
        (&mut found.title, nested.title),
        (&mut found.artist, nested.artist),
        (&mut found.album, nested.album),
        (&mut found.genre, nested.genre),
    ] {
        if slot.is_empty() {
            *slot = value;
        }
    }
}

fn fill(found: &mut SongMetadata, key: &str, value: &str) {
    let slot = if TITLE_KEYS.contains(&key) {
        &mut found.title
    } else if ARTIST_KEYS.contains(&key) {
        &mut found.artist
    } else if ALBUM_KEYS.contains(&key) {
        &mut found.album
    } else if GENRE_KEYS.contains(&key) {
        &mut found.genre
    } else {
        return;
    };
    if slot.is_empty() {
        *slot = value.to_string();
    }
}

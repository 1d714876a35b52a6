use std::sync::Arc;
use std::time::Duration;

use deepradio_proto::protocol::{SongMetadata, Station};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::DaemonEvent;
use crate::metadata::MetadataSource;

/// Periodic metadata fetch for the current station.
///
/// Results go back to the core as `DaemonEvent::Metadata` tagged with a
/// polling session; anything from a session other than the live one is
/// stale and must be dropped by the receiver (`is_current`).
pub struct MetadataPoller {
    source: Arc<dyn MetadataSource>,
    interval: Duration,
    events: mpsc::Sender<DaemonEvent>,
    session: u64,
    cancel: Option<CancellationToken>,
}

impl MetadataPoller {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        interval: Duration,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            source,
            interval,
            events,
            session: 0,
            cancel: None,
        }
    }

    /// Start polling `station`, superseding any previous session.
    pub fn start(&mut self, station: &Station) -> u64 {
        self.stop();
        self.session += 1;
        let session = self.session;
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        if !station.has_metadata_api() {
            debug!("{} has no metadata API, publishing empty metadata", station.name);
            let event = DaemonEvent::Metadata {
                session,
                result: Ok(SongMetadata::default()),
            };
            if self.events.try_send(event).is_err() {
                warn!("Event channel full, dropped empty metadata for {}", station.name);
            }
            return session;
        }

        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        let interval = self.interval;
        let station = station.clone();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = source.fetch(&station) => result,
                };
                if let Err(e) = &result {
                    warn!("Metadata fetch for {} failed: {}", station.name, e);
                }
                if events
                    .send(DaemonEvent::Metadata { session, result })
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Metadata polling session {} ended", session);
        });

        session
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }

    /// True if `session` is the live polling session.
    pub fn is_current(&self, session: u64) -> bool {
        self.cancel.is_some() && session == self.session
    }
}

impl Drop for MetadataPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

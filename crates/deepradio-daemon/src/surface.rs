use deepradio_proto::protocol::NowPlaying;
use tracing::info;

/// Long-running visible indicator of playback (notification, tray, media
/// session).  Activated when playback starts, updated on every change of
/// what is playing, deactivated on stop.
pub trait PlaybackSurface: Send {
    fn activate(&mut self, now_playing: &NowPlaying);
    fn update(&mut self, now_playing: &NowPlaying);
    fn deactivate(&mut self);
}

#[derive(Debug, Default)]
pub struct TracingSurface {
    last: Option<String>,
}

impl PlaybackSurface for TracingSurface {
    fn activate(&mut self, now_playing: &NowPlaying) {
        info!("Now playing surface active: {}", now_playing.station);
        self.update(now_playing);
    }

    fn update(&mut self, now_playing: &NowPlaying) {
        let state = if now_playing.is_playing { "playing" } else { "paused" };
        let line = format!("{} - {} ({})", now_playing.artist, now_playing.title, state);
        if self.last.as_deref() != Some(line.as_str()) {
            info!("{}", line);
            self.last = Some(line);
        }
    }

    fn deactivate(&mut self) {
        if self.last.take().is_some() {
            info!("Now playing surface inactive");
        }
    }
}

use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use deepradio_proto::protocol::{Command, PlaybackMode, PlaybackStatus, SongMetadata};
use deepradio_proto::state::StateManager;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct ApiState {
    stations: Vec<StationInfo>,
    current_station: Option<usize>,
    status: PlaybackStatus,
    is_playing: bool,
    is_paused: bool,
    is_buffering: bool,
    playback_mode: PlaybackMode,
    volume: f32,
    metadata: SongMetadata,
    prebuffered: Vec<String>,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct StationInfo {
    idx: usize,
    name: String,
    url: String,
    categories: Vec<String>,
    is_favorite: bool,
}

#[derive(Serialize)]
struct ModeInfo {
    mode: PlaybackMode,
    label: &'static str,
    description: &'static str,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

pub fn router(state_manager: Arc<StateManager>, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    let app_state = HttpState {
        state_manager,
        event_tx,
    };

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play/:idx", get(play_station).post(play_station))
        .route("/api/resume", get(resume).post(resume))
        .route("/api/pause", get(pause).post(pause))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/next", get(next_station).post(next_station))
        .route("/api/prev", get(prev_station).post(prev_station))
        .route("/api/modes", get(list_modes))
        .route("/api/mode/:mode", get(set_mode).post(set_mode))
        .route("/api/volume/:volume", get(set_volume).post(set_volume))
        .route("/api/volume", get(get_volume))
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state_manager, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send_command(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward HTTP command, core loop gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<ApiState> {
    let engine = state.state_manager.get_state().await;

    let stations: Vec<StationInfo> = engine
        .stations
        .iter()
        .enumerate()
        .map(|(idx, s)| StationInfo {
            idx,
            name: s.name.clone(),
            url: s.url.clone(),
            categories: s.categories.clone(),
            is_favorite: s.is_favorite,
        })
        .collect();

    Json(ApiState {
        stations,
        current_station: engine.current_station,
        status: engine.status,
        is_playing: engine.is_playing,
        is_paused: engine.is_paused,
        is_buffering: engine.is_buffering,
        playback_mode: engine.playback_mode,
        volume: engine.volume,
        metadata: engine.metadata,
        prebuffered: engine.prebuffered,
        last_error: engine.last_error,
    })
}

async fn play_station(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    info!("HTTP API: Play station {}", idx);
    send_command(&state, Command::Play { station_idx: idx }).await
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Resume");
    send_command(&state, Command::Resume).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Pause");
    send_command(&state, Command::Pause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Stop");
    send_command(&state, Command::Stop).await
}

async fn next_station(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Next station");
    send_command(&state, Command::Next).await
}

async fn prev_station(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Previous station");
    send_command(&state, Command::Prev).await
}

async fn list_modes() -> Json<Vec<ModeInfo>> {
    Json(
        PlaybackMode::ALL
            .iter()
            .map(|mode| ModeInfo {
                mode: *mode,
                label: mode.label(),
                description: mode.description(),
            })
            .collect(),
    )
}

async fn set_mode(State(state): State<HttpState>, Path(mode): Path<String>) -> StatusCode {
    match mode.parse::<PlaybackMode>() {
        Ok(mode) => {
            info!("HTTP API: Playback mode {}", mode.label());
            send_command(&state, Command::SetMode { mode }).await
        }
        Err(e) => {
            warn!("HTTP API: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let value = (volume as f32 / 100.0).clamp(0.0, 1.0);
    info!("HTTP API: Set volume to {}%", volume);
    send_command(&state, Command::Volume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let engine = state.state_manager.get_state().await;
    let volume = (engine.volume * 100.0).round() as u8;
    Json(VolumeStatus { volume })
}

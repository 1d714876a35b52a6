/// mpv-backed audio output primitive.
///
/// Architecture:
///
/// ```text
///   MpvPrimitive::spawn()
///         │
///         ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
///         ├── reader_task   ← reads JSON lines from socket
///         │                      ├── response (has request_id) → matched oneshot::Sender
///         │                      └── event                     → event channel
///         └── watch_events  ← file-loaded / end-file → readiness or fault
/// ```
///
/// Every primitive owns its own mpv process, started paused, so a prepared
/// stream keeps filling its cache without producing sound until `start`.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::error::PrimitiveError;
use crate::primitive::{
    AudioPrimitive, BoxedPrimitive, FaultSender, PrimitiveFactory, PrimitiveFault, PrimitiveId,
    Readiness,
};

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;
type ReadySlot = Arc<Mutex<Option<oneshot::Sender<Result<(), PrimitiveError>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `Some(message)` when an `end-file` means the stream is gone.  Only our
    /// own `stop` and playlist redirects are expected; a live stream never
    /// reaches `eof` on its own.
    pub fn end_file_fault(&self) -> Option<String> {
        if self.event_name()? != "end-file" {
            return None;
        }
        let reason = self
            .raw
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        match reason {
            "stop" | "redirect" => None,
            "error" => {
                let detail = self
                    .raw
                    .get("file_error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                Some(detail.to_string())
            }
            "eof" => Some("stream ended".to_string()),
            other => Some(format!("stream ended ({})", other)),
        }
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    async fn command(&self, command: Value) -> Result<(), PrimitiveError> {
        self.send(command)
            .await
            .map(|_| ())
            .map_err(|e| PrimitiveError::Backend(e.to_string()))
    }
}

// ── process / connection ──────────────────────────────────────────────────────

fn mpv_command(socket_name: &str) -> Result<tokio::process::Command, PrimitiveError> {
    let mpv_binary = deepradio_proto::platform::find_mpv_binary()
        .ok_or_else(|| PrimitiveError::Backend("mpv binary not found".into()))?;

    let mut cmd = tokio::process::Command::new(mpv_binary);
    cmd.arg("--no-video")
        .arg("--idle=yes")
        .arg("--pause=yes")
        .arg("--cache=yes")
        .arg(deepradio_proto::platform::mpv_socket_arg(socket_name))
        .arg("--quiet")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    Ok(cmd)
}

#[cfg(unix)]
async fn spawn_and_connect(
    socket_name: &str,
    event_tx: mpsc::Sender<MpvEvent>,
) -> Result<(tokio::process::Child, MpvHandle), PrimitiveError> {
    let socket_path = std::path::PathBuf::from(socket_name);
    let _ = tokio::fs::remove_file(&socket_path).await;

    let mut child = mpv_command(socket_name)?.spawn()?;

    // Wait for socket to appear
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        let _ = child.kill().await;
        return Err(PrimitiveError::Backend("mpv IPC socket did not appear".into()));
    }

    let stream = UnixStream::connect(&socket_path).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((child, start_io_tasks(BufReader::new(read_half), write_half, event_tx)))
}

#[cfg(windows)]
async fn spawn_and_connect(
    socket_name: &str,
    event_tx: mpsc::Sender<MpvEvent>,
) -> Result<(tokio::process::Child, MpvHandle), PrimitiveError> {
    let mut child = mpv_command(socket_name)?.spawn()?;

    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            let (read_half, write_half) = tokio::io::split(client);
            return Ok((child, start_io_tasks(BufReader::new(read_half), write_half, event_tx)));
        }
    }
    let _ = child.kill().await;
    Err(PrimitiveError::Backend("mpv named pipe did not appear".into()))
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── primitive ─────────────────────────────────────────────────────────────────

pub struct MpvPrimitive {
    id: PrimitiveId,
    socket_name: String,
    process: Option<tokio::process::Child>,
    handle: MpvHandle,
    source: Option<String>,
    ready: ReadySlot,
    released: Arc<AtomicBool>,
    watcher: tokio::task::JoinHandle<()>,
}

impl MpvPrimitive {
    pub async fn spawn(faults: FaultSender) -> Result<Self, PrimitiveError> {
        let id = PrimitiveId::next();
        let socket_name = deepradio_proto::platform::mpv_socket_name(id.0);

        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        let (process, handle) = spawn_and_connect(&socket_name, event_tx).await?;
        info!("mpv {}: process started", id);

        let ready: ReadySlot = Arc::new(Mutex::new(None));
        let released = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch_events(
            id,
            event_rx,
            ready.clone(),
            released.clone(),
            faults,
        ));

        Ok(Self {
            id,
            socket_name,
            process: Some(process),
            handle,
            source: None,
            ready,
            released,
            watcher,
        })
    }
}

#[async_trait]
impl AudioPrimitive for MpvPrimitive {
    fn id(&self) -> PrimitiveId {
        self.id
    }

    async fn set_source(&mut self, url: &str) -> Result<(), PrimitiveError> {
        self.source = Some(url.to_string());
        Ok(())
    }

    async fn prepare(&mut self) -> Result<Readiness, PrimitiveError> {
        let url = self.source.clone().ok_or(PrimitiveError::NoSource)?;
        let (tx, rx) = oneshot::channel();
        *self.ready.lock().await = Some(tx);
        debug!("mpv {}: loading {}", self.id, url);
        self.handle.command(json!(["loadfile", url])).await?;
        Ok(rx)
    }

    async fn start(&mut self) -> Result<(), PrimitiveError> {
        self.handle.command(json!(["set_property", "pause", false])).await
    }

    async fn pause(&mut self) -> Result<(), PrimitiveError> {
        self.handle.command(json!(["set_property", "pause", true])).await
    }

    async fn stop(&mut self) -> Result<(), PrimitiveError> {
        self.handle.command(json!(["stop"])).await
    }

    async fn set_volume(&mut self, left: f32, right: f32) -> Result<(), PrimitiveError> {
        // mpv has a single volume; balance is not supported
        let vol_pct = ((left + right) / 2.0 * 100.0).clamp(0.0, 100.0);
        self.handle
            .command(json!(["set_property", "volume", vol_pct]))
            .await
    }

    async fn release(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watcher.abort();
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        {
            let _ = tokio::fs::remove_file(&self.socket_name).await;
        }
        debug!("mpv {}: released", self.id);
    }
}

async fn watch_events(
    id: PrimitiveId,
    mut events: mpsc::Receiver<MpvEvent>,
    ready: ReadySlot,
    released: Arc<AtomicBool>,
    faults: FaultSender,
) {
    while let Some(evt) = events.recv().await {
        match evt.event_name() {
            Some("file-loaded") => {
                if let Some(tx) = ready.lock().await.take() {
                    debug!("mpv {}: file loaded", id);
                    let _ = tx.send(Ok(()));
                }
            }
            Some("end-file") => {
                let Some(message) = evt.end_file_fault() else {
                    continue;
                };
                if released.load(Ordering::SeqCst) {
                    continue;
                }
                info!("mpv {}: {}", id, message);
                match ready.lock().await.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(PrimitiveError::Prepare(message)));
                    }
                    None => {
                        let _ = faults.send(PrimitiveFault { id, message });
                    }
                }
            }
            _ => {}
        }
    }

    // Connection closed: either we released it or mpv died under us
    if !released.load(Ordering::SeqCst) {
        warn!("mpv {}: IPC connection lost", id);
        let message = "mpv process exited".to_string();
        match ready.lock().await.take() {
            Some(tx) => {
                let _ = tx.send(Err(PrimitiveError::Prepare(message)));
            }
            None => {
                let _ = faults.send(PrimitiveFault { id, message });
            }
        }
    }
}

/// Spawns a fresh mpv process per primitive.
#[derive(Debug, Default, Clone)]
pub struct MpvFactory;

#[async_trait]
impl PrimitiveFactory for MpvFactory {
    async fn create(&self, faults: FaultSender) -> Result<BoxedPrimitive, PrimitiveError> {
        Ok(Box::new(MpvPrimitive::spawn(faults).await?))
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                // Fail all pending requests
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

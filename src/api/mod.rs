//! HTTP streaming server.
//!
//! One accept thread with a shutdown flag, one thread per connection. Video
//! routes run a session pipeline on the connection thread and stream its
//! chunks as `multipart/x-mixed-replace`; the stats routes only read the
//! snapshot registry.

mod http;
pub mod multipart;
pub mod upload;

use anyhow::{anyhow, Result};
use serde_json::json;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ingest::VideoSource;
use crate::pipeline::{PipelineContext, SessionPipeline, Termination};
use crate::stats::SessionId;

use self::http::{discard_body, read_body, read_request, write_json_response, HttpRequest};
pub use self::multipart::{MultipartWriter, BOUNDARY};
pub use self::upload::UploadStore;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
pub const DEFAULT_CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

const FILE_FEED_PREFIX: &str = "/video_feed_file/";
/// Body bytes read and dropped after rejecting an upload.
const MAX_DISCARDED_BODY: usize = 16 * 1024 * 1024;
const DISCARD_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// A client that cannot take a chunk within this time is disconnected.
    pub client_write_timeout: Duration,
    pub live_device: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            upload_dir: PathBuf::from("static/uploads"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            client_write_timeout: DEFAULT_CLIENT_WRITE_TIMEOUT,
            live_device: 0,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Cancel every session, stop accepting, and wait for all connection
    /// threads to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct StreamServer {
    cfg: ApiConfig,
    context: PipelineContext,
}

struct ServerState {
    cfg: ApiConfig,
    context: PipelineContext,
    uploads: UploadStore,
    /// Doubles as the cancel flag of every session.
    shutdown: Arc<AtomicBool>,
}

impl StreamServer {
    pub fn new(cfg: ApiConfig, context: PipelineContext) -> Self {
        Self { cfg, context }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ServerState {
            uploads: UploadStore::new(&self.cfg.upload_dir)?,
            cfg: self.cfg,
            context: self.context,
            shutdown: shutdown.clone(),
        });
        log::info!("stream server listening on {}", addr);

        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, state) {
                log::error!("stream server stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if state.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                workers.push(std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log::warn!("request from {} rejected: {}", peer, err);
                    }
                }));
                workers.retain(|worker| !worker.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };

    for worker in workers {
        if worker.join().is_err() {
            log::error!("connection thread panicked");
        }
    }
    result
}

fn handle_connection(mut stream: TcpStream, state: &ServerState) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(http::head_read_timeout())?;
    stream.set_write_timeout(Some(state.cfg.client_write_timeout))?;

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/api/stats") => stats(&mut stream, &request, state),
        ("GET", "/api/sessions") => sessions(&mut stream, state),
        ("GET", "/video_feed_webcam") => stream_session(
            &mut stream,
            state,
            SessionId::live(),
            VideoSource::Device(state.cfg.live_device),
        ),
        ("GET", path) if path.starts_with(FILE_FEED_PREFIX) => file_feed(&mut stream, &request, state),
        ("POST", "/upload") => upload(&mut stream, &request, state),
        (_, "/health" | "/api/stats" | "/api/sessions" | "/video_feed_webcam" | "/upload") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        (_, path) if path.starts_with(FILE_FEED_PREFIX) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn stats(stream: &mut TcpStream, request: &HttpRequest, state: &ServerState) -> Result<()> {
    let session = match request.query_param("session") {
        Some(raw) => match SessionId::parse(raw) {
            Ok(id) => id,
            Err(_) => {
                return write_json_response(stream, 400, r#"{"error":"invalid_session"}"#);
            }
        },
        None => SessionId::live(),
    };
    let snapshot = state.context.snapshots.latest(&session);
    write_json_response(stream, 200, &serde_json::to_string(&snapshot)?)
}

fn sessions(stream: &mut TcpStream, state: &ServerState) -> Result<()> {
    let active: Vec<_> = state
        .context
        .snapshots
        .active()
        .into_iter()
        .map(|(id, snapshot)| {
            json!({
                "id": id,
                "personas": snapshot.person_count,
                "vehiculos": snapshot.vehicle_count,
            })
        })
        .collect();
    write_json_response(stream, 200, &json!({ "sessions": active }).to_string())
}

/// `/video_feed_file/<id>[?session=<16 hex digits>]`. Without `session` the
/// stream gets a fresh id; either way it is echoed in `X-Session-Id`.
fn file_feed(stream: &mut TcpStream, request: &HttpRequest, state: &ServerState) -> Result<()> {
    let name = &request.path[FILE_FEED_PREFIX.len()..];
    let Ok(file) = state.uploads.resolve(name) else {
        return write_json_response(stream, 400, r#"{"error":"invalid_identifier"}"#);
    };
    let id = match request.query_param("session").map(SessionId::parse) {
        None => SessionId::generate(),
        Some(Ok(id)) if !id.is_live() => id,
        Some(_) => return write_json_response(stream, 400, r#"{"error":"invalid_session"}"#),
    };
    if state.context.snapshots.contains(&id) {
        return write_json_response(stream, 409, r#"{"error":"session_in_use"}"#);
    }
    stream_session(stream, state, id, VideoSource::File(file))
}

fn stream_session(
    stream: &mut TcpStream,
    state: &ServerState,
    id: SessionId,
    source: VideoSource,
) -> Result<()> {
    let pipeline = SessionPipeline::new(id, source, state.context.clone(), state.shutdown.clone());
    let session = match pipeline.open() {
        Ok(session) => session,
        Err(_) => {
            return write_json_response(stream, 503, r#"{"error":"source_unavailable"}"#);
        }
    };

    let mut writer = MultipartWriter::new(stream);
    if let Err(err) = writer.begin(session.session_id()) {
        log::debug!("session {}: client gone before first chunk: {}", session.session_id(), err);
        return Ok(());
    }
    let report = session.run(&mut writer);
    if matches!(
        report.termination,
        Termination::EndOfStream | Termination::Cancelled
    ) {
        // Best effort; the client may already be gone.
        let _ = writer.finish();
    }
    Ok(())
}

fn upload(stream: &mut TcpStream, request: &HttpRequest, state: &ServerState) -> Result<()> {
    let name = match request.query_param("filename") {
        Some(name) if state.uploads.is_valid_identifier(name) => name.to_string(),
        Some(_) => return reject_upload(stream, request, 400, r#"{"error":"invalid_filename"}"#),
        None => return reject_upload(stream, request, 400, r#"{"error":"missing_filename"}"#),
    };
    let Some(length) = request.content_length() else {
        return write_json_response(stream, 411, r#"{"error":"length_required"}"#);
    };
    if length > state.cfg.max_upload_bytes {
        return reject_upload(stream, request, 413, r#"{"error":"payload_too_large"}"#);
    }

    let body = read_body(stream, request, state.cfg.max_upload_bytes)?;
    let path = match state.uploads.store(&name, &body) {
        Ok(path) => path,
        Err(err) => {
            log::error!("upload {} failed: {:#}", name, err);
            return write_json_response(stream, 500, r#"{"error":"upload_failed"}"#);
        }
    };
    log::info!("stored upload {} ({} bytes)", path.display(), body.len());
    let session = SessionId::generate();
    let response = json!({
        "id": name,
        "session": session,
        "stream": format!("{}{}?session={}", FILE_FEED_PREFIX, name, session),
    });
    write_json_response(stream, 201, &response.to_string())
}

/// Answer an upload without storing it. The unread body is drained after the
/// response so closing the socket does not reset the connection under it.
fn reject_upload(stream: &mut TcpStream, request: &HttpRequest, status: u16, body: &str) -> Result<()> {
    write_json_response(stream, status, body)?;
    stream.shutdown(Shutdown::Write)?;
    stream.set_read_timeout(Some(DISCARD_TIMEOUT))?;
    let discarded = discard_body(stream, request, MAX_DISCARDED_BODY);
    log::debug!("rejected upload ({}), discarded {} body bytes", status, discarded);
    Ok(())
}

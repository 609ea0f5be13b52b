//! Loopback status API.
//!
//! Minimal HTTP/1.1 over a std `TcpListener` on its own thread. Every
//! endpoint except `/health` requires the capability token generated at
//! spawn, presented as `Authorization: Bearer <hex>`.
//!
//! - `GET /health`
//! - `GET /status`: per-source status and notification counters
//! - `GET /events`: recent trigger events, oldest first
//! - `GET /frames/<source>/latest.jpg`: latest cached frame as JPEG; the
//!   source identifier is percent-encoded

use anyhow::{anyhow, Result};
use percent_encoding::percent_decode_str;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ApiSettings;
use crate::notify::NotificationStats;
use crate::status::SourceStatus;
use crate::supervisor::SurveillanceSupervisor;
use crate::SourceId;

const MAX_REQUEST_BYTES: usize = 8192;
const PREVIEW_JPEG_QUALITY: u8 = 85;

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Random bearer token, fixed for the lifetime of one server.
#[derive(Clone, Debug)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        if Sha256::digest(presented) != Sha256::digest(self.token) {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    sources: Vec<SourceStatus>,
    notifications: NotificationStats,
}

pub struct ApiServer {
    cfg: ApiSettings,
    supervisor: Arc<SurveillanceSupervisor>,
}

impl ApiServer {
    pub fn new(cfg: ApiSettings, supervisor: Arc<SurveillanceSupervisor>) -> Self {
        Self { cfg, supervisor }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let token_mgr = CapabilityToken::generate();
        let token = token_mgr.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let supervisor = self.supervisor;
        let token_path = self.cfg.token_path.clone();
        let join = std::thread::Builder::new()
            .name("status-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &supervisor, &token_mgr, shutdown_thread) {
                    log::error!("status api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    supervisor: &SurveillanceSupervisor,
    token_mgr: &CapabilityToken,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, supervisor, token_mgr) {
                    log::warn!("status api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    supervisor: &SurveillanceSupervisor,
    token_mgr: &CapabilityToken,
) -> Result<()> {
    // Accepted sockets can inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    let route = match Route::parse(&request.path) {
        Some(Route::Health) => {
            write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
            return Ok(());
        }
        Some(route) => route,
        None => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
            return Ok(());
        }
    };

    if request.has_query_token() {
        write_json_response(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }
    let token = match request.bearer_token() {
        Some(token) => token,
        None => {
            write_json_response(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if let Err(err) = token_mgr.validate(&token) {
        write_json_response(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(err);
    }

    match route {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?,
        Route::Status => {
            let body = StatusResponse {
                running: supervisor.is_active(),
                sources: supervisor.status(),
                notifications: supervisor.notification_stats(),
            };
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&body)?)?;
        }
        Route::Events => {
            let events = supervisor.recent_triggers();
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&events)?)?;
        }
        Route::LatestFrame(source) => {
            if supervisor.frame_cache(&source).is_none() {
                write_json_response(&mut stream, 404, r#"{"error":"unknown_source"}"#)?;
            } else if let Some(frame) = supervisor.latest_frame(&source) {
                let jpeg = frame.to_jpeg(PREVIEW_JPEG_QUALITY)?;
                write_response(&mut stream, 200, "image/jpeg", &jpeg)?;
            } else {
                write_json_response(&mut stream, 404, r#"{"error":"no_frame"}"#)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Status,
    Events,
    LatestFrame(SourceId),
}

impl Route {
    fn parse(path: &str) -> Option<Self> {
        match path {
            "/health" => return Some(Route::Health),
            "/status" => return Some(Route::Status),
            "/events" => return Some(Route::Events),
            _ => {}
        }
        let encoded = path
            .strip_prefix("/frames/")?
            .strip_suffix("/latest.jpg")?;
        if encoded.is_empty() || encoded.contains('/') {
            return None;
        }
        let id = percent_decode_str(encoded).decode_utf8().ok()?;
        Some(Route::LatestFrame(SourceId::new(id.into_owned())))
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                if let Some((k, _)) = pair.split_once('=') {
                    if k == "token" {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_decode_source_identifiers() {
        assert_eq!(Route::parse("/health"), Some(Route::Health));
        assert_eq!(Route::parse("/status"), Some(Route::Status));
        assert_eq!(
            Route::parse("/frames/rtsp%3A%2F%2Fcam%2F1/latest.jpg"),
            Some(Route::LatestFrame(SourceId::new("rtsp://cam/1")))
        );
        assert_eq!(
            Route::parse("/frames/0/latest.jpg"),
            Some(Route::LatestFrame(SourceId::new("0")))
        );
        assert_eq!(Route::parse("/frames//latest.jpg"), None);
        assert_eq!(Route::parse("/frames/a/b/latest.jpg"), None);
        assert_eq!(
            Route::parse("/frames/cam%201/latest.jpg"),
            Some(Route::LatestFrame(SourceId::new("cam 1")))
        );
        assert_eq!(Route::parse("/frames/%FF%FE/latest.jpg"), None);
        assert_eq!(Route::parse("/recordings"), None);
    }

    #[test]
    fn token_validation() {
        let token = CapabilityToken::generate();
        assert!(token.validate(&token.token_hex()).is_ok());
        assert!(token.validate(&hex::encode([0u8; 32])).is_err());
        assert!(token.validate("not-hex").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_private() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("api.token");
        write_token_file(&path, "abc")?;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path)?, "abc\n");
        Ok(())
    }
}

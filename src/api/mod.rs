use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::combiner::ControlSurface;

const MAX_REQUEST_BYTES: usize = 8192;
const HEAD_END: &[u8] = b"\r\n\r\n";
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: crate::config::DEFAULT_API_ADDR.to_string(),
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
    /// Signal the accept loop and wait for it to exit.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.join.take().map(JoinHandle::join) {
            Some(Err(_)) => Err(anyhow!("control api thread panicked")),
            _ => Ok(()),
        }
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    control: Arc<dyn ControlSurface>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, control: Arc<dyn ControlSurface>) -> Self {
        Self { cfg, control }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)
            .map_err(|e| anyhow!("failed to bind api on {}: {}", configured_addr, e))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let control = self.control;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, control.as_ref(), shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    control: &dyn ControlSurface,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if let Err(err) = serve(stream, control) {
            log::warn!("control api request rejected: {}", err);
        }
    }
    Ok(())
}

fn serve(mut stream: TcpStream, control: &dyn ControlSurface) -> Result<()> {
    stream.set_nonblocking(false)?;
    let (status, body) = if is_loopback_only(&stream)? {
        (403, br#"{"error":"forbidden"}"#.to_vec())
    } else {
        let request = match read_request(&mut stream) {
            Ok(request) => request,
            Err(err) => {
                let (status, body) = error_body(400, &err.to_string());
                let _ = write_response(&mut stream, status, &body);
                return Err(err);
            }
        };
        route(&request, control)?
    };
    write_response(&mut stream, status, &body)
}

/// A loopback listener only answers loopback peers.
fn is_loopback_only(stream: &TcpStream) -> Result<bool> {
    let local = stream.local_addr()?;
    let peer = stream.peer_addr()?;
    Ok(local.ip().is_loopback() && !peer.ip().is_loopback())
}

fn route(request: &HttpRequest, control: &dyn ControlSurface) -> Result<(u16, Vec<u8>)> {
    let path = request.path.trim_end_matches('/');
    match request.method.as_str() {
        "GET" => route_get(path, control),
        "PUT" => route_put(path, &request.body, control),
        _ => Ok((405, br#"{"error":"method_not_allowed"}"#.to_vec())),
    }
}

fn route_get(path: &str, control: &dyn ControlSurface) -> Result<(u16, Vec<u8>)> {
    match path {
        "/health" => Ok((200, br#"{"status":"ok"}"#.to_vec())),
        "" | "/status" => Ok((200, serde_json::to_vec(&control.stats())?)),
        "/nodes" => Ok((200, serde_json::to_vec(&control.stats().nodes)?)),
        _ => {
            if let Some(name) = path.strip_prefix("/nodes/") {
                let stats = control.stats();
                if let Some(node) = stats.node(name) {
                    return Ok((200, serde_json::to_vec(node)?));
                }
            }
            Ok((404, br#"{"error":"not_found"}"#.to_vec()))
        }
    }
}

fn route_put(path: &str, body: &[u8], control: &dyn ControlSurface) -> Result<(u16, Vec<u8>)> {
    match path {
        "/reset" => {}
        "" | "/status" => match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) if fields.contains_key("reset") => {}
            Ok(Value::Object(fields)) => {
                let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
                return Ok(error_body(400, &format!("Invalid path: {}", keys.join(", "))));
            }
            Ok(_) => return Ok(error_body(400, "request body must be a JSON object")),
            Err(err) => return Ok(error_body(400, &format!("invalid JSON body: {}", err))),
        },
        other => return Ok(error_body(400, &format!("Invalid path: {}", other))),
    }
    control.reset();
    Ok((200, serde_json::to_vec(&control.stats())?))
}

fn error_body(status: u16, message: &str) -> (u16, Vec<u8>) {
    let body = serde_json::json!({ "error": message });
    (status, body.to_string().into_bytes())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut data = Vec::new();
    let head_len = read_until_head_end(stream, &mut data)?;

    let head = String::from_utf8_lossy(&data[..head_len]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target)) = (request_line.next(), request_line.next()) else {
        return Err(anyhow!("malformed request line"));
    };

    let mut content_length = 0usize;
    for (name, value) in lines.filter_map(|line| line.split_once(':')) {
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid content-length"))?;
        }
    }
    let body_start = head_len + HEAD_END.len();
    let total = body_start
        .checked_add(content_length)
        .filter(|total| *total <= MAX_REQUEST_BYTES)
        .ok_or_else(|| anyhow!("request too large"))?;

    let mut chunk = [0u8; 1024];
    while data.len() < total {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        data.extend_from_slice(&chunk[..n]);
    }

    let path = target.split('?').next().unwrap_or(target).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body: data[body_start..total].to_vec(),
    })
}

/// Read until the blank line ending the request head; returns its offset.
fn read_until_head_end(stream: &mut TcpStream, data: &mut Vec<u8>) -> Result<usize> {
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = data.windows(HEAD_END.len()).position(|w| w == HEAD_END) {
            return Ok(pos);
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&chunk[..n]);
    }
}

fn write_response(stream: &mut TcpStream, status: u16, body: &[u8]) -> Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Method Not Allowed",
    };
    write!(
        stream,
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    )?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

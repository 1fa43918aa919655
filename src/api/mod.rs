//! Thin HTTP reader over the latest-value cache.
//!
//! The gateway serves whatever the cache currently holds; it never blocks
//! on the bus and never propagates internal errors to clients. An absent
//! cache entry is a 404 "not yet available", nothing more.
//!
//! Endpoints:
//! - `GET /health` - liveness
//! - `GET /status` - broker/topic summary
//! - `GET /latest_image` - raw artifact bytes with their media type
//! - `GET /latest_insight` - latest insight text as JSON
//! - `GET /latest` - HTML page combining both

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::{CacheEntry, CachedValue, LatestStateCache};

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub raw_topic: String,
    pub insight_topic: String,
    pub broker_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8780".to_string(),
            raw_topic: "camera/feed".to_string(),
            insight_topic: "llm/insight".to_string(),
            broker_addr: "127.0.0.1:1883".to_string(),
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
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    cache: LatestStateCache,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    status: &'a str,
    broker: &'a str,
    subscribed_topics: [&'a str; 2],
    image_present: bool,
    insight_present: bool,
}

#[derive(Serialize)]
struct InsightBody<'a> {
    insight: &'a str,
    last_updated_epoch_s: u64,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, cache: LatestStateCache) -> Self {
        Self { cfg, cache }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, self.cfg, self.cache, shutdown_thread) {
                log::error!("gateway api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    cache: LatestStateCache,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &cfg, &cache) {
                    log::warn!("gateway api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    cache: &LatestStateCache,
) -> Result<()> {
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match request.path.as_str() {
        "/" | "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/status" => {
            let body = StatusBody {
                status: "gateway is running",
                broker: &cfg.broker_addr,
                subscribed_topics: [&cfg.raw_topic, &cfg.insight_topic],
                image_present: cache.read(&cfg.raw_topic).is_some(),
                insight_present: cache.read(&cfg.insight_topic).is_some(),
            };
            let payload = serde_json::to_vec(&body)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/latest_image" => match cache.read(&cfg.raw_topic) {
            Some(CacheEntry {
                value: CachedValue::Artifact { bytes, media_type },
                ..
            }) => write_response(&mut stream, 200, &media_type, &bytes),
            _ => write_json_response(&mut stream, 404, r#"{"error":"no image received yet"}"#),
        },
        "/latest_insight" => match cache.read(&cfg.insight_topic) {
            Some(CacheEntry {
                value: CachedValue::Text(text),
                last_updated,
            }) => {
                let body = InsightBody {
                    insight: &text,
                    last_updated_epoch_s: epoch_seconds(last_updated),
                };
                let payload = serde_json::to_vec(&body)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            _ => write_json_response(&mut stream, 404, r#"{"error":"no insight received yet"}"#),
        },
        "/latest" => {
            let html = render_latest_page(
                cache.read(&cfg.raw_topic).as_ref(),
                cache.read(&cfg.insight_topic).as_ref(),
            );
            write_response(&mut stream, 200, "text/html; charset=utf-8", html.as_bytes())
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Combined feed page: latest image embedded as a data URL plus the
/// latest insight text, escaped for HTML.
fn render_latest_page(image: Option<&CacheEntry>, insight: Option<&CacheEntry>) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>Latest Feed and Insight</title></head>\n<body>\n\
         <h1>Latest Feed and Insight</h1>\n",
    );

    match image {
        Some(CacheEntry {
            value: CachedValue::Artifact { bytes, media_type },
            ..
        }) => {
            html.push_str(&format!(
                "<img src=\"data:{};base64,{}\" alt=\"latest frame\">\n",
                escape_html(media_type),
                BASE64.encode(bytes)
            ));
        }
        _ => html.push_str("<p>No image received yet.</p>\n"),
    }

    html.push_str("<div><h2>Insight</h2>");
    match insight {
        Some(CacheEntry {
            value: CachedValue::Text(text),
            ..
        }) => {
            html.push_str(&format!(
                "<p>{}</p>",
                escape_html(text).replace('\n', "<br>")
            ));
        }
        _ => html.push_str("<p>No insight received yet.</p>"),
    }
    html.push_str("</div>\n</body>\n</html>\n");
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn epoch_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
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
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
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
}

//! Simple HTTP health, metrics and stats server (synchronous)

use crate::cache::Cache;
use crate::config::MetricsConfig;
use crate::metrics::Metrics;
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// HTTP response produced by [`HealthServer::route`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn new(status: u16, content_type: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }
}

/// Health server state
pub struct HealthServer {
    metrics: Arc<Metrics>,
    cache: Arc<Cache>,
    ready: AtomicBool,
    running: AtomicBool,
}

impl HealthServer {
    pub fn new(metrics: Arc<Metrics>, cache: Arc<Cache>) -> Self {
        Self {
            metrics,
            cache,
            ready: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the health server (blocking, run in separate thread)
    pub fn run(self: Arc<Self>, config: &MetricsConfig) -> std::io::Result<()> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;
        info!("Health server listening on {}", config.listen_addr);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.handle_connection(stream) {
                        warn!("Health connection error: {}", e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                Err(e) => {
                    error!("Health server accept error: {}", e);
                }
            }
        }

        info!("Health server stopped");
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;

        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;

        // "GET /path HTTP/1.1"
        let mut parts = request_line.split_whitespace();
        let response = match (parts.next(), parts.next()) {
            (Some(method), Some(path)) => self.route(method, path),
            _ => HttpResponse::new(400, "text/plain", "Bad Request"),
        };
        send_response(&mut stream, &response)
    }

    /// Answer one request
    pub fn route(&self, method: &str, path: &str) -> HttpResponse {
        if method != "GET" {
            return HttpResponse::new(405, "text/plain", "Method Not Allowed");
        }

        match path {
            "/health" | "/healthz" => {
                HttpResponse::new(200, "application/json", r#"{"status":"healthy"}"#)
            }
            "/ready" | "/readyz" => {
                if self.is_ready() {
                    HttpResponse::new(200, "application/json", r#"{"status":"ready"}"#)
                } else {
                    HttpResponse::new(503, "application/json", r#"{"status":"not ready"}"#)
                }
            }
            "/metrics" => {
                self.metrics.observe_cache(self.cache.snapshot());
                match self.metrics.gather() {
                    Ok(body) => HttpResponse::new(200, "text/plain; version=0.0.4", body),
                    Err(e) => {
                        error!("Failed to encode metrics: {}", e);
                        HttpResponse::new(500, "text/plain", "Internal Server Error")
                    }
                }
            }
            "/stats" => {
                let mut stats = self.cache.stat("");
                self.metrics.extend_stats(&mut stats);
                let mut body = String::new();
                for (name, values) in &stats {
                    for value in values {
                        let _ = writeln!(body, "{name} {value}");
                    }
                }
                HttpResponse::new(200, "text/plain", body)
            }
            _ => HttpResponse::new(404, "text/plain", "Not Found"),
        }
    }
}

fn send_response(stream: &mut TcpStream, response: &HttpResponse) -> std::io::Result<()> {
    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        status_text,
        response.content_type,
        response.body.len(),
    );

    stream.write_all(head.as_bytes())?;
    stream.write_all(response.body.as_bytes())?;
    stream.flush()
}

//! Per-connection HTTP serving shared by the plain and TLS servers.
//!
//! Request heads are parsed with `httparse`; bodies are length-delimited.
//! Each parsed request runs through the engine (interceptor breakpoints,
//! then the processor pipeline) and the shaped response is written back,
//! honoring HTTP/1.x keep-alive.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Method;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::{RequestContext, ResponseContext};
use crate::interceptor::{breakpoints, InterceptorRunner};
use crate::pipeline::Pipeline;

const MAX_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 4096;

/// Canonical reason phrase for a status code.
#[must_use]
pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    }
}

/// Tracks live connections for graceful shutdown.
///
/// Shutdown is cooperative: the accept loop stops taking new connections and
/// per-connection loops notice the flag at their next read timeout.
#[derive(Default)]
pub struct ConnTracker {
    shutdown: AtomicBool,
    active: AtomicUsize,
}

impl ConnTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Register a live connection; the guard deregisters on drop.
    #[must_use]
    pub fn activate(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            tracker: self.clone(),
        }
    }

    /// Block until every tracked connection has finished, or `timeout`
    /// elapses.
    pub fn wait_idle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.active_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// RAII registration of one live connection.
pub struct ActiveGuard {
    tracker: Arc<ConnTracker>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Redirect policy for a plain-HTTP listener that fronts an HTTPS one.
#[derive(Debug, Clone, Copy)]
pub struct HttpsRedirect {
    /// Port of the HTTPS listener; 443 is omitted from the Location.
    pub port: u16,
}

/// Builder for [`ServerEngine`].
#[derive(Default)]
pub struct ServerEngineBuilder {
    pipeline: Option<Pipeline>,
    interceptors: Option<InterceptorRunner>,
    redirect: Option<HttpsRedirect>,
    max_body_size: Option<usize>,
}

impl ServerEngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn interceptors(mut self, interceptors: InterceptorRunner) -> Self {
        self.interceptors = Some(interceptors);
        self
    }

    /// Answer every request with a 301 to the HTTPS listener instead of
    /// running the pipeline.
    pub fn redirect_to_https(mut self, port: u16) -> Self {
        self.redirect = Some(HttpsRedirect { port });
        self
    }

    /// Maximum accepted request body size (default 4 MiB).
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = Some(bytes);
        self
    }

    pub fn build(self) -> Result<ServerEngine, ConfigError> {
        let Some(pipeline) = self.pipeline else {
            return Err(ConfigError::MissingField { field: "pipeline" });
        };
        if let Some(0) = self.max_body_size {
            return Err(ConfigError::InvalidValue {
                field: "max_body_size",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(ServerEngine {
            pipeline,
            interceptors: self.interceptors.unwrap_or_default(),
            redirect: self.redirect,
            max_body_size: self.max_body_size.unwrap_or(4 * 1024 * 1024),
        })
    }
}

/// Ties interceptors and the processor pipeline together per request.
pub struct ServerEngine {
    pipeline: Pipeline,
    interceptors: InterceptorRunner,
    redirect: Option<HttpsRedirect>,
    max_body_size: usize,
}

impl ServerEngine {
    #[must_use]
    pub fn builder() -> ServerEngineBuilder {
        ServerEngineBuilder::new()
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Handle one request: redirect mode, interceptor consent, pipeline.
    pub fn handle(&self, req: &mut RequestContext, res: &mut ResponseContext) {
        if let Some(redirect) = self.redirect {
            self.write_redirect(redirect, req, res);
            return;
        }
        match self
            .interceptors
            .run(breakpoints::REQUEST_PREPROCESS, req)
        {
            Ok(true) => self.pipeline.run(req, res),
            Ok(false) => self.pipeline.fail(
                &ProcessError::Rejected {
                    reason: "Forbidden".to_string(),
                },
                req,
                res,
            ),
            Err(e) => self.pipeline.fail(&e, req, res),
        }
    }

    fn write_redirect(&self, redirect: HttpsRedirect, req: &RequestContext, res: &mut ResponseContext) {
        let host = req
            .header("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_else(|| "localhost".to_string());
        let location = if redirect.port == 443 {
            format!("https://{host}{}", req.raw_path)
        } else {
            format!("https://{host}:{}{}", redirect.port, req.raw_path)
        };
        debug!(location = %location, "redirecting to https");
        res.set_status(301, None);
        res.set_header("Location", location);
    }
}

/// Outcome of reading one request off the stream.
pub(crate) enum ReadOutcome {
    Request(Box<RequestContext>),
    /// Clean close between requests.
    Closed,
    TooLarge,
    Malformed,
}

enum Fill {
    Data,
    Eof,
    Idle,
}

fn fill<S: Read>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    shutting_down: &impl Fn() -> bool,
) -> io::Result<Fill> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(Fill::Eof),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                return Ok(Fill::Data);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if shutting_down() {
                    return Ok(Fill::Idle);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Read one request, carrying pipelined bytes across calls in `leftover`.
pub(crate) fn read_request<S: Read>(
    stream: &mut S,
    peer: Option<SocketAddr>,
    max_body: usize,
    leftover: &mut Vec<u8>,
    shutting_down: impl Fn() -> bool,
) -> io::Result<ReadOutcome> {
    let mut buf = std::mem::take(leftover);
    loop {
        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut parse_req = httparse::Request::new(&mut headers);
            match parse_req.parse(&buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let method = parse_req.method.unwrap_or("GET").to_string();
                    let path = parse_req.path.unwrap_or("/").to_string();
                    let version = parse_req.version.unwrap_or(1);
                    let mut map = HashMap::with_capacity(parse_req.headers.len());
                    for h in parse_req.headers.iter() {
                        map.insert(
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).to_string(),
                        );
                    }
                    Some((head_len, method, path, version, map))
                }
                Ok(httparse::Status::Partial) => None,
                Err(_) => return Ok(ReadOutcome::Malformed),
            }
        };

        if let Some((head_len, method, path, version, headers)) = parsed {
            let content_len = headers
                .get("content-length")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if content_len > max_body {
                return Ok(ReadOutcome::TooLarge);
            }
            while buf.len() < head_len + content_len {
                match fill(stream, &mut buf, &shutting_down)? {
                    Fill::Data => {}
                    Fill::Eof | Fill::Idle => return Ok(ReadOutcome::Malformed),
                }
            }
            let body = if content_len > 0 {
                Some(buf[head_len..head_len + content_len].to_vec())
            } else {
                None
            };
            *leftover = buf.split_off(head_len + content_len);
            let Ok(method) = Method::from_bytes(method.as_bytes()) else {
                return Ok(ReadOutcome::Malformed);
            };
            let ctx = RequestContext::new(method, path, version, headers, body, peer);
            return Ok(ReadOutcome::Request(Box::new(ctx)));
        }

        if buf.len() > MAX_HEAD_BYTES {
            return Ok(ReadOutcome::Malformed);
        }
        match fill(stream, &mut buf, &shutting_down)? {
            Fill::Data => {}
            Fill::Eof => {
                return Ok(if buf.is_empty() {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::Malformed
                });
            }
            Fill::Idle => return Ok(ReadOutcome::Closed),
        }
    }
}

/// Serialize the shaped response, including staged cookies.
pub(crate) fn write_response<S: Write>(
    stream: &mut S,
    res: &mut ResponseContext,
    keep_alive: bool,
) -> io::Result<()> {
    let status = res.status();
    let reason = res
        .reason()
        .map(str::to_string)
        .unwrap_or_else(|| status_reason(status).to_string());
    let body = res.take_body();

    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in res.headers() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    for cookie in res.staged_cookies() {
        head.push_str("Set-Cookie: ");
        head.push_str(&cookie.to_header_value());
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    });
    head.push_str("\r\n");

    res.mark_started();
    stream.write_all(head.as_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

fn wants_keep_alive(req: &RequestContext) -> bool {
    let connection = req.header("connection").map(str::to_ascii_lowercase);
    match req.version_minor {
        0 => connection.as_deref() == Some("keep-alive"),
        _ => connection.as_deref() != Some("close"),
    }
}

fn error_response(status: u16) -> ResponseContext {
    let mut res = ResponseContext::new();
    res.json(
        status,
        &serde_json::json!({ "status": status, "error": status_reason(status) }),
    );
    res
}

/// Serve one accepted connection until close, error, or shutdown.
pub(crate) fn handle_connection<S: Read + Write>(
    mut stream: S,
    peer: Option<SocketAddr>,
    engine: &ServerEngine,
    tracker: &ConnTracker,
) {
    let mut leftover = Vec::new();
    loop {
        if tracker.is_shutdown() {
            break;
        }
        let outcome = read_request(
            &mut stream,
            peer,
            engine.max_body_size(),
            &mut leftover,
            || tracker.is_shutdown(),
        );
        match outcome {
            Ok(ReadOutcome::Request(mut req)) => {
                let keep_alive = wants_keep_alive(&req) && !tracker.is_shutdown();
                let mut res = ResponseContext::new();
                engine.handle(&mut req, &mut res);
                if write_response(&mut stream, &mut res, keep_alive).is_err() {
                    break;
                }
                debug!(
                    method = %req.original_method,
                    path = %req.path,
                    status = res.status(),
                    "request served"
                );
                if !keep_alive {
                    break;
                }
            }
            Ok(ReadOutcome::Closed) => break,
            Ok(ReadOutcome::TooLarge) => {
                let _ = write_response(&mut stream, &mut error_response(413), false);
                break;
            }
            Ok(ReadOutcome::Malformed) => {
                let _ = write_response(&mut stream, &mut error_response(400), false);
                break;
            }
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_simple_request() {
        let raw = b"GET /hello?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let mut stream = Cursor::new(raw);
        let mut leftover = Vec::new();
        let outcome = read_request(&mut stream, None, 1024, &mut leftover, || false).unwrap();
        match outcome {
            ReadOutcome::Request(req) => {
                assert_eq!(req.method, Method::GET);
                assert_eq!(req.path, "/hello");
                assert_eq!(req.header("host"), Some("example.com"));
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_read_request_with_body_and_pipelined_leftover() {
        let raw =
            b"POST /a HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyGET /b HTTP/1.1\r\n\r\n".to_vec();
        let mut stream = Cursor::new(raw);
        let mut leftover = Vec::new();
        let outcome = read_request(&mut stream, None, 1024, &mut leftover, || false).unwrap();
        match outcome {
            ReadOutcome::Request(req) => {
                assert_eq!(req.body.as_deref(), Some(&b"body"[..]));
            }
            _ => panic!("expected request"),
        }
        assert!(leftover.starts_with(b"GET /b"));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 9999\r\n\r\n".to_vec();
        let mut stream = Cursor::new(raw);
        let mut leftover = Vec::new();
        let outcome = read_request(&mut stream, None, 16, &mut leftover, || false).unwrap();
        assert!(matches!(outcome, ReadOutcome::TooLarge));
    }

    #[test]
    fn test_malformed_head() {
        let raw = b"NOT AN HTTP REQUEST\r\n\r\n".to_vec();
        let mut stream = Cursor::new(raw);
        let mut leftover = Vec::new();
        let outcome = read_request(&mut stream, None, 16, &mut leftover, || false).unwrap();
        assert!(matches!(outcome, ReadOutcome::Malformed));
    }

    #[test]
    fn test_write_response_includes_cookies_and_length() {
        use crate::http::cookies::{CookieOptions, StagedCookie};
        let mut res = ResponseContext::new();
        res.set_status(200, None);
        res.set_header("Content-Type", "text/plain");
        res.stage_cookie(StagedCookie {
            name: "a".to_string(),
            value: "b".to_string(),
            options: CookieOptions::default(),
        });
        res.set_body(b"hi".to_vec());
        let mut out = Vec::new();
        write_response(&mut out, &mut res, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Set-Cookie: a=b; Version=1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }
}

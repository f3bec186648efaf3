//! Per-request context pair threaded through every pipeline stage.
//!
//! The [`RequestContext`] accumulates derived fields as it passes through the
//! configured stages (query params, credentials, cookies, language, cache
//! conditions, ranges, accepted media types, resolved route). Fields are
//! additive: no stage reads a field populated by a later stage — ordering is
//! the pipeline's responsibility.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use http::Method;
use serde_json::Value;

use crate::http::cookies::StagedCookie;
use crate::http::route::Route;
use crate::services::Credentials;

/// A parsed `Accept-Language` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageTag {
    pub tag: String,
    /// `;q=` weight in `[0, 1]`; entries without a weight carry 1.0.
    pub score: f32,
}

/// A parsed `Accept` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub mime: String,
    /// `;q=` score; defaults to 1.0, including for unparseable scores.
    pub score: f32,
}

/// One sub-range of a `Range: bytes=` header.
///
/// `-500` (last 500 bytes) parses to a populated `suffix_length`; `500-`
/// (from 500 to end of resource) parses to `start` with `end` absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub suffix_length: Option<u64>,
}

/// An ETag-valued condition: the distinguished `*` wildcard, or an explicit
/// list of tags.
///
/// Tags are stored unquoted with any weak (`W/`) prefix stripped; the
/// weak/strong distinction itself is discarded at extraction, so callers
/// needing weak-comparison semantics must track it themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtagCondition {
    Wildcard,
    Tags(Vec<String>),
}

/// A `Vary`-valued condition: `*` or an explicit header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaryCondition {
    Wildcard,
    Headers(Vec<String>),
}

/// Conditional-request directives extracted from the request headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditionals {
    pub if_match: Option<EtagCondition>,
    pub if_none_match: Option<EtagCondition>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
    pub vary: Option<VaryCondition>,
}

/// CSRF token pair issued for the current request, exposed so handlers can
/// embed the secret in rendered forms.
#[derive(Debug, Clone)]
pub struct CsrfToken {
    pub id: uuid::Uuid,
    pub secret: String,
}

/// Per-request state accumulated by the processing pipeline.
#[derive(Debug)]
pub struct RequestContext {
    /// Effective method, possibly rewritten by an enabled method override.
    pub method: Method,
    /// The method the client actually sent, preserved across overrides.
    pub original_method: Method,
    /// Request path without the query string.
    pub path: String,
    /// Request path including the query string, as received.
    pub raw_path: String,
    /// HTTP minor version (0 for HTTP/1.0, 1 for HTTP/1.1).
    pub version_minor: u8,
    pub peer_addr: Option<SocketAddr>,
    /// Headers with lowercased names.
    pub headers: HashMap<String, String>,
    /// Cookies parsed from the `Cookie` header (populated by the cookie stage).
    pub cookies: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    /// Form fields from an `application/x-www-form-urlencoded` body.
    pub form_params: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub credentials: Option<Credentials>,
    /// `Accept-Language` entries in header order.
    pub languages: Vec<LanguageTag>,
    /// First `Accept-Language` entry (first-wins, not best-wins).
    pub preferred_language: Option<String>,
    pub conditionals: Conditionals,
    pub ranges: Vec<ByteRange>,
    pub accepts: Vec<MediaRange>,
    pub csrf_token: Option<CsrfToken>,
    pub path_params: HashMap<String, String>,
    pub route: Option<Arc<Route>>,
}

impl RequestContext {
    /// Build a fresh context from the raw request line pieces. Derived fields
    /// start empty and are filled in by the pipeline stages.
    pub fn new(
        method: Method,
        raw_path: impl Into<String>,
        version_minor: u8,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        let raw_path = raw_path.into();
        let path = raw_path
            .split('?')
            .next()
            .unwrap_or("/")
            .to_string();
        Self {
            original_method: method.clone(),
            method,
            path,
            raw_path,
            version_minor,
            peer_addr,
            headers,
            cookies: HashMap::new(),
            query_params: HashMap::new(),
            form_params: HashMap::new(),
            body,
            credentials: None,
            languages: Vec::new(),
            preferred_language: None,
            conditionals: Conditionals::default(),
            ranges: Vec::new(),
            accepts: Vec::new(),
            csrf_token: None,
            path_params: HashMap::new(),
            route: None,
        }
    }

    /// Get a header by name (names are stored lowercased).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|v| v.as_str())
    }

    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|v| v.as_str())
    }

    /// Parse the body as JSON, if present and well-formed.
    #[must_use]
    pub fn json_body(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }

    /// Extension of the request path (`/img/logo.png` → `png`).
    #[must_use]
    pub fn path_extension(&self) -> Option<&str> {
        let file = self.path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext)
        }
    }
}

/// Per-request response state.
///
/// Headers and status are mutable only until the response `started` streaming;
/// after that, mutation is a silent no-op (never an error), matching the
/// behavior of a response whose head is already on the wire.
#[derive(Debug)]
pub struct ResponseContext {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    staged_cookies: Vec<StagedCookie>,
    body: Vec<u8>,
    started: bool,
    status_set: bool,
}

impl Default for ResponseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: Vec::new(),
            staged_cookies: Vec::new(),
            body: Vec::new(),
            started: false,
            status_set: false,
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether a stage or handler has explicitly set the status.
    #[must_use]
    pub fn status_is_set(&self) -> bool {
        self.status_set
    }

    /// Set the status (and optionally the reason phrase). No-op once the
    /// response has started streaming.
    pub fn set_status(&mut self, status: u16, reason: Option<&str>) {
        if self.started {
            return;
        }
        self.status = status;
        self.reason = reason.map(|r| r.to_string());
        self.status_set = true;
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Replace any existing header with the same (case-insensitive) name.
    /// No-op once the response has started streaming.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        if self.started {
            return;
        }
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Append a header without replacing existing ones of the same name.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        if self.started {
            return;
        }
        self.headers.push((name.to_string(), value.into()));
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        if self.started {
            return;
        }
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Queue a cookie to be written with the response head.
    pub fn stage_cookie(&mut self, cookie: StagedCookie) {
        if self.started {
            return;
        }
        // Last staging wins for a given cookie name.
        self.staged_cookies.retain(|c| c.name != cookie.name);
        self.staged_cookies.push(cookie);
    }

    #[must_use]
    pub fn staged_cookies(&self) -> &[StagedCookie] {
        &self.staged_cookies
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Serialize `value` as the JSON body and set status + content type.
    pub fn json(&mut self, status: u16, value: &Value) {
        self.set_status(status, None);
        self.set_header("Content-Type", "application/json");
        self.body = serde_json::to_vec(value).unwrap_or_default();
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Mark the response head as flushed; all further status/header/cookie
    /// mutation becomes a no-op.
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.started
    }
}

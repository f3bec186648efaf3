//! Request-population stage.
//!
//! Derives read-only-by-convention fields from the raw request before
//! routing: query and form parameters, an optional method override, Basic
//! credentials, language preferences, conditional-request directives, byte
//! ranges, and accepted media types.
//!
//! Every parser here is total over client input: malformed headers degrade to
//! "absent/default", never to a processing failure. Client-controlled bytes
//! must not be able to crash the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::Method;
use tracing::debug;

use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::{
    ByteRange, Conditionals, EtagCondition, LanguageTag, MediaRange, RequestContext,
    ResponseContext, VaryCondition,
};
use crate::pipeline::{Flow, Processor};
use crate::services::{Credentials, CredentialsProvider};

/// Parse query string parameters from a URL path.
///
/// Only the substring after the first `?` is considered; an absent `?` yields
/// an empty map.
#[must_use]
pub fn parse_query_params(raw_path: &str) -> HashMap<String, String> {
    match raw_path.find('?') {
        Some(pos) => url::form_urlencoded::parse(raw_path[pos + 1..].as_bytes())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        None => HashMap::new(),
    }
}

/// Parse an `application/x-www-form-urlencoded` body.
#[must_use]
pub fn parse_form_params(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Extract HTTP Basic credentials from an `Authorization` header value.
///
/// The base64 payload is split on the first colon into exactly two parts;
/// anything malformed (bad base64, no colon) is discarded, not errored.
#[must_use]
pub fn parse_basic_credentials(header: &str) -> Option<Credentials> {
    let payload = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Parse an `Accept-Language` header.
///
/// Each comma-separated entry optionally carries a `;q=` weight; entries
/// without one (or with an unparseable one) weigh 1. Entry order is
/// preserved: the *first* entry is the preferred language, regardless of
/// weight.
#[must_use]
pub fn parse_accept_language(value: &str) -> Vec<LanguageTag> {
    value
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (tag, score) = match entry.split_once(';') {
                Some((tag, params)) => (tag.trim(), parse_q_value(params)),
                None => (entry, 1.0),
            };
            if tag.is_empty() {
                return None;
            }
            Some(LanguageTag {
                tag: tag.to_string(),
                score,
            })
        })
        .collect()
}

fn parse_q_value(params: &str) -> f32 {
    for param in params.split(';') {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim() == "q" {
                if let Ok(q) = value.trim().parse::<f32>() {
                    if (0.0..=1.0).contains(&q) {
                        return q;
                    }
                }
                return 1.0;
            }
        }
    }
    1.0
}

/// Parse an ETag-valued header (`If-Match`, `If-None-Match`).
///
/// `*` is the distinguished wildcard. Tags are unquoted and the weak (`W/`)
/// prefix is stripped; the weak/strong distinction itself is discarded.
#[must_use]
pub fn parse_etag_condition(value: &str) -> Option<EtagCondition> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value == "*" {
        return Some(EtagCondition::Wildcard);
    }
    let tags: Vec<String> = value
        .split(',')
        .filter_map(|tag| {
            let tag = tag.trim();
            let tag = tag.strip_prefix("W/").unwrap_or(tag);
            let tag = tag.trim_matches('"');
            if tag.is_empty() {
                None
            } else {
                Some(tag.to_string())
            }
        })
        .collect();
    if tags.is_empty() {
        None
    } else {
        Some(EtagCondition::Tags(tags))
    }
}

/// Parse a `Vary` header value.
#[must_use]
pub fn parse_vary(value: &str) -> Option<VaryCondition> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value == "*" {
        return Some(VaryCondition::Wildcard);
    }
    let headers: Vec<String> = value
        .split(',')
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if headers.is_empty() {
        None
    } else {
        Some(VaryCondition::Headers(headers))
    }
}

/// Parse a `Range` header. Only the `bytes=` unit is recognized.
///
/// `0-499` → start/end, `500-` → start to end-of-resource, `-500` → last 500
/// bytes (`suffix_length`). Malformed sub-ranges are dropped.
#[must_use]
pub fn parse_ranges(value: &str) -> Vec<ByteRange> {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Vec::new();
    };
    spec.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (left, right) = part.split_once('-')?;
            if left.is_empty() {
                // Suffix form: last N bytes.
                let n = right.trim().parse::<u64>().ok()?;
                Some(ByteRange {
                    start: None,
                    end: None,
                    suffix_length: Some(n),
                })
            } else {
                let start = left.trim().parse::<u64>().ok()?;
                let end = if right.trim().is_empty() {
                    None
                } else {
                    Some(right.trim().parse::<u64>().ok()?)
                };
                Some(ByteRange {
                    start: Some(start),
                    end,
                    suffix_length: None,
                })
            }
        })
        .collect()
}

/// Parse an `Accept` header. Media types with no explicit `;q=` score 1; an
/// unparseable score also defaults to 1 (never an error).
#[must_use]
pub fn parse_accept(value: &str) -> Vec<MediaRange> {
    value
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (mime, score) = match entry.split_once(';') {
                Some((mime, params)) => (mime.trim(), parse_q_value(params)),
                None => (entry, 1.0),
            };
            if mime.is_empty() {
                return None;
            }
            Some(MediaRange {
                mime: mime.to_string(),
                score,
            })
        })
        .collect()
}

/// Builder for [`RequestProcessor`].
pub struct RequestProcessorBuilder {
    method_override: bool,
    method_override_param: String,
    credentials_provider: Option<Arc<dyn CredentialsProvider>>,
}

impl Default for RequestProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            method_override: false,
            method_override_param: "_method".to_string(),
            credentials_provider: None,
        }
    }

    /// Allow clients to override the request method via the configured
    /// parameter or the `X-Http-Method-Override` header. Off by default.
    pub fn method_override(mut self, enabled: bool) -> Self {
        self.method_override = enabled;
        self
    }

    /// Name of the query/form parameter carrying a method override.
    pub fn method_override_param(mut self, name: impl Into<String>) -> Self {
        self.method_override_param = name.into();
        self
    }

    /// Resolve parsed Basic credentials against a credential store.
    pub fn credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<RequestProcessor, ConfigError> {
        if self.method_override_param.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "method_override_param",
                reason: "parameter name must not be empty".to_string(),
            });
        }
        Ok(RequestProcessor {
            method_override: self.method_override,
            method_override_param: self.method_override_param,
            credentials_provider: self.credentials_provider,
        })
    }
}

/// Pipeline stage that populates the request context with derived fields.
pub struct RequestProcessor {
    method_override: bool,
    method_override_param: String,
    credentials_provider: Option<Arc<dyn CredentialsProvider>>,
}

impl RequestProcessor {
    #[must_use]
    pub fn builder() -> RequestProcessorBuilder {
        RequestProcessorBuilder::new()
    }

    fn apply_method_override(&self, req: &mut RequestContext) {
        // Override parameter wins over the header; the original method is
        // preserved separately either way.
        let requested = req
            .query_params
            .get(&self.method_override_param)
            .or_else(|| req.form_params.get(&self.method_override_param))
            .cloned()
            .or_else(|| req.header("x-http-method-override").map(str::to_string));
        if let Some(name) = requested {
            if let Ok(method) = name.trim().to_uppercase().parse::<Method>() {
                debug!(from = %req.original_method, to = %method, "method override applied");
                req.method = method;
            }
        }
    }

    fn resolve_credentials(
        &self,
        credentials: Credentials,
    ) -> Result<Option<Credentials>, ProcessError> {
        let Some(provider) = &self.credentials_provider else {
            return Ok(Some(credentials));
        };
        match provider.lookup(&credentials.username) {
            Ok(Some(stored)) if stored.password == credentials.password => Ok(Some(credentials)),
            Ok(_) => Ok(None),
            Err(e) => Err(ProcessError::Internal(e)),
        }
    }
}

impl Processor for RequestProcessor {
    fn name(&self) -> &str {
        "request"
    }

    fn process(
        &self,
        req: &mut RequestContext,
        _res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError> {
        req.query_params = parse_query_params(&req.raw_path);

        let is_form = req
            .header("content-type")
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            if let Some(body) = req.body.as_deref() {
                req.form_params = parse_form_params(body);
            }
        }

        if self.method_override {
            self.apply_method_override(req);
        }

        if let Some(auth) = req.header("authorization") {
            if let Some(credentials) = parse_basic_credentials(auth) {
                req.credentials = self.resolve_credentials(credentials)?;
            }
        }

        if let Some(value) = req.header("accept-language") {
            req.languages = parse_accept_language(value);
            req.preferred_language = req.languages.first().map(|l| l.tag.clone());
        }

        req.conditionals = Conditionals {
            if_match: req.header("if-match").and_then(parse_etag_condition),
            if_none_match: req.header("if-none-match").and_then(parse_etag_condition),
            if_modified_since: req
                .header("if-modified-since")
                .and_then(|v| httpdate::parse_http_date(v).ok()),
            if_unmodified_since: req
                .header("if-unmodified-since")
                .and_then(|v| httpdate::parse_http_date(v).ok()),
            vary: req.header("vary").and_then(parse_vary),
        };

        if let Some(value) = req.header("range") {
            req.ranges = parse_ranges(value);
        }
        if let Some(value) = req.header("accept") {
            req.accepts = parse_accept(value);
        }

        debug!(
            method = %req.method,
            path = %req.path,
            query_count = req.query_params.len(),
            languages = req.languages.len(),
            "request populated"
        );
        Ok(Flow::Continue)
    }
}

//! CSRF token issuance and verification.
//!
//! A token is a pair: a server-generated UUID (the token id, delivered to the
//! client in a cookie) and a random secret of configured length (delivered by
//! the client in a form field or header on mutating requests). The store is
//! intentionally process-lifetime-scoped — the one sanctioned exception to
//! "no state on the processor".
//!
//! Expiry is a per-token timer keyed to the TTL. Changing a token's TTL
//! cancels and reschedules that timer; the store never holds two live timers
//! for the same token id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::Method;
use rand::RngCore;
use tracing::debug;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::{CsrfToken, RequestContext, ResponseContext};
use crate::http::cookies::{hex_encode, CookieOptions, StagedCookie};
use crate::pipeline::{Flow, Processor};
use crate::timer::{self, TimerHandle};

/// Constant-time byte comparison over equal-length inputs.
///
/// Callers must length-gate first; unequal lengths short-circuit to `false`
/// without entering the comparator.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

struct TokenEntry {
    secret: String,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
    timer: Option<TimerHandle>,
}

/// Process-lifetime store of live CSRF tokens.
///
/// Cheap to clone; clones share the same underlying map.
#[derive(Clone)]
pub struct TokenStore {
    tokens: Arc<DashMap<Uuid, TokenEntry>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Create a token with a fresh id and a secret of `length` random bytes
    /// (hex-encoded) from the OS CSPRNG.
    pub fn create(&self, length: usize, ttl: Option<Duration>) -> CsrfToken {
        let id = Uuid::new_v4();
        let mut bytes = vec![0u8; length];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let secret = hex_encode(&bytes);
        let timer = ttl.map(|t| self.schedule_removal(id, t));
        self.tokens.insert(
            id,
            TokenEntry {
                secret: secret.clone(),
                ttl,
                expires_at: ttl.map(|t| Instant::now() + t),
                timer,
            },
        );
        debug!(token_id = %id, ttl = ?ttl, "csrf token created");
        CsrfToken { id, secret }
    }

    fn schedule_removal(&self, id: Uuid, ttl: Duration) -> TimerHandle {
        let tokens = self.tokens.clone();
        timer::after(ttl, move || {
            if tokens.remove(&id).is_some() {
                debug!(token_id = %id, "csrf token expired");
            }
        })
    }

    /// Return the token secret, or `None` if unknown or expired.
    ///
    /// An entry whose deadline has passed is treated as absent even if its
    /// expiry timer has not fired yet.
    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<String> {
        let expired = {
            let entry = self.tokens.get(id)?;
            entry
                .expires_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(false)
        };
        if expired {
            self.tokens.remove(id);
            return None;
        }
        self.tokens.get(id).map(|e| e.secret.clone())
    }

    /// Change a token's TTL, cancelling the old expiry timer and scheduling a
    /// new one.
    pub fn set_ttl(&self, id: &Uuid, ttl: Option<Duration>) {
        let new_timer = ttl.map(|t| self.schedule_removal(*id, t));
        if let Some(mut entry) = self.tokens.get_mut(id) {
            if let Some(old) = entry.timer.take() {
                old.cancel();
            }
            entry.ttl = ttl;
            entry.expires_at = ttl.map(|t| Instant::now() + t);
            entry.timer = new_timer;
        } else if let Some(t) = new_timer {
            t.cancel();
        }
    }

    /// Verify a client-supplied secret against the stored secret.
    ///
    /// Length is checked first; only equal-length inputs reach the
    /// constant-time comparator.
    #[must_use]
    pub fn verify(&self, id: &Uuid, secret: &str) -> bool {
        let Some(stored) = self.get(id) else {
            return false;
        };
        if stored.len() != secret.len() {
            return false;
        }
        constant_time_eq(stored.as_bytes(), secret.as_bytes())
    }

    /// Remove a token, cancelling its expiry timer.
    pub fn remove(&self, id: &Uuid) {
        if let Some((_, entry)) = self.tokens.remove(id) {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Builder for [`CsrfProcessor`].
pub struct CsrfProcessorBuilder {
    token_length: usize,
    ttl: Option<Duration>,
    cookie_name: String,
    field_name: Option<String>,
    header_name: Option<String>,
    store: Option<TokenStore>,
}

impl Default for CsrfProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrfProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token_length: 32,
            ttl: None,
            cookie_name: "csrf-id".to_string(),
            field_name: Some("csrf-token".to_string()),
            header_name: Some("x-csrf-token".to_string()),
            store: None,
        }
    }

    /// Secret length in random bytes (hex-encoded on the wire).
    pub fn token_length(mut self, length: usize) -> Self {
        self.token_length = length;
        self
    }

    /// TTL applied to newly issued tokens.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cookie name carrying the token id.
    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// Form field carrying the secret; `None` disables the form transport.
    pub fn field_name(mut self, name: Option<String>) -> Self {
        self.field_name = name;
        self
    }

    /// Header carrying the secret; `None` disables the header transport.
    pub fn header_name(mut self, name: Option<String>) -> Self {
        self.header_name = name;
        self
    }

    /// Share an existing token store instead of creating a fresh one.
    pub fn store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<CsrfProcessor, ConfigError> {
        if !(8..=256).contains(&self.token_length) {
            return Err(ConfigError::InvalidValue {
                field: "token_length",
                reason: format!("must be between 8 and 256 bytes, got {}", self.token_length),
            });
        }
        if self.cookie_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cookie_name",
                reason: "cookie name must not be empty".to_string(),
            });
        }
        if self.field_name.is_none() && self.header_name.is_none() {
            return Err(ConfigError::Conflict {
                reason: "at least one of field_name/header_name must be configured".to_string(),
            });
        }
        Ok(CsrfProcessor {
            token_length: self.token_length,
            ttl: self.ttl,
            cookie_name: self.cookie_name,
            field_name: self.field_name,
            header_name: self.header_name,
            store: self.store.unwrap_or_default(),
        })
    }
}

/// Pipeline stage issuing CSRF tokens on safe requests and verifying them on
/// mutating ones.
pub struct CsrfProcessor {
    token_length: usize,
    ttl: Option<Duration>,
    cookie_name: String,
    field_name: Option<String>,
    header_name: Option<String>,
    store: TokenStore,
}

impl std::fmt::Debug for CsrfProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfProcessor")
            .field("token_length", &self.token_length)
            .field("ttl", &self.ttl)
            .field("cookie_name", &self.cookie_name)
            .field("field_name", &self.field_name)
            .field("header_name", &self.header_name)
            .finish_non_exhaustive()
    }
}

impl CsrfProcessor {
    #[must_use]
    pub fn builder() -> CsrfProcessorBuilder {
        CsrfProcessorBuilder::new()
    }

    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    fn cookie_token_id(&self, req: &RequestContext) -> Option<Uuid> {
        req.cookie(&self.cookie_name)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    fn client_secret<'a>(&self, req: &'a RequestContext) -> Option<&'a str> {
        if let Some(field) = &self.field_name {
            if let Some(secret) = req.form_params.get(field) {
                return Some(secret.as_str());
            }
        }
        if let Some(header) = &self.header_name {
            if let Some(secret) = req.header(header) {
                return Some(secret);
            }
        }
        None
    }

    fn is_mutating(method: &Method) -> bool {
        matches!(
            *method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

impl Processor for CsrfProcessor {
    fn name(&self) -> &str {
        "csrf"
    }

    fn process(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError> {
        let cookie_id = self.cookie_token_id(req);

        if Self::is_mutating(&req.method) {
            let verified = match (cookie_id, self.client_secret(req)) {
                (Some(id), Some(secret)) => self.store.verify(&id, secret),
                _ => false,
            };
            if !verified {
                return Err(ProcessError::CsrfMismatch);
            }
            if let Some(id) = cookie_id {
                req.csrf_token = self.store.get(&id).map(|secret| CsrfToken { id, secret });
            }
            return Ok(Flow::Continue);
        }

        // Safe method: make sure the client holds a live token.
        match cookie_id.and_then(|id| self.store.get(&id).map(|secret| (id, secret))) {
            Some((id, secret)) => {
                req.csrf_token = Some(CsrfToken { id, secret });
            }
            None => {
                let token = self.store.create(self.token_length, self.ttl);
                res.stage_cookie(StagedCookie {
                    name: self.cookie_name.clone(),
                    value: token.id.to_string(),
                    options: CookieOptions {
                        path: Some("/".to_string()),
                        http_only: true,
                        ..CookieOptions::default()
                    },
                });
                req.csrf_token = Some(token);
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
    }

    #[test]
    fn test_store_round_trip() {
        let store = TokenStore::new();
        let token = store.create(32, None);
        assert!(store.verify(&token.id, &token.secret));
        let wrong = format!("{}x", token.secret);
        assert!(!store.verify(&token.id, &wrong));
    }

    #[test]
    fn test_build_requires_transport() {
        let err = CsrfProcessor::builder()
            .field_name(None)
            .header_name(None)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict { .. }));
    }

    #[test]
    fn test_build_rejects_bad_length() {
        let err = CsrfProcessor::builder().token_length(4).build().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "token_length",
                ..
            }
        ));
    }
}

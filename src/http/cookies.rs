//! Cookie parsing, staging, and the `Set-Cookie` wire format.
//!
//! Inbound: the `Cookie` header is split on `"; "` and each pair on the
//! *first* `=` only, so values may legally contain `=`. Outbound: cookies are
//! staged on the [`ResponseContext`](crate::http::context::ResponseContext)
//! and serialized with the response head, one `Set-Cookie` header each.
//!
//! When a [`CookieCipher`] is configured, each cookie value is individually
//! encrypted under a fresh random IV; the wire value is
//! `<iv-hex>.<base64(ciphertext)>`. What happens when an inbound value fails
//! to decrypt is an explicit policy choice ([`DecryptFailure`]): the default
//! keeps the received literal, the strict alternative treats the cookie as
//! absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use tracing::debug;

use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::{RequestContext, ResponseContext};
use crate::pipeline::{Flow, Processor};
use crate::services::CookieCipher;

/// `SameSite` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
}

/// Attributes for a cookie to be sent to the client.
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub expires: Option<SystemTime>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub max_age: Option<i64>,
    pub same_site: Option<SameSite>,
}

/// A cookie queued for emission with the response head.
#[derive(Debug, Clone)]
pub struct StagedCookie {
    pub name: String,
    pub value: String,
    pub options: CookieOptions,
}

impl StagedCookie {
    /// Serialize to the `Set-Cookie` header value.
    ///
    /// Attribute order is fixed: `Version`, `Expires`, `Domain`, `Path`,
    /// `Secure`, `HttpOnly`, `Max-Age`, `SameSite`. The domain is emitted
    /// with a leading dot.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}; Version=1", self.name, self.value);
        if let Some(expires) = self.options.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if let Some(domain) = &self.options.domain {
            out.push_str("; Domain=");
            if !domain.starts_with('.') {
                out.push('.');
            }
            out.push_str(domain);
        }
        if let Some(path) = &self.options.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if self.options.secure {
            out.push_str("; Secure");
        }
        if self.options.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(max_age) = self.options.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        match self.options.same_site {
            Some(SameSite::Strict) => out.push_str("; SameSite=Strict"),
            Some(SameSite::Lax) => out.push_str("; SameSite=Lax"),
            None => {}
        }
        out
    }
}

/// Parse a `Cookie` header value into name/value pairs.
///
/// Pairs are split on `"; "`; each pair is split on the first `=` only.
/// Pairs without an `=` are discarded.
#[must_use]
pub fn parse_cookie_header(value: &str) -> HashMap<String, String> {
    value
        .split("; ")
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Policy for inbound cookie values that fail decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecryptFailure {
    /// Keep the value exactly as received (the historical behavior).
    #[default]
    KeepRaw,
    /// Treat the cookie as absent.
    Drop,
}

/// Builder for [`CookieProcessor`].
pub struct CookieProcessorBuilder {
    cipher: Option<Arc<dyn CookieCipher>>,
    on_decrypt_failure: DecryptFailure,
    iv_length: usize,
}

impl Default for CookieProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cipher: None,
            on_decrypt_failure: DecryptFailure::KeepRaw,
            iv_length: 16,
        }
    }

    /// Enable value encryption with the given cipher.
    pub fn cipher(mut self, cipher: Arc<dyn CookieCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn on_decrypt_failure(mut self, policy: DecryptFailure) -> Self {
        self.on_decrypt_failure = policy;
        self
    }

    /// IV length in bytes used for value encryption.
    pub fn iv_length(mut self, len: usize) -> Self {
        self.iv_length = len;
        self
    }

    /// Validate every field and construct the processor.
    pub fn build(self) -> Result<CookieProcessor, ConfigError> {
        if !(8..=64).contains(&self.iv_length) {
            return Err(ConfigError::InvalidValue {
                field: "iv_length",
                reason: format!("must be between 8 and 64 bytes, got {}", self.iv_length),
            });
        }
        Ok(CookieProcessor {
            cipher: self.cipher,
            on_decrypt_failure: self.on_decrypt_failure,
            iv_length: self.iv_length,
        })
    }
}

/// Pipeline stage that parses inbound cookies and stages outbound ones.
///
/// Crafted once per server build and shared across requests; all per-request
/// state lives on the contexts.
pub struct CookieProcessor {
    cipher: Option<Arc<dyn CookieCipher>>,
    on_decrypt_failure: DecryptFailure,
    iv_length: usize,
}

impl std::fmt::Debug for CookieProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieProcessor")
            .field("cipher", &self.cipher.is_some())
            .field("on_decrypt_failure", &self.on_decrypt_failure)
            .field("iv_length", &self.iv_length)
            .finish()
    }
}

impl CookieProcessor {
    #[must_use]
    pub fn builder() -> CookieProcessorBuilder {
        CookieProcessorBuilder::new()
    }

    /// Stage a cookie on the response, encrypting the value when a cipher is
    /// configured.
    pub fn set_cookie(
        &self,
        res: &mut ResponseContext,
        name: &str,
        value: &str,
        options: CookieOptions,
    ) {
        let value = match &self.cipher {
            Some(cipher) => match self.encrypt_value(cipher.as_ref(), value) {
                Ok(v) => v,
                Err(e) => {
                    debug!(cookie = name, error = %e, "cookie encryption failed, staging plaintext skipped");
                    return;
                }
            },
            None => value.to_string(),
        };
        res.stage_cookie(StagedCookie {
            name: name.to_string(),
            value,
            options,
        });
    }

    fn encrypt_value(&self, cipher: &dyn CookieCipher, value: &str) -> anyhow::Result<String> {
        let mut iv = vec![0u8; self.iv_length];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let ciphertext = cipher.encrypt(value.as_bytes(), &iv)?;
        Ok(format!("{}.{}", hex_encode(&iv), BASE64.encode(ciphertext)))
    }

    /// Decode one inbound value. Returns `None` when the value must be
    /// treated as absent under the configured failure policy.
    fn decode_value(&self, raw: &str) -> Option<String> {
        let Some(cipher) = &self.cipher else {
            return Some(raw.to_string());
        };
        let decrypted = Self::try_decrypt(cipher.as_ref(), raw);
        match decrypted {
            Some(v) => Some(v),
            None => match self.on_decrypt_failure {
                DecryptFailure::KeepRaw => Some(raw.to_string()),
                DecryptFailure::Drop => None,
            },
        }
    }

    fn try_decrypt(cipher: &dyn CookieCipher, raw: &str) -> Option<String> {
        let (iv_hex, payload) = raw.split_once('.')?;
        let iv = hex_decode(iv_hex)?;
        let ciphertext = BASE64.decode(payload).ok()?;
        let plaintext = cipher.decrypt(&ciphertext, &iv).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

impl Processor for CookieProcessor {
    fn name(&self) -> &str {
        "cookies"
    }

    fn process(
        &self,
        req: &mut RequestContext,
        _res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError> {
        if let Some(header) = req.header("cookie") {
            let raw = parse_cookie_header(header);
            let mut cookies = HashMap::with_capacity(raw.len());
            for (name, value) in raw {
                if let Some(decoded) = self.decode_value(&value) {
                    cookies.insert(name, decoded);
                }
            }
            debug!(cookie_count = cookies.len(), "cookies parsed");
            req.cookies = cookies;
        }
        Ok(Flow::Continue)
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub(crate) fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

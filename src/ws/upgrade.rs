//! WebSocket upgrade policy.
//!
//! The upgrade decision runs inside the handshake, in order: anonymous-origin
//! gate, origin allow/deny, channel derivation and allow-list, then the
//! connection middleware chain (same first-refusal-stops semantics as the
//! HTTP interceptors, but over the upgrade request rather than a response).
//! A rejected upgrade becomes a non-2xx handshake response and the socket is
//! destroyed before any connection object exists.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::ConfigError;

/// The inbound upgrade request as seen by policy checks and middleware.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Upgrade path as received (no query string).
    pub path: String,
    /// Channel derived from the path.
    pub channel: String,
    pub origin: Option<String>,
    /// Headers with lowercased names.
    pub headers: HashMap<String, String>,
    pub peer_addr: Option<SocketAddr>,
}

/// Why an upgrade was refused.
#[derive(Debug)]
pub enum UpgradeError {
    /// No `Origin` header and anonymous origins are disallowed.
    MissingOrigin,
    /// The origin is denied, or unknown under strict origin checking.
    OriginRejected(String),
    /// The requested channel is not in the allow-list.
    ChannelRejected(String),
    /// The per-channel authorization callback rejected the connection.
    Unauthorized(String),
    /// A middleware link refused consent.
    Refused,
    /// A middleware or authorization callback failed outright.
    Failed(String),
}

impl UpgradeError {
    /// HTTP status for the handshake rejection response.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            UpgradeError::Unauthorized(_) => 401,
            UpgradeError::Failed(_) => 500,
            _ => 403,
        }
    }
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeError::MissingOrigin => write!(f, "anonymous origin not allowed"),
            UpgradeError::OriginRejected(origin) => write!(f, "origin '{origin}' not allowed"),
            UpgradeError::ChannelRejected(channel) => {
                write!(f, "channel '{channel}' not allowed")
            }
            UpgradeError::Unauthorized(channel) => {
                write!(f, "not authorized for channel '{channel}'")
            }
            UpgradeError::Refused => write!(f, "connection refused"),
            UpgradeError::Failed(reason) => write!(f, "upgrade middleware failed: {reason}"),
        }
    }
}

impl std::error::Error for UpgradeError {}

/// A link in the connection middleware chain.
///
/// `Ok(false)` refuses the connection and stops the chain; `Err` propagates
/// as an upgrade failure instead of a refusal.
pub trait ConnectionMiddleware: Send + Sync {
    fn check(&self, req: &UpgradeRequest) -> anyhow::Result<bool>;
}

impl<F> ConnectionMiddleware for F
where
    F: Fn(&UpgradeRequest) -> anyhow::Result<bool> + Send + Sync,
{
    fn check(&self, req: &UpgradeRequest) -> anyhow::Result<bool> {
        self(req)
    }
}

/// Derive the requested channel from an upgrade path. The root path maps to
/// the default channel.
#[must_use]
pub fn channel_from_path(path: &str, default_channel: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        default_channel.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Builder for [`UpgradePolicy`].
pub struct UpgradePolicyBuilder {
    allow_anonymous_origin: bool,
    strict_origin: bool,
    allowed_origins: HashSet<String>,
    denied_origins: HashSet<String>,
    allowed_channels: HashSet<String>,
    default_channel: String,
    middleware: Vec<Arc<dyn ConnectionMiddleware>>,
}

impl Default for UpgradePolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradePolicyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allow_anonymous_origin: true,
            strict_origin: false,
            allowed_origins: HashSet::new(),
            denied_origins: HashSet::new(),
            allowed_channels: HashSet::new(),
            default_channel: "default".to_string(),
            middleware: Vec::new(),
        }
    }

    /// Accept clients that send no `Origin` header. On by default.
    pub fn allow_anonymous_origin(mut self, allow: bool) -> Self {
        self.allow_anonymous_origin = allow;
        self
    }

    /// Reject origins that appear in neither the allow nor the deny set.
    pub fn strict_origin(mut self, strict: bool) -> Self {
        self.strict_origin = strict;
        self
    }

    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.insert(origin.into());
        self
    }

    pub fn deny_origin(mut self, origin: impl Into<String>) -> Self {
        self.denied_origins.insert(origin.into());
        self
    }

    /// Restrict upgrades to the given channel. An empty allow-list admits
    /// every channel.
    pub fn allow_channel(mut self, channel: impl Into<String>) -> Self {
        self.allowed_channels.insert(channel.into());
        self
    }

    /// Channel assigned to upgrades on the root path.
    pub fn default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = channel.into();
        self
    }

    /// Append a middleware link; links run in the order added.
    pub fn middleware(mut self, mw: Arc<dyn ConnectionMiddleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    pub fn build(self) -> Result<UpgradePolicy, ConfigError> {
        if self.default_channel.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default_channel",
                reason: "channel name must not be empty".to_string(),
            });
        }
        if self.strict_origin
            && self.allowed_origins.is_empty()
            && self.denied_origins.is_empty()
        {
            return Err(ConfigError::Conflict {
                reason: "strict_origin with empty allow and deny sets rejects every origin"
                    .to_string(),
            });
        }
        Ok(UpgradePolicy {
            allow_anonymous_origin: self.allow_anonymous_origin,
            strict_origin: self.strict_origin,
            allowed_origins: self.allowed_origins,
            denied_origins: self.denied_origins,
            allowed_channels: self.allowed_channels,
            default_channel: self.default_channel,
            middleware: self.middleware,
        })
    }
}

/// Upgrade acceptance policy evaluated inside the handshake.
pub struct UpgradePolicy {
    allow_anonymous_origin: bool,
    strict_origin: bool,
    allowed_origins: HashSet<String>,
    denied_origins: HashSet<String>,
    allowed_channels: HashSet<String>,
    default_channel: String,
    middleware: Vec<Arc<dyn ConnectionMiddleware>>,
}

impl UpgradePolicy {
    #[must_use]
    pub fn builder() -> UpgradePolicyBuilder {
        UpgradePolicyBuilder::new()
    }

    #[must_use]
    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    /// Run the full upgrade check sequence against one request.
    pub fn evaluate(&self, req: &UpgradeRequest) -> Result<(), UpgradeError> {
        match &req.origin {
            None => {
                if !self.allow_anonymous_origin {
                    return Err(UpgradeError::MissingOrigin);
                }
            }
            Some(origin) => {
                if self.denied_origins.contains(origin) {
                    return Err(UpgradeError::OriginRejected(origin.clone()));
                }
                if self.strict_origin && !self.allowed_origins.contains(origin) {
                    return Err(UpgradeError::OriginRejected(origin.clone()));
                }
            }
        }

        if !self.allowed_channels.is_empty() && !self.allowed_channels.contains(&req.channel) {
            return Err(UpgradeError::ChannelRejected(req.channel.clone()));
        }

        for (idx, mw) in self.middleware.iter().enumerate() {
            match mw.check(req) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(index = idx, "connection middleware refused consent");
                    return Err(UpgradeError::Refused);
                }
                Err(e) => return Err(UpgradeError::Failed(e.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(origin: Option<&str>, channel: &str) -> UpgradeRequest {
        UpgradeRequest {
            path: format!("/{channel}"),
            channel: channel.to_string(),
            origin: origin.map(str::to_string),
            headers: HashMap::new(),
            peer_addr: None,
        }
    }

    #[test]
    fn test_channel_from_path() {
        assert_eq!(channel_from_path("/", "default"), "default");
        assert_eq!(channel_from_path("/chat", "default"), "chat");
        assert_eq!(channel_from_path("/chat/?x=1", "default"), "chat");
    }

    #[test]
    fn test_anonymous_origin_gate() {
        let policy = UpgradePolicy::builder()
            .allow_anonymous_origin(false)
            .build()
            .unwrap();
        assert!(matches!(
            policy.evaluate(&request(None, "default")),
            Err(UpgradeError::MissingOrigin)
        ));
        assert!(policy
            .evaluate(&request(Some("https://a.example"), "default"))
            .is_ok());
    }

    #[test]
    fn test_strict_origin_requires_known_origin() {
        let policy = UpgradePolicy::builder()
            .strict_origin(true)
            .allow_origin("https://a.example")
            .deny_origin("https://b.example")
            .build()
            .unwrap();
        assert!(policy
            .evaluate(&request(Some("https://a.example"), "default"))
            .is_ok());
        assert!(matches!(
            policy.evaluate(&request(Some("https://b.example"), "default")),
            Err(UpgradeError::OriginRejected(_))
        ));
        assert!(matches!(
            policy.evaluate(&request(Some("https://c.example"), "default")),
            Err(UpgradeError::OriginRejected(_))
        ));
    }

    #[test]
    fn test_channel_allow_list() {
        let policy = UpgradePolicy::builder()
            .allow_channel("chat")
            .build()
            .unwrap();
        assert!(policy.evaluate(&request(None, "chat")).is_ok());
        assert!(matches!(
            policy.evaluate(&request(None, "admin")),
            Err(UpgradeError::ChannelRejected(_))
        ));
    }

    #[test]
    fn test_middleware_first_refusal_stops_chain() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let policy = UpgradePolicy::builder()
            .middleware(Arc::new(
                move |_req: &UpgradeRequest| -> anyhow::Result<bool> {
                    c1.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                },
            ))
            .middleware(Arc::new(
                move |_req: &UpgradeRequest| -> anyhow::Result<bool> {
                    c2.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                },
            ))
            .build()
            .unwrap();
        assert!(matches!(
            policy.evaluate(&request(None, "default")),
            Err(UpgradeError::Refused)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_middleware_error_propagates() {
        let policy = UpgradePolicy::builder()
            .middleware(Arc::new(
                |_req: &UpgradeRequest| -> anyhow::Result<bool> {
                    Err(anyhow::anyhow!("lookup failed"))
                },
            ))
            .build()
            .unwrap();
        assert!(matches!(
            policy.evaluate(&request(None, "default")),
            Err(UpgradeError::Failed(_))
        ));
    }
}

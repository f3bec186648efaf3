//! Per-channel connection authorization.
//!
//! Authorization callbacks are keyed by channel name with an optional `*`
//! catch-all; a channel without a callback admits every connection. The
//! check runs inside the handshake, so a rejection is delivered as a non-2xx
//! upgrade response before any connection object exists.

use std::collections::HashMap;
use std::sync::Arc;

use super::upgrade::{UpgradeError, UpgradeRequest};

/// Accept/reject callback for one channel. `Ok(false)` rejects with 401;
/// `Err` maps to an upgrade failure.
pub type AuthCallback = Arc<dyn Fn(&UpgradeRequest) -> anyhow::Result<bool> + Send + Sync>;

/// Dispatches per-channel authorization callbacks.
#[derive(Default)]
pub struct ChannelAuthorizer {
    by_channel: HashMap<String, AuthCallback>,
    catch_all: Option<AuthCallback>,
}

impl ChannelAuthorizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback for `channel`.
    pub fn on_channel(&mut self, channel: impl Into<String>, callback: AuthCallback) {
        self.by_channel.insert(channel.into(), callback);
    }

    /// Register the catch-all callback used for channels without their own.
    pub fn catch_all(&mut self, callback: AuthCallback) {
        self.catch_all = Some(callback);
    }

    /// Authorize one upgrade request for its channel.
    pub fn authorize(&self, req: &UpgradeRequest) -> Result<(), UpgradeError> {
        let callback = self
            .by_channel
            .get(&req.channel)
            .or(self.catch_all.as_ref());
        match callback {
            None => Ok(()),
            Some(callback) => match callback(req) {
                Ok(true) => Ok(()),
                Ok(false) => Err(UpgradeError::Unauthorized(req.channel.clone())),
                Err(e) => Err(UpgradeError::Failed(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn request(channel: &str) -> UpgradeRequest {
        UpgradeRequest {
            path: format!("/{channel}"),
            channel: channel.to_string(),
            origin: None,
            headers: Map::new(),
            peer_addr: None,
        }
    }

    #[test]
    fn test_unregistered_channel_admits() {
        let authorizer = ChannelAuthorizer::new();
        assert!(authorizer.authorize(&request("anything")).is_ok());
    }

    #[test]
    fn test_channel_callback_rejects() {
        let mut authorizer = ChannelAuthorizer::new();
        authorizer.on_channel(
            "admin",
            Arc::new(|req: &UpgradeRequest| Ok(req.headers.contains_key("x-admin-token"))),
        );
        assert!(matches!(
            authorizer.authorize(&request("admin")),
            Err(UpgradeError::Unauthorized(_))
        ));
        assert!(authorizer.authorize(&request("public")).is_ok());
    }

    #[test]
    fn test_catch_all_applies_to_unlisted_channels() {
        let mut authorizer = ChannelAuthorizer::new();
        authorizer.on_channel("open", Arc::new(|_req: &UpgradeRequest| Ok(true)));
        authorizer.catch_all(Arc::new(|_req: &UpgradeRequest| Ok(false)));
        assert!(authorizer.authorize(&request("open")).is_ok());
        assert!(authorizer.authorize(&request("other")).is_err());
    }
}

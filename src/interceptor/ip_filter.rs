use std::collections::HashSet;

use tracing::debug;

use super::{breakpoints, Interceptor};
use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::RequestContext;

/// All prefix-wildcard variants of an address, plus the exact address.
///
/// `192.168.1.1` yields `192.168.1.1`, `192.168.1.*`, `192.168.*.*`,
/// `192.*.*.*` and `*.*.*.*` (5 entries). Non-dotted-quad addresses yield
/// only the exact form.
#[must_use]
pub fn ip_wildcards(ip: &str) -> Vec<String> {
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return vec![ip.to_string()];
    }
    let mut variants = Vec::with_capacity(5);
    variants.push(ip.to_string());
    for wild in 1..=4 {
        let keep = 4 - wild;
        let mut parts: Vec<&str> = octets[..keep].to_vec();
        parts.extend(std::iter::repeat("*").take(wild));
        variants.push(parts.join("."));
    }
    variants
}

/// Builder for [`IpFilter`].
#[derive(Default)]
pub struct IpFilterBuilder {
    deny: HashSet<String>,
    allow: HashSet<String>,
    allow_list_only: bool,
}

impl IpFilterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny an exact address or a wildcard pattern (`10.0.*.*`).
    pub fn deny(mut self, entry: impl Into<String>) -> Self {
        self.deny.insert(entry.into());
        self
    }

    /// Allow an exact address or wildcard pattern; allow entries override
    /// deny entries for the same address.
    pub fn allow(mut self, entry: impl Into<String>) -> Self {
        self.allow.insert(entry.into());
        self
    }

    /// Require every address to match the allow set.
    pub fn allow_list_only(mut self, enabled: bool) -> Self {
        self.allow_list_only = enabled;
        self
    }

    pub fn build(self) -> Result<IpFilter, ConfigError> {
        if self.allow_list_only && self.allow.is_empty() {
            return Err(ConfigError::Conflict {
                reason: "allow_list_only requires a non-empty allow set".to_string(),
            });
        }
        Ok(IpFilter {
            deny: self.deny,
            allow: self.allow,
            allow_list_only: self.allow_list_only,
        })
    }
}

/// Interceptor rejecting requests by client IP.
///
/// Each incoming address is expanded to its wildcard variants and checked
/// against the allow set first (allow overrides deny), then the deny set.
/// In allow-list-only mode an address must additionally match the allow set.
pub struct IpFilter {
    deny: HashSet<String>,
    allow: HashSet<String>,
    allow_list_only: bool,
}

impl IpFilter {
    #[must_use]
    pub fn builder() -> IpFilterBuilder {
        IpFilterBuilder::new()
    }

    /// Consent decision for one address.
    #[must_use]
    pub fn permits(&self, ip: &str) -> bool {
        let variants = ip_wildcards(ip);
        if variants.iter().any(|v| self.allow.contains(v)) {
            return true;
        }
        if variants.iter().any(|v| self.deny.contains(v)) {
            debug!(ip, "address denied");
            return false;
        }
        !self.allow_list_only
    }
}

impl Interceptor for IpFilter {
    fn breakpoints(&self) -> Vec<String> {
        vec![breakpoints::REQUEST_PREPROCESS.to_string()]
    }

    fn check(&self, _breakpoint: &str, req: &RequestContext) -> Result<bool, ProcessError> {
        match req.peer_addr {
            Some(addr) => Ok(self.permits(&addr.ip().to_string())),
            // Without a peer address there is nothing to match; only the
            // allow-list-only mode treats that as a refusal.
            None => Ok(!self.allow_list_only),
        }
    }
}

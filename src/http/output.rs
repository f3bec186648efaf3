//! Output-shaping stage: response caching headers.
//!
//! `Cache-Control`/`Pragma` are generated from extension- or MIME-keyed
//! rules. When caching is disabled, or the client itself sent
//! `Cache-Control: no-cache`/`Pragma: no-cache`, the response is marked
//! uncacheable (`no-store, no-cache, must-revalidate, max-age=0` plus
//! `Pragma: no-cache`).

use std::collections::HashMap;

use tracing::debug;

use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::{RequestContext, ResponseContext};
use crate::pipeline::{Flow, Processor};

/// One caching rule: how long, and whether shared caches may store it.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CacheRule {
    pub max_age: u32,
    pub public: bool,
}

impl CacheRule {
    #[must_use]
    pub fn public(max_age: u32) -> Self {
        Self {
            max_age,
            public: true,
        }
    }

    #[must_use]
    pub fn private(max_age: u32) -> Self {
        Self {
            max_age,
            public: false,
        }
    }
}

/// Builder for [`OutputProcessor`].
pub struct OutputProcessorBuilder {
    enabled: bool,
    extension_rules: HashMap<String, CacheRule>,
    mime_rules: HashMap<String, CacheRule>,
}

impl Default for OutputProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            extension_rules: HashMap::new(),
            mime_rules: HashMap::new(),
        }
    }

    /// Disable caching entirely; every response is marked uncacheable.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Add a rule keyed by request path extension (e.g. `png`).
    pub fn extension_rule(mut self, extension: impl Into<String>, rule: CacheRule) -> Self {
        self.extension_rules
            .insert(extension.into().to_ascii_lowercase(), rule);
        self
    }

    /// Add a rule keyed by response MIME type (e.g. `image/png`).
    pub fn mime_rule(mut self, mime: impl Into<String>, rule: CacheRule) -> Self {
        self.mime_rules
            .insert(mime.into().to_ascii_lowercase(), rule);
        self
    }

    pub fn build(self) -> Result<OutputProcessor, ConfigError> {
        for (ext, _) in &self.extension_rules {
            if ext.is_empty() || ext.contains('.') {
                return Err(ConfigError::InvalidValue {
                    field: "extension_rules",
                    reason: format!("'{ext}' is not a bare file extension"),
                });
            }
        }
        Ok(OutputProcessor {
            enabled: self.enabled,
            extension_rules: self.extension_rules,
            mime_rules: self.mime_rules,
        })
    }
}

/// Pipeline stage applying caching headers to the shaped response.
pub struct OutputProcessor {
    enabled: bool,
    extension_rules: HashMap<String, CacheRule>,
    mime_rules: HashMap<String, CacheRule>,
}

impl OutputProcessor {
    #[must_use]
    pub fn builder() -> OutputProcessorBuilder {
        OutputProcessorBuilder::new()
    }

    fn client_refuses_cache(req: &RequestContext) -> bool {
        let no_cache = |v: &str| v.to_ascii_lowercase().contains("no-cache");
        req.header("cache-control").map(no_cache).unwrap_or(false)
            || req.header("pragma").map(no_cache).unwrap_or(false)
    }

    fn rule_for(&self, req: &RequestContext, res: &ResponseContext) -> Option<CacheRule> {
        if let Some(ext) = req.path_extension() {
            if let Some(rule) = self.extension_rules.get(&ext.to_ascii_lowercase()) {
                return Some(*rule);
            }
        }
        let mime = res.get_header("Content-Type")?;
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        self.mime_rules.get(&mime.to_ascii_lowercase()).copied()
    }

    fn mark_uncacheable(res: &mut ResponseContext) {
        res.set_header(
            "Cache-Control",
            "no-store, no-cache, must-revalidate, max-age=0",
        );
        res.set_header("Pragma", "no-cache");
    }
}

impl Processor for OutputProcessor {
    fn name(&self) -> &str {
        "output"
    }

    fn process(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError> {
        // A handler that set its own Cache-Control wins.
        if res.get_header("Cache-Control").is_some() {
            return Ok(Flow::Continue);
        }
        if !self.enabled || Self::client_refuses_cache(req) {
            Self::mark_uncacheable(res);
            return Ok(Flow::Continue);
        }
        if let Some(rule) = self.rule_for(req, res) {
            let scope = if rule.public { "public" } else { "private" };
            debug!(path = %req.path, scope, max_age = rule.max_age, "caching rule applied");
            res.set_header(
                "Cache-Control",
                format!("{scope}, max-age={}", rule.max_age),
            );
        }
        Ok(Flow::Continue)
    }
}

//! Route resolution and handler execution.
//!
//! Resolution is expressed as a typed outcome ([`Resolution`]) rather than an
//! exception: resolvers return `Resolved` or `NotFound`, and only the
//! pipeline stage turns an overall miss into the 404-class error. Multiple
//! resolvers may be configured; they are tried in configured order and the
//! first match wins.
//!
//! An optional [`RouteCache`] memoizes results keyed by the canonical
//! `(method, path, language)` form. The resolver never invalidates the cache;
//! that is the caller's responsibility.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::ConfigError;
use crate::error::ProcessError;
use crate::http::context::{RequestContext, ResponseContext};
use crate::pipeline::{Flow, Processor};

/// Handler executed for a matched route.
pub trait RouteHandler: Send + Sync {
    fn handle(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<(), ProcessError>;
}

impl<F> RouteHandler for F
where
    F: Fn(&mut RequestContext, &mut ResponseContext) -> Result<(), ProcessError> + Send + Sync,
{
    fn handle(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<(), ProcessError> {
        self(req, res)
    }
}

/// An application route: its path template, localized variants, declared
/// parameter names, and the handler to execute.
pub struct Route {
    pub path: String,
    /// Language tag → localized path template.
    pub localized: HashMap<String, String>,
    /// Parameter names declared in the template, in order.
    pub params: Vec<String>,
    handler: Arc<dyn RouteHandler>,
}

impl Route {
    pub fn handle(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<(), ProcessError> {
        self.handler.handle(req, res)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("localized", &self.localized)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A successful resolution: the route plus bound path parameters.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub path_params: HashMap<String, String>,
}

/// Typed resolution outcome.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(RouteMatch),
    NotFound,
}

/// A route resolver queried by the routing stage.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, method: &Method, path: &str, language: Option<&str>) -> Resolution;
}

/// Pluggable resolution cache.
pub trait RouteCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Resolution>;
    fn put(&self, key: &str, value: Resolution);
}

/// In-memory [`RouteCache`] backed by a hash map.
#[derive(Default)]
pub struct MemoryRouteCache {
    entries: RwLock<HashMap<String, Resolution>>,
}

impl MemoryRouteCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached resolution.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl RouteCache for MemoryRouteCache {
    fn get(&self, key: &str) -> Option<Resolution> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: Resolution) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), value);
        }
    }
}

/// Canonical cache key for a resolution query.
#[must_use]
pub fn cache_key(method: &Method, path: &str, language: Option<&str>) -> String {
    format!("{} {} {}", method, path, language.unwrap_or("-"))
}

static PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{[A-Za-z_][A-Za-z0-9_]*\}").unwrap()
});

fn compile_template(template: &str) -> Result<(Regex, Vec<String>), ConfigError> {
    let mut pattern = String::from("^");
    let mut names = Vec::new();
    let mut last = 0;
    for m in PARAM_RE.find_iter(template) {
        pattern.push_str(&regex::escape(&template[last..m.start()]));
        let name = &template[m.start() + 1..m.end() - 1];
        pattern.push_str("(?P<");
        pattern.push_str(name);
        pattern.push_str(">[^/]+)");
        names.push(name.to_string());
        last = m.end();
    }
    pattern.push_str(&regex::escape(&template[last..]));
    pattern.push('$');
    match Regex::new(&pattern) {
        Ok(re) => Ok((re, names)),
        Err(e) => Err(ConfigError::InvalidValue {
            field: "path",
            reason: format!("invalid route template '{template}': {e}"),
        }),
    }
}

struct CompiledRoute {
    method: Method,
    regex: Regex,
    localized: HashMap<String, Regex>,
    route: Arc<Route>,
}

/// Template-based [`RouteResolver`] matching `{param}` segments.
///
/// Routes are tried in registration order; the first match wins.
#[derive(Default)]
pub struct PathRouter {
    routes: Vec<CompiledRoute>,
}

impl PathRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route for `method` at `template` (e.g. `/pets/{id}`).
    pub fn register(
        &mut self,
        method: Method,
        template: &str,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), ConfigError> {
        self.register_localized(method, template, HashMap::new(), handler)
    }

    /// Register a route with language-specific template variants. When the
    /// request declares a preferred language with a registered variant, that
    /// variant is matched before the default template.
    pub fn register_localized(
        &mut self,
        method: Method,
        template: &str,
        localized: HashMap<String, String>,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), ConfigError> {
        let (regex, params) = compile_template(template)?;
        let mut localized_regexes = HashMap::with_capacity(localized.len());
        for (lang, variant) in &localized {
            let (re, _) = compile_template(variant)?;
            localized_regexes.insert(lang.clone(), re);
        }
        let route = Arc::new(Route {
            path: template.to_string(),
            localized,
            params,
            handler,
        });
        self.routes.push(CompiledRoute {
            method,
            regex,
            localized: localized_regexes,
            route,
        });
        Ok(())
    }

    fn capture(regex: &Regex, route: &Arc<Route>, path: &str) -> Option<RouteMatch> {
        let caps = regex.captures(path)?;
        let mut path_params = HashMap::with_capacity(route.params.len());
        for name in &route.params {
            if let Some(value) = caps.name(name) {
                path_params.insert(name.clone(), value.as_str().to_string());
            }
        }
        Some(RouteMatch {
            route: route.clone(),
            path_params,
        })
    }
}

impl RouteResolver for PathRouter {
    fn resolve(&self, method: &Method, path: &str, language: Option<&str>) -> Resolution {
        for compiled in &self.routes {
            if compiled.method != *method {
                continue;
            }
            if let Some(lang) = language {
                if let Some(re) = compiled.localized.get(lang) {
                    if let Some(m) = Self::capture(re, &compiled.route, path) {
                        return Resolution::Resolved(m);
                    }
                }
            }
            if let Some(m) = Self::capture(&compiled.regex, &compiled.route, path) {
                return Resolution::Resolved(m);
            }
        }
        Resolution::NotFound
    }
}

/// Builder for [`RouteProcessor`].
#[derive(Default)]
pub struct RouteProcessorBuilder {
    resolvers: Vec<Arc<dyn RouteResolver>>,
    cache: Option<Arc<dyn RouteCache>>,
}

impl RouteProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolver; resolvers are queried in the order added.
    pub fn resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Enable cache-assisted resolution.
    pub fn cache(mut self, cache: Arc<dyn RouteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<RouteProcessor, ConfigError> {
        if self.resolvers.is_empty() {
            return Err(ConfigError::MissingField { field: "resolvers" });
        }
        Ok(RouteProcessor {
            resolvers: self.resolvers,
            cache: self.cache,
        })
    }
}

/// Pipeline stage resolving the request to a route and executing its handler.
pub struct RouteProcessor {
    resolvers: Vec<Arc<dyn RouteResolver>>,
    cache: Option<Arc<dyn RouteCache>>,
}

impl RouteProcessor {
    #[must_use]
    pub fn builder() -> RouteProcessorBuilder {
        RouteProcessorBuilder::new()
    }

    fn lookup(&self, method: &Method, path: &str, language: Option<&str>) -> Resolution {
        let key = self.cache.as_ref().map(|_| cache_key(method, path, language));
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                debug!(key = %key, "route cache hit");
                return hit;
            }
        }
        let mut outcome = Resolution::NotFound;
        for resolver in &self.resolvers {
            if let Resolution::Resolved(m) = resolver.resolve(method, path, language) {
                outcome = Resolution::Resolved(m);
                break;
            }
        }
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            cache.put(key, outcome.clone());
        }
        outcome
    }
}

impl Processor for RouteProcessor {
    fn name(&self) -> &str {
        "route"
    }

    fn process(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError> {
        let language = req.preferred_language.clone();
        match self.lookup(&req.method, &req.path, language.as_deref()) {
            Resolution::Resolved(m) => {
                debug!(path = %req.path, route = %m.route.path, "route resolved");
                req.path_params = m.path_params;
                req.route = Some(m.route.clone());
                m.route.handle(req, res)?;
                Ok(Flow::Continue)
            }
            Resolution::NotFound => Err(ProcessError::NotFound {
                method: req.method.to_string(),
                path: req.path.clone(),
            }),
        }
    }
}

//! Error-to-response mapping.
//!
//! Dispatch is stateless and exact: a handler registered for the error's kind
//! name runs first, falling back to the `*` catch-all; with neither, the
//! response is the generic 500 pairing. The status is written *after* the
//! handler returns — HTTP-category errors carry an authoritative
//! status/message pairing that handlers cannot override — and status/header
//! writes against an already-started response are silent no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::http::context::{RequestContext, ResponseContext};
use crate::services::{Renderer, Reporter};

/// Callback invoked for a dispatched error before the status is finalized.
pub type ErrorHandler =
    Arc<dyn Fn(&ProcessError, &mut RequestContext, &mut ResponseContext) + Send + Sync>;

/// Builder for [`ExceptionProcessor`].
#[derive(Default)]
pub struct ExceptionProcessorBuilder {
    handlers: HashMap<String, ErrorHandler>,
    catch_all: Option<ErrorHandler>,
    renderer: Option<Arc<dyn Renderer>>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl ExceptionProcessorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a specific error kind (see
    /// [`ProcessError::kind`]).
    pub fn on(mut self, kind: impl Into<String>, handler: ErrorHandler) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Register the `*` catch-all handler.
    pub fn catch_all(mut self, handler: ErrorHandler) -> Self {
        self.catch_all = Some(handler);
        self
    }

    /// Render error bodies through a view service instead of plain JSON.
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Report every dispatched error to a logging/reporting sink.
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn build(self) -> ExceptionProcessor {
        ExceptionProcessor {
            handlers: self.handlers,
            catch_all: self.catch_all,
            renderer: self.renderer,
            reporter: self.reporter,
        }
    }
}

/// Terminal pipeline stage mapping errors to responses.
pub struct ExceptionProcessor {
    handlers: HashMap<String, ErrorHandler>,
    catch_all: Option<ErrorHandler>,
    renderer: Option<Arc<dyn Renderer>>,
    reporter: Option<Arc<dyn Reporter>>,
}

impl ExceptionProcessor {
    #[must_use]
    pub fn builder() -> ExceptionProcessorBuilder {
        ExceptionProcessorBuilder::new()
    }

    /// Map `err` onto the response.
    pub fn handle(&self, err: &ProcessError, req: &mut RequestContext, res: &mut ResponseContext) {
        if let Some(reporter) = &self.reporter {
            reporter.report_error(err);
        }

        let handler = self.handlers.get(err.kind()).or(self.catch_all.as_ref());
        if let Some(handler) = handler {
            debug!(kind = err.kind(), "invoking error handler");
            handler(err, req, res);
        }

        // The status is assigned after the handler: HTTP-category errors are
        // authoritative, everything else gets the generic pairing. Both are
        // no-ops if the response already started streaming.
        let (status, message) = err
            .http_status()
            .unwrap_or_else(|| (500, "Internal Server Error".to_string()));
        res.set_status(status, None);

        if res.body().is_empty() && !res.started() {
            self.write_body(status, &message, err.kind(), res);
        }

        if status >= 500 {
            warn!(kind = err.kind(), status, error = %err, "request failed");
        } else {
            debug!(kind = err.kind(), status, "request mapped to error response");
        }
    }

    fn write_body(&self, status: u16, message: &str, kind: &str, res: &mut ResponseContext) {
        let data = json!({ "status": status, "error": message, "kind": kind });
        if let Some(renderer) = &self.renderer {
            match renderer.render(&data) {
                Ok(bytes) => {
                    res.set_header("Content-Type", "text/html");
                    res.set_body(bytes);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "error view rendering failed, falling back to JSON");
                }
            }
        }
        res.set_header("Content-Type", "application/json");
        res.set_body(serde_json::to_vec(&data).unwrap_or_default());
    }
}

//! Breakpoint-scoped veto chain.
//!
//! Interceptors declare the named breakpoints they participate in and run in
//! registration order at each one. The first interceptor to refuse consent
//! stops the chain — later interceptors at that breakpoint do not run — and
//! the request is rejected. An interceptor that *fails* (returns an error)
//! propagates to the normal exception-handling path instead of counting as a
//! refusal.

mod ip_filter;

pub use ip_filter::{ip_wildcards, IpFilter, IpFilterBuilder};

use std::sync::Arc;

use tracing::debug;

use crate::error::ProcessError;
use crate::http::context::RequestContext;

/// Well-known breakpoint names.
pub mod breakpoints {
    /// Runs after the request is read, before any pipeline stage.
    pub const REQUEST_PREPROCESS: &str = "request.preprocess";
    /// Runs immediately before route resolution.
    pub const REQUEST_ROUTE: &str = "request.route";
}

/// A veto function scoped to one or more breakpoints.
pub trait Interceptor: Send + Sync {
    /// Breakpoints this interceptor participates in.
    fn breakpoints(&self) -> Vec<String>;

    /// Return consent: `Ok(true)` to continue, `Ok(false)` to reject the
    /// request, `Err` to fail into exception handling.
    fn check(&self, breakpoint: &str, req: &RequestContext) -> Result<bool, ProcessError>;
}

/// Ordered set of interceptors, run at defined lifecycle points.
#[derive(Default)]
pub struct InterceptorRunner {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interceptor; registration order is execution order.
    pub fn register(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Run every interceptor registered for `breakpoint`, in order.
    ///
    /// Returns the chain's consent. The first `false` stops the chain
    /// immediately; an error propagates unchanged.
    pub fn run(&self, breakpoint: &str, req: &RequestContext) -> Result<bool, ProcessError> {
        for (idx, interceptor) in self.interceptors.iter().enumerate() {
            if !interceptor
                .breakpoints()
                .iter()
                .any(|b| b.as_str() == breakpoint)
            {
                continue;
            }
            if !interceptor.check(breakpoint, req)? {
                debug!(breakpoint, index = idx, "interceptor refused consent");
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

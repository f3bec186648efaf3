//! HTTP request processing: contexts, parsing stages, cookies, CSRF,
//! routing, error mapping, and output shaping.

pub mod context;
pub mod cookies;
pub mod csrf;
pub mod exception;
pub mod output;
pub mod request;
pub mod route;

pub use context::{RequestContext, ResponseContext};
pub use cookies::{CookieOptions, CookieProcessor, DecryptFailure, SameSite, StagedCookie};
pub use csrf::{CsrfProcessor, TokenStore};
pub use exception::ExceptionProcessor;
pub use output::{CacheRule, OutputProcessor};
pub use request::RequestProcessor;
pub use route::{
    PathRouter, Resolution, Route, RouteCache, RouteMatch, RouteProcessor, RouteResolver,
};

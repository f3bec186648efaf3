//! # portcullis
//!
//! An embeddable, coroutine-powered HTTP and WebSocket application server
//! runtime. Every inbound HTTP request runs through a configurable pipeline
//! of processor stages; WebSocket connections are indexed in a live registry
//! supporting filtered broadcast with queuing for not-yet-connected
//! recipients.
//!
//! ## Architecture
//!
//! - **[`pipeline`]** - Ordered processor chain with short-circuiting and a
//!   terminal exception stage
//! - **[`http`]** - Request/response contexts, parsing stages, cookies,
//!   CSRF, route resolution, error mapping, caching headers
//! - **[`interceptor`]** - Breakpoint-scoped veto functions (with a built-in
//!   IP filter)
//! - **[`ws`]** - Upgrade policy, connection registry and message queue,
//!   heartbeat monitoring, per-channel authorization and message dispatch
//! - **[`server`]** - HTTP/HTTPS/WebSocket listeners, SNI-based TLS context
//!   dispatch, graceful shutdown
//! - **[`services`]** - Interfaces of external collaborators (view renderer,
//!   credential store, reporter, cookie cipher)
//!
//! ## Runtime
//!
//! Built on the `may` coroutine runtime: one coroutine per accepted
//! connection, cooperative scheduling, no async/await. Within one request the
//! configured stages run strictly in order; across connections work
//! interleaves at suspension points. Coroutine stack size is tunable via
//! `PORTCULLIS_STACK_SIZE` (see [`runtime_config`]).
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use portcullis::http::{PathRouter, RequestProcessor, RouteProcessor};
//! use portcullis::pipeline::Pipeline;
//! use portcullis::server::{Server, ServerEngine};
//!
//! let mut router = PathRouter::new();
//! router
//!     .register(http::Method::GET, "/hello/{name}", Arc::new(
//!         |req: &mut portcullis::http::RequestContext,
//!          res: &mut portcullis::http::ResponseContext|
//!          -> Result<(), portcullis::error::ProcessError> {
//!             let name = req.path_params.get("name").cloned().unwrap_or_default();
//!             res.json(200, &serde_json::json!({ "hello": name }));
//!             Ok(())
//!         },
//!     ))
//!     .unwrap();
//!
//! let pipeline = Pipeline::builder()
//!     .stage(Arc::new(RequestProcessor::builder().build().unwrap()))
//!     .stage(Arc::new(
//!         RouteProcessor::builder().resolver(Arc::new(router)).build().unwrap(),
//!     ))
//!     .build();
//! let engine = ServerEngine::builder().pipeline(pipeline).build().unwrap();
//! let handle = Server::new(engine).start("127.0.0.1:8080").unwrap();
//! handle.join().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod pipeline;
pub mod runtime_config;
pub mod server;
pub mod services;
pub mod timer;
pub mod ws;

pub use config::ConfigError;
pub use error::ProcessError;
pub use http::{RequestContext, ResponseContext};
pub use pipeline::{Flow, Pipeline, Processor};
pub use server::{HttpsServer, Server, ServerEngine, WsServer};
pub use ws::{Connection, ConnectionFilter, ConnectionRegistry, MessageQueue, SendOptions};

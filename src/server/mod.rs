//! Server lifecycle and routing glue.
//!
//! Three listeners share one engine shape: the plain HTTP server, the
//! SNI-dispatching HTTPS server, and the WebSocket server. All of them track
//! live connections for graceful shutdown and run one coroutine per accepted
//! socket.

mod core;
mod http_server;
mod tls;
mod ws_server;

pub use core::{
    status_reason, ActiveGuard, ConnTracker, HttpsRedirect, ServerEngine, ServerEngineBuilder,
};
pub use http_server::{Server, ServerHandle};
pub use tls::{load_pem_source, HttpsServer, TlsContextMap, DEFAULT_CONTEXT};
pub use ws_server::{WsServer, WsServerBuilder};

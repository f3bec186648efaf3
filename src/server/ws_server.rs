//! WebSocket server lifecycle.
//!
//! Each accepted socket runs the upgrade policy and per-channel authorization
//! inside the `tungstenite` handshake callback — a rejection is a non-2xx
//! handshake response and the socket never becomes a connection. Accepted
//! sockets are indexed into the injected registry (which drains the message
//! queue), optionally heartbeat-monitored, and fed through the message
//! dispatcher until close.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use http::StatusCode;
use may::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::handshake::HandshakeError;
use tungstenite::Message;

use super::core::ConnTracker;
use super::http_server::{ServerHandle, SOCKET_READ_TIMEOUT};
use crate::config::ConfigError;
use crate::ws::auth::ChannelAuthorizer;
use crate::ws::connection::{Connection, MessageSink, WsSocket};
use crate::ws::dispatch::MessageDispatcher;
use crate::ws::heartbeat::{DeadCallback, Heartbeat, HeartbeatConfig};
use crate::ws::queue::MessageQueue;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::upgrade::{channel_from_path, UpgradeError, UpgradePolicy, UpgradeRequest};

/// Callback observing connection lifecycle events.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Formats the body of an upgrade-rejection response.
pub type RejectFormatter = Arc<dyn Fn(&UpgradeError) -> String + Send + Sync>;

/// Builder for [`WsServer`].
pub struct WsServerBuilder {
    registry: Option<Arc<ConnectionRegistry>>,
    policy: Option<UpgradePolicy>,
    authorizer: ChannelAuthorizer,
    dispatcher: Option<MessageDispatcher>,
    heartbeat: Option<HeartbeatConfig>,
    reject_formatter: Option<RejectFormatter>,
    on_connect: Option<ConnectionCallback>,
    on_disconnect: Option<ConnectionCallback>,
    on_dead: Option<DeadCallback>,
}

impl Default for WsServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WsServerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: None,
            policy: None,
            authorizer: ChannelAuthorizer::new(),
            dispatcher: None,
            heartbeat: None,
            reject_formatter: None,
            on_connect: None,
            on_disconnect: None,
            on_dead: None,
        }
    }

    /// Share an existing registry (and its queue) with application code.
    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn policy(mut self, policy: UpgradePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn authorizer(mut self, authorizer: ChannelAuthorizer) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn dispatcher(mut self, dispatcher: MessageDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Enable heartbeat monitoring for every accepted connection.
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = Some(config);
        self
    }

    /// Custom body for upgrade rejection responses.
    pub fn reject_formatter(mut self, formatter: RejectFormatter) -> Self {
        self.reject_formatter = Some(formatter);
        self
    }

    pub fn on_connect(mut self, callback: ConnectionCallback) -> Self {
        self.on_connect = Some(callback);
        self
    }

    pub fn on_disconnect(mut self, callback: ConnectionCallback) -> Self {
        self.on_disconnect = Some(callback);
        self
    }

    /// Invoked when a heartbeat deadline is missed.
    pub fn on_dead(mut self, callback: DeadCallback) -> Self {
        self.on_dead = Some(callback);
        self
    }

    pub fn build(self) -> Result<WsServer, ConfigError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => UpgradePolicy::builder().build()?,
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ConnectionRegistry::new(Arc::new(MessageQueue::new()))));
        Ok(WsServer {
            inner: Arc::new(WsInner {
                registry,
                policy,
                authorizer: self.authorizer,
                dispatcher: self
                    .dispatcher
                    .unwrap_or_else(|| MessageDispatcher::builder().build()),
                heartbeat: self.heartbeat,
                reject_formatter: self.reject_formatter,
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
                on_dead: self.on_dead.unwrap_or_else(|| Arc::new(|_conn| {})),
            }),
        })
    }
}

struct WsInner {
    registry: Arc<ConnectionRegistry>,
    policy: UpgradePolicy,
    authorizer: ChannelAuthorizer,
    dispatcher: MessageDispatcher,
    heartbeat: Option<HeartbeatConfig>,
    reject_formatter: Option<RejectFormatter>,
    on_connect: Option<ConnectionCallback>,
    on_disconnect: Option<ConnectionCallback>,
    on_dead: DeadCallback,
}

/// WebSocket application server.
pub struct WsServer {
    inner: Arc<WsInner>,
}

impl WsServer {
    #[must_use]
    pub fn builder() -> WsServerBuilder {
        WsServerBuilder::new()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// Start listening on `addr`.
    pub fn start<A: ToSocketAddrs>(&self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let tracker = Arc::new(ConnTracker::new());

        let inner = self.inner.clone();
        let accept_tracker = tracker.clone();
        let handle = may::go!(move || {
            info!(addr = %local_addr, "websocket server listening");
            for stream in listener.incoming() {
                if accept_tracker.is_shutdown() {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let inner = inner.clone();
                        let conn_tracker = accept_tracker.clone();
                        may::go!(move || {
                            let _guard = conn_tracker.activate();
                            serve_socket(stream, &inner, &conn_tracker);
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(ServerHandle::new(local_addr, handle, tracker))
    }
}

fn rejection_response(inner: &WsInner, error: &UpgradeError) -> ErrorResponse {
    let body = match &inner.reject_formatter {
        Some(formatter) => formatter(error),
        None => error.to_string(),
    };
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::FORBIDDEN);
    response
}

fn serve_socket(stream: TcpStream, inner: &Arc<WsInner>, tracker: &Arc<ConnTracker>) {
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let _ = stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT));

    // Identity captured during the handshake callback.
    let mut accepted: Option<(String, Option<String>)> = None;

    let callback = |req: &Request, response: Response| {
        let headers: HashMap<String, String> = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let path = req.uri().path().to_string();
        let channel = channel_from_path(&path, inner.policy.default_channel());
        let upgrade_req = UpgradeRequest {
            path,
            channel: channel.clone(),
            origin: headers.get("origin").cloned(),
            headers,
            peer_addr: peer,
        };
        match inner
            .policy
            .evaluate(&upgrade_req)
            .and_then(|()| inner.authorizer.authorize(&upgrade_req))
        {
            Ok(()) => {
                accepted = Some((channel, upgrade_req.origin));
                Ok(response)
            }
            Err(e) => {
                debug!(peer = ?peer, error = %e, "upgrade rejected");
                Err(rejection_response(inner, &e))
            }
        }
    };

    // The socket has a read timeout, so the handshake may be interrupted
    // mid-exchange; resume it until it completes or fails.
    let mut attempt = tungstenite::accept_hdr(stream, callback);
    let ws = loop {
        match attempt {
            Ok(ws) => break ws,
            Err(HandshakeError::Interrupted(mid)) => {
                if tracker.is_shutdown() {
                    return;
                }
                attempt = mid.handshake();
            }
            Err(HandshakeError::Failure(e)) => {
                debug!(peer = ?peer, error = %e, "handshake failed");
                return;
            }
        }
    };
    let Some((channel, origin)) = accepted else {
        return;
    };

    let socket = WsSocket::new(ws);
    let sink: Arc<dyn MessageSink> = socket.clone();
    let conn = Connection::new(sink, channel, origin, peer);
    inner.registry.index(conn.clone());
    if let Some(callback) = &inner.on_connect {
        callback(&conn);
    }
    let heartbeat = inner
        .heartbeat
        .map(|config| Heartbeat::start(conn.clone(), config, inner.on_dead.clone()));

    loop {
        if tracker.is_shutdown() {
            conn.close();
            break;
        }
        if !conn.is_open() {
            break;
        }
        match socket.read() {
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                if let Some(hb) = &heartbeat {
                    hb.pong_received();
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(msg) => inner.dispatcher.dispatch(&conn, msg),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => break,
            Err(e) => {
                inner.dispatcher.connection_failed(&conn, &e);
                break;
            }
        }
    }

    if let Some(hb) = &heartbeat {
        hb.stop();
    }
    conn.mark_closed();
    inner.registry.remove(&conn);
    if let Some(callback) = &inner.on_disconnect {
        callback(&conn);
    }
    debug!(connection = %conn.id(), "connection closed");
}

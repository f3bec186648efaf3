//! Plain-HTTP server lifecycle.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use may::coroutine::JoinHandle;
use tracing::{info, warn};

use super::core::{handle_connection, ConnTracker, ServerEngine};

/// Read timeout on accepted sockets; bounds how long a connection loop can
/// go without noticing shutdown.
pub(crate) const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to a running server.
///
/// Provides methods for waiting until the listener is ready, stopping it
/// gracefully, or joining the accept coroutine.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    tracker: Arc<ConnTracker>,
}

impl ServerHandle {
    pub(crate) fn new(addr: SocketAddr, handle: JoinHandle<()>, tracker: Arc<ConnTracker>) -> Self {
        Self {
            addr,
            handle,
            tracker,
        }
    }

    /// Local address the server is bound to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the server to be ready to accept connections.
    ///
    /// Polls the listener address with TCP connects; useful in tests.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if the listener does not come up within ~250ms.
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop the server gracefully.
    ///
    /// Stops accepting, cancels the accept coroutine, and waits briefly for
    /// in-flight connections to drain.
    pub fn stop(self) {
        self.tracker.begin_shutdown();
        // SAFETY: cancel() is marked unsafe by the may runtime. The handle is
        // valid (we own it) and cancellation during shutdown is the intended
        // behavior.
        #[allow(unsafe_code)]
        unsafe {
            self.handle.coroutine().cancel();
        }
        let _ = self.handle.join();
        self.tracker.wait_idle(Duration::from_secs(2));
    }

    /// Block until the accept coroutine finishes.
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

/// Plain-HTTP application server.
pub struct Server {
    engine: Arc<ServerEngine>,
}

impl Server {
    #[must_use]
    pub fn new(engine: ServerEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// Start listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the port cannot be
    /// bound.
    pub fn start<A: ToSocketAddrs>(&self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        let listener = may::net::TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let tracker = Arc::new(ConnTracker::new());

        let engine = self.engine.clone();
        let accept_tracker = tracker.clone();
        let handle = may::go!(move || {
            info!(addr = %local_addr, "http server listening");
            for stream in listener.incoming() {
                if accept_tracker.is_shutdown() {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let peer = stream.peer_addr().ok();
                        let _ = stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT));
                        let engine = engine.clone();
                        let conn_tracker = accept_tracker.clone();
                        may::go!(move || {
                            let _guard = conn_tracker.activate();
                            handle_connection(stream, peer, &engine, &conn_tracker);
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

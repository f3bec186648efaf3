//! HTTPS serving: SNI-dispatched TLS contexts.
//!
//! TLS contexts are keyed by hostname with a mandatory `*` default that can
//! never be removed; the SNI server name selects the context, falling back
//! to the default for unknown or absent names. Certificate material is
//! accepted dual-mode: a value containing a PEM marker is used literally,
//! anything else is treated as a file path (load failures surface with the
//! original cause attached).

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::ToSocketAddrs;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use may::net::TcpListener;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tracing::{debug, info, warn};

use super::core::{handle_connection, ConnTracker, ServerEngine};
use super::http_server::{ServerHandle, SOCKET_READ_TIMEOUT};

/// Hostname key of the mandatory default context.
pub const DEFAULT_CONTEXT: &str = "*";

/// Load certificate material given either a file path or literal PEM text.
pub fn load_pem_source(source: &str) -> anyhow::Result<Vec<u8>> {
    if source.contains("-----BEGIN") {
        return Ok(source.as_bytes().to_vec());
    }
    fs::read(source).with_context(|| format!("failed to read PEM file '{source}'"))
}

fn certified_key(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<_, _>>()
        .context("failed to parse certificate PEM")?;
    if certs.is_empty() {
        bail!("certificate PEM contains no certificates");
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem).context("failed to parse private key PEM")?;
    let signing_key = any_supported_type(&key).context("unsupported private key type")?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// TLS contexts keyed by hostname, with the irremovable `*` default.
pub struct TlsContextMap {
    by_host: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for TlsContextMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts: Vec<String> = self
            .by_host
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("TlsContextMap")
            .field("hosts", &hosts)
            .finish()
    }
}

impl TlsContextMap {
    /// Create the map with its default (`*`) context.
    ///
    /// `cert` and `key` are dual-mode sources (path or literal PEM).
    pub fn new(cert: &str, key: &str) -> anyhow::Result<Arc<Self>> {
        let map = Arc::new(Self {
            by_host: RwLock::new(HashMap::new()),
        });
        map.set_context(DEFAULT_CONTEXT, cert, key)?;
        Ok(map)
    }

    /// Install or replace the context for `hostname`.
    pub fn set_context(&self, hostname: &str, cert: &str, key: &str) -> anyhow::Result<()> {
        let cert_pem = load_pem_source(cert)?;
        let key_pem = load_pem_source(key)?;
        let certified = certified_key(&cert_pem, &key_pem)?;
        if let Ok(mut by_host) = self.by_host.write() {
            by_host.insert(hostname.to_string(), certified);
            debug!(hostname, "tls context installed");
        }
        Ok(())
    }

    /// Remove the context for `hostname`. The default context cannot be
    /// removed.
    pub fn remove_context(&self, hostname: &str) -> anyhow::Result<()> {
        if hostname == DEFAULT_CONTEXT {
            bail!("the default ('*') TLS context cannot be removed");
        }
        if let Ok(mut by_host) = self.by_host.write() {
            by_host.remove(hostname);
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, hostname: &str) -> bool {
        self.by_host
            .read()
            .map(|m| m.contains_key(hostname))
            .unwrap_or(false)
    }

    /// Select the context for an SNI server name; unknown or absent names
    /// get the default context.
    #[must_use]
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let by_host = self.by_host.read().ok()?;
        if let Some(name) = server_name {
            if let Some(key) = by_host.get(name) {
                return Some(key.clone());
            }
        }
        by_host.get(DEFAULT_CONTEXT).cloned()
    }

    /// Build a `rustls` server configuration dispatching on SNI through this
    /// map.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniCertResolver(self.clone())));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

#[derive(Debug)]
struct SniCertResolver(Arc<TlsContextMap>);

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.select(client_hello.server_name())
    }
}

/// HTTPS application server: the plain server loop over TLS streams.
pub struct HttpsServer {
    engine: Arc<ServerEngine>,
    contexts: Arc<TlsContextMap>,
}

impl HttpsServer {
    #[must_use]
    pub fn new(engine: ServerEngine, contexts: Arc<TlsContextMap>) -> Self {
        Self {
            engine: Arc::new(engine),
            contexts,
        }
    }

    #[must_use]
    pub fn contexts(&self) -> &Arc<TlsContextMap> {
        &self.contexts
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
        let config = self.contexts.server_config();

        let engine = self.engine.clone();
        let accept_tracker = tracker.clone();
        let handle = may::go!(move || {
            info!(addr = %local_addr, "https server listening");
            for stream in listener.incoming() {
                if accept_tracker.is_shutdown() {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let peer = stream.peer_addr().ok();
                        let _ = stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT));
                        let config = config.clone();
                        let engine = engine.clone();
                        let conn_tracker = accept_tracker.clone();
                        may::go!(move || {
                            let _guard = conn_tracker.activate();
                            let conn = match ServerConnection::new(config) {
                                Ok(conn) => conn,
                                Err(e) => {
                                    warn!(error = %e, "tls session setup failed");
                                    return;
                                }
                            };
                            let tls = StreamOwned::new(conn, stream);
                            handle_connection(tls, peer, &engine, &conn_tracker);
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

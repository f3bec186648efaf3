//! External collaborator interfaces.
//!
//! The runtime consumes a handful of services it deliberately does not
//! implement: view rendering, credential lookup, error reporting, and cookie
//! encryption primitives. Each is specified here at its interface boundary
//! only; embedders supply implementations.

use serde_json::Value;

/// Username/password pair extracted from an HTTP `Authorization` header or
/// returned by a [`CredentialsProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// View-rendering service used for error pages and other server-generated
/// bodies.
pub trait Renderer: Send + Sync {
    /// Render `data` into a response body.
    fn render(&self, data: &Value) -> std::io::Result<Vec<u8>>;
}

/// Credential store lookup.
///
/// The lookup may suspend (database, directory service); failures are
/// surfaced to the caller with their cause attached, never swallowed.
pub trait CredentialsProvider: Send + Sync {
    fn lookup(&self, identifier: &str) -> anyhow::Result<Option<Credentials>>;
}

/// Logging/reporting sink for operational events and dispatched errors.
pub trait Reporter: Send + Sync {
    fn report(&self, message: &str);
    fn report_error(&self, error: &(dyn std::error::Error));
}

/// Opaque symmetric cipher used for cookie-value encryption.
///
/// The runtime owns IV generation and the wire layout (hex IV, dot, encoded
/// ciphertext); the cipher only transforms bytes.
pub trait CookieCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> anyhow::Result<Vec<u8>>;
}

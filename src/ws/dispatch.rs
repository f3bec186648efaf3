//! Per-message dispatch and error-to-wire mapping.
//!
//! Text/binary frames are handed to the handler registered for the
//! connection's channel (with an optional fallback handler). A handler error
//! becomes a wire response: the custom error handler's string when one is
//! installed, otherwise the error detail — but only when `debug_errors` is
//! opted in; the production default is a generic message, since raw error
//! detail to untrusted peers is a disclosure concern.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};
use tungstenite::Message;

use super::connection::Connection;

/// Error raised by a message handler.
#[derive(Debug)]
pub enum WsError {
    /// Handler/business-logic failure.
    Handler(anyhow::Error),
    /// The handler cannot process this frame type or payload.
    Unsupported(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsError::Handler(e) => write!(f, "message handler failed: {e}"),
            WsError::Unsupported(what) => write!(f, "unsupported message: {what}"),
        }
    }
}

impl std::error::Error for WsError {}

impl From<anyhow::Error> for WsError {
    fn from(e: anyhow::Error) -> Self {
        WsError::Handler(e)
    }
}

/// Handler for inbound frames on a channel. An `Ok(Some(..))` reply is sent
/// back on the same connection.
pub type MessageHandler =
    Arc<dyn Fn(&Arc<Connection>, Message) -> Result<Option<Message>, WsError> + Send + Sync>;

/// Formats a handler error into the wire response body.
pub type ErrorFormatter = Arc<dyn Fn(&WsError) -> String + Send + Sync>;

/// Builder for [`MessageDispatcher`].
#[derive(Default)]
pub struct MessageDispatcherBuilder {
    by_channel: HashMap<String, MessageHandler>,
    fallback: Option<MessageHandler>,
    error_formatter: Option<ErrorFormatter>,
    debug_errors: bool,
}

impl MessageDispatcherBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one channel.
    pub fn on_channel(mut self, channel: impl Into<String>, handler: MessageHandler) -> Self {
        self.by_channel.insert(channel.into(), handler);
        self
    }

    /// Handler for channels without their own registration.
    pub fn fallback(mut self, handler: MessageHandler) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Custom error-to-string mapping for wire responses.
    pub fn error_formatter(mut self, formatter: ErrorFormatter) -> Self {
        self.error_formatter = Some(formatter);
        self
    }

    /// Send full error detail to peers instead of a generic message.
    /// Intended for development only.
    pub fn debug_errors(mut self, debug: bool) -> Self {
        self.debug_errors = debug;
        self
    }

    #[must_use]
    pub fn build(self) -> MessageDispatcher {
        MessageDispatcher {
            by_channel: self.by_channel,
            fallback: self.fallback,
            error_formatter: self.error_formatter,
            debug_errors: self.debug_errors,
        }
    }
}

/// Routes inbound frames to channel handlers and maps failures onto the wire.
pub struct MessageDispatcher {
    by_channel: HashMap<String, MessageHandler>,
    fallback: Option<MessageHandler>,
    error_formatter: Option<ErrorFormatter>,
    debug_errors: bool,
}

impl MessageDispatcher {
    #[must_use]
    pub fn builder() -> MessageDispatcherBuilder {
        MessageDispatcherBuilder::new()
    }

    /// Dispatch one inbound frame.
    pub fn dispatch(&self, conn: &Arc<Connection>, msg: Message) {
        let handler = self
            .by_channel
            .get(conn.channel())
            .or(self.fallback.as_ref());
        let Some(handler) = handler else {
            debug!(channel = conn.channel(), "no message handler registered");
            return;
        };
        match handler(conn, msg) {
            Ok(Some(reply)) => {
                let _ = conn.send(reply);
            }
            Ok(None) => {}
            Err(e) => self.respond_error(conn, &e),
        }
    }

    /// Map a handler error to a wire response on the same connection.
    pub fn respond_error(&self, conn: &Arc<Connection>, error: &WsError) {
        warn!(connection = %conn.id(), error = %error, "message handler error");
        let body = match &self.error_formatter {
            Some(formatter) => formatter(error),
            None if self.debug_errors => error.to_string(),
            None => "internal error".to_string(),
        };
        let _ = conn.send(Message::text(body));
    }

    /// Map a reader-loop failure; the socket is unusable afterwards.
    pub fn connection_failed(&self, conn: &Arc<Connection>, error: &tungstenite::Error) {
        warn!(connection = %conn.id(), error = %error, "connection failed");
        conn.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::test_support::RecordingSink;

    fn connection(channel: &str) -> (Arc<Connection>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            Connection::new(sink.clone(), channel, None, None),
            sink,
        )
    }

    #[test]
    fn test_dispatch_reply() {
        let dispatcher = MessageDispatcher::builder()
            .on_channel(
                "echo",
                Arc::new(|_conn: &Arc<Connection>, msg: Message| Ok(Some(msg))),
            )
            .build();
        let (conn, sink) = connection("echo");
        dispatcher.dispatch(&conn, Message::text("hello"));
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], Message::text("hello"));
    }

    #[test]
    fn test_error_is_generic_without_debug() {
        let dispatcher = MessageDispatcher::builder()
            .on_channel(
                "x",
                Arc::new(|_conn: &Arc<Connection>, _msg: Message| {
                    Err(WsError::Handler(anyhow::anyhow!("secret detail")))
                }),
            )
            .build();
        let (conn, sink) = connection("x");
        dispatcher.dispatch(&conn, Message::text("hi"));
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], Message::text("internal error"));
    }

    #[test]
    fn test_error_detail_with_debug() {
        let dispatcher = MessageDispatcher::builder()
            .on_channel(
                "x",
                Arc::new(|_conn: &Arc<Connection>, _msg: Message| {
                    Err(WsError::Unsupported("binary".to_string()))
                }),
            )
            .debug_errors(true)
            .build();
        let (conn, sink) = connection("x");
        dispatcher.dispatch(&conn, Message::text("hi"));
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], Message::text("unsupported message: binary"));
    }

    #[test]
    fn test_custom_formatter_wins() {
        let dispatcher = MessageDispatcher::builder()
            .fallback(Arc::new(|_conn: &Arc<Connection>, _msg: Message| {
                Err(WsError::Handler(anyhow::anyhow!("boom")))
            }))
            .error_formatter(Arc::new(|_e: &WsError| "custom".to_string()))
            .build();
        let (conn, sink) = connection("anything");
        dispatcher.dispatch(&conn, Message::text("hi"));
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], Message::text("custom"));
    }
}

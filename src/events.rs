use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::connection::Connection;

/// Callback for every payload that arrives on a connection, in arrival order.
///  `checked` is true for payloads of reliable packets and false for unsequenced ones.
///  For a reliable payload this fires before the ordered callback.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceivedHandler: Send + Sync + 'static {
    async fn on_received(&self, checked: bool, payload: &[u8]);
}

/// Callback for reliable payloads in strict send order, each exactly once. Gaps are
///  filled by retransmission before later payloads are handed out.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrderedHandler: Send + Sync + 'static {
    async fn on_received_ordered(&self, payload: &[u8]);
}

/// Callback for the end of a session. `explicit` is true when the peer announced the
///  disconnect, false when the session timed out.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DisconnectHandler: Send + Sync + 'static {
    async fn on_disconnected(&self, explicit: bool);
}

/// Completion callback of [`crate::connect`]: `Some` with the established connection,
///  or `None` after the handshake attempts are exhausted.
#[async_trait]
pub trait ConnectHandler: Send + Sync + 'static {
    async fn on_connect(&self, connection: Option<Arc<Connection>>);
}

/// Callback of [`crate::listen`] for every accepted handshake.
///
/// NB: This runs on the listener's accept loop before the peer's first datagrams are
///  handed to the connection - the place to register the connection's handlers.
#[async_trait]
pub trait AcceptHandler: Send + Sync + 'static {
    async fn on_accept(&self, connection: Arc<Connection>);
}

//! The proxy-facing handle a module's hooks and commands close over to
//! reach back into the live connection.
//!
//! Hook handlers and command handlers are plain objects constructed inside
//! a module's `on_load` — they don't receive a proxy reference on every
//! call the way an event or command context might. Instead they capture
//! an `Rc<dyn ProxyHandle>` at construction time, which is equivalent and
//! avoids threading an extra parameter through every hook signature in
//! `mp-hooks`.

use crate::{PacketData, ProxyError};
use async_trait::async_trait;

/// Read-only snapshot of the proxy core's state, for introspection.
#[derive(Debug, Clone)]
pub struct ProxyStatus {
    pub state: String,
    pub loaded_modules: Vec<String>,
    pub hook_table_size: usize,
    pub client_connected: bool,
    pub server_connected: bool,
}

/// What a module (via its hooks and commands) may do to the live
/// connection: inject synthetic packets on either side, tear down the
/// upstream connection, or read back a status snapshot.
///
/// `inject_*` bypass the hook pipeline entirely: they write directly to
/// the respective socket, since they are outputs, not inputs.
#[async_trait(?Send)]
pub trait ProxyHandle {
    async fn inject_client(&self, name: &str, data: PacketData) -> Result<(), ProxyError>;
    async fn inject_server(&self, name: &str, data: PacketData) -> Result<(), ProxyError>;

    /// Tear down the upstream connection with an optional reason (a
    /// server keepalive timeout firing, or an unrecoverable connection
    /// error). Does not affect the client side directly — the state
    /// machine's teardown handling reacts to the resulting
    /// `serverDisconnected` local event.
    async fn teardown_server(&self, reason: Option<String>);

    fn status(&self) -> ProxyStatus;
}

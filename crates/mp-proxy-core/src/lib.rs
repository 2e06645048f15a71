//! The proxy connection core (SPEC_FULL.md §4.E): the dual-connection
//! state machine, packet pump, keepalive-adjacent injection primitives,
//! and the status/introspection surface that sits on top of the hook
//! pipeline, command registry, and module registry.
//!
//! Grounded in the teacher's `local_proxy.rs` shape (a `tokio::select!`
//! loop racing socket I/O against a `watch`-channel shutdown signal,
//! structured `tracing` on every lifecycle edge) and `session.rs`'s
//! `SessionError`-per-module convention, generalized from "broadcast one
//! event stream to N local TCP consumers" to "pump two packet streams
//! through a hook pipeline".

use async_trait::async_trait;
use mp_command_graph::CommandGraph;
use mp_commands::CommandRegistry;
use mp_hooks::{self, HookTable};
use mp_modules::ModuleRegistry;
use mp_protocol::{
    Direction, PacketData, PacketMeta, ProxyError, ProxyHandle, ProxyStatus, ProtocolState,
    PacketTransport, TransportEvent,
};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::{mpsc, watch};

/// The dual-connection lifecycle of §4.E. `Idle` is both the start and end
/// state: exactly one client may be proxied at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    ClientConnected,
    Authenticating,
    ConnectingUpstream,
    Connected,
    Proxying,
    Teardown,
}

impl ConnState {
    fn label(self) -> &'static str {
        match self {
            ConnState::Idle => "IDLE",
            ConnState::ClientConnected => "CLIENT_CONNECTED",
            ConnState::Authenticating => "AUTHENTICATING",
            ConnState::ConnectingUpstream => "CONNECTING_UPSTREAM",
            ConnState::Connected => "CONNECTED",
            ConnState::Proxying => "PROXYING",
            ConnState::Teardown => "TEARDOWN",
        }
    }
}

/// Dials (and authenticates) the outbound connection to the upstream
/// server. The real handshake — the wire codec, the Microsoft/Mojang auth
/// exchange — is out of scope (§1); this seam is what `main.rs` plugs a
/// concrete dialer into, and what tests plug a canned/mock result into.
#[async_trait(?Send)]
pub trait UpstreamConnector {
    async fn connect(&self) -> Result<Box<dyn PacketTransport>, ProxyError>;
}

/// Queued work for the pump loop that must happen *outside* the hook
/// pipeline: injected packets (§4.E "bypassing hooks — they are outputs,
/// not inputs") and a request to tear the upstream connection down.
///
/// Hook handlers reach these through [`ProxyHandleImpl`] rather than
/// writing to a transport directly, because a transport is owned by the
/// pump loop's stack frame while a handler only holds a captured `Rc`
/// back to the proxy (§3 `Module {proxy: ref}`) — the channel is the seam
/// that lets "inject from inside a hook" cross that ownership boundary
/// without a `RefCell<Box<dyn PacketTransport>>` and the re-entrant
/// borrow panics that would invite during traversal.
enum ControlMsg {
    InjectClient(String, PacketData),
    InjectServer(String, PacketData),
    TeardownServer(Option<String>),
}

struct Shared {
    state: ConnState,
    client_connected: bool,
    server_connected: bool,
}

struct HandleInner {
    shared: Rc<RefCell<Shared>>,
    hooks: Rc<RefCell<HookTable>>,
    modules: Rc<RefCell<ModuleRegistry>>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

/// The `Rc<dyn ProxyHandle>` every module's hooks and commands close over.
pub struct ProxyHandleImpl(Rc<HandleInner>);

#[async_trait(?Send)]
impl ProxyHandle for ProxyHandleImpl {
    async fn inject_client(&self, name: &str, data: PacketData) -> Result<(), ProxyError> {
        self.0
            .control_tx
            .send(ControlMsg::InjectClient(name.to_owned(), data))
            .map_err(|_| ProxyError::ConnectionLost("pump loop gone".into()))
    }

    async fn inject_server(&self, name: &str, data: PacketData) -> Result<(), ProxyError> {
        self.0
            .control_tx
            .send(ControlMsg::InjectServer(name.to_owned(), data))
            .map_err(|_| ProxyError::ConnectionLost("pump loop gone".into()))
    }

    async fn teardown_server(&self, reason: Option<String>) {
        let _ = self.0.control_tx.send(ControlMsg::TeardownServer(reason));
    }

    fn status(&self) -> ProxyStatus {
        let shared = self.0.shared.borrow();
        ProxyStatus {
            state: shared.state.label().to_owned(),
            loaded_modules: self.0.modules.borrow().module_names(),
            hook_table_size: self.0.hooks.borrow().table_size(),
            client_connected: shared.client_connected,
            server_connected: shared.server_connected,
        }
    }
}

/// Owns the hook table, command registry, and module registry for one
/// proxy instance, and drives (at most) one client↔server connection at a
/// time through them.
pub struct ProxyCore {
    hooks: Rc<RefCell<HookTable>>,
    commands: Rc<RefCell<CommandRegistry>>,
    modules: Rc<RefCell<ModuleRegistry>>,
    shared: Rc<RefCell<Shared>>,
    handle: Rc<dyn ProxyHandle>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    control_rx: mpsc::UnboundedReceiver<ControlMsg>,
}

impl ProxyCore {
    pub fn new(command_prefix: impl Into<String>) -> Self {
        let hooks = Rc::new(RefCell::new(HookTable::new()));
        let commands = Rc::new(RefCell::new(CommandRegistry::new(command_prefix)));
        let shared = Rc::new(RefCell::new(Shared {
            state: ConnState::Idle,
            client_connected: false,
            server_connected: false,
        }));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        // `modules` is filled in below, but the handle needs a clone of the
        // `Rc<RefCell<ModuleRegistry>>` up front for `status()`'s module-name
        // listing — allocate the cell first, populate it once the handle
        // (which `ModuleRegistry::new` itself needs) exists.
        let modules_cell: Rc<RefCell<ModuleRegistry>> =
            Rc::new(RefCell::new(ModuleRegistry::new(
                hooks.clone(),
                commands.clone(),
                Rc::new(DeferredHandle),
            )));

        let handle: Rc<dyn ProxyHandle> = Rc::new(ProxyHandleImpl(Rc::new(HandleInner {
            shared: shared.clone(),
            hooks: hooks.clone(),
            modules: modules_cell.clone(),
            control_tx: control_tx.clone(),
        })));

        *modules_cell.borrow_mut() =
            ModuleRegistry::new(hooks.clone(), commands.clone(), handle.clone());
        modules_cell.borrow().bind_self(Rc::downgrade(&modules_cell));

        ProxyCore {
            hooks,
            commands,
            modules: modules_cell,
            shared,
            handle,
            control_tx,
            control_rx,
        }
    }

    pub fn hooks(&self) -> Rc<RefCell<HookTable>> {
        self.hooks.clone()
    }

    pub fn commands(&self) -> Rc<RefCell<CommandRegistry>> {
        self.commands.clone()
    }

    pub fn modules(&self) -> Rc<RefCell<ModuleRegistry>> {
        self.modules.clone()
    }

    pub fn handle(&self) -> Rc<dyn ProxyHandle> {
        self.handle.clone()
    }

    pub fn status(&self) -> ProxyStatus {
        self.handle.status()
    }

    pub fn state(&self) -> ConnState {
        self.shared.borrow().state
    }

    pub fn is_busy(&self) -> bool {
        self.shared.borrow().client_connected
    }

    fn set_state(&self, state: ConnState) {
        let prev = self.shared.borrow().state;
        self.shared.borrow_mut().state = state;
        tracing::info!(from = prev.label(), to = state.label(), "proxy state transition");
    }

    async fn fire_local(&self, r#type: &str) -> Result<bool, ProxyError> {
        let (forwarded, _) =
            mp_hooks::execute(&self.hooks, Direction::Local, r#type, PacketData::Null).await?;
        Ok(forwarded)
    }

    /// Drive one client connection end to end: `CLIENT_CONNECTED` through
    /// `TEARDOWN`/back to `IDLE` (§4.E's state diagram). Returns once the
    /// connection has fully torn down.
    ///
    /// If another client is already attached, this rejects immediately
    /// ("too many connections", remaining in the current state) rather
    /// than queuing — consistent with the Non-goal of multi-tenant
    /// serving (at most one proxied client at a time).
    pub async fn serve_client(
        &mut self,
        client: Box<dyn PacketTransport>,
        connector: &dyn UpstreamConnector,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        if self.is_busy() {
            tracing::warn!("rejecting client: too many connections");
            return Err(ProxyError::InvalidState("too many connections".into()));
        }
        self.shared.borrow_mut().client_connected = true;

        self.set_state(ConnState::ClientConnected);
        self.fire_local("clientConnected").await?;

        self.set_state(ConnState::Authenticating);
        self.fire_local("beforeServerConnect").await?;

        self.set_state(ConnState::ConnectingUpstream);
        let server = match connector.connect().await {
            Ok(server) => server,
            Err(e) => {
                tracing::warn!(error = %e, "upstream connect failed");
                self.fire_local("serverDisconnected").await.ok();
                self.shared.borrow_mut().client_connected = false;
                self.set_state(ConnState::Idle);
                return Err(e);
            }
        };
        self.shared.borrow_mut().server_connected = true;
        self.set_state(ConnState::Connected);
        self.fire_local("serverConnected").await?;

        let result = self.pump(client, server, shutdown).await;

        self.fire_local("clientDisconnected").await.ok();
        self.fire_local("serverDisconnected").await.ok();
        self.shared.borrow_mut().client_connected = false;
        self.shared.borrow_mut().server_connected = false;
        self.set_state(ConnState::Idle);
        result
    }

    /// The packet pump (§4.E): enters `PROXYING` once the upstream
    /// transport reports the `Play` state, then forwards packets in
    /// receive order per direction, consulting the hook pipeline for
    /// each, until either side disconnects or `shutdown` fires.
    async fn pump(
        &mut self,
        mut client: Box<dyn PacketTransport>,
        mut server: Box<dyn PacketTransport>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        // Wait for the upstream to reach `play` before pumping packets
        // bidirectionally; client packets before that point are dropped
        // (handshake/login traffic is the wire codec's concern, out of
        // scope here).
        loop {
            match server.next_event().await {
                Some(TransportEvent::State(ProtocolState::Play)) => break,
                Some(TransportEvent::End(reason)) => {
                    return Err(ProxyError::ConnectionLost(reason.unwrap_or_default()));
                }
                Some(TransportEvent::Error(e)) => return Err(ProxyError::ConnectionLost(e)),
                Some(_) => continue,
                None => return Err(ProxyError::ConnectionLost(String::new())),
            }
        }
        self.set_state(ConnState::Proxying);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("graceful shutdown requested, tearing down connection");
                        break;
                    }
                }
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(ControlMsg::InjectClient(name, data)) => {
                            client.write(&name, data).await?;
                        }
                        Some(ControlMsg::InjectServer(name, data)) => {
                            server.write(&name, data).await?;
                        }
                        Some(ControlMsg::TeardownServer(reason)) => {
                            tracing::warn!(reason = reason.as_deref().unwrap_or(""), "tearing down upstream");
                            break;
                        }
                        None => {}
                    }
                }
                ev = client.next_event() => {
                    match ev {
                        Some(TransportEvent::Packet(meta, data)) => {
                            self.forward(Direction::ClientToServer, meta, data, server.as_mut()).await?;
                        }
                        Some(TransportEvent::End(_)) | None => {
                            tracing::info!("client disconnected");
                            break;
                        }
                        Some(TransportEvent::Error(e)) => {
                            tracing::warn!(error = %e, "client transport error");
                            break;
                        }
                        Some(TransportEvent::State(_) | TransportEvent::Login) => {}
                    }
                }
                ev = server.next_event() => {
                    match ev {
                        Some(TransportEvent::Packet(meta, data)) => {
                            self.forward(Direction::ServerToClient, meta, data, client.as_mut()).await?;
                        }
                        Some(TransportEvent::End(_)) | None => {
                            tracing::info!("server disconnected");
                            break;
                        }
                        Some(TransportEvent::Error(e)) => {
                            tracing::warn!(error = %e, "server transport error");
                            break;
                        }
                        Some(TransportEvent::State(_) | TransportEvent::Login) => {}
                    }
                }
            }
        }

        self.set_state(ConnState::Teardown);
        Ok(())
    }

    async fn forward(
        &self,
        direction: Direction,
        meta: PacketMeta,
        data: PacketData,
        out: &mut dyn PacketTransport,
    ) -> Result<(), ProxyError> {
        let (forwarded, data) = mp_hooks::execute(&self.hooks, direction, &meta.name, data).await?;
        if forwarded {
            out.write(&meta.name, data).await?;
        }
        Ok(())
    }
}

/// Placeholder handed to `ModuleRegistry::new` for the instant between
/// allocating the registry cell and constructing the real handle that
/// needs to point back at it. Never reachable after `ProxyCore::new`
/// returns — no module's `on_load` runs during construction.
struct DeferredHandle;

#[async_trait(?Send)]
impl ProxyHandle for DeferredHandle {
    async fn inject_client(&self, _name: &str, _data: PacketData) -> Result<(), ProxyError> {
        Err(ProxyError::InvalidState("proxy not yet constructed".into()))
    }
    async fn inject_server(&self, _name: &str, _data: PacketData) -> Result<(), ProxyError> {
        Err(ProxyError::InvalidState("proxy not yet constructed".into()))
    }
    async fn teardown_server(&self, _reason: Option<String>) {}
    fn status(&self) -> ProxyStatus {
        ProxyStatus {
            state: ConnState::Idle.label().to_owned(),
            loaded_modules: Vec::new(),
            hook_table_size: 0,
            client_connected: false,
            server_connected: false,
        }
    }
}

/// Merge the Command Registry's autocomplete roots into a server-declared
/// graph (§4.B "Merge"). Re-exported from `mp-commands`, which owns the
/// implementation since it only needs `CommandGraph`/`CommandRegistry` and
/// is shared by both this crate and `mp-core-module`.
pub use mp_commands::merge_local_commands;

#[cfg(test)]
mod tests {
    use super::*;
    use mp_protocol::ProtocolState;
    use mp_test_support::TestRig;

    struct FixedConnector {
        result: RefCell<Option<Result<Box<dyn PacketTransport>, ProxyError>>>,
    }

    #[async_trait(?Send)]
    impl UpstreamConnector for FixedConnector {
        async fn connect(&self) -> Result<Box<dyn PacketTransport>, ProxyError> {
            self.result
                .borrow_mut()
                .take()
                .unwrap_or_else(|| Err(ProxyError::ConnectionLost("used twice".into())))
        }
    }

    #[tokio::test]
    async fn second_client_is_rejected_while_busy() {
        let mut core = ProxyCore::new("/p:");
        core.shared.borrow_mut().client_connected = true;
        let (_rig, client) = TestRig::paired();
        let connector = FixedConnector { result: RefCell::new(None) };
        let (_tx, rx) = watch::channel(false);
        let err = core.serve_client(Box::new(client), &connector, rx).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidState(_)));
    }

    #[tokio::test]
    async fn packets_forward_once_upstream_reaches_play() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client_rig, client_transport) = TestRig::paired();
                let (mut server_rig, server_transport) = TestRig::paired();
                let connector = Rc::new(FixedConnector {
                    result: RefCell::new(Some(Ok(Box::new(server_transport) as Box<dyn PacketTransport>))),
                });
                let (shutdown_tx, shutdown_rx) = watch::channel(false);

                server_rig.push_event(TransportEvent::State(ProtocolState::Play));

                let spawn_connector = connector.clone();
                let run = tokio::task::spawn_local(async move {
                    let mut core = ProxyCore::new("/p:");
                    core.serve_client(Box::new(client_transport), spawn_connector.as_ref(), shutdown_rx)
                        .await
                });

                client_rig.push_packet(
                    PacketMeta { name: "chat".into(), state: ProtocolState::Play },
                    PacketData::chat("hello"),
                );
                let forwarded = server_rig.next_write().await.unwrap();
                assert_eq!(forwarded.name, "chat");

                let _ = shutdown_tx.send(true);
                let _ = run.await;
            })
            .await;
    }
}

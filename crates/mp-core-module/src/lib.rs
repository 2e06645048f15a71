//! The Core Module (SPEC_FULL.md §4.F): the one module every proxy
//! instance loads unconditionally. It wires chat-command dispatch into
//! the Hook Pipeline, drives the client/server keepalive round-trip, and
//! keeps the autocomplete graph (`mp-command-graph`) merged with whatever
//! the Command Registry has registered.
//!
//! Grounded in `mp-modules`' own `RecordingModule`/`CallbackModule` test
//! fixtures for the `Module` trait shape, and in the teacher's
//! `local_proxy.rs` for the "one `tokio::select!`-adjacent timer per
//! long-lived concern, torn down on the matching lifecycle edge" style —
//! generalized here to three independently-started/stopped timers instead
//! of one.

use async_trait::async_trait;
use mp_command_graph::{CommandGraph, NodeIndex, SerializedCommandNode};
use mp_commands::{
    merge_local_commands, AutocompleteNode, Command, CommandContext, CommandDescriptor,
    CommandHandler, CommandRegistry, CommandSink,
};
use mp_hooks::{Direction, Event, EventAction, HookHandler};
use mp_modules::{BoundCallback, Module, ModuleContext, ModuleState};
use mp_protocol::{PacketData, ProxyError, ProxyHandle};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

const CLIENT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const SERVER_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// The six keys §4.F names explicitly: three timer handles plus the last
/// sent keepalive id, the cached `declare_commands` graph, and the
/// identity-set of locally-merged autocomplete nodes.
mod state_keys {
    pub const CLIENT_INTERVAL: &str = "client_keepalive_interval";
    pub const CLIENT_TIMEOUT: &str = "client_keepalive_timeout";
    pub const SERVER_TIMEOUT: &str = "server_keepalive_timeout";
    pub const LAST_SENT: &str = "last_sent_keepalive";
    pub const COMMAND_GRAPH: &str = "command_graph";
    pub const LOCAL_NODES: &str = "local_command_nodes";
}

type TimerCell = Rc<RefCell<Option<JoinHandle<()>>>>;
type LastSentCell = Rc<Cell<Option<(i64, i64)>>>;
type GraphCell = Rc<RefCell<Option<CommandGraph>>>;
type NodesCell = Rc<RefCell<Vec<NodeIndex>>>;

/// `{nodes, rootIndex}` (§6): the wire shape of a `declare_commands`
/// packet, bridged to/from `PacketData` via `serde_json::Value` since
/// `PacketData` already mirrors JSON structurally.
#[derive(Serialize, Deserialize)]
struct DeclareCommandsPayload {
    nodes: Vec<SerializedCommandNode>,
    #[serde(rename = "rootIndex")]
    root_index: u32,
}

fn graph_to_packet(graph: &CommandGraph) -> Result<PacketData, ProxyError> {
    let (nodes, root_index) = graph.serialize()?;
    let payload = DeclareCommandsPayload { nodes, root_index };
    let value = serde_json::to_value(&payload)?;
    Ok(serde_json::from_value(value)?)
}

fn packet_to_graph(data: &PacketData) -> Result<CommandGraph, ProxyError> {
    let value = serde_json::to_value(data)?;
    let payload: DeclareCommandsPayload = serde_json::from_value(value)?;
    CommandGraph::deserialize(payload.nodes, payload.root_index)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Split a millisecond timestamp into the `[high, low]` halves of an
/// unsigned 64-bit integer (§4.E "64-bit timestamp split"). Plain
/// shift/mask arithmetic, not the source's retained `& (2^53-1 - 2^32-1)`
/// masking variant, per spec.md's explicit preference for the arithmetic
/// form.
fn split_keepalive(timestamp_millis: u64) -> (i64, i64) {
    let high = (timestamp_millis >> 32) as i64;
    let low = (timestamp_millis & 0xFFFF_FFFF) as i64;
    (high, low)
}

fn keepalive_packet(high: i64, low: i64) -> PacketData {
    PacketData::List(vec![PacketData::Int(high), PacketData::Int(low)])
}

fn parse_keepalive(data: &PacketData) -> Option<(i64, i64)> {
    match data {
        PacketData::List(items) => match items.as_slice() {
            [PacketData::Int(h), PacketData::Int(l)] => Some((*h, *l)),
            _ => None,
        },
        _ => None,
    }
}

/// Abort and clear a timer slot without complaint — used on the lifecycle
/// edges (disconnect, unload) where "nothing was running" is the common
/// and unremarkable case.
fn quietly_clear(cell: &TimerCell) {
    if let Some(handle) = cell.borrow_mut().take() {
        handle.abort();
    }
}

/// Replace a timer slot's contents, aborting whatever was there. Used for
/// the server keepalive's normal refresh-on-echo path, where a previous
/// timer is expected to still be running.
fn restart(cell: &TimerCell, handle: JoinHandle<()>) {
    if let Some(old) = cell.borrow_mut().replace(handle) {
        old.abort();
    }
}

/// A `CommandSink` that reaches the live connection through the proxy
/// handle every module-registered hook and command already closes over.
struct ProxySink {
    proxy: Rc<dyn ProxyHandle>,
}

#[async_trait(?Send)]
impl CommandSink for ProxySink {
    async fn reply(&self, message: &str) {
        let _ = self
            .proxy
            .inject_client("chat", PacketData::chat(message))
            .await;
    }

    async fn send_server(&self, message: &str) {
        let _ = self
            .proxy
            .inject_server("chat", PacketData::chat(message))
            .await;
    }
}

/// `ClientToServer/chat`: run chat messages through the Command Registry,
/// suppressing the original packet whenever it resolved to a command
/// (found or not) rather than ordinary chat (§4.F, S1).
struct ChatDispatchHook {
    commands: Rc<RefCell<CommandRegistry>>,
    proxy: Rc<dyn ProxyHandle>,
}

#[async_trait(?Send)]
impl HookHandler for ChatDispatchHook {
    async fn handle(&self, event: &mut Event) -> EventAction {
        let Some(message) = event.data.get("text").and_then(PacketData::as_str) else {
            return EventAction::Continue;
        };
        // `prepare` (not `execute`) so the borrow is dropped before the
        // handler is awaited: the built-in `module` command's handlers
        // call back into registries that need their own `borrow_mut`.
        let outcome = self.commands.borrow().prepare(message);
        let sink = ProxySink {
            proxy: self.proxy.clone(),
        };
        match outcome {
            mp_commands::DispatchOutcome::NotOurs => EventAction::Continue,
            mp_commands::DispatchOutcome::NotFound => {
                sink.reply("Command not found").await;
                EventAction::Cancel
            }
            mp_commands::DispatchOutcome::Dispatch { args, handler } => {
                let ctx = CommandContext { args, sink: &sink };
                if let Err(e) = handler.handle(&ctx).await {
                    sink.reply(&format!("command failed: {e}")).await;
                }
                EventAction::Cancel
            }
        }
    }
}

/// `Local/clientConnected`: start the 15s keepalive interval and, if a
/// graph from a prior connection is still cached, re-send it immediately
/// rather than waiting on the server to redeclare (§4.F).
struct ClientConnectedHook {
    proxy: Rc<dyn ProxyHandle>,
    interval_cell: TimerCell,
    command_graph: GraphCell,
    tick_cb: BoundCallback,
}

#[async_trait(?Send)]
impl HookHandler for ClientConnectedHook {
    async fn handle(&self, _event: &mut Event) -> EventAction {
        if self.interval_cell.borrow().is_none() {
            let tick_cb = self.tick_cb.clone();
            let handle = tokio::task::spawn_local(async move {
                loop {
                    tokio::time::sleep(CLIENT_KEEPALIVE_INTERVAL).await;
                    tick_cb.fire();
                }
            });
            *self.interval_cell.borrow_mut() = Some(handle);
        }

        if let Some(graph) = self.command_graph.borrow().as_ref() {
            if let Ok(packet) = graph_to_packet(graph) {
                let _ = self.proxy.inject_client("declare_commands", packet).await;
            }
        }
        EventAction::Continue
    }
}

/// `Local/clientDisconnected`: stop the client-side keepalive timers.
struct ClientDisconnectedHook {
    interval_cell: TimerCell,
    timeout_cell: TimerCell,
}

#[async_trait(?Send)]
impl HookHandler for ClientDisconnectedHook {
    async fn handle(&self, _event: &mut Event) -> EventAction {
        quietly_clear(&self.interval_cell);
        quietly_clear(&self.timeout_cell);
        EventAction::Continue
    }
}

/// `Local/serverConnected`: arm the initial server keepalive timeout.
struct ServerConnectedHook {
    timeout_cell: TimerCell,
    timeout_cb: BoundCallback,
}

#[async_trait(?Send)]
impl HookHandler for ServerConnectedHook {
    async fn handle(&self, _event: &mut Event) -> EventAction {
        let cb = self.timeout_cb.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(SERVER_KEEPALIVE_TIMEOUT).await;
            cb.fire();
        });
        restart(&self.timeout_cell, handle);
        EventAction::Continue
    }
}

/// `Local/serverDisconnected`: stop the server keepalive timeout and, per
/// §4.F, drop the cached graph and local-node set — the next connection
/// starts clean rather than replaying a stale merge.
struct ServerDisconnectedHook {
    timeout_cell: TimerCell,
    command_graph: GraphCell,
    local_nodes: NodesCell,
}

#[async_trait(?Send)]
impl HookHandler for ServerDisconnectedHook {
    async fn handle(&self, _event: &mut Event) -> EventAction {
        quietly_clear(&self.timeout_cell);
        *self.command_graph.borrow_mut() = None;
        self.local_nodes.borrow_mut().clear();
        EventAction::Continue
    }
}

/// `ClientToServer/keep_alive`: the client's echo of our injected ping.
/// Always suppressed; mismatches and unsolicited echoes are logged, never
/// fatal (§4.E).
struct ClientKeepAliveHook {
    last_sent: LastSentCell,
    timeout_cell: TimerCell,
}

#[async_trait(?Send)]
impl HookHandler for ClientKeepAliveHook {
    async fn handle(&self, event: &mut Event) -> EventAction {
        let received = parse_keepalive(&event.data);
        match (received, self.last_sent.get()) {
            (Some(r), Some(expected)) if r == expected => {}
            (Some(r), Some(expected)) => {
                tracing::warn!(?r, ?expected, "client keepalive echo mismatch");
            }
            (Some(r), None) => {
                tracing::warn!(?r, "client keepalive echo with none outstanding");
            }
            (None, _) => {
                tracing::warn!("malformed client keepalive payload");
            }
        }
        match self.timeout_cell.borrow_mut().take() {
            Some(handle) => handle.abort(),
            None => tracing::warn!("client keepalive timeout already cleared"),
        }
        EventAction::Cancel
    }
}

/// `ServerToClient/keep_alive`: the real server pinging us. Echo the exact
/// payload back upstream and refresh the timeout (§4.E).
struct ServerKeepAliveHook {
    proxy: Rc<dyn ProxyHandle>,
    timeout_cell: TimerCell,
    timeout_cb: BoundCallback,
}

#[async_trait(?Send)]
impl HookHandler for ServerKeepAliveHook {
    async fn handle(&self, event: &mut Event) -> EventAction {
        let _ = self
            .proxy
            .inject_server("keep_alive", event.data.clone())
            .await;
        let cb = self.timeout_cb.clone();
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(SERVER_KEEPALIVE_TIMEOUT).await;
            cb.fire();
        });
        restart(&self.timeout_cell, handle);
        EventAction::Cancel
    }
}

/// `ServerToClient/declare_commands`: replace the server's graph with one
/// merging in the Command Registry's local commands (§4.B, §4.F, S3).
struct DeclareCommandsHook {
    proxy: Rc<dyn ProxyHandle>,
    commands: Rc<RefCell<CommandRegistry>>,
    command_graph: GraphCell,
    local_nodes: NodesCell,
}

#[async_trait(?Send)]
impl HookHandler for DeclareCommandsHook {
    async fn handle(&self, event: &mut Event) -> EventAction {
        let mut graph = match packet_to_graph(&event.data) {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(error = %e, "malformed declare_commands from server");
                return EventAction::Continue;
            }
        };

        let previous = self.local_nodes.borrow().clone();
        let applied = merge_local_commands(&mut graph, &self.commands.borrow(), &previous);
        *self.local_nodes.borrow_mut() = applied;

        let packet = match graph_to_packet(&graph) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to re-serialize merged command graph");
                return EventAction::Continue;
            }
        };
        *self.command_graph.borrow_mut() = Some(graph);

        let _ = self.proxy.inject_client("declare_commands", packet).await;
        EventAction::Cancel
    }
}

/// The built-in `module` command (§4.F): `load`/`unload`/`reload <name>`,
/// `import <path>`.
struct ModuleCommandHandler {
    registry: Rc<RefCell<mp_modules::ModuleRegistry>>,
}

#[async_trait(?Send)]
impl CommandHandler for ModuleCommandHandler {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<(), ProxyError> {
        let sub = ctx.args.get(1).map(String::as_str);
        let arg = ctx.args.get(2).map(String::as_str);
        match (sub, arg) {
            (Some("load"), Some(name)) => {
                self.registry.borrow_mut().load(name).await?;
                ctx.sink.reply(&format!("loaded {name}")).await;
            }
            (Some("unload"), Some(name)) => {
                self.registry.borrow_mut().unload(name, false).await?;
                ctx.sink.reply(&format!("unloaded {name}")).await;
            }
            (Some("reload"), Some(name)) => {
                let new_name = self.registry.borrow_mut().reload(name).await?;
                ctx.sink.reply(&format!("reloaded {name} -> {new_name}")).await;
            }
            (Some("import"), Some(path)) => {
                let name = self.registry.borrow_mut().import(path)?;
                ctx.sink.reply(&format!("imported {name}")).await;
            }
            _ => {
                ctx.sink
                    .reply("usage: module <load|unload|reload|import> <name|path>")
                    .await;
            }
        }
        Ok(())
    }
}

fn module_autocomplete() -> AutocompleteNode {
    // Each subcommand literal gets a single `brigadier:string` argument
    // child (the module name or import path), executable so
    // `/p:module load foo` resolves without a trailing literal.
    AutocompleteNode::literal("module")
        .with_child(AutocompleteNode::literal("load").with_child(leaf_arg()))
        .with_child(AutocompleteNode::literal("unload").with_child(leaf_arg()))
        .with_child(AutocompleteNode::literal("reload").with_child(leaf_arg()))
        .with_child(AutocompleteNode::literal("import").with_child(leaf_arg()))
}

fn leaf_arg() -> AutocompleteNode {
    AutocompleteNode::argument("name", "brigadier:string").executable(true)
}

/// The Core Module (§4.F): always loaded, never unloaded except during a
/// reload of itself (enforced by `ModuleRegistry::unload`, not here).
pub struct CoreModule {
    state: ModuleState,
    proxy: Option<Rc<dyn ProxyHandle>>,
    last_sent_keepalive: LastSentCell,
    command_graph: GraphCell,
    local_command_nodes: NodesCell,
    client_keepalive_interval: TimerCell,
    client_keepalive_timeout: TimerCell,
    server_keepalive_timeout: TimerCell,
    client_timeout_cb: Option<BoundCallback>,
    module_command: Option<Command>,
}

impl Default for CoreModule {
    fn default() -> Self {
        CoreModule {
            state: ModuleState::new(),
            proxy: None,
            last_sent_keepalive: Rc::new(Cell::new(None)),
            command_graph: Rc::new(RefCell::new(None)),
            local_command_nodes: Rc::new(RefCell::new(Vec::new())),
            client_keepalive_interval: Rc::new(RefCell::new(None)),
            client_keepalive_timeout: Rc::new(RefCell::new(None)),
            server_keepalive_timeout: Rc::new(RefCell::new(None)),
            client_timeout_cb: None,
            module_command: None,
        }
    }
}

impl CoreModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover a preserved `Rc`/`Rc<RefCell<_>>` cell from migrated state,
    /// or install a freshly built one — and in either case, write it back
    /// under the same key so this generation's `state_mut()` reflects the
    /// live cell and the next reload migrates the very same pointer.
    fn recover_or_default<T: Clone + 'static>(&mut self, key: &str, default: T) -> T {
        let value = self
            .state
            .get::<T>(key)
            .cloned()
            .unwrap_or(default);
        self.state.insert(key, value.clone());
        value
    }
}

#[async_trait(?Send)]
impl Module for CoreModule {
    fn name(&self) -> String {
        "core".to_owned()
    }

    fn state_preserve_keys(&self) -> Vec<String> {
        vec![
            state_keys::CLIENT_INTERVAL.into(),
            state_keys::CLIENT_TIMEOUT.into(),
            state_keys::SERVER_TIMEOUT.into(),
            state_keys::LAST_SENT.into(),
            state_keys::COMMAND_GRAPH.into(),
            state_keys::LOCAL_NODES.into(),
        ]
    }

    fn state_mut(&mut self) -> &mut ModuleState {
        &mut self.state
    }

    async fn on_load(&mut self, ctx: &ModuleContext, _reloading: bool) -> Result<(), ProxyError> {
        let proxy = ctx.proxy();
        self.proxy = Some(proxy.clone());

        self.last_sent_keepalive =
            self.recover_or_default(state_keys::LAST_SENT, Rc::new(Cell::new(None)));
        self.command_graph =
            self.recover_or_default(state_keys::COMMAND_GRAPH, Rc::new(RefCell::new(None)));
        self.local_command_nodes =
            self.recover_or_default(state_keys::LOCAL_NODES, Rc::new(RefCell::new(Vec::new())));
        self.client_keepalive_interval =
            self.recover_or_default(state_keys::CLIENT_INTERVAL, Rc::new(RefCell::new(None)));
        self.client_keepalive_timeout =
            self.recover_or_default(state_keys::CLIENT_TIMEOUT, Rc::new(RefCell::new(None)));
        self.server_keepalive_timeout =
            self.recover_or_default(state_keys::SERVER_TIMEOUT, Rc::new(RefCell::new(None)));
        self.client_timeout_cb = Some(ctx.bind_callback("client_timeout_fire"));

        let commands = ctx.commands();

        ctx.register_hook(
            Direction::ClientToServer,
            "chat",
            Rc::new(ChatDispatchHook {
                commands: commands.clone(),
                proxy: proxy.clone(),
            }),
            0,
        );
        ctx.register_hook(
            Direction::Local,
            "clientConnected",
            Rc::new(ClientConnectedHook {
                proxy: proxy.clone(),
                interval_cell: self.client_keepalive_interval.clone(),
                command_graph: self.command_graph.clone(),
                tick_cb: ctx.bind_callback("client_tick"),
            }),
            0,
        );
        ctx.register_hook(
            Direction::Local,
            "clientDisconnected",
            Rc::new(ClientDisconnectedHook {
                interval_cell: self.client_keepalive_interval.clone(),
                timeout_cell: self.client_keepalive_timeout.clone(),
            }),
            0,
        );
        ctx.register_hook(
            Direction::Local,
            "serverConnected",
            Rc::new(ServerConnectedHook {
                timeout_cell: self.server_keepalive_timeout.clone(),
                timeout_cb: ctx.bind_callback("server_timeout_fire"),
            }),
            0,
        );
        ctx.register_hook(
            Direction::Local,
            "serverDisconnected",
            Rc::new(ServerDisconnectedHook {
                timeout_cell: self.server_keepalive_timeout.clone(),
                command_graph: self.command_graph.clone(),
                local_nodes: self.local_command_nodes.clone(),
            }),
            0,
        );
        ctx.register_hook(
            Direction::ClientToServer,
            "keep_alive",
            Rc::new(ClientKeepAliveHook {
                last_sent: self.last_sent_keepalive.clone(),
                timeout_cell: self.client_keepalive_timeout.clone(),
            }),
            0,
        );
        ctx.register_hook(
            Direction::ServerToClient,
            "keep_alive",
            Rc::new(ServerKeepAliveHook {
                proxy: proxy.clone(),
                timeout_cell: self.server_keepalive_timeout.clone(),
                timeout_cb: ctx.bind_callback("server_timeout_fire"),
            }),
            0,
        );
        ctx.register_hook(
            Direction::ServerToClient,
            "declare_commands",
            Rc::new(DeclareCommandsHook {
                proxy: proxy.clone(),
                commands: commands.clone(),
                command_graph: self.command_graph.clone(),
                local_nodes: self.local_command_nodes.clone(),
            }),
            0,
        );

        if let Some(registry) = ctx.modules() {
            let command = ctx.register_command(CommandDescriptor {
                name: "module".into(),
                description: "manage proxy modules".into(),
                autocomplete: Some(module_autocomplete()),
                handler: Rc::new(ModuleCommandHandler { registry }),
            })?;
            self.module_command = Some(command);
        }

        Ok(())
    }

    async fn on_unload(&mut self, _ctx: &ModuleContext, reloading: bool) -> Result<(), ProxyError> {
        if !reloading {
            quietly_clear(&self.client_keepalive_interval);
            quietly_clear(&self.client_keepalive_timeout);
            quietly_clear(&self.server_keepalive_timeout);
        }
        self.module_command = None;
        Ok(())
    }

    fn invoke_callback(&mut self, key: &str) {
        match key {
            "client_tick" => {
                let Some(proxy) = self.proxy.clone() else { return };
                let last_sent = self.last_sent_keepalive.clone();
                let timeout_cell = self.client_keepalive_timeout.clone();
                // `invoke_callback` is synchronous (it is dispatched from
                // `BoundCallback::fire`, called from inside a spawned
                // timer task with no surrounding `.await` point of its
                // own) but injecting a packet and arming the follow-up
                // timeout both need to run in async context, so the
                // actual work is handed to a fresh task.
                tokio::task::spawn_local(async move {
                    let (high, low) = split_keepalive(now_millis());
                    last_sent.set(Some((high, low)));
                    let _ = proxy
                        .inject_client("keep_alive", keepalive_packet(high, low))
                        .await;
                });
                // The 20s timeout for this tick is armed separately so it
                // can be cancelled the instant the matching echo arrives,
                // rather than racing the injection above.
                if let Some(cb) = self.client_timeout_cb.clone() {
                    let handle = tokio::task::spawn_local(async move {
                        tokio::time::sleep(CLIENT_KEEPALIVE_TIMEOUT).await;
                        cb.fire();
                    });
                    restart(&timeout_cell, handle);
                }
            }
            "client_timeout_fire" => {
                tracing::warn!("client failed to echo keepalive in time");
                if let Some(proxy) = self.proxy.clone() {
                    // No dedicated "disconnect the client" primitive exists
                    // (§3/§4.E expose only `teardown_server`); tearing down
                    // the upstream is the closest available action and
                    // drives the state machine back to `IDLE` the same way
                    // a genuine client drop would.
                    tokio::task::spawn_local(async move {
                        proxy
                            .teardown_server(Some("client keepalive timeout".into()))
                            .await;
                    });
                }
            }
            "server_timeout_fire" => {
                tracing::warn!("server keepalive timed out, tearing down upstream");
                if let Some(proxy) = self.proxy.clone() {
                    tokio::task::spawn_local(async move {
                        proxy.teardown_server(None).await;
                    });
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_protocol::ProxyStatus;
    use std::collections::BTreeSet;

    #[test]
    fn split_keepalive_uses_arithmetic_shift_and_mask() {
        let ts: u64 = 0x1_2345_6789_ABCD;
        let (high, low) = split_keepalive(ts);
        assert_eq!(high, (ts >> 32) as i64);
        assert_eq!(low, (ts & 0xFFFF_FFFF) as i64);
    }

    #[test]
    fn keepalive_packet_round_trips_through_parse() {
        let packet = keepalive_packet(11, 22);
        assert_eq!(parse_keepalive(&packet), Some((11, 22)));
    }

    #[test]
    fn parse_keepalive_rejects_non_list_payloads() {
        assert_eq!(parse_keepalive(&PacketData::Null), None);
    }

    struct ReplyHandler {
        message: &'static str,
    }
    #[async_trait(?Send)]
    impl CommandHandler for ReplyHandler {
        async fn handle(&self, ctx: &CommandContext<'_>) -> Result<(), ProxyError> {
            ctx.sink.reply(self.message).await;
            Ok(())
        }
    }

    struct NoopHandler;
    #[async_trait(?Send)]
    impl CommandHandler for NoopHandler {
        async fn handle(&self, _ctx: &CommandContext<'_>) -> Result<(), ProxyError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandle {
        injected_client: RefCell<Vec<(String, PacketData)>>,
        injected_server: RefCell<Vec<(String, PacketData)>>,
        torn_down: RefCell<Vec<Option<String>>>,
    }

    #[async_trait(?Send)]
    impl ProxyHandle for RecordingHandle {
        async fn inject_client(&self, name: &str, data: PacketData) -> Result<(), ProxyError> {
            self.injected_client
                .borrow_mut()
                .push((name.to_owned(), data));
            Ok(())
        }
        async fn inject_server(&self, name: &str, data: PacketData) -> Result<(), ProxyError> {
            self.injected_server
                .borrow_mut()
                .push((name.to_owned(), data));
            Ok(())
        }
        async fn teardown_server(&self, reason: Option<String>) {
            self.torn_down.borrow_mut().push(reason);
        }
        fn status(&self) -> ProxyStatus {
            ProxyStatus {
                state: "TEST".into(),
                loaded_modules: Vec::new(),
                hook_table_size: 0,
                client_connected: false,
                server_connected: false,
            }
        }
    }

    /// Fresh hook table, command registry (`/p:` prefix), and module
    /// registry with the core module's factory registered (but not yet
    /// imported/loaded), plus the recording handle every test inspects.
    fn fixture() -> (
        Rc<RefCell<mp_hooks::HookTable>>,
        Rc<RefCell<CommandRegistry>>,
        Rc<RefCell<mp_modules::ModuleRegistry>>,
        Rc<RecordingHandle>,
    ) {
        let hooks = Rc::new(RefCell::new(mp_hooks::HookTable::new()));
        let commands = Rc::new(RefCell::new(CommandRegistry::new("/p:")));
        let handle = Rc::new(RecordingHandle::default());
        let registry = Rc::new(RefCell::new(mp_modules::ModuleRegistry::new(
            hooks.clone(),
            commands.clone(),
            handle.clone() as Rc<dyn ProxyHandle>,
        )));
        registry.borrow().bind_self(Rc::downgrade(&registry));
        registry.borrow_mut().register_factory(mp_modules::ModuleFactory {
            key: "core".into(),
            build: Rc::new(|| Box::new(CoreModule::new()) as Box<dyn Module>),
        });
        (hooks, commands, registry, handle)
    }

    /// Let chains of `spawn_local` tasks (tick fires a timeout-arming task,
    /// which itself awaits a timer) actually run before assertions. Needed
    /// whenever a test advances paused time past a callback boundary.
    async fn drain() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn s1_chat_command_is_suppressed_and_replied() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();
                commands
                    .borrow_mut()
                    .register(CommandDescriptor {
                        name: "test".into(),
                        description: "".into(),
                        autocomplete: None,
                        handler: Rc::new(ReplyHandler { message: "HI" }),
                    })
                    .unwrap();

                let (forwarded, _) = mp_hooks::execute(
                    &hooks,
                    Direction::ClientToServer,
                    "chat",
                    PacketData::chat("/p:test"),
                )
                .await
                .unwrap();

                assert!(!forwarded);
                let sent = handle.injected_client.borrow();
                assert_eq!(sent.len(), 1);
                assert_eq!(sent[0].0, "chat");
                assert_eq!(sent[0].1.get("text").and_then(PacketData::as_str), Some("HI"));
            })
            .await;
    }

    #[tokio::test]
    async fn unknown_command_replies_not_found_and_is_suppressed() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, _commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                let (forwarded, _) = mp_hooks::execute(
                    &hooks,
                    Direction::ClientToServer,
                    "chat",
                    PacketData::chat("/p:bogus"),
                )
                .await
                .unwrap();

                assert!(!forwarded);
                let sent = handle.injected_client.borrow();
                assert_eq!(
                    sent[0].1.get("text").and_then(PacketData::as_str),
                    Some("Command not found")
                );
            })
            .await;
    }

    #[tokio::test]
    async fn ordinary_chat_is_not_a_command_and_forwards() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, _commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                let (forwarded, _) = mp_hooks::execute(
                    &hooks,
                    Direction::ClientToServer,
                    "chat",
                    PacketData::chat("hello world"),
                )
                .await
                .unwrap();

                assert!(forwarded);
                assert!(handle.injected_client.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn client_keepalive_tick_sends_split_timestamp() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, _commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                mp_hooks::execute(&hooks, Direction::Local, "clientConnected", PacketData::Null)
                    .await
                    .unwrap();

                tokio::time::advance(CLIENT_KEEPALIVE_INTERVAL + Duration::from_millis(1)).await;
                drain().await;

                let sent = handle.injected_client.borrow();
                let (_, data) = sent
                    .iter()
                    .find(|(name, _)| name == "keep_alive")
                    .expect("keep_alive was injected");
                match data {
                    PacketData::List(items) => assert_eq!(items.len(), 2),
                    other => panic!("unexpected keepalive payload: {other:?}"),
                }
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn server_keepalive_timeout_tears_down_upstream_without_echo() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, _commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                mp_hooks::execute(&hooks, Direction::Local, "serverConnected", PacketData::Null)
                    .await
                    .unwrap();

                tokio::time::advance(SERVER_KEEPALIVE_TIMEOUT + Duration::from_millis(1)).await;
                drain().await;

                assert_eq!(handle.torn_down.borrow().len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn server_keepalive_echo_is_forwarded_and_suppressed() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, _commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                let (forwarded, _) = mp_hooks::execute(
                    &hooks,
                    Direction::ServerToClient,
                    "keep_alive",
                    keepalive_packet(1, 2),
                )
                .await
                .unwrap();

                assert!(!forwarded);
                let sent = handle.injected_server.borrow();
                assert_eq!(sent.len(), 1);
                assert_eq!(parse_keepalive(&sent[0].1), Some((1, 2)));
            })
            .await;
    }

    #[tokio::test]
    async fn client_keepalive_echo_is_suppressed_regardless_of_match() {
        // S2: the client's echo of our ping is never forwarded, matching
        // or not (mismatches are logged, never fatal).
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, _commands, registry, _handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                let (forwarded, _) = mp_hooks::execute(
                    &hooks,
                    Direction::ClientToServer,
                    "keep_alive",
                    keepalive_packet(1, 2),
                )
                .await
                .unwrap();

                assert!(!forwarded);
            })
            .await;
    }

    #[tokio::test]
    async fn s3_declare_commands_merges_local_command_into_server_graph() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();
                commands
                    .borrow_mut()
                    .register(CommandDescriptor {
                        name: "foo".into(),
                        description: "".into(),
                        autocomplete: Some(AutocompleteNode::literal("foo")),
                        handler: Rc::new(NoopHandler),
                    })
                    .unwrap();

                let mut graph = CommandGraph::new();
                let say = graph.add_literal("say");
                graph.add_child(graph.root(), say);
                let packet = graph_to_packet(&graph).unwrap();

                let (forwarded, _) = mp_hooks::execute(
                    &hooks,
                    Direction::ServerToClient,
                    "declare_commands",
                    packet,
                )
                .await
                .unwrap();

                assert!(!forwarded);
                let sent = handle.injected_client.borrow();
                let (_, data) = sent
                    .iter()
                    .find(|(name, _)| name == "declare_commands")
                    .expect("merged graph was re-sent");
                let merged = packet_to_graph(data).unwrap();
                let names: BTreeSet<String> = merged
                    .children(merged.root())
                    .iter()
                    .map(|n| merged.name(*n).unwrap().to_owned())
                    .collect();
                assert_eq!(
                    names,
                    ["say", "p:foo"].into_iter().map(String::from).collect()
                );
            })
            .await;
    }

    #[tokio::test]
    async fn repeated_declare_commands_merges_idempotently() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();
                commands
                    .borrow_mut()
                    .register(CommandDescriptor {
                        name: "foo".into(),
                        description: "".into(),
                        autocomplete: Some(AutocompleteNode::literal("foo")),
                        handler: Rc::new(NoopHandler),
                    })
                    .unwrap();

                for _ in 0..2 {
                    let mut graph = CommandGraph::new();
                    let say = graph.add_literal("say");
                    graph.add_child(graph.root(), say);
                    let packet = graph_to_packet(&graph).unwrap();
                    mp_hooks::execute(&hooks, Direction::ServerToClient, "declare_commands", packet)
                        .await
                        .unwrap();
                }

                let sent = handle.injected_client.borrow();
                let (_, data) = sent
                    .iter()
                    .filter(|(name, _)| name == "declare_commands")
                    .last()
                    .unwrap();
                let merged = packet_to_graph(data).unwrap();
                assert_eq!(merged.children(merged.root()).len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn core_module_registers_builtin_module_command() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (_hooks, commands, registry, _handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                let nodes = commands.borrow().autocomplete_nodes();
                assert!(nodes.iter().any(|n| n.name == "p:module"));
            })
            .await;
    }

    #[tokio::test]
    async fn core_module_cannot_be_unloaded_outside_reload() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (_hooks, _commands, registry, _handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();

                let err = registry.borrow_mut().unload("core", false).await.unwrap_err();
                assert!(matches!(err, ProxyError::InvalidState(_)));
            })
            .await;
    }

    #[tokio::test]
    async fn reload_resends_cached_command_graph_on_next_client_connect() {
        // The hybrid Rc<RefCell<_>> state-preservation design: the cached
        // `declare_commands` graph and its merge set survive a reload of
        // the core module itself intact.
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (hooks, commands, registry, handle) = fixture();
                registry.borrow_mut().import("core").unwrap();
                registry.borrow_mut().load("core").await.unwrap();
                commands
                    .borrow_mut()
                    .register(CommandDescriptor {
                        name: "foo".into(),
                        description: "".into(),
                        autocomplete: Some(AutocompleteNode::literal("foo")),
                        handler: Rc::new(NoopHandler),
                    })
                    .unwrap();

                let mut graph = CommandGraph::new();
                let say = graph.add_literal("say");
                graph.add_child(graph.root(), say);
                let packet = graph_to_packet(&graph).unwrap();
                mp_hooks::execute(&hooks, Direction::ServerToClient, "declare_commands", packet)
                    .await
                    .unwrap();

                registry.borrow_mut().reload("core").await.unwrap();

                mp_hooks::execute(&hooks, Direction::Local, "clientConnected", PacketData::Null)
                    .await
                    .unwrap();

                let sent = handle.injected_client.borrow();
                let declare_sends = sent.iter().filter(|(name, _)| name == "declare_commands").count();
                assert_eq!(declare_sends, 2);
            })
            .await;
    }
}

//! Client-facing command dispatch (SPEC_FULL.md §4.C) and the small,
//! owned autocomplete-fragment type each registered command attaches to
//! the shared graph (§4.B, §4.F "merge").
//!
//! Kept decoupled from the proxy core: commands talk to the outside world
//! through `CommandSink` (reply toward the client, send toward the
//! server) rather than holding a concrete `Proxy` reference, so this
//! crate has no dependency on `mp-proxy-core` — the dependency points the
//! other way.

use async_trait::async_trait;
use mp_command_graph::{CommandGraph, NodeIndex, SuggestionProvider};
use mp_protocol::ProxyError;
use std::collections::HashMap;
use std::rc::Rc;

/// A small owned tree describing one command's autocomplete subtree,
/// independent of any particular `CommandGraph` instance. `append_to_graph`
/// grafts it into a real graph when the core module merges local commands
/// into the server-declared one.
#[derive(Debug, Clone)]
pub struct AutocompleteNode {
    pub name: String,
    pub executable: bool,
    pub argument: Option<ArgumentSpec>,
    pub children: Vec<AutocompleteNode>,
}

#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    pub parser: String,
    pub properties: Option<serde_json::Value>,
    pub suggests: Option<SuggestionProvider>,
}

impl AutocompleteNode {
    pub fn literal(name: impl Into<String>) -> Self {
        AutocompleteNode {
            name: name.into(),
            executable: false,
            argument: None,
            children: Vec::new(),
        }
    }

    pub fn argument(name: impl Into<String>, parser: impl Into<String>) -> Self {
        AutocompleteNode {
            name: name.into(),
            executable: false,
            argument: Some(ArgumentSpec {
                parser: parser.into(),
                properties: None,
                suggests: None,
            }),
            children: Vec::new(),
        }
    }

    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    pub fn with_child(mut self, child: AutocompleteNode) -> Self {
        self.children.push(child);
        self
    }
}

/// Merge the Command Registry's autocomplete roots into a server-declared
/// graph (SPEC_FULL.md §4.B "Merge"). `previous` is the identity-set of
/// nodes this function added last time; removing exactly those nodes
/// before adding the freshly-computed set makes repeated merges idempotent
/// (invariant 5). Returns the new set to pass back in on the next call.
pub fn merge_local_commands(
    graph: &mut CommandGraph,
    commands: &CommandRegistry,
    previous: &[NodeIndex],
) -> Vec<NodeIndex> {
    let root = graph.root();
    for idx in previous {
        graph.remove_child(root, *idx);
    }
    commands
        .autocomplete_nodes()
        .iter()
        .map(|node| append_to_graph(graph, root, node))
        .collect()
}

/// Graft an `AutocompleteNode` (and its subtree) into `graph` as a child
/// of `parent`, returning the new node's index.
pub fn append_to_graph(graph: &mut CommandGraph, parent: NodeIndex, node: &AutocompleteNode) -> NodeIndex {
    let idx = match &node.argument {
        Some(spec) => graph.add_argument(
            node.name.clone(),
            spec.parser.clone(),
            spec.properties.clone(),
            spec.suggests,
        ),
        None => graph.add_literal(node.name.clone()),
    };
    graph.set_executable(idx, node.executable);
    graph.add_child(parent, idx);
    for child in &node.children {
        append_to_graph(graph, idx, child);
    }
    idx
}

/// What a registered command can do to the outside world: reply to the
/// player, or forward a message on as if the player had sent it upstream.
#[async_trait(?Send)]
pub trait CommandSink {
    async fn reply(&self, message: &str);
    async fn send_server(&self, message: &str);
}

/// `{args, proxy}` from §3, minus the proxy reference (see module docs).
pub struct CommandContext<'a> {
    pub args: Vec<String>,
    pub sink: &'a dyn CommandSink,
}

#[async_trait(?Send)]
pub trait CommandHandler {
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<(), ProxyError>;
}

/// A not-yet-registered command definition.
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub autocomplete: Option<AutocompleteNode>,
    pub handler: Rc<dyn CommandHandler>,
}

/// A registered command's handle, used to unregister it later.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
}

/// The result of resolving a chat message against the registry, without
/// invoking anything yet. See [`CommandRegistry::prepare`].
pub enum DispatchOutcome {
    /// `message` did not start with the configured prefix at all.
    NotOurs,
    /// Prefixed, but no command with that name is registered.
    NotFound,
    /// Resolved to a registered command's handler, ready to invoke.
    Dispatch {
        args: Vec<String>,
        handler: Rc<dyn CommandHandler>,
    },
}

struct RegisteredCommand {
    description: String,
    autocomplete: Option<AutocompleteNode>,
    handler: Rc<dyn CommandHandler>,
}

/// Prefix-matched dispatch of chat-originated commands (§4.C).
pub struct CommandRegistry {
    prefix: String,
    commands: HashMap<String, RegisteredCommand>,
}

impl CommandRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        CommandRegistry {
            prefix: prefix.into(),
            commands: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn register(&mut self, mut descriptor: CommandDescriptor) -> Result<Command, ProxyError> {
        let name = descriptor.name.to_ascii_lowercase();
        if self.commands.contains_key(&name) {
            return Err(ProxyError::DuplicateName(name));
        }

        if self.prefix.starts_with('/') {
            let bare_prefix = &self.prefix[1..];
            if let Some(node) = &mut descriptor.autocomplete {
                if !node.name.starts_with(bare_prefix) {
                    node.name = format!("{bare_prefix}{}", node.name);
                }
            }
        }

        self.commands.insert(
            name.clone(),
            RegisteredCommand {
                description: descriptor.description,
                autocomplete: descriptor.autocomplete,
                handler: descriptor.handler,
            },
        );
        Ok(Command { name })
    }

    pub fn unregister(&mut self, command: &Command) -> Result<(), ProxyError> {
        if self.commands.remove(&command.name).is_some() {
            Ok(())
        } else {
            Err(ProxyError::UnknownName(command.name.clone()))
        }
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.commands.get(name).map(|c| c.description.as_str())
    }

    /// Resolve `message` to a dispatch plan without invoking anything.
    ///
    /// Split out from `execute` so a caller holding `self` behind a
    /// `RefCell` (every built-in and module-registered hook does, via
    /// `Rc<RefCell<CommandRegistry>>`) can drop the borrow *before*
    /// awaiting the handler. A command handler — notably the built-in
    /// `module` command — may itself trigger another module's `on_load`,
    /// which calls `register_command` and needs its own `borrow_mut()` on
    /// the same `RefCell`; holding a borrow across the handler's `.await`
    /// would panic the moment that happens.
    pub fn prepare(&self, message: &str) -> DispatchOutcome {
        if !message.starts_with(&self.prefix) {
            return DispatchOutcome::NotOurs;
        }

        let mut args: Vec<String> = message.split(' ').map(|s| s.to_owned()).collect();
        if args.is_empty() {
            return DispatchOutcome::NotFound;
        }
        let stripped = args[0]
            .strip_prefix(&self.prefix)
            .unwrap_or(&args[0])
            .to_ascii_lowercase();
        args[0] = stripped.clone();

        match self.commands.get(&stripped) {
            None => DispatchOutcome::NotFound,
            Some(cmd) => DispatchOutcome::Dispatch {
                args,
                handler: cmd.handler.clone(),
            },
        }
    }

    /// `execute(message) -> bool` (§4.C): dispatches a chat message that
    /// may or may not be a proxy command. Returns whether the hook calling
    /// this should cancel forwarding of the original chat packet.
    ///
    /// Convenience wrapper around [`prepare`](Self::prepare) for callers
    /// that don't need to drop a borrow before awaiting (e.g. the unit
    /// tests below, which hold no `RefCell` at all).
    pub async fn execute(&self, message: &str, sink: &dyn CommandSink) -> bool {
        match self.prepare(message) {
            DispatchOutcome::NotOurs => false,
            DispatchOutcome::NotFound => {
                sink.reply("Command not found").await;
                true
            }
            DispatchOutcome::Dispatch { args, handler } => {
                let ctx = CommandContext { args, sink };
                if let Err(e) = handler.handle(&ctx).await {
                    sink.reply(&format!("command failed: {e}")).await;
                }
                true
            }
        }
    }

    /// `get_autocomplete_nodes()` (§4.C): empty unless the prefix is
    /// slash-led, since the client's autocomplete only fires on
    /// slash-prefixed input.
    pub fn autocomplete_nodes(&self) -> Vec<AutocompleteNode> {
        if !self.prefix.starts_with('/') {
            return Vec::new();
        }
        self.commands
            .values()
            .filter_map(|c| c.autocomplete.clone())
            .collect()
    }
}

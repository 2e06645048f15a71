//! The command autocomplete graph (SPEC_FULL.md §4.B, §3).
//!
//! Nodes live in a flat arena (`Vec<CommandNodeData>`) indexed by `u32`;
//! `children`/`redirect` are index references rather than owned pointers,
//! which sidesteps the DAG-with-cycles ownership problem the spec calls
//! out in §9 ("hold nodes in an arena keyed by stable indices").

use bitflags::bitflags;
use mp_protocol::ProxyError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub type NodeIndex = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Literal,
    Argument,
}

/// `suggestion_provider` identifiers from §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionProvider {
    AskServer,
    Recipes,
    Sounds,
    Entities,
}

impl SuggestionProvider {
    pub fn wire_name(self) -> &'static str {
        match self {
            SuggestionProvider::AskServer => "minecraft:ask_server",
            SuggestionProvider::Recipes => "minecraft:all_recipes",
            SuggestionProvider::Sounds => "minecraft:available_sounds",
            SuggestionProvider::Entities => "minecraft:summonable_entities",
        }
    }

    pub fn from_wire_name(s: &str) -> Option<Self> {
        match s {
            "minecraft:ask_server" => Some(SuggestionProvider::AskServer),
            "minecraft:all_recipes" => Some(SuggestionProvider::Recipes),
            "minecraft:available_sounds" => Some(SuggestionProvider::Sounds),
            "minecraft:summonable_entities" => Some(SuggestionProvider::Entities),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CommandNodeData {
    kind: NodeKind,
    name: Option<String>,
    parser: Option<String>,
    parser_properties: Option<serde_json::Value>,
    suggestion_provider: Option<SuggestionProvider>,
    executable: bool,
    redirect: Option<NodeIndex>,
    children: Vec<NodeIndex>,
}

/// A recursive, redirect-capable, shared-node autocomplete graph.
///
/// `root()` is always index 0.
#[derive(Debug, Clone)]
pub struct CommandGraph {
    nodes: Vec<CommandNodeData>,
}

impl Default for CommandGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGraph {
    pub fn new() -> Self {
        CommandGraph {
            nodes: vec![CommandNodeData {
                kind: NodeKind::Root,
                name: None,
                parser: None,
                parser_properties: None,
                suggestion_provider: None,
                executable: false,
                redirect: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeIndex {
        0
    }

    pub fn add_literal(&mut self, name: impl Into<String>) -> NodeIndex {
        self.push(CommandNodeData {
            kind: NodeKind::Literal,
            name: Some(name.into()),
            parser: None,
            parser_properties: None,
            suggestion_provider: None,
            executable: false,
            redirect: None,
            children: Vec::new(),
        })
    }

    pub fn add_argument(
        &mut self,
        name: impl Into<String>,
        parser: impl Into<String>,
        parser_properties: Option<serde_json::Value>,
        suggests: Option<SuggestionProvider>,
    ) -> NodeIndex {
        self.push(CommandNodeData {
            kind: NodeKind::Argument,
            name: Some(name.into()),
            parser: Some(parser.into()),
            parser_properties,
            suggestion_provider: suggests,
            executable: false,
            redirect: None,
            children: Vec::new(),
        })
    }

    fn push(&mut self, data: CommandNodeData) -> NodeIndex {
        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(data);
        idx
    }

    pub fn set_executable(&mut self, idx: NodeIndex, executable: bool) {
        self.nodes[idx as usize].executable = executable;
    }

    pub fn set_redirect(&mut self, idx: NodeIndex, target: NodeIndex) {
        self.nodes[idx as usize].redirect = Some(target);
    }

    pub fn add_child(&mut self, parent: NodeIndex, child: NodeIndex) {
        let children = &mut self.nodes[parent as usize].children;
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn remove_child(&mut self, parent: NodeIndex, child: NodeIndex) {
        self.nodes[parent as usize].children.retain(|c| *c != child);
    }

    pub fn children(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.nodes[idx as usize].children
    }

    pub fn kind(&self, idx: NodeIndex) -> NodeKind {
        self.nodes[idx as usize].kind
    }

    pub fn name(&self, idx: NodeIndex) -> Option<&str> {
        self.nodes[idx as usize].name.as_deref()
    }

    pub fn redirect(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.nodes[idx as usize].redirect
    }

    pub fn executable(&self, idx: NodeIndex) -> bool {
        self.nodes[idx as usize].executable
    }

    /// Set a node's name in place; used by the command registry to prefix
    /// an autocomplete root name with the configured command prefix
    /// (§4.C).
    pub fn set_name(&mut self, idx: NodeIndex, name: impl Into<String>) {
        self.nodes[idx as usize].name = Some(name.into());
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Serialize the graph reachable from `root()` to a flat, indexed wire
    /// form (§4.B serialization algorithm): BFS from root, enqueueing
    /// children and redirect targets unconditionally, each node visited
    /// exactly once (identity-keyed by arena index).
    pub fn serialize(&self) -> Result<(Vec<SerializedCommandNode>, u32), ProxyError> {
        let mut order: Vec<NodeIndex> = Vec::new();
        let mut position: Vec<Option<u32>> = vec![None; self.nodes.len()];
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();

        queue.push_back(self.root());
        position[self.root() as usize] = Some(0);
        order.push(self.root());

        while let Some(idx) = queue.pop_front() {
            let node = &self.nodes[idx as usize];
            let mut next: Vec<NodeIndex> = node.children.clone();
            if let Some(r) = node.redirect {
                next.push(r);
            }
            for n in next {
                if position[n as usize].is_none() {
                    position[n as usize] = Some(order.len() as u32);
                    order.push(n);
                    queue.push_back(n);
                }
            }
        }

        let mut out = Vec::with_capacity(order.len());
        for idx in &order {
            let node = &self.nodes[*idx as usize];
            let children: Vec<u32> = node
                .children
                .iter()
                .map(|c| position[*c as usize].expect("reachable child is numbered"))
                .collect();
            let redirect = node
                .redirect
                .map(|r| position[r as usize].expect("reachable redirect is numbered"));

            let extra = match node.kind {
                NodeKind::Root => NodeExtra::None,
                NodeKind::Literal => NodeExtra::Literal {
                    name: node
                        .name
                        .clone()
                        .ok_or_else(|| ProxyError::MalformedGraph("literal missing name".into()))?,
                },
                NodeKind::Argument => NodeExtra::Argument {
                    name: node.name.clone().ok_or_else(|| {
                        ProxyError::MalformedGraph("argument missing name".into())
                    })?,
                    parser: node.parser.clone().ok_or_else(|| {
                        ProxyError::MalformedGraph("argument missing parser".into())
                    })?,
                    properties: node.parser_properties.clone(),
                    suggests: node.suggestion_provider,
                },
            };

            out.push(SerializedCommandNode {
                flags: NodeFlags::pack(node.kind, node.executable, redirect.is_some(), node.suggestion_provider.is_some()),
                children,
                redirect,
                extra,
            });
        }

        Ok((out, 0))
    }

    /// Deserialize a flat node list plus a root index back into a graph.
    pub fn deserialize(
        nodes: Vec<SerializedCommandNode>,
        root_index: u32,
    ) -> Result<CommandGraph, ProxyError> {
        if root_index as usize >= nodes.len() {
            return Err(ProxyError::MalformedGraph(format!(
                "root_index {} out of bounds ({} nodes)",
                root_index,
                nodes.len()
            )));
        }

        let len = nodes.len() as u32;
        let mut arena = Vec::with_capacity(nodes.len());
        for (i, n) in nodes.iter().enumerate() {
            for c in &n.children {
                if *c >= len {
                    return Err(ProxyError::MalformedGraph(format!(
                        "node {} child index {} out of bounds",
                        i, c
                    )));
                }
            }
            if let Some(r) = n.redirect {
                if r >= len {
                    return Err(ProxyError::MalformedGraph(format!(
                        "node {} redirect index {} out of bounds",
                        i, r
                    )));
                }
            }

            let (kind, executable, _, _) = NodeFlags::unpack(n.flags);
            let (name, parser, parser_properties, suggestion_provider) = match &n.extra {
                NodeExtra::None => (None, None, None, None),
                NodeExtra::Literal { name } => (Some(name.clone()), None, None, None),
                NodeExtra::Argument {
                    name,
                    parser,
                    properties,
                    suggests,
                } => (
                    Some(name.clone()),
                    Some(parser.clone()),
                    properties.clone(),
                    *suggests,
                ),
            };

            if matches!(kind, NodeKind::Literal) && name.is_none() {
                return Err(ProxyError::MalformedGraph(format!(
                    "node {} is a literal with no name",
                    i
                )));
            }
            if matches!(kind, NodeKind::Argument) && (name.is_none() || parser.is_none()) {
                return Err(ProxyError::MalformedGraph(format!(
                    "node {} is an argument missing name or parser",
                    i
                )));
            }

            arena.push(CommandNodeData {
                kind,
                name,
                parser,
                parser_properties,
                suggestion_provider,
                executable,
                redirect: n.redirect,
                children: n.children.clone(),
            });
        }

        // Rotate so the designated root lands at arena index 0, the
        // invariant `root()` relies on. Indices referenced by children /
        // redirect are remapped accordingly.
        if root_index == 0 {
            return Ok(CommandGraph { nodes: arena });
        }
        let mut remap: Vec<u32> = (0..len).collect();
        remap.swap(0, root_index as usize);
        let mut swapped: Vec<u32> = vec![0; len as usize];
        for (new_pos, &old_idx) in remap.iter().enumerate() {
            swapped[old_idx as usize] = new_pos as u32;
        }
        let mut reordered = vec![
            CommandNodeData {
                kind: NodeKind::Root,
                name: None,
                parser: None,
                parser_properties: None,
                suggestion_provider: None,
                executable: false,
                redirect: None,
                children: Vec::new(),
            };
            len as usize
        ];
        for (old_idx, node) in arena.into_iter().enumerate() {
            let new_idx = swapped[old_idx];
            let mut node = node;
            node.children = node.children.iter().map(|c| swapped[*c as usize]).collect();
            node.redirect = node.redirect.map(|r| swapped[r as usize]);
            reordered[new_idx as usize] = node;
        }

        Ok(CommandGraph { nodes: reordered })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct NodeFlags: u8 {
        const TYPE_LITERAL          = 0b0000_0001;
        const TYPE_ARGUMENT         = 0b0000_0010;
        const HAS_COMMAND           = 0b0000_0100;
        const HAS_REDIRECT          = 0b0000_1000;
        const HAS_CUSTOM_SUGGESTS   = 0b0001_0000;
    }
}

impl NodeFlags {
    fn pack(kind: NodeKind, executable: bool, has_redirect: bool, has_suggests: bool) -> u8 {
        let mut f = NodeFlags::empty();
        match kind {
            NodeKind::Root => {}
            NodeKind::Literal => f |= NodeFlags::TYPE_LITERAL,
            NodeKind::Argument => f |= NodeFlags::TYPE_ARGUMENT,
        }
        if executable {
            f |= NodeFlags::HAS_COMMAND;
        }
        if has_redirect {
            f |= NodeFlags::HAS_REDIRECT;
        }
        if has_suggests {
            f |= NodeFlags::HAS_CUSTOM_SUGGESTS;
        }
        f.bits()
    }

    fn unpack(byte: u8) -> (NodeKind, bool, bool, bool) {
        let f = NodeFlags::from_bits_truncate(byte);
        let kind = if f.contains(NodeFlags::TYPE_ARGUMENT) {
            NodeKind::Argument
        } else if f.contains(NodeFlags::TYPE_LITERAL) {
            NodeKind::Literal
        } else {
            NodeKind::Root
        };
        (
            kind,
            f.contains(NodeFlags::HAS_COMMAND),
            f.contains(NodeFlags::HAS_REDIRECT),
            f.contains(NodeFlags::HAS_CUSTOM_SUGGESTS),
        )
    }
}

/// The type-dependent extra payload of a serialized node (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeExtra {
    None,
    Literal {
        name: String,
    },
    Argument {
        name: String,
        parser: String,
        properties: Option<serde_json::Value>,
        suggests: Option<SuggestionProvider>,
    },
}

/// One entry of the flat wire format (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedCommandNode {
    pub flags: u8,
    pub children: Vec<u32>,
    pub redirect: Option<u32>,
    pub extra: NodeExtra,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_structure() {
        let mut g = CommandGraph::new();
        let say = g.add_literal("say");
        g.set_executable(say, true);
        let target = g.add_argument("target", "brigadier:string", None, Some(SuggestionProvider::Entities));
        g.add_child(say, target);
        g.add_child(g.root(), say);

        let (nodes, root_index) = g.serialize().unwrap();
        let g2 = CommandGraph::deserialize(nodes, root_index).unwrap();

        assert_eq!(g2.kind(g2.root()), NodeKind::Root);
        assert_eq!(g2.children(g2.root()).len(), 1);
        let say2 = g2.children(g2.root())[0];
        assert_eq!(g2.name(say2), Some("say"));
        assert!(g2.executable(say2));
        assert_eq!(g2.children(say2).len(), 1);
        let target2 = g2.children(say2)[0];
        assert_eq!(g2.name(target2), Some("target"));
        assert_eq!(g2.kind(target2), NodeKind::Argument);
    }

    #[test]
    fn serialize_then_deserialize_then_serialize_is_stable_in_counts() {
        let mut g = CommandGraph::new();
        let foo = g.add_literal("foo");
        g.add_child(g.root(), foo);
        let (nodes, root) = g.serialize().unwrap();
        let node_count_1 = nodes.len();
        let g2 = CommandGraph::deserialize(nodes, root).unwrap();
        let (nodes2, _) = g2.serialize().unwrap();
        assert_eq!(node_count_1, nodes2.len());
    }

    #[test]
    fn redirect_to_root_round_trips() {
        // S6: literal `execute` redirects to root.
        let mut g = CommandGraph::new();
        let execute = g.add_literal("execute");
        g.set_redirect(execute, g.root());
        g.add_child(g.root(), execute);

        let (nodes, root_index) = g.serialize().unwrap();
        let g2 = CommandGraph::deserialize(nodes, root_index).unwrap();

        let execute2 = g2.children(g2.root())[0];
        assert_eq!(g2.redirect(execute2), Some(g2.root()));
    }

    #[test]
    fn deserialize_rejects_out_of_bounds_child() {
        let nodes = vec![SerializedCommandNode {
            flags: 0,
            children: vec![5],
            redirect: None,
            extra: NodeExtra::None,
        }];
        let err = CommandGraph::deserialize(nodes, 0).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedGraph(_)));
    }

    #[test]
    fn deserialize_rejects_literal_with_missing_name() {
        // A node flagged as Literal but carrying `NodeExtra::None` — the
        // wire payload lost its `name` — must surface `MalformedGraph`
        // (§7) rather than panicking or silently defaulting.
        let nodes = vec![
            SerializedCommandNode {
                flags: NodeFlags::TYPE_LITERAL.bits(),
                children: vec![],
                redirect: None,
                extra: NodeExtra::None,
            },
        ];
        let err = CommandGraph::deserialize(nodes, 0).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedGraph(_)));
    }

    #[test]
    fn suggestion_provider_wire_names_round_trip() {
        for provider in [
            SuggestionProvider::AskServer,
            SuggestionProvider::Recipes,
            SuggestionProvider::Sounds,
            SuggestionProvider::Entities,
        ] {
            assert_eq!(SuggestionProvider::from_wire_name(provider.wire_name()), Some(provider));
        }
        assert_eq!(SuggestionProvider::from_wire_name("bogus"), None);
    }

    #[test]
    fn shared_child_appears_once_in_serialization() {
        let mut g = CommandGraph::new();
        let shared = g.add_literal("shared");
        let a = g.add_literal("a");
        let b = g.add_literal("b");
        g.add_child(a, shared);
        g.add_child(b, shared);
        g.add_child(g.root(), a);
        g.add_child(g.root(), b);

        let (nodes, _) = g.serialize().unwrap();
        // root + a + b + shared = 4 nodes, shared counted once.
        assert_eq!(nodes.len(), 4);
    }
}

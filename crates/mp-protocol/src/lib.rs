// mp-protocol: shared wire-adjacent data model for the proxy workspace.
//
// This crate is the base of the dependency graph: it has no sibling
// workspace deps. Everything else (hooks, commands, modules, proxy-core)
// builds on the types defined here.

pub mod auth;
pub mod error;
pub mod handle;
pub mod transport;

pub use auth::AuthProvider;
pub use error::ProxyError;
pub use handle::{ProxyHandle, ProxyStatus};
pub use transport::{PacketTransport, TransportEvent};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which side of the proxy a hook, event, or packet belongs to.
///
/// `Local` covers lifecycle events (`clientConnected`, `serverDisconnected`,
/// ...) that are not wire packets at all but still flow through the hook
/// pipeline under their own direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Local,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
            Direction::Local => "local",
        };
        f.write_str(s)
    }
}

/// The protocol state the underlying transport reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    Handshake,
    Status,
    Login,
    Play,
}

/// A structured packet payload: a tree of primitives, maps, and byte
/// strings.
///
/// Real wire encoding (varints, compression) is out of scope; this is the
/// decoded form hooks observe and mutate.
// Variant order matters for `#[serde(untagged)]`: serde tries each variant
// in declaration order and keeps the first that parses. `List` must precede
// `Bytes` or a JSON array of small integers (e.g. the two halves of a
// keep_alive id) would parse as `Bytes` instead — `Vec<u8>` happily accepts
// any array of in-range numbers. `Bytes` is kept last as a fallback for
// genuinely binary payloads constructed in-process; it does not round-trip
// through JSON (it comes back as `List` of `Int`), which is acceptable
// since the real wire codec's compression/encryption is out of scope here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PacketData {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PacketData>),
    Map(BTreeMap<String, PacketData>),
    Bytes(Vec<u8>),
}

impl PacketData {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PacketData::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PacketData>> {
        match self {
            PacketData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PacketData> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Build a one-field chat packet `{text: message}`, the shape the
    /// core module's `reply`/`send_server` helpers use.
    pub fn chat(message: impl Into<String>) -> PacketData {
        let mut m = BTreeMap::new();
        m.insert("text".to_owned(), PacketData::Str(message.into()));
        PacketData::Map(m)
    }
}

/// Metadata accompanying a decoded packet: its name and the protocol state
/// it was received in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketMeta {
    pub name: String,
    pub state: ProtocolState,
}

impl PacketMeta {
    pub fn new(name: impl Into<String>, state: ProtocolState) -> Self {
        PacketMeta {
            name: name.into(),
            state,
        }
    }
}

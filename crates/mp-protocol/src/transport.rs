//! The packet transport seam.
//!
//! The real wire codec — framing, varints, compression, encryption, packet
//! schemas for the underlying game protocol — is out of scope. What the
//! proxy core actually consumes is this trait: a stream of decoded
//! `(meta, data)` packets plus state-change notifications, and a
//! `write(name, data)` sink. Tests and the bundled binary use the loopback
//! implementation in `mp-test-support` / below; a real implementation
//! would wrap an actual codec.

use crate::{PacketData, PacketMeta, ProtocolState, ProxyError};
use async_trait::async_trait;

/// One event surfaced by a transport while it's connected.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fully decoded packet arrived.
    Packet(PacketMeta, PacketData),
    /// The protocol state changed (handshake -> status -> login -> play).
    State(ProtocolState),
    /// The upstream/peer logged in successfully (login -> play transition
    /// is reported separately via `State`; `Login` carries any
    /// session material the transport negotiated).
    Login,
    /// The connection ended cleanly, optionally with a reason.
    End(Option<String>),
    /// The connection ended with an error.
    Error(String),
}

/// A decoded, bidirectional packet transport.
///
/// One instance per connection (client-facing or server-facing); the
/// proxy core holds two. `?Send`: transports run on the single
/// cooperative executor the whole proxy is built around, never across a
/// thread boundary.
#[async_trait(?Send)]
pub trait PacketTransport {
    /// Wait for the next transport event. Returns `None` once the
    /// transport is exhausted (no more events will ever arrive).
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Write an encoded packet to the peer.
    async fn write(&mut self, name: &str, data: PacketData) -> Result<(), ProxyError>;
}

//! Test doubles for driving a proxy connection without a real game
//! server or client.
//!
//! Grounded in the teacher's `rt-test-utils` pattern of a paired
//! mock-server/mock-client: here `MockTransport` (what the proxy core
//! holds and calls `next_event`/`write` on) is paired with a `TestRig`
//! the test drives directly, feeding events in one direction and
//! recording writes in the other, over plain `tokio::sync::mpsc`
//! channels rather than a real socket.

use async_trait::async_trait;
use mp_protocol::{PacketData, ProxyError, PacketTransport, TransportEvent};
use tokio::sync::mpsc;

/// One outbound write the proxy core made through a [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub name: String,
    pub data: PacketData,
}

/// A [`PacketTransport`] backed by channels instead of a socket.
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<RecordedWrite>,
}

#[async_trait(?Send)]
impl PacketTransport for MockTransport {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    async fn write(&mut self, name: &str, data: PacketData) -> Result<(), ProxyError> {
        self.outbound
            .send(RecordedWrite {
                name: name.to_owned(),
                data,
            })
            .map_err(|_| ProxyError::ConnectionLost("mock transport closed".into()))
    }
}

/// The test-side handle for a [`MockTransport`]: push events the proxy
/// core will see, and drain the writes it made.
pub struct TestRig {
    events: mpsc::UnboundedSender<TransportEvent>,
    writes: mpsc::UnboundedReceiver<RecordedWrite>,
}

impl TestRig {
    /// Build a connected `(TestRig, MockTransport)` pair. Hand the
    /// transport to whatever holds a `Box<dyn PacketTransport>`; drive the
    /// rig from the test body.
    pub fn paired() -> (TestRig, MockTransport) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        (
            TestRig {
                events: event_tx,
                writes: write_rx,
            },
            MockTransport {
                inbound: event_rx,
                outbound: write_tx,
            },
        )
    }

    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn push_packet(&self, meta: mp_protocol::PacketMeta, data: PacketData) {
        self.push_event(TransportEvent::Packet(meta, data));
    }

    pub async fn next_write(&mut self) -> Option<RecordedWrite> {
        self.writes.recv().await
    }

    pub fn try_next_write(&mut self) -> Option<RecordedWrite> {
        self.writes.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_protocol::{ProtocolState, PacketMeta};

    #[tokio::test]
    async fn rig_delivers_pushed_events_to_transport() {
        let (rig, mut transport) = TestRig::paired();
        rig.push_packet(
            PacketMeta {
                name: "chat".into(),
                state: ProtocolState::Play,
            },
            PacketData::chat("hi"),
        );

        let event = transport.next_event().await.unwrap();
        match event {
            TransportEvent::Packet(meta, data) => {
                assert_eq!(meta.name, "chat");
                assert_eq!(data.get("text").and_then(PacketData::as_str), Some("hi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_writes_are_recorded_on_the_rig() {
        let (mut rig, mut transport) = TestRig::paired();
        transport.write("chat", PacketData::chat("pong")).await.unwrap();

        let recorded = rig.next_write().await.unwrap();
        assert_eq!(recorded.name, "chat");
        assert_eq!(recorded.data.get("text").and_then(PacketData::as_str), Some("pong"));
    }

    #[tokio::test]
    async fn dropping_rig_surfaces_connection_lost_on_write() {
        let (rig, mut transport) = TestRig::paired();
        drop(rig);
        let err = transport.write("chat", PacketData::Null).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionLost(_)));
    }
}

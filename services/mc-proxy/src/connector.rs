//! Dials the configured upstream server (SPEC_FULL.md §1/§4.E
//! `UpstreamConnector`), authenticating through an [`AuthProvider`] first.
//!
//! Real Microsoft/Mojang auth and the real wire handshake are out of
//! scope; this connects a plain TCP socket and trusts the peer to speak
//! the same newline-JSON framing [`TcpTransport`] does.

use crate::transport::{DebugLoggingTransport, TcpTransport};
use async_trait::async_trait;
use mp_protocol::{AuthProvider, PacketTransport, ProxyError};
use mp_proxy_core::UpstreamConnector;
use std::rc::Rc;
use tokio::net::TcpStream;

pub struct TcpUpstreamConnector {
    pub address: String,
    pub port: u16,
    pub auth: Rc<dyn AuthProvider>,
}

#[async_trait(?Send)]
impl UpstreamConnector for TcpUpstreamConnector {
    async fn connect(&self) -> Result<Box<dyn PacketTransport>, ProxyError> {
        let creds = self.auth.authenticate().await?;
        tracing::info!(user = %creds.username, address = %self.address, port = self.port, "connecting upstream");
        let stream = TcpStream::connect((self.address.as_str(), self.port)).await?;
        Ok(Box::new(DebugLoggingTransport::wrap(
            TcpTransport::new(stream),
            "server",
        )))
    }
}

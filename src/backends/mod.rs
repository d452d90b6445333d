/**
 * backends/mod.rs
 *
 * Collaborator contracts consumed by the orchestrator:
 * - signalling channel (out-of-band message transport)
 * - NAT discovery (reflexive address lookup)
 * - tunnel service (data-plane link factory)
 */

mod signalling;
mod stun;
mod tunnel;

pub use signalling::WsSignalling;
pub use stun::StunDiscovery;
pub use tunnel::{P2pTunnel, P2pTunnelService, Probe};

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use crate::config::{NatConfig, SignallingConfig, TunnelConfig};
use crate::message::Message;

/// Out-of-band transport for connection-setup messages.
#[async_trait]
pub trait SignallingChannel: Send {
    fn configure(&mut self, cfg: &SignallingConfig);

    /// Establish the transport and register our identity. A failure here
    /// is fatal to the orchestrator's run.
    async fn connect(&mut self) -> Result<(), SignallingError>;

    async fn disconnect(&mut self);

    /// Block until the next peer message arrives. `Closed` signals the
    /// normal end of the channel; any error terminates the receive loop.
    async fn receive(&mut self) -> Result<Message, SignallingError>;
}

/// Reflexive-address discovery (STUN-style). The orchestrator only
/// configures it; candidate gathering happens inside the data plane.
#[async_trait]
pub trait NatDiscovery: Send {
    fn configure(&mut self, cfg: &NatConfig);

    async fn discover(&self) -> Result<SocketAddr, NatError>;
}

/// One established data-plane link. Dropping the link tears the tunnel
/// down; that is the release contract teardown paths rely on.
pub trait TunnelLink: Send {
    fn forward(&self, payload: &HashMap<String, String>);
}

/// Data-plane factory: opens a link to a peer once signalling agreed on
/// the handshake parameters.
#[async_trait]
pub trait TunnelService: Send + Sync {
    type Link: TunnelLink + 'static;

    fn configure(&mut self, cfg: &TunnelConfig);

    async fn open(
        &self,
        peer: &str,
        addr: Ipv4Addr,
        params: &HashMap<String, String>,
    ) -> Result<Self::Link, TunnelError>;
}

/// Signalling channel errors.
#[derive(Debug)]
pub enum SignallingError {
    Connect(String),
    Registration(String),
    Send(String),
    Recv(String),
    Protocol(String),
    Closed,
}

impl std::fmt::Display for SignallingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignallingError::Connect(e) => write!(f, "Connection failed: {}", e),
            SignallingError::Registration(e) => write!(f, "Registration failed: {}", e),
            SignallingError::Send(e) => write!(f, "Send failed: {}", e),
            SignallingError::Recv(e) => write!(f, "Receive failed: {}", e),
            SignallingError::Protocol(e) => write!(f, "Protocol violation: {}", e),
            SignallingError::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for SignallingError {}

/// NAT discovery errors.
#[derive(Debug)]
pub enum NatError {
    Bind(String),
    Io(String),
    Timeout,
    Malformed(String),
}

impl std::fmt::Display for NatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatError::Bind(e) => write!(f, "Bind failed: {}", e),
            NatError::Io(e) => write!(f, "I/O failed: {}", e),
            NatError::Timeout => write!(f, "Query timed out"),
            NatError::Malformed(e) => write!(f, "Malformed response: {}", e),
        }
    }
}

impl std::error::Error for NatError {}

/// Tunnel establishment errors.
#[derive(Debug)]
pub enum TunnelError {
    Candidates(String),
    Punch(String),
    Connect(String),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Candidates(e) => write!(f, "No usable candidates: {}", e),
            TunnelError::Punch(e) => write!(f, "Hole punching failed: {}", e),
            TunnelError::Connect(e) => write!(f, "Connect failed: {}", e),
        }
    }
}

impl std::error::Error for TunnelError {}

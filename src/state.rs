/**
 * state.rs
 *
 * Per-peer connection state machine. One instance per connection
 * attempt, owned exclusively by the orchestrator's registry.
 */

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::alloc::IpAllocator;
use crate::backends::{TunnelLink, TunnelService};
use crate::message::{Message, MessageKind};

/// Lifecycle phase of one peer connection attempt. `Terminated` is the
/// only absorbing phase; nothing transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Joining,
    Established,
    Resetting,
    Terminated,
}

/// Connection state for a single peer: lifecycle phase, admission flag,
/// accumulated handshake parameters and the resources held once the
/// tunnel is up.
pub struct PeerState<L: TunnelLink> {
    peer: String,
    phase: Phase,
    validated: bool,
    negotiated: HashMap<String, String>,
    addr: Option<Ipv4Addr>,
    link: Option<L>,
    created_at: Instant,
}

impl<L: TunnelLink> PeerState<L> {
    /// A validated state starts in `Joining` (admitted friend), an
    /// unvalidated one in `New` (inbound Init).
    pub fn new(peer: impl Into<String>, validated: bool) -> Self {
        let peer = peer.into();
        let phase = if validated { Phase::Joining } else { Phase::New };
        debug!(peer = %peer, ?phase, "creating state machine");
        Self {
            peer,
            phase,
            validated,
            negotiated: HashMap::new(),
            addr: None,
            link: None,
            created_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn validated(&self) -> bool {
        self.validated
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_live(&self) -> bool {
        self.phase != Phase::Terminated
    }

    /// Route one signalling message into the machine. Per-message
    /// failures are logged, never propagated; they must not take the
    /// receive loop down.
    pub async fn deliver<T>(&mut self, msg: &Message, tunnel: &T, alloc: &IpAllocator)
    where
        T: TunnelService<Link = L> + ?Sized,
    {
        match (&msg.kind, self.phase) {
            (_, Phase::Terminated) => {
                debug!(peer = %self.peer, "message for terminated state dropped");
            }
            (MessageKind::Init, Phase::New | Phase::Joining) => {
                self.negotiated.extend(msg.data.clone());
                debug!(peer = %self.peer, params = msg.data.len(), "handshake offer recorded");
            }
            (MessageKind::Accept, Phase::New | Phase::Joining) => {
                self.establish(msg, tunnel, alloc).await;
            }
            (MessageKind::Data, Phase::Established) => {
                if let Some(link) = &self.link {
                    link.forward(&msg.data);
                }
            }
            (kind, phase) => {
                debug!(peer = %self.peer, ?kind, ?phase, "message ignored in current phase");
            }
        }
    }

    /// Handshake complete: take an address from the pool and bring the
    /// data plane up. On failure the address goes straight back and the
    /// phase is unchanged, so a later Accept can retry.
    async fn establish<T>(&mut self, msg: &Message, tunnel: &T, alloc: &IpAllocator)
    where
        T: TunnelService<Link = L> + ?Sized,
    {
        let Some(addr) = alloc.allocate() else {
            warn!(peer = %self.peer, "no address available, handshake stalled");
            return;
        };
        let mut params = self.negotiated.clone();
        params.extend(msg.data.clone());
        match tunnel.open(&self.peer, addr, &params).await {
            Ok(link) => {
                self.addr = Some(addr);
                self.link = Some(link);
                self.phase = Phase::Established;
                info!(peer = %self.peer, %addr, "tunnel established");
            }
            Err(e) => {
                alloc.release(addr);
                warn!(peer = %self.peer, error = %e, "tunnel setup failed");
            }
        }
    }

    /// Drop negotiation state and start over, keeping the peer id.
    /// No-op on terminated machines; resetting an already-fresh machine
    /// is harmless.
    pub fn reset(&mut self, reason: &str, alloc: &IpAllocator) {
        if self.phase == Phase::Terminated {
            debug!(peer = %self.peer, "reset of terminated state ignored");
            return;
        }
        self.phase = Phase::Resetting;
        info!(peer = %self.peer, reason, "resetting connection");
        self.release(alloc);
        self.validated = false;
        self.negotiated.clear();
        self.phase = Phase::New;
    }

    /// Release everything and enter the absorbing terminal phase.
    /// Idempotent: terminating twice releases once.
    pub fn terminate(&mut self, alloc: &IpAllocator) {
        if self.phase == Phase::Terminated {
            return;
        }
        self.release(alloc);
        self.phase = Phase::Terminated;
        debug!(peer = %self.peer, "state terminated");
    }

    /// `Option::take` makes double release impossible: the link closes
    /// when dropped, the address goes back to the pool at most once.
    fn release(&mut self, alloc: &IpAllocator) {
        self.link.take();
        if let Some(addr) = self.addr.take() {
            alloc.release(addr);
        }
    }
}

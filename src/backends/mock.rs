/**
 * backends/mock.rs
 *
 * Scripted collaborators for orchestrator and state machine tests.
 */

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    NatDiscovery, NatError, SignallingChannel, SignallingError, TunnelError, TunnelLink,
    TunnelService,
};
use crate::config::{NatConfig, SignallingConfig, TunnelConfig};
use crate::message::Message;

/// Signalling channel that replays a script. Once the script runs dry,
/// `receive` parks forever so shutdown paths can be exercised.
pub(crate) struct MockSignalling {
    script: Mutex<VecDeque<Result<Message, SignallingError>>>,
    connect_error: Mutex<Option<SignallingError>>,
    pub connected: Arc<AtomicBool>,
    pub disconnected: Arc<AtomicBool>,
}

impl MockSignalling {
    pub fn new(script: Vec<Result<Message, SignallingError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            connect_error: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing_connect(err: SignallingError) -> Self {
        let mock = Self::new(Vec::new());
        *mock.connect_error.lock().unwrap() = Some(err);
        mock
    }
}

#[async_trait]
impl SignallingChannel for MockSignalling {
    fn configure(&mut self, _cfg: &SignallingConfig) {}

    async fn connect(&mut self) -> Result<(), SignallingError> {
        if let Some(err) = self.connect_error.lock().unwrap().take() {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    async fn receive(&mut self) -> Result<Message, SignallingError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }
}

pub(crate) struct MockNat {
    pub configured: Arc<AtomicBool>,
}

impl MockNat {
    pub fn new() -> Self {
        Self {
            configured: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl NatDiscovery for MockNat {
    fn configure(&mut self, _cfg: &NatConfig) {
        self.configured.store(true, Ordering::SeqCst);
    }

    async fn discover(&self) -> Result<SocketAddr, NatError> {
        Ok("203.0.113.7:4000".parse().unwrap())
    }
}

/// Recording link: counts drops so release-exactly-once is observable.
pub(crate) struct MockLink {
    peer: String,
    forwarded: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
    drops: Arc<AtomicUsize>,
}

impl TunnelLink for MockLink {
    fn forward(&self, payload: &HashMap<String, String>) {
        self.forwarded
            .lock()
            .unwrap()
            .push((self.peer.clone(), payload.clone()));
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockTunnelService {
    pub opened: Arc<Mutex<Vec<String>>>,
    pub forwarded: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
    pub drops: Arc<AtomicUsize>,
    pub fail_open: AtomicBool,
}

impl MockTunnelService {
    pub fn new() -> Self {
        Self {
            opened: Arc::new(Mutex::new(Vec::new())),
            forwarded: Arc::new(Mutex::new(Vec::new())),
            drops: Arc::new(AtomicUsize::new(0)),
            fail_open: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TunnelService for MockTunnelService {
    type Link = MockLink;

    fn configure(&mut self, _cfg: &TunnelConfig) {}

    async fn open(
        &self,
        peer: &str,
        _addr: Ipv4Addr,
        _params: &HashMap<String, String>,
    ) -> Result<MockLink, TunnelError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TunnelError::Punch("scripted failure".into()));
        }
        self.opened.lock().unwrap().push(peer.to_string());
        Ok(MockLink {
            peer: peer.to_string(),
            forwarded: Arc::clone(&self.forwarded),
            drops: Arc::clone(&self.drops),
        })
    }
}

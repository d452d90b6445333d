/**
 * orchestrator.rs
 *
 * Connection orchestrator: owns the per-peer registry, runs the
 * signalling receive loop, enforces admission and keeps the
 * one-live-state-per-peer invariant.
 */

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::alloc::IpAllocator;
use crate::backends::{
    NatDiscovery, SignallingChannel, SignallingError, TunnelLink, TunnelService,
};
use crate::config::Config;
use crate::friends::{Friend, FriendDirectory};
use crate::message::{Message, MessageKind};
use crate::state::{PeerState, Phase};

type Registry<L> = Arc<Mutex<HashMap<String, PeerState<L>>>>;

/// The control core of the VPN. Owns the three backends, the address
/// pool and the registry of live per-peer state machines.
///
/// All registry mutation happens either in the receive loop or in
/// [`OrchestratorHandle::stop`], serialized by one mutex; `stop`
/// additionally waits for the loop to exit before touching anything,
/// so the two never race.
pub struct Orchestrator<S, N, T>
where
    S: SignallingChannel,
    N: NatDiscovery,
    T: TunnelService,
{
    signalling: S,
    nat: N,
    tunnel: T,
    alloc: Arc<IpAllocator>,
    friends: FriendDirectory,
    registry: Registry<T::Link>,
    shutdown: broadcast::Sender<()>,
    running: watch::Sender<bool>,
}

impl<S, N, T> Orchestrator<S, N, T>
where
    S: SignallingChannel,
    N: NatDiscovery,
    T: TunnelService,
{
    pub fn new(signalling: S, nat: N, tunnel: T, alloc: Arc<IpAllocator>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (running, _) = watch::channel(false);
        Self {
            signalling,
            nat,
            tunnel,
            alloc,
            friends: FriendDirectory::default(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            running,
        }
    }

    /// Apply the friend table and forward each backend its config blob.
    /// Must be called before `run`/`start`.
    pub fn configure(&mut self, cfg: &Config) {
        self.friends = FriendDirectory::new(cfg.friends.clone());
        self.signalling.configure(&cfg.signalling);
        self.nat.configure(&cfg.nat);
        self.tunnel.configure(&cfg.tunnel);
        self.alloc.configure(&cfg.allocator);
        info!(friends = self.friends.len(), "configured");
    }

    pub fn is_friend(&self, name: &str) -> Option<&Friend> {
        self.friends.lookup(name)
    }

    /// Control surface usable while (or before) `run` executes.
    pub fn handle(&self) -> OrchestratorHandle<T::Link> {
        OrchestratorHandle {
            shutdown: self.shutdown.clone(),
            running: self.running.subscribe(),
            registry: Arc::clone(&self.registry),
            alloc: Arc::clone(&self.alloc),
        }
    }

    /// Blocking receive loop. Connects the signalling channel, then
    /// dispatches messages until the channel fails (the error is
    /// returned and the registry left untouched; teardown belongs to
    /// [`OrchestratorHandle::stop`]) or a shutdown is requested
    /// (returns `Ok`).
    pub async fn run(mut self) -> Result<(), SignallingError> {
        // Subscribe before anything can fail so a concurrent stop() is
        // never missed.
        let mut shutdown = self.shutdown.subscribe();

        self.alloc.init();

        if let Err(e) = self.signalling.connect().await {
            error!(error = %e, "signalling connect failed");
            return Err(e);
        }

        let _ = self.running.send(true);
        info!("orchestrator running");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => None,
                res = self.signalling.receive() => Some(res),
            };
            match next {
                None => {
                    self.signalling.disconnect().await;
                    let _ = self.running.send(false);
                    info!("orchestrator stopped");
                    return Ok(());
                }
                Some(Ok(msg)) => self.dispatch(msg).await,
                Some(Err(e)) => {
                    let _ = self.running.send(false);
                    error!(error = %e, "signalling receive failed");
                    return Err(e);
                }
            }
        }
    }

    async fn dispatch(&self, msg: Message) {
        match msg.kind {
            MessageKind::Init => self.on_init(msg).await,
            MessageKind::Join => self.on_join(msg).await,
            MessageKind::Quit => self.on_quit(&msg.from).await,
            MessageKind::Reset => self.on_reset(&msg).await,
            _ => self.on_forward(msg).await,
        }
    }

    /// Init: a fresh, unvalidated connection attempt. Any prior live
    /// entry for the peer is terminated first (terminate-and-replace),
    /// so its resources are released exactly once and at most one live
    /// state per peer ever exists.
    async fn on_init(&self, msg: Message) {
        let mut registry = self.registry.lock().await;
        self.evict(&mut registry, &msg.from);
        let mut state = PeerState::new(msg.from.clone(), false);
        state.deliver(&msg, &self.tunnel, &self.alloc).await;
        registry.insert(msg.from, state);
    }

    /// Join: admission-gated. Only peers present in the friend table
    /// with the validated flag get a state; everything else is dropped
    /// without side effects. The Join message itself carries nothing
    /// the machine needs.
    async fn on_join(&self, msg: Message) {
        match self.friends.lookup(&msg.from) {
            Some(friend) if friend.validated => {
                let mut registry = self.registry.lock().await;
                self.evict(&mut registry, &msg.from);
                info!(peer = %msg.from, "friend joined");
                registry.insert(msg.from.clone(), PeerState::new(msg.from, true));
            }
            Some(_) => debug!(peer = %msg.from, "join from unvalidated friend dropped"),
            None => debug!(peer = %msg.from, "join from unknown peer dropped"),
        }
    }

    async fn on_quit(&self, peer: &str) {
        let mut registry = self.registry.lock().await;
        match registry.remove(peer) {
            Some(mut state) => {
                state.terminate(&self.alloc);
                info!(peer, "peer quit");
            }
            None => debug!(peer, "quit for unknown peer ignored"),
        }
    }

    async fn on_reset(&self, msg: &Message) {
        let mut registry = self.registry.lock().await;
        match registry.get_mut(&msg.from) {
            Some(state) => state.reset(msg.reason().unwrap_or("unspecified"), &self.alloc),
            None => debug!(peer = %msg.from, "reset for unknown peer ignored"),
        }
    }

    async fn on_forward(&self, msg: Message) {
        let mut registry = self.registry.lock().await;
        match registry.get_mut(&msg.from) {
            Some(state) => state.deliver(&msg, &self.tunnel, &self.alloc).await,
            None => debug!(peer = %msg.from, kind = ?msg.kind, "message for unknown peer discarded"),
        }
    }

    fn evict(&self, registry: &mut HashMap<String, PeerState<T::Link>>, peer: &str) {
        if let Some(mut prior) = registry.remove(peer) {
            if prior.is_live() {
                warn!(peer, "replacing live connection state");
            }
            prior.terminate(&self.alloc);
        }
    }
}

impl<S, N, T> Orchestrator<S, N, T>
where
    S: SignallingChannel + Sync + 'static,
    N: NatDiscovery + Sync + 'static,
    T: TunnelService + 'static,
{
    /// Begin `run` on the runtime without blocking the caller.
    pub fn start(self) -> OrchestratorHandle<T::Link> {
        let handle = self.handle();
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "orchestrator loop ended");
            }
        });
        handle
    }
}

/// Clonable control surface for an orchestrator. Obtained from
/// [`Orchestrator::handle`] or [`Orchestrator::start`].
pub struct OrchestratorHandle<L: TunnelLink> {
    shutdown: broadcast::Sender<()>,
    running: watch::Receiver<bool>,
    registry: Registry<L>,
    alloc: Arc<IpAllocator>,
}

impl<L: TunnelLink> Clone for OrchestratorHandle<L> {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown.clone(),
            running: self.running.clone(),
            registry: Arc::clone(&self.registry),
            alloc: Arc::clone(&self.alloc),
        }
    }
}

impl<L: TunnelLink> OrchestratorHandle<L> {
    /// Stop the orchestrator: request shutdown, wait until the loop has
    /// exited (after which no dispatch can happen), then terminate every
    /// live peer state and stop the allocator. Best effort, idempotent,
    /// never an error.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());

        let mut running = self.running.clone();
        loop {
            if !*running.borrow_and_update() {
                break;
            }
            if running.changed().await.is_err() {
                break;
            }
        }

        let mut registry = self.registry.lock().await;
        let drained = registry.len();
        for state in registry.values_mut() {
            state.terminate(&self.alloc);
        }
        registry.clear();
        drop(registry);
        if drained > 0 {
            info!(peers = drained, "released peer states");
        }

        self.alloc.stop();
    }

    /// Phase of the given peer's state, if one exists.
    pub async fn peer_phase(&self, peer: &str) -> Option<Phase> {
        self.registry.lock().await.get(peer).map(|s| s.phase())
    }

    pub async fn peer_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

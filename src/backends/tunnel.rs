/**
 * backends/tunnel.rs
 *
 * Data-plane establishment: UDP hole punching with signed probe
 * packets, then TCP simultaneous open through the punched mapping.
 */

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{stun, TunnelError, TunnelLink, TunnelService};
use crate::config::TunnelConfig;

const PROBE_MAGIC: &[u8; 4] = b"GUAV";
const PROBE_CONTEXT: &[u8] = b"GUAVA_TUNNEL_PROBE";
const PROBE_LEN: usize = 78; // 4 magic + 8 nonce + 2 port + 64 signature

/// Hole-punching probe: a nonce and the TCP rendezvous port we are
/// advertising, ed25519-signed so a third party cannot redirect the
/// rendezvous.
#[derive(Debug, Clone)]
pub struct Probe {
    pub nonce: u64,
    pub tcp_port: u16,
    pub signature: Signature,
}

impl Probe {
    pub fn new(tcp_port: u16, key: &SigningKey) -> Self {
        let nonce = rand::random::<u64>();
        let signature = key.sign(&Self::signed_bytes(nonce, tcp_port));
        Self {
            nonce,
            tcp_port,
            signature,
        }
    }

    pub fn verify(&self, key: &VerifyingKey) -> bool {
        key.verify(&Self::signed_bytes(self.nonce, self.tcp_port), &self.signature)
            .is_ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PROBE_LEN);
        bytes.extend_from_slice(PROBE_MAGIC);
        bytes.extend_from_slice(&self.nonce.to_be_bytes());
        bytes.extend_from_slice(&self.tcp_port.to_be_bytes());
        bytes.extend_from_slice(&self.signature.to_bytes());
        bytes
    }

    /// Anything that is not exactly a probe is `None`; the punch loop
    /// sees arbitrary junk and just keeps going.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != PROBE_LEN || &data[0..4] != PROBE_MAGIC {
            return None;
        }
        let nonce = u64::from_be_bytes(data[4..12].try_into().ok()?);
        let tcp_port = u16::from_be_bytes(data[12..14].try_into().ok()?);
        let signature = Signature::from_bytes(data[14..PROBE_LEN].try_into().ok()?);
        Some(Self {
            nonce,
            tcp_port,
            signature,
        })
    }

    fn signed_bytes(nonce: u64, tcp_port: u16) -> Vec<u8> {
        let mut message = Vec::with_capacity(PROBE_CONTEXT.len() + 10);
        message.extend_from_slice(PROBE_CONTEXT);
        message.extend_from_slice(&nonce.to_be_bytes());
        message.extend_from_slice(&tcp_port.to_be_bytes());
        message
    }
}

/// Production tunnel factory. Each `open` runs the full establishment
/// pipeline against one peer's candidate endpoints.
pub struct P2pTunnelService {
    cfg: TunnelConfig,
    key: SigningKey,
}

impl P2pTunnelService {
    pub fn new() -> Self {
        Self {
            cfg: TunnelConfig::default(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Hex public key peers use to verify our probes.
    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}

impl Default for P2pTunnelService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelService for P2pTunnelService {
    type Link = P2pTunnel;

    fn configure(&mut self, cfg: &TunnelConfig) {
        self.cfg = cfg.clone();
        if let Some(seed) = &self.cfg.probe_key {
            match parse_signing_key(seed) {
                Ok(key) => self.key = key,
                Err(e) => warn!(error = %e, "probe key unusable, keeping generated key"),
            }
        }
    }

    async fn open(
        &self,
        peer: &str,
        addr: Ipv4Addr,
        params: &HashMap<String, String>,
    ) -> Result<P2pTunnel, TunnelError> {
        let candidates = candidate_endpoints(params)?;
        let peer_key = params
            .get("probe_key")
            .and_then(|hex_key| parse_verifying_key(hex_key));
        info!(peer, candidates = candidates.len(), "opening tunnel");

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| TunnelError::Punch(format!("bind: {}", e)))?;

        // Warm the NAT mapping on the punching socket so the peer's
        // probes land on a live translation.
        if let Some(server) = &self.cfg.stun_server {
            match stun::query(&socket, server, Duration::from_secs(5)).await {
                Ok(reflexive) => debug!(%reflexive, "punching from warmed mapping"),
                Err(e) => debug!(error = %e, "stun warm-up failed, punching anyway"),
            }
        }

        let local_port = match self.cfg.tcp_port {
            0 => reserve_port().map_err(|e| TunnelError::Connect(e.to_string()))?,
            port => port,
        };
        let probe = Probe::new(local_port, &self.key).encode();

        let punch_wait = Duration::from_secs(self.cfg.punch_timeout_secs);
        let (peer_probe, from) =
            punch(&socket, &probe, peer_key.as_ref(), &candidates, punch_wait).await?;

        let peer_tcp = SocketAddr::new(from.ip(), peer_probe.tcp_port);
        let connect_wait = Duration::from_secs(self.cfg.connect_timeout_secs);
        let stream = simultaneous_open(local_port, peer_tcp, connect_wait).await?;

        info!(peer, %addr, "tunnel link up");
        Ok(P2pTunnel {
            peer: peer.to_string(),
            addr,
            stream,
        })
    }
}

/// An established link. Dropping it closes the stream and with it the
/// tunnel.
pub struct P2pTunnel {
    peer: String,
    addr: Ipv4Addr,
    stream: TcpStream,
}

impl P2pTunnel {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn virtual_addr(&self) -> Ipv4Addr {
        self.addr
    }
}

impl TunnelLink for P2pTunnel {
    fn forward(&self, payload: &HashMap<String, String>) {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "payload not encodable");
                return;
            }
        };
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        let mut stream = &self.stream;
        if let Err(e) = stream.write_all(&frame) {
            warn!(peer = %self.peer, error = %e, "forward failed");
        }
    }
}

/// Candidate endpoints from the handshake payload: the reflexive
/// endpoint plus, when present, the peer's LAN address.
fn candidate_endpoints(params: &HashMap<String, String>) -> Result<Vec<SocketAddr>, TunnelError> {
    let mut candidates = Vec::new();
    for key in ["endpoint", "local"] {
        if let Some(raw) = params.get(key) {
            match raw.parse::<SocketAddr>() {
                Ok(addr) => candidates.push(addr),
                Err(_) => debug!(key, raw = %raw, "unparseable candidate skipped"),
            }
        }
    }
    if candidates.is_empty() {
        return Err(TunnelError::Candidates(
            "handshake carried no usable endpoint".to_string(),
        ));
    }
    Ok(candidates)
}

/// Send our probe to every candidate until one of the peer's probes
/// arrives, or the deadline passes. Unverifiable datagrams are skipped,
/// never fatal.
async fn punch(
    socket: &UdpSocket,
    probe_bytes: &[u8],
    peer_key: Option<&VerifyingKey>,
    candidates: &[SocketAddr],
    deadline: Duration,
) -> Result<(Probe, SocketAddr), TunnelError> {
    let start = Instant::now();
    let mut buf = vec![0u8; 256];

    loop {
        if start.elapsed() > deadline {
            return Err(TunnelError::Punch("timed out".to_string()));
        }

        for addr in candidates {
            let _ = socket.send_to(probe_bytes, addr).await;
        }

        match timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match Probe::decode(&buf[..len]) {
                Some(peer_probe) => {
                    if let Some(key) = peer_key {
                        if !peer_probe.verify(key) {
                            debug!(%from, "probe signature rejected");
                            continue;
                        }
                    }
                    debug!(%from, port = peer_probe.tcp_port, "peer probe received");
                    return Ok((peer_probe, from));
                }
                None => debug!(%from, len, "unrecognized datagram during punch"),
            },
            Ok(Err(e)) => debug!(error = %e, "punch socket error"),
            Err(_) => {} // resend interval elapsed
        }
    }
}

/// TCP simultaneous open: both sides bind the port they advertised in
/// their probes and connect to each other; the NATs pass the SYNs
/// because of the preceding UDP exchange.
async fn simultaneous_open(
    local_port: u16,
    peer: SocketAddr,
    wait: Duration,
) -> Result<TcpStream, TunnelError> {
    // A direct attempt first; succeeds when the peer bound before us.
    if let Ok(stream) = TcpStream::connect_timeout(&peer, Duration::from_millis(500)) {
        debug!(%peer, "direct connect succeeded");
        return Ok(stream);
    }

    let local = SocketAddr::from(([0, 0, 0, 0], local_port));
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(sock_err)?;
    socket.set_reuse_address(true).map_err(sock_err)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(sock_err)?;
    socket.bind(&local.into()).map_err(sock_err)?;
    socket.set_nonblocking(true).map_err(sock_err)?;

    match socket.connect(&peer.into()) {
        Ok(()) => {}
        // non-blocking connect reports in-progress as WouldBlock or
        // EINPROGRESS depending on platform
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(115) => {}
        Err(e) => return Err(TunnelError::Connect(format!("connect: {}", e))),
    }

    let stream: TcpStream = socket.into();
    let start = Instant::now();
    loop {
        if start.elapsed() > wait {
            return Err(TunnelError::Connect("simultaneous open timed out".to_string()));
        }
        match stream.peer_addr() {
            Ok(_) => {
                stream.set_nonblocking(false).map_err(sock_err)?;
                debug!(%peer, "simultaneous open succeeded");
                return Ok(stream);
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}

/// Bind an ephemeral TCP listener to claim a port number, then let it
/// go; SO_REUSEADDR makes the later bind on the same port work.
fn reserve_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("0.0.0.0:0")?;
    Ok(listener.local_addr()?.port())
}

fn parse_signing_key(hex_seed: &str) -> Result<SigningKey, String> {
    let bytes = hex::decode(hex_seed).map_err(|e| e.to_string())?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "seed must be 32 bytes".to_string())?;
    Ok(SigningKey::from_bytes(&seed))
}

fn parse_verifying_key(hex_key: &str) -> Option<VerifyingKey> {
    let bytes = hex::decode(hex_key).ok()?;
    let raw: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&raw).ok()
}

fn sock_err(e: std::io::Error) -> TunnelError {
    TunnelError::Connect(e.to_string())
}

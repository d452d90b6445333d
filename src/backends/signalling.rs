/**
 * backends/signalling.rs
 *
 * TLS WebSocket signalling channel against a relay server.
 */

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{SignallingChannel, SignallingError};
use crate::config::SignallingConfig;
use crate::message::Message;

type WsStream = WebSocketStream<MaybeTlsStream<tokio_native_tls::TlsStream<TcpStream>>>;

/// Frames exchanged with the relay. Peer messages travel inside
/// `Relay`; everything else is client/relay bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Register { name: String },
    RegisterAck { success: bool, message: String },
    Relay { message: Message },
    Keepalive,
    Error { message: String },
}

/// WebSocket signalling client. Connection sequence: raw TCP, TLS
/// handshake, WebSocket upgrade, register exchange.
pub struct WsSignalling {
    cfg: SignallingConfig,
    stream: Option<WsStream>,
}

impl WsSignalling {
    pub fn new() -> Self {
        Self {
            cfg: SignallingConfig::default(),
            stream: None,
        }
    }

    async fn open_stream(&self) -> Result<WsStream, SignallingError> {
        let req = self
            .cfg
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SignallingError::Connect(format!("invalid relay url: {}", e)))?;

        let host = req
            .uri()
            .host()
            .ok_or_else(|| SignallingError::Connect("missing hostname".to_string()))?
            .to_string();
        let port = req.uri().port_u16().unwrap_or(443);

        let mut builder = TlsConnector::builder();
        if self.cfg.accept_invalid_certs {
            // Development relays run on self-signed certificates.
            builder.danger_accept_invalid_certs(true);
        }
        let tls = builder
            .build()
            .map_err(|e| SignallingError::Connect(format!("tls setup: {}", e)))?;
        let tls = tokio_native_tls::TlsConnector::from(tls);

        // STEP 1: Raw TCP connect
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| SignallingError::Connect(format!("tcp: {}", e)))?;

        // STEP 2: TLS handshake over TCP
        let tls_stream = tls
            .connect(&host, tcp)
            .await
            .map_err(|e| SignallingError::Connect(format!("tls: {}", e)))?;

        // STEP 3: WebSocket upgrade over TLS
        let (stream, _resp) =
            tokio_tungstenite::client_async_tls_with_config(req, tls_stream, None, None)
                .await
                .map_err(|e| SignallingError::Connect(format!("websocket: {}", e)))?;

        Ok(stream)
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), SignallingError> {
        let json = serde_json::to_string(frame)
            .map_err(|e| SignallingError::Send(e.to_string()))?;
        let stream = self.stream.as_mut().ok_or(SignallingError::Closed)?;
        stream
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| SignallingError::Send(e.to_string()))
    }

    /// Next decodable frame. Transport ping/pong is answered here;
    /// undecodable text is skipped, it must not kill the channel.
    async fn next_frame(&mut self) -> Result<Frame, SignallingError> {
        loop {
            let stream = self.stream.as_mut().ok_or(SignallingError::Closed)?;
            let item = stream
                .next()
                .await
                .ok_or(SignallingError::Closed)?
                .map_err(|e| SignallingError::Recv(e.to_string()))?;

            match item {
                WsMessage::Text(text) => match serde_json::from_str(&text) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => warn!(error = %e, "undecodable signalling frame skipped"),
                },
                WsMessage::Ping(payload) => {
                    stream
                        .send(WsMessage::Pong(payload))
                        .await
                        .map_err(|e| SignallingError::Send(e.to_string()))?;
                }
                WsMessage::Close(_) => return Err(SignallingError::Closed),
                _ => {}
            }
        }
    }
}

impl Default for WsSignalling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignallingChannel for WsSignalling {
    fn configure(&mut self, cfg: &SignallingConfig) {
        self.cfg = cfg.clone();
    }

    async fn connect(&mut self) -> Result<(), SignallingError> {
        let stream = self.open_stream().await?;
        self.stream = Some(stream);

        self.send_frame(&Frame::Register {
            name: self.cfg.name.clone(),
        })
        .await?;

        loop {
            match self.next_frame().await? {
                Frame::RegisterAck { success: true, .. } => {
                    debug!(name = %self.cfg.name, "registered with relay");
                    return Ok(());
                }
                Frame::RegisterAck {
                    success: false,
                    message,
                } => return Err(SignallingError::Registration(message)),
                Frame::Keepalive => {}
                other => debug!(frame = ?other, "frame before register ack skipped"),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(error = %e, "websocket close failed");
            }
        }
    }

    async fn receive(&mut self) -> Result<Message, SignallingError> {
        loop {
            match self.next_frame().await? {
                Frame::Relay { message } => return Ok(message),
                Frame::Keepalive => {}
                Frame::Error { message } => {
                    warn!(error = %message, "relay reported an error");
                }
                other => debug!(frame = ?other, "unexpected relay frame skipped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn relay_frame_carries_a_peer_message() {
        let frame: Frame = serde_json::from_str(
            r#"{"type":"relay","message":{"type":"reset","from":"carol","data":{"reason":"timeout"}}}"#,
        )
        .unwrap();
        match frame {
            Frame::Relay { message } => {
                assert_eq!(message.kind, MessageKind::Reset);
                assert_eq!(message.reason(), Some("timeout"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn register_frame_encodes_snake_case() {
        let json = serde_json::to_string(&Frame::Register {
            name: "alice".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"register","name":"alice"}"#);
    }
}

//! WebSocket relay server.
//!
//! Each accepted socket becomes one hub [`Session`](super::Session). The
//! handshake reads `publickey` and `id` from the query string and, when
//! enabled, accepts the `prsc.v1` sub-protocol.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;

use super::{RelayConfig, RelayHub, RelayStats};
use crate::transport::{query_param, SUBPROTOCOL};

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Accepts WebSocket participants and relays their signaling.
pub struct RelayServer {
    config: RelayConfig,
    hub: RelayHub,
}

struct Admission {
    peer: String,
    public_key: Option<String>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let hub = RelayHub::new(config.clone());
        Self { config, hub }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn stats(&self) -> RelayStats {
        self.hub.stats()
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: RelayHub,
    ) -> Result<(), RelayError> {
        let config = hub.config().clone();
        let mut admission = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let uri = request.uri().to_string();
            let public_key = query_param(&uri, "publickey").filter(|k| !k.is_empty());
            if config.require_public_key && public_key.is_none() {
                return Err(error_response(StatusCode::UNAUTHORIZED, "missing publickey"));
            }

            let requested = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.split(',').any(|p| p.trim() == SUBPROTOCOL));
            if requested && config.negotiate_subprotocol {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
            }

            let peer = query_param(&uri, "id")
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| addr.to_string());
            admission = Some(Admission { peer, public_key });
            Ok(response)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(admission) = admission else {
            return Ok(());
        };

        let (session, mut outbox) = match hub.open_session(&admission.peer, admission.public_key.as_deref()) {
            Ok(opened) => opened,
            Err(e) => {
                log::warn!("Refused {addr}: {e}");
                return Ok(());
            }
        };
        log::info!("Peer {} connected from {addr}", admission.peer);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => session.handle(&data),
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                frame = outbox.recv() => match frame {
                    Some(frame) => ws_sender.send(Message::Binary(frame.into())).await?,
                    None => {
                        // Hub dropped the session.
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                },
            }
        }

        drop(session);
        Ok(())
    }
}

fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.channel_capacity, 256);
        assert!(config.negotiate_subprotocol);
        assert!(config.require_public_key);
    }

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats(), RelayStats::default());
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(StatusCode::UNAUTHORIZED, "missing publickey");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("missing publickey"));
    }
}

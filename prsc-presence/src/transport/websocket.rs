//! WebSocket transports.
//!
//! The primary connector asks the relay for the `prsc.v1` sub-protocol,
//! which carries a datagram lane next to the ordered stream. A relay that
//! does not answer with it is treated as not supporting the primary
//! transport, and the connection may downgrade to the plain connector.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{
    CloseReason, Connector, Link, LinkDriver, Transport, TransportError,
    DEFAULT_DATAGRAM_CAPACITY, DEFAULT_INBOUND_CAPACITY,
};

/// Sub-protocol negotiated by the primary transport.
pub const SUBPROTOCOL: &str = "prsc.v1";

/// Connects to a relay over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    subprotocol: Option<&'static str>,
    inbound_capacity: usize,
    datagram_capacity: usize,
}

impl WebSocketConnector {
    /// Primary: requires the relay to accept [`SUBPROTOCOL`].
    pub fn negotiated() -> Self {
        Self {
            subprotocol: Some(SUBPROTOCOL),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            datagram_capacity: DEFAULT_DATAGRAM_CAPACITY,
        }
    }

    /// Fallback: plain WebSocket, no negotiation.
    pub fn plain() -> Self {
        Self {
            subprotocol: None,
            ..Self::negotiated()
        }
    }

    pub fn with_capacity(mut self, inbound: usize, datagram: usize) -> Self {
        self.inbound_capacity = inbound;
        self.datagram_capacity = datagram;
        self
    }

    pub fn subprotocol(&self) -> Option<&'static str> {
        self.subprotocol
    }

    async fn open(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let ws_url = websocket_url(url);
        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(classify_error)?;
        if let Some(proto) = self.subprotocol {
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(proto));
        }

        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_error)?;

        if let Some(proto) = self.subprotocol {
            let accepted = response
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.split(',').any(|p| p.trim() == proto));
            if !accepted {
                return Err(TransportError::Unsupported(format!(
                    "relay did not accept sub-protocol {proto}"
                )));
            }
        }

        let (link, driver) = Link::new(self.inbound_capacity, self.datagram_capacity);
        tokio::spawn(pump(ws_stream, driver));
        Ok(link)
    }
}

impl Connector for WebSocketConnector {
    fn name(&self) -> &'static str {
        match self.subprotocol {
            Some(_) => "websocket+prsc.v1",
            None => "websocket",
        }
    }

    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>> {
        Box::pin(self.open(url))
    }
}

/// `https://` → `wss://`, `http://` → `ws://`; other schemes untouched.
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Sort handshake failures into capability mismatch vs. refusal.
fn classify_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                400 | 404 | 405 | 426 | 501 | 505 => TransportError::Unsupported(format!(
                    "handshake answered with HTTP {status}"
                )),
                _ => TransportError::Rejected(format!("handshake answered with HTTP {status}")),
            }
        }
        WsError::Protocol(e) => TransportError::Unsupported(e.to_string()),
        WsError::Io(e) => TransportError::Io(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Rejected(other.to_string()),
    }
}

/// Moves frames between the socket and the link until either side ends.
async fn pump(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>, driver: LinkDriver) {
    let LinkDriver {
        mut outbound,
        inbound,
        mut close_requested,
    } = driver;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            frame = outbound.next() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_writer.send(Message::Binary(frame.into())).await {
                        break CloseReason::Error(e.to_string());
                    }
                }
                None => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    break CloseReason::Local;
                }
            },
            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => inbound.deliver(data.into()),
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    break CloseReason::Remote(detail);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseReason::Error(e.to_string()),
                None => break CloseReason::Remote("connection ended".to_string()),
            },
            _ = close_requested.requested() => {
                let _ = ws_writer.send(Message::Close(None)).await;
                break CloseReason::Local;
            }
        }
    };

    inbound.finish(reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_scheme_mapping() {
        assert_eq!(websocket_url("https://relay.example/v1?id=1"), "wss://relay.example/v1?id=1");
        assert_eq!(websocket_url("http://127.0.0.1:9090"), "ws://127.0.0.1:9090");
        assert_eq!(websocket_url("wss://relay.example"), "wss://relay.example");
    }

    #[test]
    fn test_connector_names() {
        assert_eq!(WebSocketConnector::negotiated().name(), "websocket+prsc.v1");
        assert_eq!(WebSocketConnector::plain().name(), "websocket");
        assert_eq!(WebSocketConnector::plain().subprotocol(), None);
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_a_capability_mismatch() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = WebSocketConnector::negotiated()
            .connect(&format!("http://127.0.0.1:{port}"))
            .await
            .err()
            .unwrap();
        assert!(!err.is_capability_mismatch(), "got {err:?}");
    }
}

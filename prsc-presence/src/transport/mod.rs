//! Transport seam between the protocol engine and the network.
//!
//! ```text
//!  Channel ──FrameWriter──► ┌──────────────┐  pump task  ┌──────────┐
//!                           │     Link     │ ◄─────────► │  socket  │
//!  Channel ◄──broadcast──── │ (lanes+close)│             │ / relay  │
//!                           └──────────────┘             └──────────┘
//! ```
//!
//! A [`Connector`] produces a ready [`Transport`]; awaiting
//! [`Connector::connect`] is the readiness wait. Every concrete transport in
//! this crate is a [`Link`] driven by a pump task that owns the socket.

pub mod memory;
pub mod websocket;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, watch};

pub use memory::MemoryConnector;
pub use websocket::{WebSocketConnector, SUBPROTOCOL};

/// Frames buffered per inbound subscriber before it starts lagging.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;
/// Datagrams queued before new ones are dropped.
pub const DEFAULT_DATAGRAM_CAPACITY: usize = 256;

/// Outbound lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Unreliable: dropped under backpressure
    Datagram,
    /// Reliable and ordered
    Stream,
}

impl Delivery {
    pub fn from_reliable(reliable: bool) -> Self {
        if reliable {
            Self::Stream
        } else {
            Self::Datagram
        }
    }
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed from this side
    Local,
    /// The remote closed or refused the session
    Remote(String),
    /// The connection failed
    Error(String),
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote does not speak this transport at all
    #[error("transport unsupported by remote: {0}")]
    Unsupported(String),
    /// The remote explicitly refused or closed the session
    #[error("transport rejected: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
    #[error("transport io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether switching to a fallback implementation could help.
    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// A live, multiplexed connection to the relay.
pub trait Transport: Send + Sync {
    /// A writer for one lane. Writers of all channels share the transport.
    fn writer(&self, delivery: Delivery) -> Result<FrameWriter, TransportError>;

    /// A receiver of every inbound frame, in arrival order.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;

    /// Resolves once the transport is closed, for whatever reason.
    fn closed(&self) -> BoxFuture<'static, CloseReason>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Opens transports to a URL.
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>>;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>> {
        (**self).connect(url)
    }
}

/// Write half handed to a channel.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    delivery: Delivery,
    stream: mpsc::UnboundedSender<Bytes>,
    datagram: mpsc::Sender<Bytes>,
}

impl FrameWriter {
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Queue one frame. Returns `Ok(false)` when a full datagram lane
    /// dropped it.
    pub fn write(&self, frame: impl Into<Bytes>) -> Result<bool, TransportError> {
        let frame = frame.into();
        match self.delivery {
            Delivery::Stream => self
                .stream
                .send(frame)
                .map(|()| true)
                .map_err(|_| TransportError::Closed),
            Delivery::Datagram => match self.datagram.try_send(frame) {
                Ok(()) => Ok(true),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

/// Shared transport state: two outbound lanes, an inbound fan-out and a
/// close signal. The pump task holds the matching [`LinkDriver`].
pub struct Link {
    stream: mpsc::UnboundedSender<Bytes>,
    datagram: mpsc::Sender<Bytes>,
    inbound: broadcast::Sender<Bytes>,
    closed: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Pump side of a [`Link`].
pub struct LinkDriver {
    pub outbound: Outbound,
    pub inbound: Inbound,
    pub close_requested: CloseSignal,
}

impl Link {
    pub fn new(inbound_capacity: usize, datagram_capacity: usize) -> (Arc<Self>, LinkDriver) {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (datagram_tx, datagram_rx) = mpsc::channel(datagram_capacity.max(1));
        let (inbound, _) = broadcast::channel(inbound_capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(None);
        let closed = Arc::new(closed_tx);

        let driver = LinkDriver {
            outbound: Outbound {
                stream: stream_rx,
                datagram: datagram_rx,
            },
            inbound: Inbound {
                sender: inbound.clone(),
                closed: closed.clone(),
            },
            close_requested: CloseSignal { rx: closed_rx },
        };
        let link = Arc::new(Self {
            stream: stream_tx,
            datagram: datagram_tx,
            inbound,
            closed,
        });
        (link, driver)
    }

    pub fn with_defaults() -> (Arc<Self>, LinkDriver) {
        Self::new(DEFAULT_INBOUND_CAPACITY, DEFAULT_DATAGRAM_CAPACITY)
    }
}

impl Transport for Link {
    fn writer(&self, delivery: Delivery) -> Result<FrameWriter, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(FrameWriter {
            delivery,
            stream: self.stream.clone(),
            datagram: self.datagram.clone(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inbound.subscribe()
    }

    fn closed(&self) -> BoxFuture<'static, CloseReason> {
        let mut rx = self.closed.subscribe();
        Box::pin(async move {
            match rx.wait_for(Option::is_some).await {
                Ok(reason) => reason.clone().unwrap_or(CloseReason::Local),
                Err(_) => CloseReason::Local,
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn close(&self) {
        set_closed(&self.closed, CloseReason::Local);
    }
}

/// First reason wins.
fn set_closed(closed: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    closed.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// Outbound frames waiting for the socket.
pub struct Outbound {
    stream: mpsc::UnboundedReceiver<Bytes>,
    datagram: mpsc::Receiver<Bytes>,
}

impl Outbound {
    /// Next frame to put on the socket; stream frames first.
    ///
    /// `None` once every writer and the [`Link`] itself are gone.
    pub async fn next(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            Some(frame) = self.stream.recv() => Some(frame),
            Some(frame) = self.datagram.recv() => Some(frame),
            else => None,
        }
    }
}

/// Inbound side: fan frames out to subscribers and report the close.
pub struct Inbound {
    sender: broadcast::Sender<Bytes>,
    closed: Arc<watch::Sender<Option<CloseReason>>>,
}

impl Inbound {
    pub fn deliver(&self, frame: Bytes) {
        // No subscribers is fine: nobody has joined a channel yet.
        let _ = self.sender.send(frame);
    }

    pub fn finish(&self, reason: CloseReason) {
        set_closed(&self.closed, reason);
    }
}

/// Resolves when someone called [`Transport::close`].
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(Option::is_some).await;
    }
}

/// Percent-decoded value of query parameter `key` in `url`.
pub(crate) fn query_param(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    let raw = query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })?;
    Some(match urlencoding::decode(raw) {
        Ok(value) => value.into_owned(),
        Err(_) => raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_stream_writer_delivers_in_order() {
        let (link, mut driver) = Link::with_defaults();
        let writer = link.writer(Delivery::Stream).unwrap();

        writer.write(vec![1]).unwrap();
        writer.write(vec![2]).unwrap();

        assert_eq!(driver.outbound.next().await.unwrap(), Bytes::from_static(&[1]));
        assert_eq!(driver.outbound.next().await.unwrap(), Bytes::from_static(&[2]));
    }

    #[tokio::test]
    async fn test_datagram_lane_drops_when_full() {
        let (link, mut driver) = Link::new(16, 2);
        let writer = link.writer(Delivery::Datagram).unwrap();

        let queued: Vec<bool> = (0..5u8).map(|i| writer.write(vec![i]).unwrap()).collect();
        assert_eq!(queued, vec![true, true, false, false, false]);

        assert_eq!(driver.outbound.next().await.unwrap(), Bytes::from_static(&[0]));
        assert_eq!(driver.outbound.next().await.unwrap(), Bytes::from_static(&[1]));
        let more = timeout(Duration::from_millis(20), driver.outbound.next()).await;
        assert!(more.is_err(), "dropped datagrams must not arrive");
    }

    #[tokio::test]
    async fn test_inbound_fan_out() {
        let (link, driver) = Link::with_defaults();
        let mut a = link.subscribe();
        let mut b = link.subscribe();

        driver.inbound.deliver(Bytes::from_static(b"frame"));

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"frame"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"frame"));
    }

    #[tokio::test]
    async fn test_close_resolves_closed_and_blocks_writers() {
        let (link, mut driver) = Link::with_defaults();
        let closed = link.closed();

        link.close();
        driver.close_requested.requested().await;

        assert_eq!(closed.await, CloseReason::Local);
        assert!(link.is_closed());
        assert_eq!(link.writer(Delivery::Stream).unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (link, driver) = Link::with_defaults();
        driver.inbound.finish(CloseReason::Remote("bye".into()));
        link.close();

        assert_eq!(link.closed().await, CloseReason::Remote("bye".into()));
    }

    #[test]
    fn test_query_param() {
        let url = "https://relay.example/v1?publickey=abc&id=p1";
        assert_eq!(query_param(url, "publickey").as_deref(), Some("abc"));
        assert_eq!(query_param(url, "id").as_deref(), Some("p1"));
        assert_eq!(query_param(url, "missing"), None);
        assert_eq!(query_param("https://relay.example/v1", "id"), None);
    }

    #[test]
    fn test_query_param_decodes_reserved_characters() {
        let url = format!(
            "wss://relay.example/v1?publickey={}&id={}",
            urlencoding::encode("k&ey#1"),
            urlencoding::encode("alice smith&co"),
        );
        assert_eq!(query_param(&url, "publickey").as_deref(), Some("k&ey#1"));
        assert_eq!(query_param(&url, "id").as_deref(), Some("alice smith&co"));
    }

    #[test]
    fn test_capability_mismatch() {
        assert!(TransportError::Unsupported("h3".into()).is_capability_mismatch());
        assert!(!TransportError::Rejected("401".into()).is_capability_mismatch());
        assert!(!TransportError::Closed.is_capability_mismatch());
    }
}

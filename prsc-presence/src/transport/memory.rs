//! In-process transport wired straight into a [`RelayHub`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{query_param, CloseReason, Connector, Link, LinkDriver, Transport, TransportError};
use crate::relay::{RelayHub, Session};

/// Connects to a hub in the same process.
///
/// Reads `id` and `publickey` from the URL query like the WebSocket relay
/// does. Failures queued with [`MemoryConnector::fail_next`] are returned
/// by the next attempts, one per attempt, before any session is opened.
pub struct MemoryConnector {
    hub: RelayHub,
    name: &'static str,
    failures: Mutex<VecDeque<TransportError>>,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new(hub: RelayHub) -> Self {
        Self {
            hub,
            name: "memory",
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
        }
    }

    /// Same hub, different label in logs.
    pub fn named(hub: RelayHub, name: &'static str) -> Self {
        Self {
            name,
            ..Self::new(hub)
        }
    }

    /// Make the next attempt fail with `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.failures.lock().push_back(err);
    }

    /// Connection attempts so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    fn open(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let peer = query_param(url, "id").unwrap_or_else(|| "anonymous".to_string());
        let public_key = query_param(url, "publickey");
        let (session, outbox) = self.hub.open_session(&peer, public_key.as_deref())?;

        let (link, driver) = Link::with_defaults();
        tokio::spawn(pump(session, outbox, driver));
        Ok(link)
    }
}

impl Connector for MemoryConnector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn Transport>, TransportError>> {
        Box::pin(async move { self.open(url) })
    }
}

async fn pump(session: Session, mut outbox: mpsc::Receiver<Bytes>, driver: LinkDriver) {
    let LinkDriver {
        mut outbound,
        inbound,
        mut close_requested,
    } = driver;

    let reason = loop {
        tokio::select! {
            // Flush queued frames before honouring a close.
            biased;
            frame = outbound.next() => match frame {
                Some(frame) => session.handle(&frame),
                None => break CloseReason::Local,
            },
            frame = outbox.recv() => match frame {
                Some(frame) => inbound.deliver(frame),
                None => break CloseReason::Remote("relay ended the session".to_string()),
            },
            _ = close_requested.requested() => break CloseReason::Local,
        }
    };

    drop(session);
    inbound.finish(reason);
}

//! One joined channel: join handshake, member reconciliation and event
//! dispatch.
//!
//! ```text
//!            attach()                     channel_join echo
//!  ────────► JOINING ───────────────────────────────► JOINED
//!            (join frame sent)             (online + state sent,
//!                                           join callbacks fired)
//! ```
//!
//! A [`Channel`] outlives the transport it was attached to. When the
//! transport dies the read loop ends and the channel goes inert until the
//! connection attaches it to a new transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::logger::Logger;
use crate::peers::{PeerRegistry, Unsubscribe};
use crate::protocol::{ControlOp, DataEnvelope, Peer, ProtocolError, Signal, State};
use crate::serializer::JsonSerializer;
use crate::transport::{CloseReason, Delivery, FrameWriter, Transport};

/// Channel errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] ProtocolError),
    #[error("transport closed")]
    Closed,
    #[error("channel was left")]
    Left,
    #[error("transport dropped before the join completed")]
    JoinAborted,
}

/// Join progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Joining,
    Joined,
}

/// Callback for one application event: the decoded data and its sender.
pub type EventCallback = Arc<dyn Fn(Value, Peer) + Send + Sync>;

type JoinCallback = Arc<dyn Fn() + Send + Sync>;

/// Members of a channel, unique by string id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberList {
    members: Vec<State>,
}

impl MemberList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record with the same id, or append. Records without an
    /// id are ignored. Returns whether the list changed.
    pub fn upsert(&mut self, state: State) -> bool {
        let Some(id) = state.id() else {
            return false;
        };
        match self.members.iter_mut().find(|m| m.id().as_deref() == Some(id.as_str())) {
            Some(existing) => *existing = state,
            None => self.members.push(state),
        }
        true
    }

    /// Remove the record with `id`. Returns whether one was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.id().as_deref() != Some(id));
        self.members.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m.id().as_deref() == Some(id))
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn as_slice(&self) -> &[State] {
        &self.members
    }

    pub fn to_vec(&self) -> Vec<State> {
        self.members.clone()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

struct Attachment {
    transport: Arc<dyn Transport>,
    writer: Option<FrameWriter>,
}

struct Inner {
    local: State,
    members: MemberList,
    phase: ChannelPhase,
    left: bool,
    generation: u64,
    attachment: Option<Attachment>,
    join_waiter: Option<oneshot::Sender<()>>,
}

struct ChannelShared {
    id: String,
    delivery: Delivery,
    logger: Logger,
    inner: Mutex<Inner>,
    peers: Mutex<Option<PeerRegistry>>,
    subscribers: Mutex<HashMap<String, (u64, EventCallback)>>,
    join_callbacks: Mutex<Vec<JoinCallback>>,
    next_subscription: AtomicU64,
}

/// Handle to one channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(id: impl Into<String>, local: State, delivery: Delivery, debug: bool) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                id: id.into(),
                delivery,
                logger: Logger::new(debug, "presence::channel"),
                inner: Mutex::new(Inner {
                    local,
                    members: MemberList::new(),
                    phase: ChannelPhase::Joining,
                    left: false,
                    generation: 0,
                    attachment: None,
                    join_waiter: None,
                }),
                peers: Mutex::new(None),
                subscribers: Mutex::new(HashMap::new()),
                join_callbacks: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The local participant's state as sent to this channel.
    pub fn state(&self) -> State {
        self.shared.inner.lock().local.clone()
    }

    /// Reconciled list of the other participants.
    pub fn members(&self) -> Vec<State> {
        self.shared.inner.lock().members.to_vec()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.shared.inner.lock().phase
    }

    pub fn is_left(&self) -> bool {
        self.shared.inner.lock().left
    }

    pub fn delivery(&self) -> Delivery {
        self.shared.delivery
    }

    /// Send `data` to every other member under `event`.
    ///
    /// Data that JSON cannot represent is degraded by the serializer rather
    /// than refused; only a frame that cannot be encoded at all is an error.
    pub fn broadcast<T: Serialize + ?Sized>(&self, event: &str, data: &T) -> Result<(), ChannelError> {
        if self.is_left() {
            return Err(ChannelError::Left);
        }
        let envelope = DataEnvelope::new(event, JsonSerializer::serialize(data, &self.shared.logger));
        let signal = Signal::data(self.id(), self.shared.self_id(), &envelope).map_err(|e| {
            self.shared.logger.warn(format_args!("broadcast error: {e}"));
            ChannelError::Encode(e)
        })?;
        self.shared.send(&signal)
    }

    /// Handle inbound `event`. A later subscription to the same event
    /// replaces this one.
    pub fn subscribe(
        &self,
        event: impl Into<String>,
        callback: impl Fn(Value, Peer) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let event = event.into();
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .insert(event.clone(), (id, Arc::new(callback)));

        let weak = Arc::downgrade(&self.shared);
        Unsubscribe::new(move || {
            if let Some(shared) = weak.upgrade() {
                let mut subscribers = shared.subscribers.lock();
                if subscribers.get(&event).is_some_and(|(current, _)| *current == id) {
                    subscribers.remove(&event);
                }
            }
        })
    }

    /// Get the member list after every change. No replay of the current
    /// list: the first call is the next change.
    pub fn subscribe_peers(&self, callback: impl Fn(&[State]) + Send + Sync + 'static) -> Unsubscribe {
        let registry = self
            .shared
            .peers
            .lock()
            .get_or_insert_with(PeerRegistry::new)
            .clone();
        registry.subscribe(callback)
    }

    /// Run `callback` each time the join handshake completes.
    pub fn on_join(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.join_callbacks.lock().push(Arc::new(callback));
    }

    /// Merge `patch` into the local state and, once joined, send it.
    pub fn update_state(&self, patch: &State) -> Result<(), ChannelError> {
        let (joined, local) = {
            let mut inner = self.shared.inner.lock();
            if inner.left {
                return Err(ChannelError::Left);
            }
            inner.local.merge(patch);
            (inner.phase == ChannelPhase::Joined, inner.local.clone())
        };
        if !joined {
            return Ok(());
        }
        self.shared.send(&Signal::state(self.id(), &local)?)
    }

    /// Announce `peer_offline`, forget every member and stop processing.
    pub fn leave(&self) {
        let (had_members, self_id) = {
            let inner = self.shared.inner.lock();
            if inner.left {
                return;
            }
            (!inner.members.is_empty(), inner.local.id())
        };
        if let Some(self_id) = self_id {
            if let Err(e) = self.shared.send(&Signal::offline(self.id(), self_id)) {
                self.shared.logger.log(format_args!("leave {}: {e}", self.id()));
            }
        }

        {
            let mut inner = self.shared.inner.lock();
            inner.left = true;
            inner.members.clear();
            inner.join_waiter = None;
        }
        self.shared.logger.log(format_args!(
            "left channel {} (had members: {had_members})",
            self.id()
        ));
        self.shared.notify_peers(&[]);
    }

    /// Bind to `transport` and start the join handshake.
    ///
    /// Resolves the returned receiver when the relay echoes the join; it
    /// is dropped unresolved when the transport closes first.
    pub(crate) fn attach(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<oneshot::Receiver<()>, ChannelError> {
        // Subscribe before the join goes out so the echo cannot be missed.
        let frames = transport.subscribe();
        let closed = transport.closed();
        let (tx, rx) = oneshot::channel();

        let (generation, stale, local) = {
            let mut inner = self.shared.inner.lock();
            if inner.left {
                return Err(ChannelError::Left);
            }
            inner.generation += 1;
            inner.phase = ChannelPhase::Joining;
            inner.attachment = Some(Attachment {
                transport,
                writer: None,
            });
            inner.join_waiter = Some(tx);
            let stale = !inner.members.is_empty();
            inner.members.clear();
            (inner.generation, stale, inner.local.clone())
        };
        if stale {
            self.shared.notify_peers(&[]);
        }

        tokio::spawn(read_loop(
            Arc::downgrade(&self.shared),
            self.shared.logger.clone(),
            generation,
            frames,
            closed,
        ));

        self.shared.logger.log(format_args!("join {} as {:?}", self.id(), local.id()));
        self.shared.send(&Signal::join(self.id(), &local)?)?;
        Ok(rx)
    }

    /// Stop using the current transport without announcing anything.
    pub(crate) fn detach(&self) {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        inner.attachment = None;
        inner.join_waiter = None;
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("phase", &inner.phase)
            .field("left", &inner.left)
            .field("members", &inner.members.len())
            .finish()
    }
}

async fn read_loop(
    shared: Weak<ChannelShared>,
    logger: Logger,
    generation: u64,
    mut frames: broadcast::Receiver<Bytes>,
    mut closed: BoxFuture<'static, CloseReason>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    logger.warn(format_args!("channel reader lagged, {skipped} frames skipped"));
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reason = &mut closed => {
                logger.log(format_args!("channel reader stopped: {reason:?}"));
                break;
            }
        };

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.is_current(generation) {
            return;
        }
        shared.handle_frame(&frame);
    }

    if let Some(shared) = shared.upgrade() {
        let mut inner = shared.inner.lock();
        if inner.generation == generation {
            inner.join_waiter = None;
        }
    }
}

impl ChannelShared {
    fn self_id(&self) -> Option<String> {
        self.inner.lock().local.id()
    }

    fn is_current(&self, generation: u64) -> bool {
        let inner = self.inner.lock();
        !inner.left && inner.generation == generation
    }

    /// Encode and queue one frame on this attachment's writer.
    fn send(&self, signal: &Signal) -> Result<(), ChannelError> {
        let frame = signal.encode()?;
        let queued = self.writer()?.write(frame).map_err(|_| ChannelError::Closed)?;
        if !queued {
            self.logger.log(format_args!("datagram lane full, frame dropped"));
        }
        Ok(())
    }

    /// The writer, acquired on first use. A stale writer is released and
    /// acquisition is retried once.
    fn writer(&self) -> Result<FrameWriter, ChannelError> {
        let mut inner = self.inner.lock();
        let attachment = inner.attachment.as_mut().ok_or(ChannelError::Closed)?;
        if let Some(writer) = attachment.writer.as_ref().filter(|w| !w.is_closed()) {
            return Ok(writer.clone());
        }

        let writer = match attachment.transport.writer(self.delivery) {
            Ok(writer) => writer,
            Err(e) => {
                self.logger.log(format_args!("writer acquisition failed, retrying: {e}"));
                attachment.writer = None;
                attachment
                    .transport
                    .writer(self.delivery)
                    .map_err(|_| ChannelError::Closed)?
            }
        };
        attachment.writer = Some(writer.clone());
        Ok(writer)
    }

    fn notify_peers(&self, members: &[State]) {
        let registry = self.peers.lock().clone();
        if let Some(registry) = registry {
            registry.trigger(members);
        }
    }

    fn handle_frame(&self, bytes: &[u8]) {
        let signal = match Signal::decode(bytes) {
            Ok(signal) => signal,
            Err(e) => {
                self.logger.log(format_args!("ignored frame: {e}"));
                return;
            }
        };
        if signal.channel() != self.id {
            return;
        }

        match signal {
            Signal::Control { op, peer, payload, .. } => {
                self.logger.log(format_args!("control op: {} p: {peer:?}", op.as_str()));
                match op {
                    ControlOp::ChannelJoin => self.on_join_echo(),
                    ControlOp::PeerOnline => {
                        if let Some(peer) = peer {
                            self.on_online(peer);
                        }
                    }
                    ControlOp::PeerState => self.on_state(peer, payload),
                    ControlOp::PeerOffline => {
                        if let Some(peer) = peer {
                            self.on_offline(&peer);
                        }
                    }
                }
            }
            Signal::Data { peer, payload, .. } => self.on_data(peer, &payload),
        }
    }

    fn on_join_echo(&self) {
        let (local, waiter) = {
            let mut inner = self.inner.lock();
            if inner.phase == ChannelPhase::Joined {
                return;
            }
            inner.phase = ChannelPhase::Joined;
            (inner.local.clone(), inner.join_waiter.take())
        };

        if let Some(self_id) = local.id() {
            if let Err(e) = self.send(&Signal::online(self.id.as_str(), self_id)) {
                self.logger.warn(format_args!("peer_online not sent: {e}"));
            }
        }
        self.sync_state(&local);

        let callbacks: Vec<JoinCallback> = self.join_callbacks.lock().clone();
        for callback in callbacks {
            callback();
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(());
        }
    }

    fn sync_state(&self, local: &State) {
        self.logger.log(format_args!("sync state: {:?}", local.as_map()));
        let sent = Signal::state(self.id.as_str(), local)
            .map_err(ChannelError::from)
            .and_then(|signal| self.send(&signal));
        if let Err(e) = sent {
            self.logger.warn(format_args!("peer_state not sent: {e}"));
        }
    }

    fn on_online(&self, peer: String) {
        let local = {
            let mut inner = self.inner.lock();
            if inner.local.id().as_deref() == Some(peer.as_str()) {
                return;
            }
            inner.members.upsert(State::new(peer));
            inner.local.clone()
        };
        // The newcomer learns our full state from this.
        self.sync_state(&local);
    }

    fn on_state(&self, peer: Option<String>, payload: Option<Bytes>) {
        let Some(payload) = payload else {
            return;
        };
        let mut state = match State::decode(&payload) {
            Ok(state) => state,
            Err(e) => {
                self.logger.log(format_args!("bad peer_state payload: {e}"));
                return;
            }
        };
        if state.id().is_none() {
            match peer {
                Some(peer) => state.set_id(peer),
                None => return,
            }
        }

        let members = {
            let mut inner = self.inner.lock();
            if state.id() == inner.local.id() {
                return;
            }
            inner.members.upsert(state);
            inner.members.to_vec()
        };
        self.notify_peers(&members);
    }

    fn on_offline(&self, peer: &str) {
        let members = {
            let mut inner = self.inner.lock();
            if inner.local.id().as_deref() == Some(peer) {
                return;
            }
            inner.members.remove(peer);
            inner.members.to_vec()
        };
        self.logger.log(format_args!("offline id: {peer}"));
        self.notify_peers(&members);
    }

    fn on_data(&self, peer: Option<String>, payload: &[u8]) {
        let envelope = match DataEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.logger.log(format_args!("bad data payload: {e}"));
                return;
            }
        };
        let callback = self
            .subscribers
            .lock()
            .get(&envelope.event)
            .map(|(_, cb)| cb.clone());
        if let Some(callback) = callback {
            let data = JsonSerializer::deserialize(&envelope.data, &self.logger);
            callback(data, Peer { id: peer.unwrap_or_default() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Link, LinkDriver};
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn quiet() -> Logger {
        Logger::new(false, "presence::channel")
    }

    /// Refuses every serializer it is handed.
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not representable"))
        }
    }

    fn channel(id: &str, self_id: &str) -> Channel {
        Channel::new(id, State::new(self_id).with("name", self_id), Delivery::Datagram, false)
    }

    async fn next_signal(driver: &mut LinkDriver) -> Signal {
        let frame = timeout(Duration::from_secs(1), driver.outbound.next())
            .await
            .unwrap()
            .unwrap();
        Signal::decode(&frame).unwrap()
    }

    /// Deliver a frame and give the read loop a chance to process it.
    async fn deliver(driver: &LinkDriver, signal: Signal) {
        driver.inbound.deliver(Bytes::from(signal.encode().unwrap()));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn joined(ch: &Channel) -> LinkDriver {
        let (link, mut driver) = Link::with_defaults();
        let waiter = ch.attach(link).unwrap();

        let join = next_signal(&mut driver).await;
        assert_eq!(join.op(), Some(ControlOp::ChannelJoin));
        deliver(&driver, join).await;
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        assert_eq!(next_signal(&mut driver).await.op(), Some(ControlOp::PeerOnline));
        assert_eq!(next_signal(&mut driver).await.op(), Some(ControlOp::PeerState));
        driver
    }

    #[test]
    fn test_member_list_upsert_is_unique_by_id() {
        let mut members = MemberList::new();
        members.upsert(State::new("p2"));
        members.upsert(State::new("p2").with("x", 1));
        members.upsert(State::from_value(json!({ "id": 3 })).unwrap());
        members.upsert(State::from_value(json!({ "id": "3", "y": 2 })).unwrap());

        assert_eq!(members.len(), 2);
        assert_eq!(members.as_slice()[0].get("x"), Some(&json!(1)));
        assert_eq!(members.as_slice()[1].get("y"), Some(&json!(2)));
    }

    #[test]
    fn test_member_list_ignores_records_without_id() {
        let mut members = MemberList::new();
        assert!(!members.upsert(State::from_value(json!({ "x": 1 })).unwrap()));
        assert!(members.is_empty());
    }

    #[test]
    fn test_member_list_remove_after_many_onlines() {
        let mut members = MemberList::new();
        for _ in 0..5 {
            members.upsert(State::new("p2"));
        }
        assert!(members.remove("p2"));
        assert!(!members.contains("p2"));
        assert!(!members.remove("p2"));
    }

    #[tokio::test]
    async fn test_join_handshake() {
        let ch = channel("ch", "p1");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        ch.on_join(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ch.phase(), ChannelPhase::Joining);
        let _driver = joined(&ch).await;

        assert_eq!(ch.phase(), ChannelPhase::Joined);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_echo_fires_once() {
        let ch = channel("ch", "p1");
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        ch.on_join(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let driver = joined(&ch).await;
        deliver(&driver, Signal::join("ch", &State::new("p1")).unwrap()).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_state_reconciliation() {
        let ch = channel("ch", "p1");
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let _unsub = ch.subscribe_peers(move |members| sink.lock().push(members.to_vec()));
        let driver = joined(&ch).await;

        deliver(&driver, Signal::state("ch", &State::new("p2").with("x", 1)).unwrap()).await;
        deliver(&driver, Signal::state("ch", &State::new("p2").with("x", 2)).unwrap()).await;

        let members = ch.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].get("x"), Some(&json!(2)));
        assert_eq!(snapshots.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_peer_online_is_silent_and_resyncs() {
        let ch = channel("ch", "p1");
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let _unsub = ch.subscribe_peers(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut driver = joined(&ch).await;

        deliver(&driver, Signal::online("ch", "p2")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ch.members().len(), 1);
        let resync = next_signal(&mut driver).await;
        assert_eq!(resync.op(), Some(ControlOp::PeerState));
        assert_eq!(resync.peer(), Some("p1"));
    }

    #[tokio::test]
    async fn test_offline_notifies_even_when_absent() {
        let ch = channel("ch", "p1");
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let _unsub = ch.subscribe_peers(move |members| sink.lock().push(members.len()));
        let driver = joined(&ch).await;

        deliver(&driver, Signal::online("ch", "p2")).await;
        deliver(&driver, Signal::online("ch", "p2")).await;
        deliver(&driver, Signal::offline("ch", "p2")).await;
        deliver(&driver, Signal::offline("ch", "p9")).await;

        assert!(ch.members().is_empty());
        assert_eq!(*snapshots.lock(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_self_never_in_member_list() {
        let ch = channel("ch", "p1");
        let driver = joined(&ch).await;

        deliver(&driver, Signal::online("ch", "p1")).await;
        deliver(&driver, Signal::state("ch", &State::new("p1")).unwrap()).await;
        let self_with_extra = State::from_value(json!({ "id": "p1", "x": 1 })).unwrap();
        deliver(&driver, Signal::state("ch", &self_with_extra).unwrap()).await;

        assert!(ch.members().is_empty());
    }

    #[tokio::test]
    async fn test_other_channel_frames_skipped() {
        let ch = channel("ch", "p1");
        let driver = joined(&ch).await;

        deliver(&driver, Signal::state("other", &State::new("p2")).unwrap()).await;
        assert!(ch.members().is_empty());
    }

    #[tokio::test]
    async fn test_data_dispatch_and_resubscribe() {
        let ch = channel("ch", "p1");
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let driver = joined(&ch).await;

        let sink = first.clone();
        let _a = ch.subscribe("chat", move |data, peer| sink.lock().push((data, peer.id)));
        let sink = second.clone();
        let _b = ch.subscribe("chat", move |data, peer| sink.lock().push((data, peer.id)));

        let envelope = DataEnvelope::new("chat", JsonSerializer::serialize(&json!({ "msg": "hi" }), &quiet()));
        deliver(&driver, Signal::data("ch", Some("p2".into()), &envelope).unwrap()).await;

        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec![(json!({ "msg": "hi" }), "p2".to_string())]);
    }

    #[tokio::test]
    async fn test_stale_unsubscribe_keeps_replacement() {
        let ch = channel("ch", "p1");
        let hits = Arc::new(AtomicU64::new(0));
        let driver = joined(&ch).await;

        let old = ch.subscribe("chat", |_, _| {});
        let counter = hits.clone();
        let _new = ch.subscribe("chat", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        old.unsubscribe();

        let envelope = DataEnvelope::new("chat", JsonSerializer::serialize(&1, &quiet()));
        deliver(&driver, Signal::data("ch", Some("p2".into()), &envelope).unwrap()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_frames_data() {
        let ch = channel("ch", "p1");
        let mut driver = joined(&ch).await;

        ch.broadcast("cursor", &json!({ "x": 1 })).unwrap();

        match next_signal(&mut driver).await {
            Signal::Data { channel, peer, payload } => {
                assert_eq!(channel, "ch");
                assert_eq!(peer.as_deref(), Some("p1"));
                let envelope = DataEnvelope::decode(&payload).unwrap();
                assert_eq!(envelope.event, "cursor");
                assert_eq!(JsonSerializer::deserialize(&envelope.data, &quiet()), json!({ "x": 1 }));
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_of_unencodable_data_fails() {
        let ch = channel("ch", "p1");
        let mut driver = joined(&ch).await;

        let result = ch.broadcast("cursor", &Unserializable);

        assert!(matches!(result, Err(ChannelError::Encode(_))), "got {result:?}");
        assert!(timeout(Duration::from_millis(50), driver.outbound.next()).await.is_err());

        // The channel stays usable.
        ch.broadcast("cursor", &1).unwrap();
        assert!(matches!(next_signal(&mut driver).await, Signal::Data { .. }));
    }

    #[tokio::test]
    async fn test_leave_announces_and_clears() {
        let ch = channel("ch", "p1");
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let _unsub = ch.subscribe_peers(move |members| sink.lock().push(members.len()));
        let mut driver = joined(&ch).await;
        deliver(&driver, Signal::state("ch", &State::new("p2")).unwrap()).await;

        ch.leave();

        assert_eq!(next_signal(&mut driver).await, Signal::offline("ch", "p1"));
        assert!(ch.is_left());
        assert!(ch.members().is_empty());
        assert_eq!(*snapshots.lock(), vec![1, 0]);
        assert_eq!(ch.broadcast("chat", "late"), Err(ChannelError::Left));

        // Nothing is processed after leaving.
        deliver(&driver, Signal::state("ch", &State::new("p3")).unwrap()).await;
        assert!(ch.members().is_empty());
    }

    #[tokio::test]
    async fn test_update_state_resends_when_joined() {
        let ch = channel("ch", "p1");
        let mut driver = joined(&ch).await;

        ch.update_state(&State::default().with("cursor", json!([3, 4]))).unwrap();

        match next_signal(&mut driver).await {
            Signal::Control { op: ControlOp::PeerState, payload: Some(pl), .. } => {
                let state = State::decode(&pl).unwrap();
                assert_eq!(state.get("cursor"), Some(&json!([3, 4])));
                assert_eq!(state.id().as_deref(), Some("p1"));
            }
            other => panic!("expected peer_state, got {other:?}"),
        }
        assert_eq!(ch.state().get("cursor"), Some(&json!([3, 4])));
    }

    #[tokio::test]
    async fn test_transport_close_aborts_pending_join() {
        let ch = channel("ch", "p1");
        let (link, driver) = Link::with_defaults();
        let waiter = ch.attach(link).unwrap();

        driver.inbound.finish(CloseReason::Remote("gone".into()));

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap();
        assert!(result.is_err());
        assert_eq!(ch.phase(), ChannelPhase::Joining);
    }

    #[tokio::test]
    async fn test_reattach_clears_stale_members() {
        let ch = channel("ch", "p1");
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let _unsub = ch.subscribe_peers(move |members| sink.lock().push(members.len()));
        let driver = joined(&ch).await;
        deliver(&driver, Signal::state("ch", &State::new("p2")).unwrap()).await;
        driver.inbound.finish(CloseReason::Remote("gone".into()));

        let _second = joined(&ch).await;

        assert!(ch.members().is_empty());
        assert_eq!(*snapshots.lock(), vec![1, 0]);
        assert_eq!(ch.phase(), ChannelPhase::Joined);
    }

    #[tokio::test]
    async fn test_broadcast_without_transport_is_closed() {
        let ch = channel("ch", "p1");
        assert_eq!(ch.broadcast("chat", "hi"), Err(ChannelError::Closed));
    }
}

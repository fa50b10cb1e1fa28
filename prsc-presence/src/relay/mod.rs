//! Relay: the server half that participants connect to.
//!
//! ```text
//! Session A ──┐                         ┌──► Session B
//!             ├── RelayHub ── channel ──┤
//! Session C ──┘   (directory)           └──► Session C
//! ```
//!
//! The hub knows nothing about sockets. [`RelayServer`] bridges WebSocket
//! connections to hub sessions; [`MemoryConnector`](crate::transport::MemoryConnector)
//! bridges in-process transports to the same hub.

pub mod server;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::{ControlOp, Signal, State};
use crate::transport::TransportError;

pub use server::{RelayError, RelayServer};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session before the session is considered stuck
    pub channel_capacity: usize,
    /// Accept the `prsc.v1` sub-protocol (primary transport)
    pub negotiate_subprotocol: bool,
    /// Refuse sessions without a `publickey`
    pub require_public_key: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            negotiate_subprotocol: true,
            require_public_key: true,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub frames_received: u64,
    pub frames_forwarded: u64,
    pub active_channels: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_sessions: AtomicU64,
    active_sessions: AtomicU64,
    frames_received: AtomicU64,
    frames_forwarded: AtomicU64,
}

struct SessionEntry {
    peer: String,
    public_key: Option<String>,
    outbox: mpsc::Sender<Bytes>,
    channels: HashSet<String>,
}

/// Channel membership: session → announced peer id.
#[derive(Default)]
struct RelayChannel {
    members: HashMap<u64, String>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<u64, SessionEntry>,
    channels: HashMap<String, RelayChannel>,
}

struct HubInner {
    config: RelayConfig,
    state: Mutex<HubState>,
    next_session: AtomicU64,
    stats: AtomicRelayStats,
}

/// Channel directory and fan-out shared by all sessions.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                state: Mutex::new(HubState::default()),
                next_session: AtomicU64::new(1),
                stats: AtomicRelayStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Admit a participant.
    ///
    /// Returns the session plus the receiver of frames addressed to it.
    pub fn open_session(
        &self,
        peer: &str,
        public_key: Option<&str>,
    ) -> Result<(Session, mpsc::Receiver<Bytes>), TransportError> {
        if self.inner.config.require_public_key && public_key.map_or(true, str::is_empty) {
            return Err(TransportError::Rejected("missing publickey".to_string()));
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (outbox, rx) = mpsc::channel(self.inner.config.channel_capacity.max(1));
        self.inner.state.lock().sessions.insert(
            id,
            SessionEntry {
                peer: peer.to_string(),
                public_key: public_key.map(str::to_string),
                outbox,
                channels: HashSet::new(),
            },
        );
        self.inner.stats.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.active_sessions.fetch_add(1, Ordering::Relaxed);
        log::debug!("relay: session {id} opened for peer {peer}");

        Ok((
            Session {
                id,
                hub: self.clone(),
            },
            rx,
        ))
    }

    /// Drop every session, as if the relay restarted.
    pub fn disconnect_all(&self) {
        let ids: Vec<u64> = self.inner.state.lock().sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id);
        }
    }

    /// Key presented by the session admitted as `peer`.
    pub fn public_key(&self, peer: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .find(|s| s.peer == peer)
            .and_then(|s| s.public_key.clone())
    }

    /// Peer ids currently joined to `channel`, sorted.
    pub fn members(&self, channel: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut members: Vec<String> = state
            .channels
            .get(channel)
            .map(|c| c.members.values().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn stats(&self) -> RelayStats {
        let stats = &self.inner.stats;
        RelayStats {
            total_sessions: stats.total_sessions.load(Ordering::Relaxed),
            active_sessions: stats.active_sessions.load(Ordering::Relaxed),
            frames_received: stats.frames_received.load(Ordering::Relaxed),
            frames_forwarded: stats.frames_forwarded.load(Ordering::Relaxed),
            active_channels: self.channel_count(),
        }
    }

    fn handle_frame(&self, session: u64, bytes: &[u8]) {
        self.inner.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        let signal = match Signal::decode(bytes) {
            Ok(signal) => signal,
            Err(e) => {
                log::warn!("relay: session {session} sent an undecodable frame: {e}");
                return;
            }
        };

        let mut state = self.inner.state.lock();
        let Some(session_peer) = state.sessions.get(&session).map(|s| s.peer.clone()) else {
            return;
        };
        let channel_id = signal.channel().to_string();

        if signal.op() == Some(ControlOp::ChannelJoin) {
            let peer = match &signal {
                Signal::Control { payload: Some(pl), .. } => State::decode(pl)
                    .ok()
                    .and_then(|s| s.id())
                    .unwrap_or_else(|| session_peer.clone()),
                _ => signal.peer().map(str::to_string).unwrap_or_else(|| session_peer.clone()),
            };
            state
                .channels
                .entry(channel_id.clone())
                .or_default()
                .members
                .insert(session, peer.clone());
            if let Some(entry) = state.sessions.get_mut(&session) {
                entry.channels.insert(channel_id.clone());
            }
            log::info!("relay: peer {peer} joined channel {channel_id}");

            // The echo completes the joiner's handshake.
            let echo = signal.with_peer(peer);
            if let Ok(encoded) = echo.encode() {
                self.send_to(&state, session, Bytes::from(encoded));
            }
            return;
        }

        let Some(member_peer) = state
            .channels
            .get(&channel_id)
            .and_then(|c| c.members.get(&session))
            .cloned()
        else {
            log::debug!("relay: session {session} is not in channel {channel_id}, frame dropped");
            return;
        };

        if let Signal::Control { op: ControlOp::PeerState, payload: Some(pl), .. } = &signal {
            let claimed = State::decode(pl).ok().and_then(|s| s.id());
            if claimed.as_ref().is_some_and(|id| *id != member_peer) {
                log::warn!("relay: session {session} sent state for {claimed:?} as {member_peer}, frame dropped");
                return;
            }
        }

        // Frames always carry the sender's own peer id.
        let stamped = signal.with_peer(member_peer);
        let leaving = stamped.op() == Some(ControlOp::PeerOffline);
        match stamped.encode() {
            Ok(encoded) => self.forward(&state, &channel_id, session, Bytes::from(encoded)),
            Err(e) => log::warn!("relay: failed to re-encode frame: {e}"),
        }

        if leaving {
            Self::remove_member(&mut state, &channel_id, session);
        }
    }

    fn close_session(&self, session: u64) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.sessions.remove(&session) else {
            return;
        };
        self.inner.stats.active_sessions.fetch_sub(1, Ordering::Relaxed);

        for channel_id in &entry.channels {
            let peer = state
                .channels
                .get(channel_id)
                .and_then(|c| c.members.get(&session))
                .cloned();
            if let Some(peer) = peer {
                if let Ok(encoded) = Signal::offline(channel_id.as_str(), peer).encode() {
                    self.forward(&state, channel_id, session, Bytes::from(encoded));
                }
                Self::remove_member(&mut state, channel_id, session);
            }
        }
        log::debug!("relay: session {session} ({}) closed", entry.peer);
    }

    fn remove_member(state: &mut HubState, channel_id: &str, session: u64) {
        if let Some(channel) = state.channels.get_mut(channel_id) {
            channel.members.remove(&session);
            if channel.members.is_empty() {
                state.channels.remove(channel_id);
                log::debug!("relay: channel {channel_id} removed (empty)");
            }
        }
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.channels.remove(channel_id);
        }
    }

    /// Send to every member of `channel_id` except `from`.
    fn forward(&self, state: &HubState, channel_id: &str, from: u64, frame: Bytes) {
        let Some(channel) = state.channels.get(channel_id) else {
            return;
        };
        for &member in channel.members.keys().filter(|&&m| m != from) {
            self.send_to(state, member, frame.clone());
        }
    }

    fn send_to(&self, state: &HubState, session: u64, frame: Bytes) {
        let Some(entry) = state.sessions.get(&session) else {
            return;
        };
        match entry.outbox.try_send(frame) {
            Ok(()) => {
                self.inner.stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("relay: session {session} lagging, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// One admitted participant. Dropping it ends the session and tells the
/// remaining members of its channels that it went offline.
pub struct Session {
    id: u64,
    hub: RelayHub,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Process one frame sent by this participant.
    pub fn handle(&self, frame: &[u8]) {
        self.hub.handle_frame(self.id, frame);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.hub.close_session(self.id);
    }
}

//! Connection lifecycle: transport acquisition, downgrade, reconnect and
//! the channel directory.
//!
//! ```text
//! CONNECTING ──ready──► OPEN ──closed──► CLOSED ──backoff──► CONNECTING ─┐
//!     ▲                                    │                             │
//!     └───────────── rejoin all channels ◄─┼──────── ready ◄─────────────┘
//!                                          └── attempts exhausted: CLOSED (final)
//! ```
//!
//! A capability mismatch from the primary connector switches to the
//! fallback connector at once, without waiting for the backoff.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;

use crate::channel::{Channel, ChannelError};
use crate::logger::Logger;
use crate::protocol::State;
use crate::transport::{Connector, Delivery, Transport, TransportError, WebSocketConnector};

/// Default fixed delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Connection errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresenceError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("connection closed")]
    Closed,
}

/// Options for [`create_presence`]. Deserializable from camelCase JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceOptions {
    /// Participant id; a random UUID when absent
    pub id: Option<String>,
    /// Opaque credential, required
    pub public_key: Option<String>,
    /// Ordered stream lane instead of datagrams
    pub reliable: bool,
    /// Emit diagnostics through `log`
    pub debug: bool,
    /// Switch to the fallback transport on a capability mismatch
    pub auto_downgrade: bool,
    #[serde(rename = "reconnectIntervalMs", deserialize_with = "millis")]
    pub reconnect_interval: Duration,
    /// Consecutive failed reconnects before giving up; unlimited when absent
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            id: None,
            public_key: None,
            reliable: false,
            debug: false,
            auto_downgrade: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: None,
        }
    }
}

impl PresenceOptions {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: Some(public_key.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

fn millis<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

impl ConnectionStatus {
    /// Numeric code: connecting 0, open 1, closed 2.
    pub fn code(&self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Delivered to status listeners on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    pub code: u8,
    pub details: String,
}

pub type StatusCallback = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

struct Core {
    status: ConnectionStatus,
    state: State,
    channels: BTreeMap<String, Channel>,
    transport: Option<Arc<dyn Transport>>,
    downgraded: bool,
    retry_count: u32,
    shut_down: bool,
}

struct PresenceInner {
    url: String,
    id: String,
    options: PresenceOptions,
    logger: Logger,
    primary: Arc<dyn Connector>,
    fallback: Option<Arc<dyn Connector>>,
    core: Mutex<Core>,
    listeners: Mutex<HashMap<ConnectionStatus, Vec<StatusCallback>>>,
    shutdown: watch::Sender<bool>,
}

/// A connection to a relay. Cheap to clone; dropping the last clone
/// closes the transport and stops reconnecting.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<PresenceInner>,
}

/// Connect to `url` over WebSocket, negotiating `prsc.v1` first and falling
/// back to plain WebSocket when the relay does not speak it.
///
/// Resolves once the transport is open. A failed first connect (a refusal,
/// or an unsupported transport with `auto_downgrade` off) is returned as an
/// error; backoff and reconnect only apply after the first successful open.
pub async fn create_presence(url: &str, options: PresenceOptions) -> Result<Presence, PresenceError> {
    Presence::builder(url, options).connect().await
}

/// Configures connectors and listeners before the first connect.
pub struct PresenceBuilder {
    url: String,
    options: PresenceOptions,
    primary: Arc<dyn Connector>,
    fallback: Option<Arc<dyn Connector>>,
    listeners: Vec<(ConnectionStatus, StatusCallback)>,
    allow_insecure: bool,
}

impl PresenceBuilder {
    pub fn primary(mut self, connector: impl Connector + 'static) -> Self {
        self.primary = Arc::new(connector);
        self
    }

    pub fn fallback(mut self, connector: impl Connector + 'static) -> Self {
        self.fallback = Some(Arc::new(connector));
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    /// Accept `http://` and `ws://` for relays on a trusted local network.
    pub fn allow_insecure(mut self) -> Self {
        self.allow_insecure = true;
        self
    }

    /// Register a status listener that also sees the first connect.
    pub fn on(mut self, status: ConnectionStatus, callback: impl Fn(&StatusEvent) + Send + Sync + 'static) -> Self {
        self.listeners.push((status, Arc::new(callback)));
        self
    }

    pub async fn connect(self) -> Result<Presence, PresenceError> {
        let secure = ["https://", "wss://"];
        let insecure = ["http://", "ws://"];
        let accepted = secure.iter().any(|s| self.url.starts_with(s))
            || (self.allow_insecure && insecure.iter().any(|s| self.url.starts_with(s)));
        if !accepted {
            return Err(PresenceError::InvalidUrl(self.url));
        }
        let public_key = match self.options.public_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return Err(PresenceError::InvalidOptions("publicKey is required".to_string())),
        };

        let id = self
            .options
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{separator}publickey={}&id={}",
            self.url,
            urlencoding::encode(&public_key),
            urlencoding::encode(&id),
        );

        let mut listeners: HashMap<ConnectionStatus, Vec<StatusCallback>> = HashMap::new();
        for (status, callback) in self.listeners {
            listeners.entry(status).or_default().push(callback);
        }

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(PresenceInner {
            url,
            logger: Logger::new(self.options.debug, "presence"),
            id: id.clone(),
            options: self.options,
            primary: self.primary,
            fallback: self.fallback,
            core: Mutex::new(Core {
                status: ConnectionStatus::Closed,
                state: State::new(id),
                channels: BTreeMap::new(),
                transport: None,
                downgraded: false,
                retry_count: 0,
                shut_down: false,
            }),
            listeners: Mutex::new(listeners),
            shutdown,
        });

        inner.notify(ConnectionStatus::Connecting, "Attempting to establish a connection.");
        let transport = inner.open_transport().await.map_err(|e| {
            inner.logger.warn(format_args!("initial connect failed: {e}"));
            inner.notify(ConnectionStatus::Closed, "Connection could not be established.");
            PresenceError::Transport(e)
        })?;
        inner.opened(transport.clone());

        tokio::spawn(supervise(
            Arc::downgrade(&inner),
            transport,
            inner.shutdown.subscribe(),
        ));
        Ok(Presence { inner })
    }
}

impl Presence {
    pub fn builder(url: impl Into<String>, options: PresenceOptions) -> PresenceBuilder {
        PresenceBuilder {
            url: url.into(),
            options,
            primary: Arc::new(WebSocketConnector::negotiated()),
            fallback: Some(Arc::new(WebSocketConnector::plain())),
            listeners: Vec::new(),
            allow_insecure: false,
        }
    }

    /// The local participant id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Connection-level local state, including every merged join patch.
    pub fn state(&self) -> State {
        self.inner.core.lock().state.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.core.lock().status
    }

    pub fn is_downgraded(&self) -> bool {
        self.inner.core.lock().downgraded
    }

    /// Consecutive reconnect attempts since the transport was last open.
    pub fn retry_count(&self) -> u32 {
        self.inner.core.lock().retry_count
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.inner.core.lock().channels.get(id).cloned()
    }

    /// Ids in the channel directory, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.inner.core.lock().channels.keys().cloned().collect()
    }

    /// Listen for transitions into `status`. Listeners run in registration
    /// order on every transition, repeated ones included.
    pub fn on(&self, status: ConnectionStatus, callback: impl Fn(&StatusEvent) + Send + Sync + 'static) {
        self.inner
            .listeners
            .lock()
            .entry(status)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Join `channel_id`, merging `patch` into the connection-level state
    /// first. Resolves once the relay has acknowledged the join.
    pub async fn join_channel(&self, channel_id: &str, patch: Option<State>) -> Result<Channel, PresenceError> {
        let (channel, transport, replaced) = {
            let mut core = self.inner.core.lock();
            if core.shut_down {
                return Err(PresenceError::Closed);
            }
            if let Some(patch) = &patch {
                core.state.merge(patch);
            }
            let transport = core
                .transport
                .clone()
                .filter(|t| !t.is_closed())
                .ok_or(TransportError::Closed)?;
            let channel = Channel::new(
                channel_id,
                core.state.clone(),
                Delivery::from_reliable(self.inner.options.reliable),
                self.inner.options.debug,
            );
            let replaced = core.channels.insert(channel_id.to_string(), channel.clone());
            (channel, transport, replaced)
        };
        if let Some(old) = replaced {
            old.detach();
        }

        self.inner.logger.log(format_args!("joining channel {channel_id}"));
        let joined = channel.attach(transport)?;
        joined.await.map_err(|_| ChannelError::JoinAborted)?;
        Ok(channel)
    }

    /// Leave `channel_id` and drop it from the directory, so it is not
    /// rejoined after a reconnect.
    pub fn leave_channel(&self, channel_id: &str) {
        let channel = self.inner.core.lock().channels.remove(channel_id);
        if let Some(channel) = channel {
            channel.leave();
        }
    }

    /// Leave every channel, close the transport and stop reconnecting.
    pub fn close(&self) {
        let (channels, transport) = {
            let mut core = self.inner.core.lock();
            if core.shut_down {
                return;
            }
            core.shut_down = true;
            (std::mem::take(&mut core.channels), core.transport.take())
        };
        for channel in channels.values() {
            channel.leave();
        }
        if let Some(transport) = transport {
            transport.close();
        }
        let _ = self.inner.shutdown.send(true);
        self.inner
            .notify(ConnectionStatus::Closed, "Connection closed by client.");
    }
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Presence")
            .field("id", &self.inner.id)
            .field("status", &core.status)
            .field("channels", &core.channels.len())
            .field("downgraded", &core.downgraded)
            .finish()
    }
}

impl PresenceInner {
    fn notify(&self, status: ConnectionStatus, details: &str) {
        self.core.lock().status = status;
        self.logger.log(format_args!("status {}: {details}", status.as_str()));

        let callbacks: Vec<StatusCallback> = self
            .listeners
            .lock()
            .get(&status)
            .cloned()
            .unwrap_or_default();
        let event = StatusEvent {
            status,
            code: status.code(),
            details: details.to_string(),
        };
        for callback in callbacks {
            callback(&event);
        }
    }

    fn is_shut_down(&self) -> bool {
        self.core.lock().shut_down
    }

    /// Connect with the active connector, downgrading once on a capability
    /// mismatch.
    async fn open_transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let downgraded = self.core.lock().downgraded;
        let connector = match (&self.fallback, downgraded) {
            (Some(fallback), true) => fallback.clone(),
            _ => self.primary.clone(),
        };

        match connector.connect(&self.url).await {
            Ok(transport) => Ok(transport),
            Err(e) if e.is_capability_mismatch() && !downgraded && self.options.auto_downgrade => {
                let Some(fallback) = self.fallback.clone() else {
                    return Err(e);
                };
                self.logger.warn(format_args!(
                    "{} unsupported ({e}), downgrading to {}",
                    connector.name(),
                    fallback.name()
                ));
                self.core.lock().downgraded = true;
                fallback.connect(&self.url).await
            }
            Err(e) => Err(e),
        }
    }

    fn opened(&self, transport: Arc<dyn Transport>) {
        {
            let mut core = self.core.lock();
            core.transport = Some(transport);
            core.retry_count = 0;
        }
        self.notify(ConnectionStatus::Open, "Connection established successfully.");
    }

    /// Attach every channel in the directory to `transport` again, each
    /// with its last local state.
    fn rejoin(&self, transport: &Arc<dyn Transport>) {
        let channels: Vec<Channel> = self.core.lock().channels.values().cloned().collect();
        for channel in channels {
            match channel.attach(transport.clone()) {
                Ok(_joined) => {
                    self.logger.log(format_args!("rejoining channel {}", channel.id()));
                }
                Err(e) => {
                    self.logger.warn(format_args!("rejoin of channel {} failed: {e}", channel.id()));
                }
            }
        }
    }
}

impl Drop for PresenceInner {
    fn drop(&mut self) {
        if let Some(transport) = self.core.get_mut().transport.take() {
            transport.close();
        }
    }
}

/// Watches the live transport and replaces it when it closes.
async fn supervise(
    presence: Weak<PresenceInner>,
    mut transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let reason = tokio::select! {
            reason = transport.closed() => reason,
            _ = shutdown.changed() => return,
        };

        let Some(inner) = presence.upgrade() else {
            return;
        };
        if inner.is_shut_down() {
            return;
        }
        inner.logger.log(format_args!("transport closed: {reason:?}"));
        inner.core.lock().transport = None;
        inner.notify(ConnectionStatus::Closed, "Connection has been disconnected.");
        let interval = inner.options.reconnect_interval;
        let max_attempts = inner.options.max_reconnect_attempts;
        drop(inner);

        transport = loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }

            let Some(inner) = presence.upgrade() else {
                return;
            };
            if inner.is_shut_down() {
                return;
            }
            let attempt = {
                let mut core = inner.core.lock();
                if max_attempts.is_some_and(|max| core.retry_count >= max) {
                    None
                } else {
                    core.retry_count += 1;
                    Some(core.retry_count)
                }
            };
            let Some(attempt) = attempt else {
                inner.logger.warn(format_args!("retry count exceeded"));
                inner.core.lock().shut_down = true;
                inner.notify(ConnectionStatus::Closed, "Reconnect attempts exhausted.");
                return;
            };

            inner.notify(ConnectionStatus::Connecting, "Attempting to reconnect.");
            match inner.open_transport().await {
                Ok(transport) => {
                    inner.opened(transport.clone());
                    inner.rejoin(&transport);
                    break transport;
                }
                Err(e) => {
                    inner.logger.warn(format_args!("reconnect attempt {attempt} failed: {e}"));
                    inner.notify(ConnectionStatus::Closed, "Reconnect attempt failed.");
                }
            }
        };
    }
}

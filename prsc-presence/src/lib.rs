//! # prsc-presence — Real-time multi-user presence
//!
//! Join named channels on a relay, broadcast application events and keep a
//! reconciled view of who else is in each channel and what their state is.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   signaling frames   ┌─────────────┐
//! │  Presence   │ ◄──────────────────► │ RelayServer │
//! │ (per user)  │  MessagePack / WS    │  (central)  │
//! └──────┬──────┘                      └──────┬──────┘
//!        │ channels                           │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌─────────────┐
//! │  Channel    │                      │  RelayHub   │
//! │ members +   │                      │ (directory, │
//! │ subscribers │                      │  fan-out)   │
//! └─────────────┘                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Signaling frames (`t`/`op`/`p`/`c`/`pl`) and participant state
//! - [`serializer`] — Lossless-or-degrading event payload encoding
//! - [`peers`] — Member-list subscriptions
//! - [`channel`] — Join handshake, reconciliation and event dispatch
//! - [`connection`] — Connect, downgrade, reconnect and rejoin
//! - [`transport`] — Transport seam plus WebSocket and in-process connectors
//! - [`relay`] — The relay participants connect to
//!
//! ## Example
//!
//! ```no_run
//! use prsc_presence::{create_presence, PresenceOptions, State};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let presence = create_presence(
//!     "https://relay.example.com/v1",
//!     PresenceOptions::new("my-public-key").with_id("alice"),
//! )
//! .await?;
//!
//! let channel = presence
//!     .join_channel("lobby", Some(State::default().with("name", "Alice")))
//!     .await?;
//! let _peers = channel.subscribe_peers(|members| println!("{} others here", members.len()));
//! let _chat = channel.subscribe("chat", |data, from| println!("{}: {data}", from.id));
//! channel.broadcast("chat", "hello")?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod logger;
pub mod peers;
pub mod protocol;
pub mod relay;
pub mod serializer;
pub mod transport;

// Re-exports for convenience
pub use channel::{Channel, ChannelError, ChannelPhase, MemberList};
pub use connection::{
    create_presence, ConnectionStatus, Presence, PresenceBuilder, PresenceError,
    PresenceOptions, StatusEvent,
};
pub use logger::Logger;
pub use peers::{PeerRegistry, Unsubscribe};
pub use protocol::{ControlOp, DataEnvelope, Peer, ProtocolError, Signal, State};
pub use relay::{RelayConfig, RelayHub, RelayServer, RelayStats};
pub use serializer::{JsonSerializer, Serialized};
pub use transport::{
    Connector, Delivery, MemoryConnector, Transport, TransportError, WebSocketConnector,
};

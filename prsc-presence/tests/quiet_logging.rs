//! Diagnostics stay silent unless a participant opts in with `debug`.
//!
//! Installs its own `log` backend, so it lives in a test binary of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{LevelFilter, Log, Metadata, Record};
use prsc_presence::{
    JsonSerializer, Logger, MemoryConnector, Presence, PresenceOptions, RelayHub, Serialized,
    TransportError,
};
use tokio::time::{timeout, Duration};

/// Counts records from the participant side. Relay records are the
/// server's own and are left out.
struct CountingLog {
    records: AtomicUsize,
}

impl Log for CountingLog {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !record.target().starts_with("prsc_presence::relay") {
            self.records.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static COUNTER: CountingLog = CountingLog {
    records: AtomicUsize::new(0),
};

fn emitted() -> usize {
    COUNTER.records.load(Ordering::SeqCst)
}

fn options(id: &str) -> PresenceOptions {
    let mut options = PresenceOptions::new("test-key").with_id(id);
    options.reconnect_interval = Duration::from_millis(20);
    options
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_no_records_without_debug() {
    log::set_logger(&COUNTER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    // Serializer degradations
    let quiet = Logger::new(false, "presence::serializer");
    let mut pairs = HashMap::new();
    pairs.insert((1u8, 2u8), "pair");
    assert!(matches!(JsonSerializer::serialize(&pairs, &quiet), Serialized::Raw(_)));
    JsonSerializer::deserialize_str("{not json", &quiet);

    // Downgrade, join, broadcast, relay drop and rejoin
    let hub = RelayHub::with_defaults();
    let primary = Arc::new(MemoryConnector::named(hub.clone(), "primary"));
    primary.fail_next(TransportError::Unsupported("no subprotocol".into()));
    let alice = Presence::builder("https://relay.local/v1", options("p1"))
        .primary(primary.clone())
        .fallback(MemoryConnector::new(hub.clone()))
        .connect()
        .await
        .unwrap();
    assert!(alice.is_downgraded());
    let bob = Presence::builder("https://relay.local/v1", options("p2"))
        .primary(MemoryConnector::new(hub.clone()))
        .connect()
        .await
        .unwrap();

    let ch1 = alice.join_channel("ch-id", None).await.unwrap();
    let ch2 = bob.join_channel("ch-id", None).await.unwrap();
    eventually(|| ch1.members().len() == 1).await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let _chat = ch2.subscribe("chat", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    ch1.broadcast("chat", &pairs).unwrap();
    eventually(|| received.load(Ordering::SeqCst) == 1).await;

    hub.disconnect_all();
    assert!(hub.members("ch-id").is_empty());
    eventually(|| hub.members("ch-id").len() == 2).await;
    alice.close();
    bob.close();

    assert_eq!(emitted(), 0);

    // The same degradation is reported once a logger is enabled.
    let loud = Logger::new(true, "presence::serializer");
    JsonSerializer::serialize(&pairs, &loud);
    assert!(emitted() > 0);
}

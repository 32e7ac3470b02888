#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-transport** -- the pub/sub + KV + consumer-telemetry contract the
//! Happen core consumes, and an in-memory implementation of it.
//!
//! The core never talks to a wire transport directly; it only ever sees the
//! [`Transport`] trait. A JetStream-backed implementation is an external
//! collaborator and out of scope for this crate -- [`InMemoryTransport`]
//! exists so the core can be exercised in tests and single-process
//! bootstraps without one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::broadcast;
use tokio::time::timeout as tokio_timeout;

/// Errors surfaced by a [`Transport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The subject string used disallowed characters, or used a wildcard in
    /// a publish (wildcards are subscription-only).
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    /// `request` timed out waiting for a reply.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
    /// The named KV key was not present.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// The named stream/consumer was not known to this transport.
    #[error("unknown consumer {consumer:?} on stream {stream:?}")]
    UnknownConsumer {
        /// Stream name.
        stream: String,
        /// Consumer name.
        consumer: String,
    },
    /// Underlying channel closed unexpectedly.
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Per-consumer telemetry snapshot, as exposed by a JetStream-style consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Highest sequence number delivered to this consumer.
    pub delivered: u64,
    /// Highest sequence number acknowledged (the ack floor).
    pub ack_floor: u64,
    /// Messages delivered but not yet acknowledged.
    pub num_pending: u64,
    /// Count of redelivered messages (a proxy for delivery failures).
    pub num_redelivered: u64,
    /// When the consumer was created, epoch seconds.
    pub created_epoch_secs: i64,
}

/// Subject syntax: `[A-Za-z0-9._-]`, plus `*`/`>` wildcards in subscriptions only.
fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<(), TransportError> {
    let ok = subject.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '_'
            || c == '-'
            || (allow_wildcards && (c == '*' || c == '>'))
    });
    if !ok || subject.is_empty() {
        return Err(TransportError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Compile a subscription subject pattern (`*` = one segment, `>` = tail) to
/// a regex over dot-separated subjects.
fn compile_subject_pattern(pattern: &str) -> Regex {
    let segments: Vec<String> = pattern
        .split('.')
        .enumerate()
        .map(|(i, seg)| match seg {
            "*" => "[^.]+".to_string(),
            ">" => {
                debug_assert!(i == pattern.split('.').count() - 1, "'>' must be the last token");
                ".+".to_string()
            }
            other => regex::escape(other),
        })
        .collect();
    let src = format!("^{}$", segments.join("\\."));
    Regex::new(&src).expect("compiled subject pattern is always valid regex")
}

/// An active subscription. Dropping it unsubscribes -- the idiomatic Rust
/// analogue of the "unsubscribe closure" the contract calls for.
pub struct Subscription {
    matcher: Regex,
    rx: broadcast::Receiver<(String, Vec<u8>)>,
}

impl Subscription {
    /// Wait for the next message whose subject matches this subscription's
    /// pattern, skipping any that don't.
    pub async fn recv(&mut self) -> Result<(String, Vec<u8>), TransportError> {
        loop {
            match self.rx.recv().await {
                Ok((subject, bytes)) => {
                    if self.matcher.is_match(&subject) {
                        return Ok((subject, bytes));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransportError::ChannelClosed)
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "transport subscriber lagged, messages dropped");
                }
            }
        }
    }
}

/// A per-bucket key/value store with per-key history collapsed to latest
/// value (sufficient for the state/temporal persistence this core needs).
#[async_trait]
pub trait KvBucket: Send + Sync {
    /// Fetch the current value for `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError>;
    /// Write `value` under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), TransportError>;
    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), TransportError>;
    /// List all keys currently present.
    async fn keys(&self) -> Result<Vec<String>, TransportError>;
}

/// The pub/sub + KV + consumer-telemetry surface the Happen core consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort, ordered-per-subject publish.
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a subject pattern (`*` one segment, `>` tail).
    fn subscribe(&self, subject_pattern: &str) -> Result<Subscription, TransportError>;

    /// Synchronous request/response with a timeout. Implementations without
    /// native request/response may synthesize it via correlation-keyed
    /// pending slots; `InMemoryTransport` does so directly.
    async fn request(
        &self,
        subject: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Obtain (creating on first use) the named KV bucket.
    fn kv(&self, bucket: &str) -> Arc<dyn KvBucket>;

    /// List known consumer names for `stream`.
    async fn consumers_list(&self, stream: &str) -> Result<Vec<String>, TransportError>;

    /// Fetch telemetry for one consumer.
    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, TransportError>;
}

//─────────────────────────────
//  In-memory implementation
//─────────────────────────────

struct InMemoryKv {
    store: DashMap<String, Vec<u8>>,
}

#[async_trait]
impl KvBucket for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.store.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), TransportError> {
        self.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        self.store.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.store.iter().map(|e| e.key().clone()).collect())
    }
}

/// In-process reference [`Transport`]: a broadcast bus for pub/sub, a
/// `DashMap`-backed KV store per bucket, and settable consumer telemetry for
/// driving the Flow-Balance monitor in tests.
pub struct InMemoryTransport {
    tx: broadcast::Sender<(String, Vec<u8>)>,
    buckets: DashMap<String, Arc<InMemoryKv>>,
    consumers: DashMap<(String, String), ConsumerInfo>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with the given broadcast ring buffer
    /// capacity.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self {
            tx,
            buckets: DashMap::new(),
            consumers: DashMap::new(),
        })
    }

    /// Install or update telemetry for `consumer` on `stream`. Used by tests
    /// and local harnesses to drive Flow-Balance without a real JetStream.
    pub fn set_consumer_info(&self, stream: &str, consumer: &str, info: ConsumerInfo) {
        self.consumers
            .insert((stream.to_string(), consumer.to_string()), info);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            buckets: DashMap::new(),
            consumers: DashMap::new(),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, subject: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        validate_subject(subject, false)?;
        // A lagging/absent receiver is not a publish failure: subscribers
        // are responsible for keeping up.
        let _ = self.tx.send((subject.to_string(), bytes));
        Ok(())
    }

    fn subscribe(&self, subject_pattern: &str) -> Result<Subscription, TransportError> {
        validate_subject(subject_pattern, true)?;
        Ok(Subscription {
            matcher: compile_subject_pattern(subject_pattern),
            rx: self.tx.subscribe(),
        })
    }

    async fn request(
        &self,
        subject: &str,
        bytes: Vec<u8>,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        // No native request/response: synthesize it by subscribing to the
        // reply inbox before publishing, matching the "core synthesizes
        // request/response via correlation-id-keyed pending slots" fallback.
        let reply_subject = format!("{subject}.reply.{}", uuid_like());
        let mut sub = self.subscribe(&reply_subject)?;
        self.publish(subject, bytes).await?;
        match tokio_timeout(deadline, sub.recv()).await {
            Ok(Ok((_, bytes))) => Ok(bytes),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::RequestTimeout(deadline)),
        }
    }

    fn kv(&self, bucket: &str) -> Arc<dyn KvBucket> {
        let entry = self
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| {
                Arc::new(InMemoryKv {
                    store: DashMap::new(),
                })
            });
        entry.clone()
    }

    async fn consumers_list(&self, stream: &str) -> Result<Vec<String>, TransportError> {
        Ok(self
            .consumers
            .iter()
            .filter(|e| e.key().0 == stream)
            .map(|e| e.key().1.clone())
            .collect())
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, TransportError> {
        self.consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .map(|e| *e.value())
            .ok_or_else(|| TransportError::UnknownConsumer {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_subscribe_round_trip() {
        let transport = InMemoryTransport::new(16);
        let mut sub = transport.subscribe("happen.events.order.created").unwrap();
        transport
            .publish("happen.events.order.created", b"payload".to_vec())
            .await
            .unwrap();
        let (subject, bytes) = sub.recv().await.unwrap();
        assert_eq!(subject, "happen.events.order.created");
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn wildcard_subscription_matches_one_segment() {
        let transport = InMemoryTransport::new(16);
        let mut sub = transport.subscribe("happen.events.*").unwrap();
        transport.publish("happen.events.order", vec![1]).await.unwrap();
        transport
            .publish("happen.events.order.created", vec![2])
            .await
            .unwrap();
        let (subject, _) = sub.recv().await.unwrap();
        assert_eq!(subject, "happen.events.order");
    }

    #[tokio::test]
    async fn tail_wildcard_matches_everything_after_prefix() {
        let transport = InMemoryTransport::new(16);
        let mut sub = transport.subscribe("happen.events.>").unwrap();
        transport
            .publish("happen.events.order.created", vec![1])
            .await
            .unwrap();
        let (subject, _) = sub.recv().await.unwrap();
        assert_eq!(subject, "happen.events.order.created");
    }

    #[tokio::test]
    async fn publish_rejects_wildcards() {
        let transport = InMemoryTransport::new(16);
        let err = transport.publish("happen.events.*", vec![]).await;
        assert!(matches!(err, Err(TransportError::InvalidSubject(_))));
    }

    #[tokio::test]
    async fn kv_put_get_delete() {
        let transport = InMemoryTransport::new(16);
        let kv = transport.kv("node-a");
        assert_eq!(kv.get("state").await.unwrap(), None);
        kv.put("state", b"{}".to_vec()).await.unwrap();
        assert_eq!(kv.get("state").await.unwrap(), Some(b"{}".to_vec()));
        kv.delete("state").await.unwrap();
        assert_eq!(kv.get("state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn request_times_out_without_a_responder() {
        let transport = InMemoryTransport::new(16);
        let result = transport
            .request("happen.system.ping", vec![], Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TransportError::RequestTimeout(_))));
    }

    #[tokio::test]
    async fn consumer_info_round_trips_through_setter() {
        let transport = InMemoryTransport::new(16);
        transport.set_consumer_info(
            "orders",
            "c1",
            ConsumerInfo {
                delivered: 100,
                ack_floor: 40,
                num_pending: 60,
                num_redelivered: 2,
                created_epoch_secs: 0,
            },
        );
        let info = transport.consumer_info("orders", "c1").await.unwrap();
        assert_eq!(info.delivered, 100);
        assert_eq!(transport.consumers_list("orders").await.unwrap(), vec!["c1"]);
    }
}

//! Subscription registry: topic-keyed pools of bounded subscriber queues with fan-out publish.
//!
//! Each topic holds a mutex-protected list of subscribers. `publish` snapshots the matching
//! subscribers under the lock, delivers without holding it, then prunes the ones that went away.
//! Cancellation is observed at the next delivery attempt; the registry owns the only sender of
//! every queue, so removing a subscriber closes its queue exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default bound on subscribers per topic.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 1000;
/// Default depth of each subscriber's queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;
/// Default time a publish waits on one full subscriber queue.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// A channel in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Everything read from the hub connection.
    Hub,
    /// Wildcard: every peer line, every payload, every UDP datagram.
    All,
    /// One peer, keyed by nick.
    Peer(String),
}

impl Topic {
    /// Topic for a peer nick; `"*"` maps to the wildcard.
    pub fn peer(nick: &str) -> Topic {
        if nick == "*" {
            Topic::All
        } else {
            Topic::Peer(nick.to_string())
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Hub => f.write_str("hub"),
            Topic::All => f.write_str("*"),
            Topic::Peer(nick) => f.write_str(nick),
        }
    }
}

impl std::str::FromStr for Topic {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "hub" => Topic::Hub,
            other => Topic::peer(other),
        })
    }
}

/// What the registry carries. Consumers branch on the kind instead of sniffing bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One protocol line, terminator included, exactly as received.
    Line(String),
    /// Raw bytes announced by `$ADCSND`.
    Payload(Vec<u8>),
}

impl Message {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Line(line) => line.as_bytes(),
            Message::Payload(bytes) => bytes,
        }
    }

    pub fn as_line(&self) -> Option<&str> {
        match self {
            Message::Line(line) => Some(line),
            Message::Payload(_) => None,
        }
    }
}

/// Predicate over a message's raw bytes. Only matching messages reach the subscriber.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&[u8]) -> bool + Send + Sync>);

impl Filter {
    pub fn new(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Filter(Arc::new(f))
    }

    /// Match with a byte regex.
    pub fn regex(re: regex::bytes::Regex) -> Self {
        Filter::new(move |bytes| re.is_match(bytes))
    }

    /// Match lines starting with `prefix`, e.g. `"$SR "` for search results.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        Filter::new(move |bytes| bytes.starts_with(&prefix))
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        (self.0)(bytes)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

/// Consumer side of a registration. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Next message, or `None` once cancelled or closed by the registry.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Stop receiving. The registry releases the queue on its next delivery attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle for cancelling from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Registry side of a registration.
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    filter: Option<Filter>,
}

impl Subscriber {
    fn is_gone(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Topic pools shared by every session and consumer.
pub struct Registry {
    pools: Mutex<HashMap<Topic, Vec<Subscriber>>>,
    next_id: AtomicU64,
    max_subscribers: usize,
    queue_depth: usize,
    delivery_timeout: Duration,
}

impl Registry {
    pub fn new(max_subscribers: usize, queue_depth: usize, delivery_timeout: Duration) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_subscribers,
            queue_depth: queue_depth.max(1),
            delivery_timeout,
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Subscriber>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber on `topic`. Fails when the topic's pool is full.
    pub fn subscribe(&self, topic: Topic, filter: Option<Filter>) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let cancel = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pools = self.pools();
            let pool = pools.entry(topic.clone()).or_default();
            pool.retain(|s| !s.is_gone());
            if pool.len() >= self.max_subscribers {
                return Err(Error::CapacityExceeded {
                    topic,
                    limit: self.max_subscribers,
                });
            }
            pool.push(Subscriber {
                id,
                tx,
                cancel: cancel.clone(),
                filter,
            });
        }
        debug!("subscriber {} added on {}", id, topic);
        Ok(Subscription {
            id,
            topic,
            rx,
            cancel,
        })
    }

    /// Cancel and drop a subscription now.
    pub fn unsubscribe(&self, sub: Subscription) {
        sub.cancel();
        let mut pools = self.pools();
        if let Some(pool) = pools.get_mut(&sub.topic) {
            pool.retain(|s| s.id != sub.id);
        }
    }

    /// Deliver `msg` to every live subscriber of `topic` whose filter matches.
    /// Returns how many subscribers received it.
    pub async fn publish(&self, topic: &Topic, msg: Message) -> usize {
        let targets: Vec<(u64, mpsc::Sender<Message>, CancellationToken)> = {
            let mut pools = self.pools();
            let Some(pool) = pools.get_mut(topic) else {
                return 0;
            };
            pool.retain(|s| !s.is_gone());
            pool.iter()
                .filter(|s| s.filter.as_ref().map_or(true, |f| f.matches(msg.as_bytes())))
                .map(|s| (s.id, s.tx.clone(), s.cancel.clone()))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx, cancel) in targets {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => gone.push(id),
                res = tx.send_timeout(msg.clone(), self.delivery_timeout) => match res {
                    Ok(()) => delivered += 1,
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(
                            "subscriber {} on {} stuck for {:?}; dropping message",
                            id, topic, self.delivery_timeout
                        );
                    }
                    Err(SendTimeoutError::Closed(_)) => gone.push(id),
                },
            }
        }
        if !gone.is_empty() {
            let mut pools = self.pools();
            if let Some(pool) = pools.get_mut(topic) {
                pool.retain(|s| !gone.contains(&s.id));
            }
            debug!("removed {} subscribers from {}", gone.len(), topic);
        }
        delivered
    }

    /// Create an empty pool for `topic` if none exists.
    pub fn ensure_topic(&self, topic: Topic) {
        self.pools().entry(topic).or_default();
    }

    /// Detach and close every subscriber on `topic`. Returns how many were closed.
    pub fn remove_topic(&self, topic: &Topic) -> usize {
        let removed = self.pools().remove(topic);
        let n = removed.map_or(0, |pool| pool.len());
        if n > 0 {
            debug!("closed {} subscribers on {}", n, topic);
        }
        n
    }

    /// Live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.pools()
            .get(topic)
            .map_or(0, |pool| pool.iter().filter(|s| !s.is_gone()).count())
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.pools().keys().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_SUBSCRIBERS,
            DEFAULT_QUEUE_DEPTH,
            DEFAULT_DELIVERY_TIMEOUT,
        )
    }
}

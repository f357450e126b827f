//! Outbound router: one bounded queue and one writer task per destination.
//!
//! Producers call `send` from any task; the writer task is the only code that touches the
//! destination's socket, so payloads reach the wire whole and in submission order.
//! Queues are created on first use and buffer until a writer is attached. A torn-down
//! destination rejects sends until it is connected again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Default depth of each destination queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1000;
/// Default bound on destinations holding a queue but no live writer.
pub const DEFAULT_MAX_IDLE_ROUTES: usize = 64;

/// Write half handed to the router once a session has a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where an outbound payload goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Hub,
    Peer(String),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Hub => f.write_str("hub"),
            Destination::Peer(nick) => f.write_str(nick),
        }
    }
}

/// A payload tagged with its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub destination: Destination,
    pub payload: Vec<u8>,
}

/// A writer attached by `connected`. `generation` identifies it in `release`.
#[derive(Debug)]
pub struct Attachment {
    pub generation: u64,
    pub writer: JoinHandle<()>,
}

struct Route {
    /// `None` while dead: after a write failure or teardown, until the next `connected`.
    tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Receiver waiting for a writer to be attached.
    pending: Option<mpsc::Receiver<Vec<u8>>>,
    /// Generation of the current writer; 0 before the first one.
    generation: u64,
}

impl Route {
    fn is_dead(&self) -> bool {
        self.tx.is_none()
    }

    /// Dead, or buffering with nobody to write.
    fn is_idle(&self) -> bool {
        self.tx.is_none() || self.pending.is_some()
    }

    fn kill(&mut self) {
        self.tx = None;
        self.pending = None;
    }
}

pub struct Router {
    routes: Mutex<HashMap<Destination, Route>>,
    next_generation: AtomicU64,
    queue_depth: usize,
    max_idle: usize,
}

impl Router {
    pub fn new(queue_depth: usize, max_idle_routes: usize) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            max_idle: max_idle_routes.max(1),
        }
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<Destination, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_route(&self) -> Route {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        Route {
            tx: Some(tx),
            pending: Some(rx),
            generation: 0,
        }
    }

    /// Make room for one more idle route. Peer tombstones are evicted first.
    fn make_room(&self, routes: &mut HashMap<Destination, Route>, destination: &Destination) -> Result<()> {
        if routes.values().filter(|r| r.is_idle()).count() < self.max_idle {
            return Ok(());
        }
        routes.retain(|d, r| *d == Destination::Hub || !r.is_dead());
        if routes.values().filter(|r| r.is_idle()).count() < self.max_idle {
            return Ok(());
        }
        warn!(
            "not buffering for {}: {} destinations already wait for a connection",
            destination, self.max_idle
        );
        Err(Error::DestinationClosed(destination.clone()))
    }

    /// Queue `payload` for `destination`. Waits while the queue is full.
    /// A destination never seen before buffers until `connected`; a torn-down one fails.
    pub async fn send(&self, destination: Destination, payload: impl Into<Vec<u8>>) -> Result<()> {
        let tx = {
            let mut routes = self.routes();
            if !routes.contains_key(&destination) {
                self.make_room(&mut routes, &destination)?;
                routes.insert(destination.clone(), self.new_route());
            }
            match routes.get(&destination).and_then(|r| r.tx.clone()) {
                Some(tx) => tx,
                None => return Err(Error::DestinationClosed(destination)),
            }
        };
        tx.send(payload.into())
            .await
            .map_err(|_| Error::DestinationClosed(destination))
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.send(envelope.destination, envelope.payload).await
    }

    /// Attach a writer for `destination` and start its serializer task.
    /// Payloads queued before the connection existed are written first.
    pub fn connected(self: &Arc<Self>, destination: Destination, writer: BoxWriter) -> Attachment {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let mut routes = self.routes();
            let route = routes
                .entry(destination.clone())
                .or_insert_with(|| self.new_route());
            route.generation = generation;
            match (route.tx.is_some(), route.pending.take()) {
                (true, Some(rx)) => rx,
                // Dead, or a writer is already running: start over with a fresh queue.
                _ => {
                    let (tx, rx) = mpsc::channel(self.queue_depth);
                    route.tx = Some(tx);
                    rx
                }
            }
        };
        info!("{} connected", destination);
        let router = Arc::clone(self);
        let writer = tokio::spawn(async move { router.run_writer(destination, generation, rx, writer).await });
        Attachment { generation, writer }
    }

    /// Attach the hub connection's write half.
    pub fn attach_hub(self: &Arc<Self>, writer: BoxWriter) -> Attachment {
        self.connected(Destination::Hub, writer)
    }

    /// Tear down `destination`. Its writer finishes what is queued and exits;
    /// later sends fail with `DestinationClosed` until the next `connected`.
    pub fn disconnected(&self, destination: &Destination) {
        if let Some(route) = self.routes().get_mut(destination) {
            if !route.is_dead() {
                info!("{} disconnected", destination);
            }
            route.kill();
        }
    }

    /// Like `disconnected`, but only while `generation` is still the current writer.
    /// Returns whether the destination was torn down.
    pub fn release(&self, destination: &Destination, generation: u64) -> bool {
        match self.routes().get_mut(destination) {
            Some(route) if route.generation == generation => {
                if !route.is_dead() {
                    info!("{} disconnected", destination);
                }
                route.kill();
                true
            }
            _ => {
                debug!("{}: writer {} already replaced", destination, generation);
                false
            }
        }
    }

    /// Whether `destination` currently accepts payloads.
    pub fn is_open(&self, destination: &Destination) -> bool {
        self.routes()
            .get(destination)
            .map_or(false, |r| r.tx.as_ref().map_or(false, |tx| !tx.is_closed()))
    }

    /// Destinations known to the router, live or not.
    pub fn route_count(&self) -> usize {
        self.routes().len()
    }

    fn mark_dead(&self, destination: &Destination, generation: u64) {
        let mut routes = self.routes();
        if let Some(route) = routes.get_mut(destination) {
            if route.generation == generation {
                route.kill();
            }
        }
    }

    async fn run_writer(
        self: Arc<Self>,
        destination: Destination,
        generation: u64,
        mut rx: mpsc::Receiver<Vec<u8>>,
        mut writer: BoxWriter,
    ) {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = write_payload(&mut writer, &payload).await {
                warn!("write to {} failed: {}", destination, e);
                self.mark_dead(&destination, generation);
                rx.close();
                return;
            }
            debug!("client -> {}: {}", destination, String::from_utf8_lossy(&payload));
        }
        let _ = writer.shutdown().await;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH, DEFAULT_MAX_IDLE_ROUTES)
    }
}

async fn write_payload(writer: &mut BoxWriter, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    /// Writer that fails every write.
    struct Broken;

    impl AsyncWrite for Broken {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn buffers_until_connected_then_writes_in_order() {
        let router = Arc::new(Router::default());
        let bob = Destination::Peer("bob".into());
        router.send(bob.clone(), "$Lock x|").await.unwrap();
        router.send(bob.clone(), "$Key y|").await.unwrap();

        let (local, mut remote) = duplex(1024);
        router.connected(bob.clone(), Box::new(local));
        router.send(bob.clone(), "$Direction Download 1|").await.unwrap();
        router.disconnected(&bob);

        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "$Lock x|$Key y|$Direction Download 1|");
    }

    #[tokio::test]
    async fn concurrent_producers_never_interleave() {
        let router = Arc::new(Router::default());
        let (local, mut remote) = duplex(64);
        router.attach_hub(Box::new(local));

        let mut tasks = Vec::new();
        for p in 0..8 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let msg = format!("<p{}> message number {} with some padding|", p, i);
                    router.send(Destination::Hub, msg).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        router.disconnected(&Destination::Hub);

        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.split_terminator('|').collect();
        assert_eq!(lines.len(), 400);
        for p in 0..8 {
            let prefix = format!("<p{}> ", p);
            let mine: Vec<&str> = lines.iter().copied().filter(|l| l.starts_with(&prefix)).collect();
            assert_eq!(mine.len(), 50);
            for (i, l) in mine.iter().enumerate() {
                assert_eq!(*l, format!("<p{}> message number {} with some padding", p, i));
            }
        }
    }

    #[tokio::test]
    async fn write_failure_closes_destination() {
        let router = Arc::new(Router::default());
        let bob = Destination::Peer("bob".into());
        let attached = router.connected(bob.clone(), Box::new(Broken));
        router.send(bob.clone(), "$MyNick me|").await.unwrap();
        attached.writer.await.unwrap();

        assert!(!router.is_open(&bob));
        assert!(matches!(
            router.send(bob.clone(), "again|").await,
            Err(Error::DestinationClosed(Destination::Peer(_)))
        ));
    }

    #[tokio::test]
    async fn reconnect_revives_dead_destination() {
        let router = Arc::new(Router::default());
        let bob = Destination::Peer("bob".into());
        let attached = router.connected(bob.clone(), Box::new(Broken));
        router.send(bob.clone(), "x|").await.unwrap();
        attached.writer.await.unwrap();

        let (local, mut remote) = duplex(64);
        router.connected(bob.clone(), Box::new(local));
        router.send(bob.clone(), "y|").await.unwrap();
        router.disconnected(&bob);
        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "y|");
    }

    #[tokio::test]
    async fn send_after_teardown_fails_until_reconnected() {
        let router = Arc::new(Router::new(4, 8));
        let (local, _remote) = duplex(64);
        router.attach_hub(Box::new(local));
        router.disconnected(&Destination::Hub);

        // More sends than the queue holds: each fails at once instead of buffering.
        for _ in 0..10 {
            let res = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                router.send(Destination::Hub, "$MyINFO|"),
            )
            .await
            .unwrap();
            assert!(matches!(res, Err(Error::DestinationClosed(Destination::Hub))));
        }

        let (local, mut remote) = duplex(64);
        router.attach_hub(Box::new(local));
        router.send(Destination::Hub, "back|").await.unwrap();
        router.disconnected(&Destination::Hub);
        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "back|");
    }

    #[tokio::test]
    async fn unconnected_destinations_are_bounded() {
        let router = Router::new(4, 8);
        let mut accepted = 0;
        for i in 0..100 {
            if router.send(Destination::Peer(format!("ghost{}", i)), "x|").await.is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 8);
        assert_eq!(router.route_count(), 8);
    }

    #[tokio::test]
    async fn tombstones_make_way_for_new_destinations() {
        let router = Arc::new(Router::new(4, 2));
        for nick in ["a", "b"] {
            let (local, _remote) = duplex(64);
            router.connected(Destination::Peer(nick.into()), Box::new(local));
            router.disconnected(&Destination::Peer(nick.into()));
        }
        router.send(Destination::Peer("c".into()), "x|").await.unwrap();
        assert_eq!(router.route_count(), 1);
    }

    #[tokio::test]
    async fn stale_release_leaves_newer_writer() {
        let router = Arc::new(Router::default());
        let bob = Destination::Peer("bob".into());
        let (first, _r1) = duplex(64);
        let old = router.connected(bob.clone(), Box::new(first));
        let (second, mut r2) = duplex(64);
        let new = router.connected(bob.clone(), Box::new(second));

        assert!(!router.release(&bob, old.generation));
        assert!(router.is_open(&bob));
        router.send(bob.clone(), "still here|").await.unwrap();

        assert!(router.release(&bob, new.generation));
        assert!(!router.is_open(&bob));
        let mut out = String::new();
        r2.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "still here|");
    }
}

//! Client facade: owns the shared registry and router, starts the hub session and active mode,
//! and exposes send/subscribe to the application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;
use sparrow_core::escape::escape;
use sparrow_core::{encode_line, Command, KeyDerivation, User};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::active::{self, ActiveEndpoint, ActiveServer, AddressPolicy, FixedAddress, PrivateTenNet};
use crate::config::Config;
use crate::context::{ClientEvent, Shared};
use crate::error::{Error, Result};
use crate::hub;
use crate::peer::PeerOptions;
use crate::registry::{Filter, Registry, Subscription, Topic};
use crate::router::{Destination, Router};

pub struct Client {
    config: Config,
    shared: Shared,
    address_policy: Box<dyn AddressPolicy>,
    /// Set while `connect_to_hub` is dialing or handshaking.
    connecting: AtomicBool,
    hub_task: Mutex<Option<JoinHandle<()>>>,
    active: Mutex<Option<ActiveServer>>,
}

impl Client {
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(
            config.registry.max_subscribers,
            config.registry.queue_depth,
            config.registry.delivery_timeout(),
        );
        let router = Router::new(config.router.queue_depth, config.router.max_idle_routes);
        let mut user = User::new(config.nick.clone());
        user.share_size = config.share_size;
        let address_policy: Box<dyn AddressPolicy> = match config.active.address {
            Some(ip) => Box::new(FixedAddress(ip)),
            None => Box::new(PrivateTenNet),
        };
        Self {
            shared: Shared::new(registry, router, user),
            config,
            address_policy,
            connecting: AtomicBool::new(false),
            hub_task: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    /// Replace how the active-mode address is chosen.
    pub fn with_address_policy(mut self, policy: impl AddressPolicy + 'static) -> Self {
        self.address_policy = Box::new(policy);
        self
    }

    /// Replace the lock-to-key derivation used by hub and peer handshakes.
    pub fn with_key_derivation(mut self, keys: impl KeyDerivation + 'static) -> Self {
        self.shared.keys = Arc::new(keys);
        self
    }

    /// Change the nick announced to the hub and peers. Not allowed while a hub session runs.
    pub fn set_nick(&self, nick: impl Into<String>) -> Result<()> {
        if self.hub_active() {
            return Err(Error::AlreadyConnected);
        }
        self.shared.user.write().unwrap_or_else(|e| e.into_inner()).nick = nick.into();
        Ok(())
    }

    pub fn nick(&self) -> String {
        self.shared.nick()
    }

    pub fn user(&self) -> User {
        self.shared.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn hub_active(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
            || lock(&self.hub_task).as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Dial `addr` and complete the hub handshake. Returns once the hub said `$Hello`;
    /// afterwards the session keeps running in the background until the connection drops.
    pub async fn connect_to_hub(&self, addr: &str) -> Result<()> {
        if self.hub_active() || self.connecting.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        let res = hub::connect(
            addr,
            self.shared.clone(),
            self.config.hub.connect_timeout(),
            self.config.hub.read_timeout(),
        )
        .await;
        let out = res.map(|task| {
            *lock(&self.hub_task) = Some(task);
        });
        self.connecting.store(false, Ordering::SeqCst);
        out
    }

    /// Start listening for peer connections and UDP search results. Idempotent.
    pub async fn start_active_mode(&self) -> Result<ActiveEndpoint> {
        if let Some(endpoint) = self.active_endpoint() {
            return Ok(endpoint);
        }
        let opts = PeerOptions {
            max_payload: self.config.peer.max_payload,
            direction_number: self.config.peer.direction_number,
        };
        let server = active::start(
            self.address_policy.as_ref(),
            self.config.active.tcp_port,
            self.config.active.udp_port,
            self.shared.clone(),
            opts,
        )
        .await?;
        let mut slot = lock(&self.active);
        // Lost a race with a concurrent start; keep the first server.
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.endpoint());
        }
        let endpoint = server.endpoint();
        *slot = Some(server);
        Ok(endpoint)
    }

    /// Endpoint of the running active mode, if any.
    pub fn active_endpoint(&self) -> Option<ActiveEndpoint> {
        lock(&self.active).as_ref().map(ActiveServer::endpoint)
    }

    /// Queue a raw payload for the hub. It must already be `|`-terminated.
    pub async fn send_to_hub(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.shared.router.send(Destination::Hub, payload).await
    }

    /// Queue a raw payload for a connected peer.
    pub async fn send_to_peer(&self, nick: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.shared
            .router
            .send(Destination::Peer(nick.to_string()), payload)
            .await
    }

    /// Public chat line, escaped.
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let line = Command::Raw(format!("<{}> {}", self.nick(), escape(text)));
        self.send_to_hub(encode_line(&line)?).await
    }

    /// Ask `nick` (through the hub) to connect to our active endpoint.
    pub async fn request_connection(&self, nick: &str) -> Result<()> {
        let endpoint = self.active_endpoint().ok_or(Error::NotActive)?;
        info!("asking {} to connect to {}", nick, endpoint.tcp_addr());
        let cmd = Command::ConnectToMe {
            nick: nick.to_string(),
            address: endpoint.tcp_addr().to_string(),
        };
        self.send_to_hub(encode_line(&cmd)?).await
    }

    pub fn subscribe_hub(&self, filter: Option<Filter>) -> Result<Subscription> {
        self.shared.registry.subscribe(Topic::Hub, filter)
    }

    /// Lines and payloads from one peer; `"*"` subscribes to every peer.
    pub fn subscribe_peer(&self, nick: &str, filter: Option<Filter>) -> Result<Subscription> {
        self.shared.registry.subscribe(Topic::peer(nick), filter)
    }

    pub fn subscribe_all(&self, filter: Option<Filter>) -> Result<Subscription> {
        self.shared.registry.subscribe(Topic::All, filter)
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.shared.router
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Message;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn config(nick: &str) -> Config {
        let mut c = Config::default();
        c.nick = nick.into();
        c.active.address = Some(Ipv4Addr::LOCALHOST);
        c
    }

    async fn read_cmd(r: &mut BufReader<TcpStream>) -> String {
        let mut buf = Vec::new();
        r.read_until(b'|', &mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Accepts one client, runs the handshake, and hands back the connection.
    async fn mock_hub() -> (String, JoinHandle<BufReader<TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(stream);
            conn.get_mut().write_all(b"$Lock ABCD Pk=mock|").await.unwrap();
            for _ in 0..4 {
                read_cmd(&mut conn).await;
            }
            conn.get_mut().write_all(b"$Hello|").await.unwrap();
            conn
        });
        (addr, task)
    }

    #[tokio::test]
    async fn nick_is_fixed_once_connected() {
        let client = Client::new(config("alice"));
        client.set_nick("bob").unwrap();
        assert_eq!(client.nick(), "bob");

        let (addr, hub) = mock_hub().await;
        client.connect_to_hub(&addr).await.unwrap();
        let _conn = hub.await.unwrap();
        assert!(matches!(client.set_nick("carol"), Err(Error::AlreadyConnected)));
        assert!(matches!(client.connect_to_hub(&addr).await, Err(Error::AlreadyConnected)));
        assert_eq!(client.user().nick, "bob");
    }

    #[tokio::test]
    async fn failed_connect_releases_nick() {
        let client = Client::new(config("alice"));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(client.connect_to_hub(&addr).await, Err(Error::ConnectionLost(_))));
        client.set_nick("bob").unwrap();
    }

    #[tokio::test]
    async fn chat_is_escaped() {
        let client = Client::new(config("alice"));
        let (addr, hub) = mock_hub().await;
        client.connect_to_hub(&addr).await.unwrap();
        let mut conn = hub.await.unwrap();

        client.send_chat("costs $5 | cheap").await.unwrap();
        assert_eq!(read_cmd(&mut conn).await, "<alice> costs &#36;5 &#124; cheap|");
    }

    #[tokio::test]
    async fn connection_request_needs_active_mode() {
        let client = Client::new(config("alice"));
        let (addr, hub) = mock_hub().await;
        client.connect_to_hub(&addr).await.unwrap();
        let mut conn = hub.await.unwrap();

        assert!(matches!(client.request_connection("bob").await, Err(Error::NotActive)));

        let ep = client.start_active_mode().await.unwrap();
        assert_eq!(client.start_active_mode().await.unwrap(), ep);
        client.request_connection("bob").await.unwrap();
        assert_eq!(
            read_cmd(&mut conn).await,
            format!("$ConnectToMe bob 127.0.0.1:{}|", ep.tcp_port)
        );
    }

    #[tokio::test]
    async fn hub_lines_reach_subscribers_and_loss_is_reported() {
        let client = Client::new(config("alice"));
        let mut events = client.events();
        let mut hub_sub = client
            .subscribe_hub(Some(Filter::prefix("$Hello")))
            .unwrap();
        let (addr, hub) = mock_hub().await;
        client.connect_to_hub(&addr).await.unwrap();
        let conn = hub.await.unwrap();

        assert_eq!(hub_sub.recv().await, Some(Message::Line("$Hello|".into())));
        assert_eq!(events.recv().await.unwrap(), ClientEvent::HubReady);

        drop(conn);
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::HubLost { .. }));
        assert_eq!(hub_sub.recv().await, None);
    }

    #[tokio::test]
    async fn wildcard_nick_subscribes_to_all() {
        let client = Client::new(config("alice"));
        let sub = client.subscribe_peer("*", None).unwrap();
        assert_eq!(sub.topic(), &Topic::All);
        assert_eq!(client.registry().subscriber_count(&Topic::All), 1);
    }

    #[tokio::test]
    async fn peer_sends_before_connection_are_buffered() {
        let client = Client::new(config("alice"));
        client.send_to_peer("bob", "$Supports ADCGet|").await.unwrap();
        assert!(client.router().is_open(&Destination::Peer("bob".into())));
    }
}

//! Hub session: dial, lock/key authentication, then republish every hub line until the connection drops.

use std::time::Duration;

use log::{debug, info, warn};
use sparrow_core::escape::unescape;
use sparrow_core::{encode_line, Command, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::context::{ClientEvent, Shared};
use crate::error::{Error, Result};
use crate::registry::{Message, Topic};
use crate::router::Destination;
use crate::transport::read_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubPhase {
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

/// Reader side of the hub connection. Writes go through the router.
pub struct HubSession<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    phase: HubPhase,
    shared: Shared,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> HubSession<R> {
    pub fn new(reader: R, shared: Shared, read_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            phase: HubPhase::Connecting,
            shared,
            read_timeout,
        }
    }

    pub fn phase(&self) -> HubPhase {
        self.phase
    }

    async fn next_line(&mut self) -> Result<String> {
        match tokio::time::timeout(self.read_timeout, read_line(&mut self.reader, &mut self.buf)).await {
            Ok(line) => line,
            Err(_) => Err(Error::ConnectionLost(format!(
                "no data from hub for {}s",
                self.read_timeout.as_secs()
            ))),
        }
    }

    /// Drive the handshake until `$Hello`. Lines seen on the way are published as usual.
    pub async fn handshake(&mut self) -> Result<()> {
        while self.phase != HubPhase::Ready {
            let line = match self.next_line().await {
                Ok(line) => line,
                Err(e) => {
                    self.phase = HubPhase::Closed;
                    return Err(e);
                }
            };
            if let Err(e) = self.handle(&line).await {
                self.phase = HubPhase::Closed;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Read until the connection fails. Always ends `Closed` and returns why.
    pub async fn run(mut self) -> Error {
        loop {
            let res = match self.next_line().await {
                Ok(line) => self.handle(&line).await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                self.phase = HubPhase::Closed;
                return e;
            }
        }
    }

    async fn handle(&mut self, line: &str) -> Result<()> {
        debug!("hub: {}", unescape(line));
        self.shared
            .registry
            .publish(&Topic::Hub, Message::Line(line.to_string()))
            .await;

        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("unparsed hub line: {}", e);
                return Ok(());
            }
        };
        match (self.phase, cmd) {
            (HubPhase::Connecting, Command::Lock { lock, .. }) => {
                let shared = &self.shared;
                let key = shared.keys.derive_key(&lock)?;
                let nick = shared.nick();
                send(shared, &Command::Key(key)).await?;
                send(shared, &Command::ValidateNick(nick.clone())).await?;
                send(shared, &Command::Version(PROTOCOL_VERSION.to_string())).await?;
                send(shared, &Command::my_info(&nick, shared.share_size())).await?;
                self.phase = HubPhase::Authenticating;
            }
            (HubPhase::Authenticating, Command::Hello(_)) => {
                info!("hub accepted {}", self.shared.nick());
                self.phase = HubPhase::Ready;
                self.shared.emit(ClientEvent::HubReady);
            }
            (HubPhase::Connecting | HubPhase::Authenticating, Command::ValidateDenide(nick)) => {
                return Err(Error::ProtocolViolation(format!("hub rejected nick {}", nick)));
            }
            (HubPhase::Connecting | HubPhase::Authenticating, Command::GetPass | Command::BadPass) => {
                return Err(Error::ProtocolViolation(
                    "hub requires a password".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Queue one command for the hub. Takes `Shared`, not the session: a `&HubSession` held
/// across the await would make the spawned future require `S: Sync`.
async fn send(shared: &Shared, cmd: &Command) -> Result<()> {
    match shared.router.send(Destination::Hub, encode_line(cmd)?).await {
        Err(Error::DestinationClosed(_)) => {
            Err(Error::ConnectionLost("hub stopped accepting writes".into()))
        }
        res => res,
    }
}

/// Run the hub protocol over an established stream. Returns once the hub said `$Hello`;
/// the returned task keeps reading until the connection drops, then reports `HubLost`.
pub async fn start<S>(stream: S, shared: Shared, read_timeout: Duration) -> Result<JoinHandle<()>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    shared.router.attach_hub(Box::new(wr));
    let mut session = HubSession::new(rd, shared.clone(), read_timeout);
    if let Err(e) = session.handshake().await {
        warn!("hub handshake failed: {}", e);
        close(&shared);
        return Err(e);
    }
    Ok(tokio::spawn(async move {
        let reason = session.run().await;
        warn!("hub session closed: {}", reason);
        close(&shared);
        shared.emit(ClientEvent::HubLost {
            reason: reason.to_string(),
        });
    }))
}

/// Dial the hub and run `start` over the connection.
pub async fn connect(
    addr: &str,
    shared: Shared,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<JoinHandle<()>> {
    info!("connecting to hub {} as {}", addr, shared.nick());
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Error::ConnectionLost(format!("{}: {}", addr, e))),
        Err(_) => return Err(Error::ConnectionLost(format!("{}: connect timed out", addr))),
    };
    start(stream, shared, read_timeout).await
}

fn close(shared: &Shared) {
    shared.router.disconnected(&Destination::Hub);
    shared.registry.remove_topic(&Topic::Hub);
}

//! Peer session: one per accepted connection. Nick exchange, lock/key, then stream lines until
//! one announced payload has been read; the session ends there.

use log::{debug, info, warn};
use rand::Rng;
use sparrow_core::{encode_line, generate_lock, Command};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::context::{ClientEvent, Shared};
use crate::error::{Error, Result};
use crate::registry::{Message, Topic};
use crate::router::Destination;
use crate::transport::read_raw_line;

/// Largest payload a peer may announce unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Start,
    AwaitingLock,
    Streaming,
    Done,
}

/// Connection record: who is on the other end and how far the handshake got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    pub remote: String,
    pub nick: Option<String>,
    pub phase: PeerPhase,
}

#[derive(Debug, Clone, Copy)]
pub struct PeerOptions {
    pub max_payload: u64,
    /// Number sent in `$Direction Download <n>`; random when unset.
    pub direction_number: Option<u32>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            direction_number: None,
        }
    }
}

struct PeerSession<R> {
    link: PeerLink,
    reader: BufReader<R>,
    buf: Vec<u8>,
    shared: Shared,
    opts: PeerOptions,
    /// Router generation of this session's writer, once attached.
    generation: Option<u64>,
}

/// Run one peer connection to completion. Never fails the caller: errors end this session only,
/// after its route and topic have been released. Returns the final connection record.
pub async fn run<S>(stream: S, remote: String, shared: Shared, opts: PeerOptions) -> PeerLink
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    info!("handling connection from {}", remote);
    let (rd, wr) = tokio::io::split(stream);
    let mut session = PeerSession {
        link: PeerLink {
            remote,
            nick: None,
            phase: PeerPhase::Start,
        },
        reader: BufReader::new(rd),
        buf: Vec::new(),
        shared,
        opts,
        generation: None,
    };
    let result = session.drive(wr).await;
    session.finish(result)
}

impl<R: AsyncRead + Unpin> PeerSession<R> {
    fn label(&self) -> &str {
        self.link.nick.as_deref().unwrap_or(&self.link.remote)
    }

    async fn drive<W>(&mut self, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let hello = encode_line(&Command::MyNick(self.shared.nick()))?;
        writer
            .write_all(&hello)
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        let mut writer = Some(writer);

        loop {
            // `$Key` and some chat are not UTF-8; only the text view is lossy.
            let raw = read_raw_line(&mut self.reader, &mut self.buf).await?;
            let cmd = Command::parse_bytes(&raw)?;
            let line = String::from_utf8_lossy(&raw).into_owned();
            debug!("{} -> client: {}", self.label(), line);

            match (&cmd, self.link.phase) {
                (Command::MyNick(nick), PeerPhase::Start) => {
                    let Some(w) = writer.take() else {
                        return Err(Error::ProtocolViolation("writer already handed off".into()));
                    };
                    self.link.nick = Some(nick.clone());
                    let attached = self
                        .shared
                        .router
                        .connected(Destination::Peer(nick.clone()), Box::new(w));
                    self.generation = Some(attached.generation);
                    self.shared.registry.ensure_topic(Topic::Peer(nick.clone()));
                    self.send(&Command::Lock {
                        lock: generate_lock(),
                        pk: Some(format!("sparrow{}", env!("CARGO_PKG_VERSION"))),
                    })
                    .await?;
                    self.link.phase = PeerPhase::AwaitingLock;
                    self.shared
                        .emit(ClientEvent::PeerConnected { nick: nick.clone() });
                }
                (Command::MyNick(_), phase) => {
                    return Err(Error::ProtocolViolation(format!(
                        "$MyNick repeated in {:?}",
                        phase
                    )));
                }
                (Command::Lock { lock, .. }, PeerPhase::AwaitingLock) => {
                    let key = self.shared.keys.derive_key(lock)?;
                    let number = self
                        .opts
                        .direction_number
                        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=32767));
                    self.send(&Command::peer_supports()).await?;
                    self.send(&Command::Direction {
                        direction: "Download".into(),
                        number,
                    })
                    .await?;
                    self.send(&Command::Key(key)).await?;
                    self.link.phase = PeerPhase::Streaming;
                }
                (Command::Lock { .. }, phase) => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected $Lock in {:?}",
                        phase
                    )));
                }
                _ => {}
            }

            self.publish(Message::Line(line)).await;

            if let Command::AdcSnd { kind, name, bytes, .. } = &cmd {
                if kind == "file" {
                    return self.receive_payload(name, *bytes).await;
                }
            }
        }
    }

    /// Read exactly the announced number of bytes, publish them, and close the peer's topic.
    async fn receive_payload(&mut self, name: &str, bytes: u64) -> Result<()> {
        if self.link.phase != PeerPhase::Streaming {
            return Err(Error::ProtocolViolation(format!(
                "$ADCSND before handshake finished ({:?})",
                self.link.phase
            )));
        }
        if bytes > self.opts.max_payload {
            return Err(Error::ProtocolViolation(format!(
                "{} announced {} bytes, limit is {}",
                self.label(),
                bytes,
                self.opts.max_payload
            )));
        }
        info!("downloading {} from {}: {} bytes", name, self.label(), bytes);
        let mut payload = vec![0u8; bytes as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::ConnectionLost(format!("payload cut short: {}", e)))?;
        info!("finished downloading {} from {}", name, self.label());

        self.publish(Message::Payload(payload)).await;
        if let Some(nick) = self.link.nick.clone() {
            self.shared.emit(ClientEvent::PayloadReceived { nick, bytes });
        }
        Ok(())
    }

    async fn send(&self, cmd: &Command) -> Result<()> {
        let Some(nick) = &self.link.nick else {
            return Err(Error::ProtocolViolation("send before $MyNick".into()));
        };
        match self
            .shared
            .router
            .send(Destination::Peer(nick.clone()), encode_line(cmd)?)
            .await
        {
            Err(Error::DestinationClosed(_)) => {
                Err(Error::ConnectionLost(format!("{} stopped accepting writes", nick)))
            }
            res => res,
        }
    }

    /// Lines and payloads go to the peer's own topic (once known) and to the wildcard.
    async fn publish(&self, msg: Message) {
        if let Some(nick) = &self.link.nick {
            self.shared
                .registry
                .publish(&Topic::Peer(nick.clone()), msg.clone())
                .await;
        }
        self.shared.registry.publish(&Topic::All, msg).await;
    }

    fn finish(mut self, result: Result<()>) -> PeerLink {
        match &result {
            Ok(()) => info!("{}: session complete", self.label()),
            Err(e) => warn!("{}: session ended: {}", self.label(), e),
        }
        self.link.phase = PeerPhase::Done;
        if let Some(nick) = self.link.nick.clone() {
            let dest = Destination::Peer(nick.clone());
            // A newer connection from the same nick owns the route and topic now.
            let current = self
                .generation
                .map_or(false, |g| self.shared.router.release(&dest, g));
            if current {
                self.shared.registry.remove_topic(&Topic::Peer(nick.clone()));
            }
            self.shared.emit(ClientEvent::PeerDisconnected {
                nick,
                error: result.err().map(|e| e.to_string()),
            });
        }
        self.link
    }
}

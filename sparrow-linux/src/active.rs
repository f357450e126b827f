//! Active mode: a TCP listener for incoming peer connections and a UDP socket for search results,
//! both bound to a local IPv4 address chosen by an `AddressPolicy`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::context::Shared;
use crate::error::{Error, Result};
use crate::peer::{self, PeerOptions};
use crate::registry::{Message, Topic};

/// Datagram buffer; search results are far smaller.
const UDP_BUFFER: usize = 2048;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One address of a local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub ip: IpAddr,
}

impl Interface {
    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// Picks the address peers will be told to connect to.
pub trait AddressPolicy: Send + Sync {
    fn select(&self, interfaces: &[Interface]) -> Option<Ipv4Addr>;
}

/// First non-loopback address in 10.0.0.0/8.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateTenNet;

impl AddressPolicy for PrivateTenNet {
    fn select(&self, interfaces: &[Interface]) -> Option<Ipv4Addr> {
        interfaces
            .iter()
            .filter(|i| !i.is_loopback())
            .find_map(|i| match i.ip {
                IpAddr::V4(v4) if v4.octets()[0] == 10 => Some(v4),
                _ => None,
            })
    }
}

/// Always the configured address, whatever the interfaces say.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddress(pub Ipv4Addr);

impl AddressPolicy for FixedAddress {
    fn select(&self, _: &[Interface]) -> Option<Ipv4Addr> {
        Some(self.0)
    }
}

/// Addresses of every local interface.
pub fn local_interfaces() -> Result<Vec<Interface>> {
    let ifaces = if_addrs::get_if_addrs()?;
    Ok(ifaces
        .into_iter()
        .map(|i| Interface {
            ip: i.ip(),
            name: i.name,
        })
        .collect())
}

/// Where peers reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveEndpoint {
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl ActiveEndpoint {
    /// `ip:port` for `$ConnectToMe`.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.tcp_port)
    }
}

/// Running listeners. Dropping this stops them.
pub struct ActiveServer {
    endpoint: ActiveEndpoint,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveServer {
    pub fn endpoint(&self) -> ActiveEndpoint {
        self.endpoint
    }
}

impl Drop for ActiveServer {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Bind TCP and UDP on the policy's address and start serving.
pub async fn start(
    policy: &dyn AddressPolicy,
    tcp_port: u16,
    udp_port: u16,
    shared: Shared,
    opts: PeerOptions,
) -> Result<ActiveServer> {
    let interfaces = local_interfaces().unwrap_or_else(|e| {
        warn!("couldn't list interface addresses: {}", e);
        Vec::new()
    });
    let ip = policy.select(&interfaces).ok_or(Error::NoSuitableAddress)?;

    let listener = TcpListener::bind((ip, tcp_port)).await?;
    let udp = UdpSocket::bind((ip, udp_port)).await?;
    let endpoint = ActiveEndpoint {
        ip,
        tcp_port: listener.local_addr()?.port(),
        udp_port: udp.local_addr()?.port(),
    };
    info!(
        "active mode on {} (tcp {}, udp {})",
        endpoint.ip, endpoint.tcp_port, endpoint.udp_port
    );

    let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), opts));
    let udp_task = tokio::spawn(udp_loop(Arc::new(udp), shared));
    Ok(ActiveServer {
        endpoint,
        tasks: vec![accept_task, udp_task],
    })
}

async fn accept_loop(listener: TcpListener, shared: Shared, opts: PeerOptions) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    peer::run(stream, remote.to_string(), shared, opts).await;
                });
            }
            Err(e) => {
                warn!("couldn't accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn udp_loop(socket: Arc<UdpSocket>, shared: Shared) {
    let mut buf = vec![0u8; UDP_BUFFER];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                debug!("udp from {}: {}", from, text);
                shared
                    .registry
                    .publish(&Topic::All, Message::Line(text))
                    .await;
            }
            Err(e) => {
                warn!("couldn't read UDP packet: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

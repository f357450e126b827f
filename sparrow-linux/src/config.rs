//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration. File: ~/.config/sparrow/config.toml or /etc/sparrow/config.toml.
/// Env overrides: SPARROW_NICK, SPARROW_HUB, SPARROW_ACTIVE_ADDRESS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_nick")]
    pub nick: String,
    /// Hub to join at startup, `host:port`.
    #[serde(default)]
    pub hub_address: Option<String>,
    #[serde(default = "default_share_size")]
    pub share_size: u64,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub active: ActiveConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// Dial timeout (default 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Silence after which the hub is presumed gone (default 60).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveConfig {
    /// Advertised address. Unset: first 10.x.x.x interface address.
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    /// TCP listen port (default 0, any free port).
    #[serde(default)]
    pub tcp_port: u16,
    /// UDP listen port (default 0, any free port).
    #[serde(default)]
    pub udp_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Destinations allowed to buffer without a connection (default 64).
    #[serde(default = "default_max_idle_routes")]
    pub max_idle_routes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Largest `$ADCSND` payload accepted, in bytes (default 64 MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload: u64,
    #[serde(default)]
    pub direction_number: Option<u32>,
}

fn default_nick() -> String {
    "sparrow".to_string()
}
fn default_share_size() -> u64 {
    sparrow_core::user::DEFAULT_SHARE_SIZE
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_read_timeout() -> u64 {
    60
}
fn default_max_subscribers() -> usize {
    crate::registry::DEFAULT_MAX_SUBSCRIBERS
}
fn default_queue_depth() -> usize {
    1000
}
fn default_max_idle_routes() -> usize {
    crate::router::DEFAULT_MAX_IDLE_ROUTES
}
fn default_delivery_timeout_ms() -> u64 {
    1000
}
fn default_max_payload() -> u64 {
    crate::peer::DEFAULT_MAX_PAYLOAD
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nick: default_nick(),
            hub_address: None,
            share_size: default_share_size(),
            hub: HubConfig::default(),
            active: ActiveConfig::default(),
            registry: RegistryConfig::default(),
            router: RouterConfig::default(),
            peer: PeerConfig::default(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscribers: default_max_subscribers(),
            queue_depth: default_queue_depth(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_idle_routes: default_max_idle_routes(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
            direction_number: None,
        }
    }
}

impl HubConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl RegistryConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SPARROW_NICK") {
        if !s.is_empty() {
            c.nick = s;
        }
    }
    if let Some(s) = var("SPARROW_HUB") {
        c.hub_address = Some(s);
    }
    if let Some(s) = var("SPARROW_ACTIVE_ADDRESS") {
        match s.parse::<Ipv4Addr>() {
            Ok(ip) => c.active.address = Some(ip),
            Err(_) => log::warn!("ignoring SPARROW_ACTIVE_ADDRESS={:?}: not an IPv4 address", s),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sparrow/config.toml"));
    }
    out.push(PathBuf::from("/etc/sparrow/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => log::warn!("{}: {}", p.display(), e),
                Err(e) => log::warn!("{}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

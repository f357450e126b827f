//! Sparrow: NMDC client core. Hub session, active mode, peer sessions, and the
//! subscription registry and outbound router that connect them to the application.

pub mod active;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod peer;
pub mod registry;
pub mod router;
pub mod transport;

pub use active::{ActiveEndpoint, AddressPolicy, FixedAddress, PrivateTenNet};
pub use client::Client;
pub use config::Config;
pub use context::ClientEvent;
pub use error::{Error, Result};
pub use registry::{Filter, Message, Registry, Subscription, Topic};
pub use router::{Attachment, Destination, Envelope, Router};

//! PTP/IP client core: discovers cameras on a WiFi network, performs the
//! PTP/IP handshake, and keeps a live session open that reports newly taken
//! photos (and their bytes) to a pluggable sink.
//!
//! This crate covers the protocol engine only. Application UI, auth, upload,
//! and WiFi join are external collaborators that interact with it through
//! [`scanner::Scanner`], [`session::Session`], and [`config::ClientConfig`].

pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod guid;
pub mod proto;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use scanner::{DiscoveredCamera, Scanner};
pub use session::{Session, SessionDelegate, SessionEvent};

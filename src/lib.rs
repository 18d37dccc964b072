//! Swiz library
//!
//! Client/server directory synchronization over a framed TCP protocol:
//! fixed-header packets, chunked MD5-verified transfers, per-path locking,
//! and listing-based reconciliation.

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod listing;
pub mod logging;
pub mod packet;
pub mod pathlock;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod watch;

pub use client::{Client, ClientConfig};
pub use error::SwizError;
pub use packet::Packet;
pub use server::{Server, ServerConfig};

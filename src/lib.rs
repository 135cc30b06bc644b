//! Mini-Network: asynchronous peer connection layer for a Bitcoin-style node
//!
//! This crate provides:
//! - An ordered dispatcher (strand) over a shared worker pool
//! - Outbound connector with resolution, deadline and cancellation
//! - Inbound acceptor with one channel per accept
//! - Framed peer channels with typed message subscriptions
//! - A protocol session base that serializes each session's handlers
//! - Wire messages (`version`, `verack`, `ping`, `pong`, `getaddr`,
//!   `filterload`) with a symmetric encode/decode contract
//!
//! # Example
//!
//! ```no_run
//! use mini_network::network::{Connector, ProtocolPing, Settings};
//! use mini_network::utility::Threadpool;
//! use std::sync::Arc;
//!
//! let pool = Threadpool::new(4).unwrap();
//! let settings = Arc::new(Settings::default());
//! let connector = Connector::new(pool.clone(), settings.clone());
//!
//! let heartbeat = settings.heartbeat_interval();
//! connector.connect(("seed.example.org", 8333), move |result| {
//!     if let Ok(channel) = result {
//!         let pool = channel.pool().clone();
//!         ProtocolPing::new(&pool, channel.clone(), heartbeat).start();
//!         channel.start();
//!     }
//! });
//! ```

pub mod error;
pub mod message;
pub mod network;
pub mod utility;

// Re-export commonly used types
pub use error::{NetworkError, NetworkResult};
pub use message::{FilterLoad, GetAddress, Message, Ping, Pong, VerAck, Version};
pub use network::{
    Acceptor, Authority, Channel, Connector, Endpoint, Protocol, ProtocolBase, ProtocolPing,
    Settings,
};
pub use utility::{Dispatcher, Threadpool};

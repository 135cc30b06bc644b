//! Peer networking
//!
//! Connection lifecycle and per-connection protocol dispatch:
//! - [`Connector`] turns an [`Endpoint`] into a [`Channel`] (outbound)
//! - [`Acceptor`] turns a listening socket into channels (inbound)
//! - [`Channel`] frames messages over one TCP connection
//! - [`Protocol`] attaches ordered sessions such as [`ProtocolPing`]
//!
//! Every completion handler runs on the shared [`Threadpool`] and is
//! invoked exactly once, including when the operation is canceled.
//!
//! [`Threadpool`]: crate::utility::Threadpool

pub mod acceptor;
pub mod authority;
pub mod channel;
pub mod connector;
pub mod protocol;
pub mod protocol_ping;
pub mod resolver;
pub mod settings;

pub use acceptor::{AcceptResult, Acceptor};
pub use authority::{Authority, Endpoint};
pub use channel::Channel;
pub use connector::{ConnectResult, Connector, Dialer, TcpDialer};
pub use protocol::{Protocol, ProtocolBase};
pub use protocol_ping::ProtocolPing;
pub use resolver::{DnsResolver, Resolver, StaticResolver};
pub use settings::{Settings, SettingsError};

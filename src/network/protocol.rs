//! Protocol session base
//!
//! A protocol is one conversation attached to a channel (handshake, ping,
//! address exchange, ...). Concrete protocols hold a [`ProtocolBase`] and
//! implement [`Protocol`]; the provided methods route every channel event
//! back to the protocol through its own ordered dispatcher, so a protocol's
//! handlers never run concurrently with each other.
//!
//! Each bound handler captures an `Arc` of the protocol, keeping it alive
//! while anything is outstanding. The channel releases those handlers when
//! it stops, which ends the protocol.
//!
//! ```ignore
//! impl ProtocolPing {
//!     pub fn start(self: &Arc<Self>) {
//!         self.subscribe::<Ping, _>(Self::handle_receive_ping);
//!         self.subscribe_stop(Self::handle_stop);
//!     }
//! }
//! ```

use crate::error::NetworkError;
use crate::message::{Message, Version};
use crate::network::authority::Authority;
use crate::network::channel::Channel;
use crate::utility::{Dispatcher, Threadpool};
use std::sync::Arc;

/// State shared by every protocol: its channel and its ordering domain
pub struct ProtocolBase {
    name: String,
    pool: Threadpool,
    dispatch: Dispatcher,
    channel: Arc<Channel>,
}

impl ProtocolBase {
    /// `name` is used for logging only
    pub fn new(pool: &Threadpool, channel: Arc<Channel>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.clone(),
            dispatch: Dispatcher::new(pool.clone()),
            channel,
        }
    }
}

impl std::fmt::Debug for ProtocolBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBase")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .finish()
    }
}

/// A session attached to one channel
pub trait Protocol: Send + Sync + Sized + 'static {
    fn base(&self) -> &ProtocolBase;

    /// Bind `method` to this protocol; the result keeps the protocol alive
    fn bind<A, F>(self: &Arc<Self>, method: F) -> impl Fn(A) + Clone + Send + Sync + 'static
    where
        A: 'static,
        F: Fn(&Arc<Self>, A) + Send + Sync + 'static,
    {
        let this = self.clone();
        let method = Arc::new(method);
        move |args: A| method(&this, args)
    }

    /// Run `method` on this protocol's ordered path
    fn call<F>(self: &Arc<Self>, method: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        let this = self.clone();
        self.base().dispatch.ordered(move || method(&this));
    }

    /// Send `message`; `handler` receives the write outcome in order
    fn send<M, F>(self: &Arc<Self>, message: &M, handler: F)
    where
        M: Message,
        F: FnOnce(&Arc<Self>, Result<(), NetworkError>) + Send + 'static,
    {
        let this = self.clone();
        let handler = self
            .base()
            .dispatch
            .ordered_delegate_once(move |result: Result<(), NetworkError>| handler(&this, result));
        self.base().channel.send(message, handler);
    }

    /// Receive every future `M` in order, then the stop code once
    fn subscribe<M, F>(self: &Arc<Self>, handler: F)
    where
        M: Message,
        F: Fn(&Arc<Self>, Result<M, NetworkError>) + Send + Sync + 'static,
    {
        let this = self.clone();
        let handler = self
            .base()
            .dispatch
            .ordered_delegate(move |result: Result<M, NetworkError>| handler(&this, result));
        self.base().channel.subscribe::<M, _>(handler);
    }

    /// Receive the channel stop code once
    fn subscribe_stop<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(&Arc<Self>, NetworkError) + Send + 'static,
    {
        let this = self.clone();
        let handler = self
            .base()
            .dispatch
            .ordered_delegate_once(move |ec: NetworkError| handler(&this, ec));
        self.base().channel.subscribe_stop(handler);
    }

    fn authority(&self) -> Authority {
        self.base().channel.authority()
    }

    fn channel(&self) -> &Arc<Channel> {
        &self.base().channel
    }

    fn name(&self) -> &str {
        &self.base().name
    }

    fn nonce(&self) -> u64 {
        self.base().channel.nonce()
    }

    fn pool(&self) -> &Threadpool {
        &self.base().pool
    }

    /// Record the peer version
    ///
    /// Not synchronized with other protocols: the handshake must finish
    /// this before any other protocol reads the version.
    fn set_version(&self, value: Version) {
        self.base().channel.set_version(value);
    }

    /// Stop the channel; no-op once stopped
    fn stop(&self, ec: NetworkError) {
        self.base().channel.stop(ec);
    }

    fn stopped(&self) -> bool {
        self.base().channel.stopped()
    }
}

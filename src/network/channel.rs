//! Peer channel
//!
//! One established TCP connection to a peer. Outbound packets are queued to
//! a writer task; inbound packets are decoded by a reader task and fanned
//! out to the subscribers registered for their command.
//!
//! Lifecycle: a channel is created by the connector or acceptor, protocols
//! subscribe to it, then the owner calls [`Channel::start`]. The first
//! [`Channel::stop`] (explicit, peer disconnect, or stream error) ends both
//! tasks and notifies every subscriber exactly once. Message delivery and
//! the stop notification are serialized, so no message reaches a subscriber
//! after its stop code.

use crate::error::NetworkError;
use crate::message::{HeadingCodec, Message, Packet, Version};
use crate::network::authority::Authority;
use crate::network::settings::Settings;
use crate::utility::Threadpool;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

type SendHandler = Box<dyn FnOnce(Result<(), NetworkError>) + Send + 'static>;
type StopHandler = Box<dyn FnOnce(NetworkError) + Send + 'static>;
/// Decodes a payload for one subscriber; returns false if it was malformed.
type MessageHandler = Arc<dyn Fn(Result<&[u8], NetworkError>) -> bool + Send + Sync + 'static>;

type Outgoing = (Packet, SendHandler);
type FramedStream = Framed<TcpStream, HeadingCodec>;

#[derive(Default)]
struct Subscriptions {
    stopped: bool,
    messages: HashMap<&'static str, Vec<MessageHandler>>,
    stop: Vec<StopHandler>,
}

/// An established peer connection
pub struct Channel {
    pool: Threadpool,
    settings: Arc<Settings>,
    authority: Authority,
    nonce: u64,
    /// Peer version; written once by the handshake, read afterwards.
    version: RwLock<Option<Version>>,
    stopped: AtomicBool,
    subscriptions: Mutex<Subscriptions>,
    /// Held while subscribers are invoked
    delivery: Arc<Mutex<()>>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    /// Socket and send queue, held until `start` hands them to the tasks.
    pending: Mutex<Option<(TcpStream, mpsc::UnboundedReceiver<Outgoing>)>>,
    token: CancellationToken,
}

impl Channel {
    /// Wrap an established socket
    pub fn new(
        pool: Threadpool,
        settings: Arc<Settings>,
        stream: TcpStream,
        authority: Authority,
    ) -> Arc<Self> {
        let (outbound, queue) = mpsc::unbounded_channel();
        let nonce = rand::random::<u64>();

        log::debug!("Opened channel [{}] nonce {:016x}", authority, nonce);

        Arc::new(Self {
            pool,
            settings,
            authority,
            nonce,
            version: RwLock::new(None),
            stopped: AtomicBool::new(false),
            subscriptions: Mutex::new(Subscriptions::default()),
            delivery: Arc::new(Mutex::new(())),
            outbound,
            pending: Mutex::new(Some((stream, queue))),
            token: CancellationToken::new(),
        })
    }

    /// Begin reading and writing; call once protocols have subscribed
    pub fn start(self: &Arc<Self>) {
        let Some((stream, queue)) = self.pending.lock().take() else {
            log::debug!("Channel [{}] already started or stopped", self.authority);
            return;
        };

        let framed = Framed::new(stream, HeadingCodec::new(self.settings.identifier));
        let (writer, reader) = framed.split();

        self.pool.spawn(self.clone().write_loop(writer, queue));
        self.pool.spawn(self.clone().read_loop(reader));
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Random identifier, used to detect connections to self
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn pool(&self) -> &Threadpool {
        &self.pool
    }

    pub fn version(&self) -> Option<Version> {
        self.version.read().clone()
    }

    /// Store the peer's version
    ///
    /// Single writer: the handshake sets this before any other protocol
    /// reads it.
    pub fn set_version(&self, value: Version) {
        *self.version.write() = Some(value);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Token cancelled when the channel stops, for protocol timer loops
    pub fn stopping(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Serialize and queue `message`; `handler` receives the write outcome
    pub fn send<M, F>(&self, message: &M, handler: F)
    where
        M: Message,
        F: FnOnce(Result<(), NetworkError>) + Send + 'static,
    {
        self.send_packet(Packet::from_message(message), handler);
    }

    /// Queue a raw packet
    pub fn send_packet<F>(&self, packet: Packet, handler: F)
    where
        F: FnOnce(Result<(), NetworkError>) + Send + 'static,
    {
        if self.stopped() {
            self.pool.post(move || handler(Err(NetworkError::ChannelStopped)));
            return;
        }

        // Fails only once the writer has closed the queue on stop.
        let handler: SendHandler = Box::new(handler);
        if let Err(mpsc::error::SendError((_, handler))) = self.outbound.send((packet, handler)) {
            self.pool.post(move || handler(Err(NetworkError::ChannelStopped)));
        }
    }

    /// Receive every future `M`, then the stop code once when the channel
    /// stops. Subscribing to a stopped channel delivers the stop code
    /// immediately.
    pub fn subscribe<M, F>(&self, handler: F)
    where
        M: Message,
        F: Fn(Result<M, NetworkError>) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(move |payload: Result<&[u8], NetworkError>| match payload {
            Ok(data) => {
                let message = M::factory_from_data(data);
                if !message.is_valid() {
                    return false;
                }
                handler(Ok(message));
                true
            }
            Err(ec) => {
                handler(Err(ec));
                true
            }
        });

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.stopped {
            drop(subscriptions);
            self.pool.post(move || {
                handler(Err(NetworkError::ChannelStopped));
            });
            return;
        }

        subscriptions
            .messages
            .entry(M::COMMAND)
            .or_default()
            .push(handler);
    }

    /// One-shot notification of the stop code
    pub fn subscribe_stop<F>(&self, handler: F)
    where
        F: FnOnce(NetworkError) + Send + 'static,
    {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.stopped {
            drop(subscriptions);
            self.pool.post(move || handler(NetworkError::ChannelStopped));
            return;
        }

        subscriptions.stop.push(Box::new(handler));
    }

    /// Stop the channel; only the first call has any effect
    pub fn stop(&self, ec: NetworkError) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        match &ec {
            NetworkError::ChannelStopped => log::debug!("Channel [{}] stopped", self.authority),
            other => log::info!("Channel [{}] stopped: {}", self.authority, other),
        }

        self.token.cancel();

        // Never started: nothing else will drain the send queue.
        let unstarted = self.pending.lock().take();
        if let Some((_, mut queue)) = unstarted {
            fail_queued(&self.pool, &mut queue);
        }

        let (messages, stops) = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.stopped = true;
            (
                std::mem::take(&mut subscriptions.messages),
                std::mem::take(&mut subscriptions.stop),
            )
        };

        // Waits out a delivery already in progress on the reader.
        let delivery = self.delivery.clone();
        self.pool.post(move || {
            let _delivery = delivery.lock();
            for handler in messages.into_values().flatten() {
                handler(Err(ec.clone()));
            }
            for handler in stops {
                handler(ec.clone());
            }
        });
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    async fn read_loop(self: Arc<Self>, mut reader: SplitStream<FramedStream>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = reader.next() => next,
            };

            match next {
                Some(Ok(packet)) => self.notify(packet),
                Some(Err(e)) => {
                    log::warn!("Invalid stream from [{}]: {}", self.authority, e);
                    self.stop(e);
                    break;
                }
                None => {
                    log::debug!("Peer [{}] closed the connection", self.authority);
                    self.stop(NetworkError::ChannelStopped);
                    break;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: SplitSink<FramedStream, Packet>,
        mut queue: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        loop {
            let (packet, handler) = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = queue.recv() => match next {
                    Some(item) => item,
                    None => break,
                },
            };

            let command = packet.command.clone();
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(NetworkError::ChannelStopped),
                result = writer.send(packet) => result,
            };

            match result {
                Ok(()) => {
                    log::trace!("Sent {} to [{}]", command, self.authority);
                    handler(Ok(()));
                }
                Err(e) => {
                    log::debug!("Failure sending {} to [{}]: {}", command, self.authority, e);
                    handler(Err(e.clone()));
                    self.stop(e);
                    break;
                }
            }
        }

        fail_queued(&self.pool, &mut queue);
    }

    fn notify(&self, packet: Packet) {
        let malformed = {
            let _delivery = self.delivery.lock();
            let handlers = {
                let subscriptions = self.subscriptions.lock();
                if subscriptions.stopped {
                    return;
                }
                match subscriptions.messages.get(packet.command.as_str()) {
                    Some(handlers) => handlers.clone(),
                    None => {
                        log::debug!(
                            "Ignoring {} from [{}] (no subscribers)",
                            packet.command,
                            self.authority
                        );
                        return;
                    }
                }
            };

            // A handler may stop the channel; the rest then get only the stop code.
            handlers
                .iter()
                .take_while(|_| !self.stopped())
                .any(|handler| !handler(Ok(&packet.payload)))
        };

        if malformed {
            log::warn!("Invalid {} payload from [{}]", packet.command, self.authority);
            self.stop(NetworkError::MalformedMessage(packet.command.clone()));
        }
    }
}

/// Close the send queue and fail whatever is still in it.
fn fail_queued(pool: &Threadpool, queue: &mut mpsc::UnboundedReceiver<Outgoing>) {
    queue.close();
    while let Ok((_, handler)) = queue.try_recv() {
        pool.post(move || handler(Err(NetworkError::ChannelStopped)));
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Releases any stop subscribers of a channel that was never stopped.
        self.stop(NetworkError::ChannelStopped);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority)
            .field("nonce", &format_args!("{:016x}", self.nonce))
            .field("stopped", &self.stopped())
            .finish()
    }
}

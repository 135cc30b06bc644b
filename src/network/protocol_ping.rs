//! Keep-alive protocol
//!
//! Sends a `ping` with a fresh nonce every heartbeat and answers the peer's
//! pings. A `pong` that does not echo the outstanding nonce is treated as a
//! broken stream.

use crate::error::NetworkError;
use crate::message::{Ping, Pong};
use crate::network::channel::Channel;
use crate::network::protocol::{Protocol, ProtocolBase};
use crate::utility::Threadpool;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const NAME: &str = "ping";

pub struct ProtocolPing {
    base: ProtocolBase,
    heartbeat: Duration,
    /// Nonce of the ping awaiting its pong
    outstanding: Mutex<Option<u64>>,
}

impl Protocol for ProtocolPing {
    fn base(&self) -> &ProtocolBase {
        &self.base
    }
}

impl ProtocolPing {
    pub fn new(pool: &Threadpool, channel: Arc<Channel>, heartbeat: Duration) -> Arc<Self> {
        Arc::new(Self {
            base: ProtocolBase::new(pool, channel, NAME),
            heartbeat,
            outstanding: Mutex::new(None),
        })
    }

    /// Subscribe to the channel and start the heartbeat timer
    pub fn start(self: &Arc<Self>) {
        self.subscribe::<Ping, _>(Self::handle_receive_ping);
        self.subscribe::<Pong, _>(Self::handle_receive_pong);
        self.subscribe_stop(Self::handle_stop);

        let this = self.clone();
        let stopping = self.channel().stopping();
        let period = self.heartbeat;

        self.pool().spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stopping.cancelled() => break,
                    _ = timer.tick() => this.call(Self::send_ping),
                }
            }
            log::trace!("Heartbeat ended for [{}]", this.authority());
        });
    }

    fn send_ping(self: &Arc<Self>) {
        if self.stopped() {
            return;
        }

        let nonce = rand::random::<u64>();
        if let Some(previous) = self.outstanding.lock().replace(nonce) {
            log::debug!(
                "No pong for ping {:016x} from [{}] before next heartbeat",
                previous,
                self.authority()
            );
        }

        self.send(&Ping::new(nonce), Self::handle_send);
    }

    fn handle_send(self: &Arc<Self>, result: Result<(), NetworkError>) {
        if let Err(ec) = result {
            if !self.stopped() {
                log::debug!("Failure sending {} to [{}]: {}", self.name(), self.authority(), ec);
                self.stop(ec);
            }
        }
    }

    fn handle_receive_ping(self: &Arc<Self>, result: Result<Ping, NetworkError>) {
        let ping = match result {
            Ok(ping) => ping,
            Err(_) => return,
        };

        log::trace!("Ping {:016x} from [{}]", ping.nonce, self.authority());
        self.send(&Pong::new(ping.nonce), Self::handle_send);
    }

    fn handle_receive_pong(self: &Arc<Self>, result: Result<Pong, NetworkError>) {
        let pong = match result {
            Ok(pong) => pong,
            Err(_) => return,
        };

        let expected = self.outstanding.lock().take();
        if expected != Some(pong.nonce) {
            log::warn!(
                "Unexpected pong nonce {:016x} from [{}]",
                pong.nonce,
                self.authority()
            );
            self.stop(NetworkError::BadStream(format!(
                "unexpected pong nonce {:016x}",
                pong.nonce
            )));
        }
    }

    fn handle_stop(self: &Arc<Self>, ec: NetworkError) {
        log::debug!("Stopped {} protocol for [{}]: {}", self.name(), self.authority(), ec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::tests::channel_pair;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_answers_ping_with_pong() {
        let (a, b) = channel_pair().await;
        let pool = b.pool().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        a.subscribe::<Pong, _>(move |result| {
            let _ = tx.send(result);
        });
        ProtocolPing::new(&pool, b.clone(), Duration::from_secs(3600)).start();
        a.start();
        b.start();

        a.send(&Ping::new(0xfeed), |_| {});
        assert_eq!(recv(&mut rx).await, Ok(Pong::new(0xfeed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_sends_ping_and_accepts_matching_pong() {
        let (a, b) = channel_pair().await;
        let pool = a.pool().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Echo pings back from the far side.
        let echo = b.clone();
        b.subscribe::<Ping, _>(move |result| {
            if let Ok(ping) = result {
                let _ = tx.send(ping.nonce);
                echo.send(&Pong::new(ping.nonce), |_| {});
            }
        });

        let protocol = ProtocolPing::new(&pool, a.clone(), Duration::from_millis(200));
        protocol.start();
        a.start();
        b.start();

        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert_ne!(first, second);
        assert!(!a.stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unexpected_pong_stops_channel() {
        let (a, b) = channel_pair().await;
        let pool = b.pool().clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        b.subscribe_stop(move |ec| {
            let _ = tx.send(ec);
        });
        ProtocolPing::new(&pool, b.clone(), Duration::from_secs(3600)).start();
        a.start();
        b.start();

        a.send(&Pong::new(42), |_| {});
        assert!(matches!(recv(&mut rx).await, NetworkError::BadStream(_)));
        assert!(b.stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_ends_heartbeat_and_releases_protocol() {
        let (a, _b) = channel_pair().await;
        let pool = a.pool().clone();

        let protocol = ProtocolPing::new(&pool, a.clone(), Duration::from_millis(20));
        protocol.start();
        a.start();

        let weak = Arc::downgrade(&protocol);
        drop(protocol);

        a.stop(NetworkError::ChannelStopped);

        let mut released = false;
        for _ in 0..100 {
            if weak.upgrade().is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_ping_after_stop() {
        let (a, _b) = channel_pair().await;
        let pool = a.pool().clone();
        let protocol = ProtocolPing::new(&pool, a.clone(), Duration::from_secs(3600));

        a.stop(NetworkError::OperationCanceled);
        protocol.call(ProtocolPing::send_ping);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(protocol.outstanding.lock().is_none());
    }
}

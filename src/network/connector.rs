//! Outbound connection establishment
//!
//! `connect` resolves the endpoint, then races a TCP connect to the first
//! resolved address against the configured deadline. Later candidates are
//! never tried; retry policy belongs to the caller.
//!
//! The TCP step itself goes through a [`Dialer`], so tests can stand in a
//! socket that never answers.

use crate::error::NetworkError;
use crate::network::authority::Endpoint;
use crate::network::channel::Channel;
use crate::network::resolver::{DnsResolver, Resolver};
use crate::network::settings::Settings;
use crate::utility::{Completion, Threadpool};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Outcome of a single connection attempt
pub type ConnectResult = Result<Arc<Channel>, NetworkError>;

/// Opens the TCP stream to one resolved address
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>>;
}

/// Plain `TcpStream::connect`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
        TcpStream::connect(addr).boxed()
    }
}

/// The in-flight (or last) attempt
struct Attempt {
    token: CancellationToken,
    completion: Arc<Completion<ConnectResult>>,
}

/// Drives outbound connection attempts, one at a time
pub struct Connector {
    pool: Threadpool,
    settings: Arc<Settings>,
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    attempt: Mutex<Option<Attempt>>,
}

impl Connector {
    /// Create a connector using the system resolver
    pub fn new(pool: Threadpool, settings: Arc<Settings>) -> Self {
        Self::with_resolver(pool, settings, Arc::new(DnsResolver))
    }

    pub fn with_resolver(pool: Threadpool, settings: Arc<Settings>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            pool,
            settings,
            resolver,
            dialer: Arc::new(TcpDialer),
            attempt: Mutex::new(None),
        }
    }

    /// Replace the TCP connect step
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Try to connect to `endpoint`; `handler` is invoked exactly once
    pub fn connect<F>(&self, endpoint: impl Into<Endpoint>, handler: F)
    where
        F: FnOnce(ConnectResult) + Send + 'static,
    {
        let endpoint = endpoint.into();
        let token = CancellationToken::new();

        let completion = {
            let mut attempt = self.attempt.lock();
            if matches!(attempt.as_ref(), Some(current) if !current.completion.is_complete()) {
                drop(attempt);
                log::debug!("Rejecting connect to [{}]: attempt in progress", endpoint);
                self.pool.post(move || {
                    handler(Err(NetworkError::ConnectFailure(
                        "connection attempt in progress".to_string(),
                    )))
                });
                return;
            }

            let completion = Arc::new(Completion::new(handler));
            *attempt = Some(Attempt {
                token: token.clone(),
                completion: completion.clone(),
            });
            completion
        };

        log::debug!("Connecting to [{}]", endpoint);

        let pool = self.pool.clone();
        let settings = self.settings.clone();
        let resolver = self.resolver.clone();
        let dialer = self.dialer.clone();

        self.pool.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(NetworkError::OperationCanceled),
                result = resolve_and_connect(resolver, dialer, &endpoint, settings.connect_timeout()) => result,
            };

            let result = result.map(|(stream, addr)| {
                log::info!("Connected to [{}] ({})", endpoint, addr);
                Channel::new(pool, settings, stream, addr.into())
            });

            if let Err(result) = completion.complete(result) {
                // Lost the race to cancel().
                if let Ok(channel) = result {
                    channel.stop(NetworkError::OperationCanceled);
                }
            }
        });
    }

    /// Abort the outstanding attempt from any thread
    ///
    /// Its handler receives `OperationCanceled` unless it already completed.
    pub fn cancel(&self) {
        let attempt = self
            .attempt
            .lock()
            .as_ref()
            .map(|a| (a.token.clone(), a.completion.clone()));

        let Some((token, completion)) = attempt else {
            return;
        };

        token.cancel();
        if let Some(handler) = completion.take() {
            log::debug!("Connection attempt canceled");
            self.pool.post(move || handler(Err(NetworkError::OperationCanceled)));
        }
    }
}

async fn resolve_and_connect(
    resolver: Arc<dyn Resolver>,
    dialer: Arc<dyn Dialer>,
    endpoint: &Endpoint,
    deadline: Duration,
) -> Result<(TcpStream, SocketAddr), NetworkError> {
    let candidates = resolver.resolve(endpoint).await?;
    let Some(&target) = candidates.first() else {
        return Err(NetworkError::ResolveFailure(format!("{}: no addresses", endpoint)));
    };

    if candidates.len() > 1 {
        log::debug!(
            "Resolved [{}] to {} addresses, trying {}",
            endpoint,
            candidates.len(),
            target
        );
    }

    let stream = connect_with_deadline(deadline, dialer.dial(target)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("Failed to set TCP_NODELAY on [{}]: {}", target, e);
    }

    Ok((stream, target))
}

/// Race `connect` against `deadline`; whichever finishes first decides
pub(crate) async fn connect_with_deadline<T, F>(deadline: Duration, connect: F) -> Result<T, NetworkError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(deadline, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(NetworkError::ConnectFailure(e.to_string())),
        Err(_) => Err(NetworkError::ConnectTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::resolver::StaticResolver;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, error::TryRecvError};

    /// Never finishes resolving
    struct StalledResolver;

    impl Resolver for StalledResolver {
        fn resolve(&self, _: &Endpoint) -> BoxFuture<'static, Result<Vec<SocketAddr>, NetworkError>> {
            futures::future::pending().boxed()
        }
    }

    /// Records every address dialed; stalls on those in `stalled`
    struct RecordingDialer {
        stalled: Vec<SocketAddr>,
        dialed: Mutex<Vec<SocketAddr>>,
    }

    impl RecordingDialer {
        fn stalling(stalled: Vec<SocketAddr>) -> Arc<Self> {
            Arc::new(Self {
                stalled,
                dialed: Mutex::new(Vec::new()),
            })
        }

        fn dialed(&self) -> Vec<SocketAddr> {
            self.dialed.lock().clone()
        }
    }

    impl Dialer for RecordingDialer {
        fn dial(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<TcpStream>> {
            self.dialed.lock().push(addr);
            if self.stalled.contains(&addr) {
                futures::future::pending().boxed()
            } else {
                TcpDialer.dial(addr)
            }
        }
    }

    fn settings(timeout_seconds: u64) -> Arc<Settings> {
        settings_millis(timeout_seconds * 1_000)
    }

    fn settings_millis(timeout: u64) -> Arc<Settings> {
        Arc::new(Settings {
            connect_timeout_milliseconds: timeout,
            ..Default::default()
        })
    }

    /// A loopback port with nothing listening on it
    fn closed_port() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    /// Wait for the single outcome, then make sure no second one follows
    async fn outcome(rx: &mut mpsc::UnboundedReceiver<ConnectResult>) -> ConnectResult {
        let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("handler never invoked")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        result
    }

    fn handler(tx: &mpsc::UnboundedSender<ConnectResult>) -> impl FnOnce(ConnectResult) + Send + 'static {
        let tx = tx.clone();
        move |result| tx.send(result).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = Connector::new(Threadpool::current(), settings(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(addr, handler(&tx));

        let channel = outcome(&mut rx).await.unwrap();
        assert_eq!(channel.authority().to_socket_addr(), addr);
        assert!(!channel.stopped());
        listener.accept().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_refused() {
        let connector = Connector::new(Threadpool::current(), settings(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(closed_port(), handler(&tx));

        assert!(matches!(
            outcome(&mut rx).await,
            Err(NetworkError::ConnectFailure(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_only_first_candidate_is_tried() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let resolver = StaticResolver::new().with(("seed", 8333), vec![closed_port(), live.local_addr().unwrap()]);
        let connector = Connector::with_resolver(Threadpool::current(), settings(1), Arc::new(resolver));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(("seed", 8333), handler(&tx));

        let result = outcome(&mut rx).await;
        assert!(matches!(
            result,
            Err(NetworkError::ConnectFailure(_)) | Err(NetworkError::ConnectTimeout)
        ));

        let second = tokio::time::timeout(Duration::from_millis(300), live.accept()).await;
        assert!(second.is_err(), "second candidate was attempted");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refused_first_candidate_skips_the_rest() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (first, second) = (closed_port(), live.local_addr().unwrap());
        let resolver = StaticResolver::new().with(("seed", 8333), vec![first, second]);
        let dialer = RecordingDialer::stalling(Vec::new());
        let connector = Connector::with_resolver(Threadpool::current(), settings(5), Arc::new(resolver))
            .with_dialer(dialer.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(("seed", 8333), handler(&tx));

        assert!(matches!(
            outcome(&mut rx).await,
            Err(NetworkError::ConnectFailure(_))
        ));
        assert_eq!(dialer.dialed(), vec![first]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_connect_times_out_once() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stalled: SocketAddr = "192.0.2.1:8333".parse().unwrap();
        let resolver = StaticResolver::new().with(("seed", 8333), vec![stalled, live.local_addr().unwrap()]);
        let dialer = RecordingDialer::stalling(vec![stalled]);
        let connector = Connector::with_resolver(Threadpool::current(), settings_millis(100), Arc::new(resolver))
            .with_dialer(dialer.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = std::time::Instant::now();
        connector.connect(("seed", 8333), handler(&tx));

        assert!(matches!(outcome(&mut rx).await, Err(NetworkError::ConnectTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(dialer.dialed(), vec![stalled]);

        let second = tokio::time::timeout(Duration::from_millis(300), live.accept()).await;
        assert!(second.is_err(), "second candidate was attempted");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_stalled_connect() {
        let stalled: SocketAddr = "192.0.2.1:8333".parse().unwrap();
        let connector = Connector::new(Threadpool::current(), settings(5))
            .with_dialer(RecordingDialer::stalling(vec![stalled]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(stalled, handler(&tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        connector.cancel();

        assert!(matches!(
            outcome(&mut rx).await,
            Err(NetworkError::OperationCanceled)
        ));
    }

    #[tokio::test]
    async fn test_deadline_race() {
        let stalled = connect_with_deadline(Duration::from_millis(20), futures::future::pending::<io::Result<()>>()).await;
        assert_eq!(stalled, Err(NetworkError::ConnectTimeout));

        let refused = connect_with_deadline(Duration::from_secs(1), async {
            Err::<(), _>(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        })
        .await;
        assert!(matches!(refused, Err(NetworkError::ConnectFailure(_))));

        let ready = connect_with_deadline(Duration::from_millis(1), async { Ok(5u8) }).await;
        assert_eq!(ready, Ok(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resolve_failure() {
        let connector = Connector::with_resolver(Threadpool::current(), settings(1), Arc::new(StaticResolver::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(("nowhere", 1), handler(&tx));

        assert!(matches!(
            outcome(&mut rx).await,
            Err(NetworkError::ResolveFailure(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_delivers_once() {
        let connector = Connector::with_resolver(Threadpool::current(), settings(5), Arc::new(StalledResolver));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(("stalled", 8333), handler(&tx));
        connector.cancel();
        connector.cancel();

        assert!(matches!(
            outcome(&mut rx).await,
            Err(NetworkError::OperationCanceled)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_cancel_from_threads() {
        let connector = Arc::new(Connector::with_resolver(
            Threadpool::current(),
            settings(5),
            Arc::new(StalledResolver),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        connector.connect(("stalled", 8333), handler(&tx));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let connector = connector.clone();
                std::thread::spawn(move || connector.cancel())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(matches!(
            outcome(&mut rx).await,
            Err(NetworkError::OperationCanceled)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_after_completion_is_noop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connector = Connector::new(Threadpool::current(), settings(5));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.connect(listener.local_addr().unwrap(), handler(&tx));
        let channel = outcome(&mut rx).await.unwrap();

        connector.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(!channel.stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_connect_while_pending_fails_fast() {
        let connector = Connector::with_resolver(Threadpool::current(), settings(5), Arc::new(StalledResolver));
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        connector.connect(("stalled", 1), handler(&first_tx));
        connector.connect(("stalled", 2), handler(&second_tx));

        assert!(matches!(
            outcome(&mut second_rx).await,
            Err(NetworkError::ConnectFailure(_))
        ));

        connector.cancel();
        assert!(matches!(
            outcome(&mut first_rx).await,
            Err(NetworkError::OperationCanceled)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_after_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let resolver = StaticResolver::new().with(("peer", 1), vec![addr]);
        let connector = Connector::with_resolver(Threadpool::current(), settings(5), Arc::new(resolver));
        let (tx, mut rx) = mpsc::unbounded_channel();

        connector.cancel();
        connector.connect(("peer", 1), handler(&tx));

        assert!(outcome(&mut rx).await.is_ok());
    }
}

//! Inbound connection acceptance
//!
//! `listen` opens the socket once; each `accept` then yields at most one
//! channel and must be re-armed by the caller for the next peer.

use crate::error::NetworkError;
use crate::network::channel::Channel;
use crate::network::settings::Settings;
use crate::utility::{Completion, Threadpool};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

/// Outcome of a single accept
pub type AcceptResult = Result<Arc<Channel>, NetworkError>;

#[derive(Default)]
struct State {
    listener: Option<Arc<TcpListener>>,
    local_addr: Option<SocketAddr>,
    pending: Option<Arc<Completion<AcceptResult>>>,
}

/// Listens on a local port and accepts peers one at a time
pub struct Acceptor {
    pool: Threadpool,
    settings: Arc<Settings>,
    state: Mutex<State>,
    token: CancellationToken,
}

impl Acceptor {
    pub fn new(pool: Threadpool, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            settings,
            state: Mutex::new(State::default()),
            token: CancellationToken::new(),
        }
    }

    /// Bind `settings.bind_address:port` and start listening
    ///
    /// `handler` receives `Ok(())` or the failure exactly once. Port 0 picks
    /// an ephemeral port, see [`Acceptor::local_addr`].
    pub fn listen<F>(&self, port: u16, handler: F)
    where
        F: FnOnce(Result<(), NetworkError>) + Send + 'static,
    {
        let result = self.open(port);
        self.pool.post(move || handler(result));
    }

    fn open(&self, port: u16) -> Result<(), NetworkError> {
        let mut state = self.state.lock();

        if self.token.is_cancelled() {
            return Err(NetworkError::OperationCanceled);
        }

        if state.listener.is_some() {
            return Err(NetworkError::ListenFailure("already listening".to_string()));
        }

        let addr = SocketAddr::new(self.settings.bind_address, port);
        let listener = {
            // Registering the socket needs the pool's reactor.
            let _runtime = self.pool.handle().enter();
            bind(addr, self.settings.listen_backlog)
        }
        .map_err(|e| {
            log::warn!("Failed to listen on {}: {}", addr, e);
            NetworkError::ListenFailure(format!("{}: {}", addr, e))
        })?;

        let local_addr = listener.local_addr().ok();
        log::info!("Listening for inbound connections on {}", local_addr.unwrap_or(addr));

        state.local_addr = local_addr;
        state.listener = Some(Arc::new(listener));
        Ok(())
    }

    /// Wait for the next inbound connection; `handler` is invoked exactly once
    pub fn accept<F>(&self, handler: F)
    where
        F: FnOnce(AcceptResult) + Send + 'static,
    {
        let mut state = self.state.lock();

        let listener = match self.armable(&state) {
            Ok(listener) => listener,
            Err(ec) => {
                drop(state);
                self.pool.post(move || handler(Err(ec)));
                return;
            }
        };

        let completion = Arc::new(Completion::new(handler));
        state.pending = Some(completion.clone());
        drop(state);

        let pool = self.pool.clone();
        let settings = self.settings.clone();
        let token = self.token.clone();

        self.pool.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(NetworkError::OperationCanceled),
                result = listener.accept() => result
                    .map_err(|e| NetworkError::AcceptFailure(e.to_string())),
            };

            let result = result.map(|(stream, addr)| {
                if let Err(e) = stream.set_nodelay(true) {
                    log::warn!("Failed to set TCP_NODELAY on [{}]: {}", addr, e);
                }
                log::info!("Accepted connection from [{}]", addr);
                Channel::new(pool, settings, stream, addr.into())
            });

            if let Err(Ok(channel)) = completion.complete(result) {
                channel.stop(NetworkError::OperationCanceled);
            }
        });
    }

    fn armable(&self, state: &State) -> Result<Arc<TcpListener>, NetworkError> {
        if self.token.is_cancelled() {
            return Err(NetworkError::OperationCanceled);
        }

        if matches!(state.pending.as_ref(), Some(pending) if !pending.is_complete()) {
            return Err(NetworkError::AcceptFailure("accept already pending".to_string()));
        }

        state
            .listener
            .clone()
            .ok_or_else(|| NetworkError::AcceptFailure("not listening".to_string()))
    }

    /// Close the listener and abort a pending accept, from any thread
    ///
    /// Sticky: later `listen` and `accept` calls fail with
    /// `OperationCanceled`.
    pub fn cancel(&self) {
        let pending = {
            let mut state = self.state.lock();
            self.token.cancel();
            state.listener = None;
            state.pending.take()
        };

        if let Some(handler) = pending.and_then(|completion| completion.take()) {
            log::debug!("Accept canceled");
            self.pool.post(move || handler(Err(NetworkError::OperationCanceled)));
        }
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state.listener.as_ref().and(state.local_addr)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::{self, error::TryRecvError};
    use tokio::time::timeout;

    fn loopback() -> Arc<Settings> {
        Arc::new(Settings {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        })
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .unwrap()
    }

    async fn listening() -> Acceptor {
        let acceptor = Acceptor::new(Threadpool::current(), loopback());
        let (tx, mut rx) = mpsc::unbounded_channel();
        acceptor.listen(0, move |result| tx.send(result).unwrap());
        assert_eq!(recv(&mut rx).await, Ok(()));
        acceptor
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listen_twice_fails() {
        let acceptor = listening().await;
        assert!(acceptor.local_addr().is_some());

        let (tx, mut rx) = mpsc::unbounded_channel();
        acceptor.listen(0, move |result| tx.send(result).unwrap());
        assert!(matches!(recv(&mut rx).await, Err(NetworkError::ListenFailure(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listen_on_bound_port_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let acceptor = Acceptor::new(Threadpool::current(), loopback());
        let (tx, mut rx) = mpsc::unbounded_channel();
        acceptor.listen(port, move |result| tx.send(result).unwrap());

        assert!(matches!(recv(&mut rx).await, Err(NetworkError::ListenFailure(_))));
        assert!(acceptor.local_addr().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_yields_one_channel_per_call() {
        let acceptor = listening().await;
        let addr = acceptor.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let t = tx.clone();
        acceptor.accept(move |result| t.send(result).unwrap());

        let first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();

        let channel = recv(&mut rx).await.unwrap();
        assert_eq!(channel.authority().to_socket_addr(), first.local_addr().unwrap());

        // Not re-armed: the second connection waits in the backlog.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        acceptor.accept(move |result| tx.send(result).unwrap());
        assert!(recv(&mut rx).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_without_listen_fails() {
        let acceptor = Acceptor::new(Threadpool::current(), loopback());
        let (tx, mut rx) = mpsc::unbounded_channel();
        acceptor.accept(move |result| tx.send(result.err()).unwrap());

        assert!(matches!(recv(&mut rx).await, Some(NetworkError::AcceptFailure(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_pending_accept_fails() {
        let acceptor = listening().await;
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        acceptor.accept(move |result| first_tx.send(result.err()).unwrap());
        acceptor.accept(move |result| second_tx.send(result.err()).unwrap());

        assert!(matches!(
            recv(&mut second_rx).await,
            Some(NetworkError::AcceptFailure(_))
        ));

        acceptor.cancel();
        assert_eq!(recv(&mut first_rx).await, Some(NetworkError::OperationCanceled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_pending_accept() {
        let acceptor = listening().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Keep a sender so a missing second delivery reads as Empty.
        let handler_tx = tx.clone();
        acceptor.accept(move |result| handler_tx.send(result.err()).unwrap());
        acceptor.cancel();
        acceptor.cancel();

        assert_eq!(recv(&mut rx).await, Some(NetworkError::OperationCanceled));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(acceptor.local_addr().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_operations_after_cancel_fail_fast() {
        let acceptor = listening().await;
        acceptor.cancel();

        let (tx, mut rx) = mpsc::unbounded_channel();
        acceptor.accept(move |result| tx.send(result.err()).unwrap());
        assert_eq!(recv(&mut rx).await, Some(NetworkError::OperationCanceled));

        let (tx, mut rx) = mpsc::unbounded_channel();
        acceptor.listen(0, move |result| tx.send(result).unwrap());
        assert_eq!(recv(&mut rx).await, Err(NetworkError::OperationCanceled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_cancels_pending_accept() {
        let acceptor = listening().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        acceptor.accept(move |result| tx.send(result.err()).unwrap());
        drop(acceptor);

        assert_eq!(recv(&mut rx).await, Some(NetworkError::OperationCanceled));
    }
}

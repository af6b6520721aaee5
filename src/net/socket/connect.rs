use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use mio::Token;
use socket2::{Domain, Protocol, Type};

use super::{ConnectCallback, Socket};
use crate::{
    error::lock,
    net::{
        errors::SockError,
        handle::{Handle, SockKind},
    },
    timer::TimerHandle,
};

/// The connect attempt in flight. Whoever takes it out of the socket owns
/// the single report of its outcome; dropping it cancels the timeout.
pub(crate) struct PendingConnect {
    token: Token,
    on_result: Option<ConnectCallback>,
    timer: Option<TimerHandle>,
}

impl PendingConnect {
    pub(super) fn token(&self) -> Token {
        self.token
    }

    pub(super) fn into_callback(mut self) -> Option<ConnectCallback> {
        self.on_result.take()
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl Socket {
    /// Starts a non-blocking connect to `host:port`.
    ///
    /// `on_result` runs exactly once: with success once the stream is
    /// established, with the classified error if it fails, or with a timeout
    /// if `timeout` elapses first. Resolution and socket creation failures
    /// are reported before this returns. Any previous handle is closed
    /// first, and closing the socket while connecting abandons the attempt
    /// without reporting.
    pub fn connect<F>(&self, host: &str, port: u16, timeout: Duration, on_result: F)
    where
        F: FnOnce(SockError) + Send + 'static,
    {
        self.close();

        let addr = match resolve(host, port) {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!(host, port, error = %err, "resolution failed");
                on_result(err);
                return;
            }
        };
        let socket = match open_stream(addr, self.config.no_delay) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                on_result(SockError::from_io(&e));
                return;
            }
        };

        let handle = Arc::new(Handle::new(
            socket,
            SockKind::Stream,
            Arc::clone(&self.poller),
            self.config.hook.clone(),
        ));
        let token = handle.token();
        tracing::debug!(%addr, fd = handle.raw_fd(), "connecting");

        *lock(&self.connecting) = Some(PendingConnect {
            token,
            on_result: Some(Box::new(on_result)),
            timer: None,
        });
        self.install(handle, true);

        let socket = self.weak_self.clone();
        let timer = self.poller.schedule(timeout, move || {
            if let Some(socket) = socket.upgrade() {
                socket.on_connect_timeout(token);
            }
        });
        let mut connecting = lock(&self.connecting);
        match connecting.as_mut() {
            Some(pending) if pending.token == token => pending.timer = Some(timer),
            // already resolved
            _ => {
                timer.cancel();
            }
        }
    }

    fn on_connect_timeout(&self, token: Token) {
        let pending = lock(&self.connecting)
            .as_ref()
            .is_some_and(|p| p.token == token);
        if pending {
            tracing::debug!(?token, "connect timed out");
            self.teardown(Some(token), SockError::timeout("connect timed out"));
        }
    }

    /// Write-ready on a connecting stream: read back the socket error to
    /// learn the outcome.
    pub(super) fn on_connected(&self, handle: &Arc<Handle>) {
        let token = handle.token();
        let outcome = match handle.socket().take_error() {
            Ok(Some(e)) | Err(e) => Err(SockError::from_io(&e)),
            // writable without an error can still be a refused connect on
            // some platforms; the peer address settles it
            Ok(None) => match handle.socket().peer_addr() {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    Err(SockError::refused("connection refused"))
                }
                Err(e) => Err(SockError::from_io(&e)),
            },
        };

        if let Err(err) = outcome {
            tracing::debug!(fd = handle.raw_fd(), error = %err, "connect failed");
            self.teardown(Some(token), err);
            return;
        }

        let pending = {
            let mut connecting = lock(&self.connecting);
            match connecting.as_ref() {
                Some(p) if p.token == token => connecting.take(),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return;
        };
        let on_result = pending.into_callback();
        handle.set_connected();
        tracing::debug!(fd = handle.raw_fd(), peer = ?handle.peer_addr(), "connected");

        // the connect is still unreported, so its callback owns this failure
        if let Err(err) = self.apply_interest(handle) {
            if self.release(token, &err) {
                if let Some(on_result) = on_result {
                    on_result(err);
                }
            }
            return;
        }
        // closed in the meantime: an abandoned connect never reports
        if !self.is_current(handle) {
            return;
        }
        if let Some(on_result) = on_result {
            on_result(SockError::success());
        }
    }

    pub(super) fn is_connecting(&self, token: Token) -> bool {
        lock(&self.connecting)
            .as_ref()
            .is_some_and(|p| p.token == token)
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SockError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SockError::dns(format!("{host}: {e}")))?
        .next()
        .ok_or_else(|| SockError::dns(format!("{host}: no address")))
}

fn open_stream(addr: SocketAddr, no_delay: bool) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if no_delay {
        socket.set_tcp_nodelay(true)?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(socket),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        net::{config::SocketConfig, errors::ErrorKind},
        poll::PollHandle,
    };
    use mio::Poll;
    use std::{
        net::TcpListener,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Instant,
    };

    /// A socket whose loop never runs: events and timers are driven by hand.
    struct Idle {
        _poll: Poll,
        poller: Arc<PollHandle>,
        sock: Arc<Socket>,
        outcomes: Arc<Mutex<Vec<ErrorKind>>>,
        errors: Arc<AtomicUsize>,
    }

    impl Idle {
        fn new() -> Self {
            let poll = Poll::new().unwrap();
            let poller = Arc::new(PollHandle::new(poll.registry().try_clone().unwrap()).unwrap());
            let sock = Socket::new(Arc::clone(&poller), SocketConfig::default());
            let errors = Arc::new(AtomicUsize::new(0));
            let e = Arc::clone(&errors);
            sock.set_on_err(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            });
            Self {
                _poll: poll,
                poller,
                sock,
                outcomes: Arc::new(Mutex::new(Vec::new())),
                errors,
            }
        }

        fn connect(&self, port: u16, timeout: Duration) {
            let outcomes = Arc::clone(&self.outcomes);
            self.sock.connect("127.0.0.1", port, timeout, move |err| {
                outcomes.lock().unwrap().push(err.kind());
            });
        }

        fn outcomes(&self) -> Vec<ErrorKind> {
            self.outcomes.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_resolve_literal() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_resolve_failure_is_dns() {
        let err = resolve("no-such-host.invalid", 80).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dns);
    }

    #[test]
    fn test_connect_timeout_reports_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let idle = Idle::new();
        let timeout = Duration::from_millis(300);

        let before = Instant::now();
        idle.connect(port, timeout);
        let after = Instant::now();
        let handle = idle.sock.current_handle().unwrap();
        assert!(idle.sock.is_connecting(handle.token()));

        // armed for exactly the requested timeout
        let deadline = idle.poller.timers().next_deadline().unwrap();
        assert!(deadline >= before + timeout);
        assert!(deadline <= after + timeout);

        // write-ready is never dispatched, so only the timer can settle it
        assert_eq!(idle.poller.timers().fire_expired(before), 0);
        assert!(idle.outcomes().is_empty());

        std::thread::sleep(timeout);
        assert_eq!(idle.poller.timers().fire_expired(Instant::now()), 1);
        assert_eq!(idle.outcomes(), vec![ErrorKind::Timeout]);
        assert!(idle.sock.is_closed());
        assert!(!idle.sock.is_connecting(handle.token()));

        // a late write-ready for the stale handle reports nothing more
        idle.sock.on_connected(&handle);
        assert_eq!(idle.poller.timers().fire_expired(Instant::now() + timeout), 0);
        assert_eq!(idle.outcomes(), vec![ErrorKind::Timeout]);
        assert_eq!(idle.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_success_is_reported_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let idle = Idle::new();

        idle.connect(port, Duration::from_secs(5));
        let handle = idle.sock.current_handle().unwrap();
        let _peer = listener.accept().unwrap();

        idle.sock.on_connected(&handle);
        idle.sock.on_connected(&handle);
        assert_eq!(idle.outcomes(), vec![ErrorKind::Success]);
        assert!(!idle.sock.is_closed());
        // the timer went with the pending connect
        assert_eq!(idle.poller.timers().len(), 0);
    }

    #[test]
    fn test_interest_failure_after_connect_reports_failure_only() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let idle = Idle::new();

        idle.connect(port, Duration::from_secs(5));
        let handle = idle.sock.current_handle().unwrap();
        let _peer = listener.accept().unwrap();

        // pull the descriptor out of the poller so the next interest update fails
        idle.poller.unregister_fd(handle.raw_fd()).unwrap();
        idle.sock.on_connected(&handle);

        assert_eq!(idle.outcomes(), vec![ErrorKind::Other]);
        assert_eq!(idle.errors.load(Ordering::SeqCst), 0);
        assert!(idle.sock.is_closed());
    }
}

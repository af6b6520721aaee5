//! Single-owner wrapper around one OS socket descriptor.

use std::{
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    sync::{Arc, Mutex},
};

use mio::{Interest, Token};
use socket2::Socket;

use crate::{
    error::{lock, Result},
    poll::PollHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockKind {
    Stream,
    Datagram,
    Listener,
}

/// Platform lifecycle hook, for systems that need a descriptor marked as
/// connected (and unmarked before it closes).
pub trait SocketHook: Send + Sync {
    fn on_connected(&self, fd: RawFd) {
        let _ = fd;
    }

    fn on_close(&self, fd: RawFd) {
        let _ = fd;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl SocketHook for NoopHook {}

/// Owns a descriptor for its whole life.
///
/// Dropping the handle shuts the socket down in both directions and asks
/// the poller to deregister it; the descriptor is closed by the
/// deregistration completion on the loop thread, never before.
pub struct Handle {
    socket: Arc<Socket>,
    fd: RawFd,
    token: Token,
    kind: SockKind,
    poller: Arc<PollHandle>,
    hook: Option<Arc<dyn SocketHook>>,
    interest: Mutex<Option<Interest>>,
}

impl Handle {
    pub(crate) fn new(
        socket: Socket,
        kind: SockKind,
        poller: Arc<PollHandle>,
        hook: Option<Arc<dyn SocketHook>>,
    ) -> Self {
        let fd = socket.as_raw_fd();
        let token = poller.next_token();
        Self {
            socket: Arc::new(socket),
            fd,
            token,
            kind,
            poller,
            hook,
            interest: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn kind(&self) -> SockKind {
        self.kind
    }

    pub fn interest(&self) -> Option<Interest> {
        *lock(&self.interest)
    }

    pub fn set_interest(&self, desired: Option<Interest>) -> Result<()> {
        self.update_interest(|| desired)
    }

    /// Brings the kernel interest set in line with what `compute` returns.
    ///
    /// `compute` runs under the interest lock and the lock is held across the
    /// registry call, so concurrent updates apply in the order they observed
    /// the socket state.
    pub fn update_interest<F>(&self, compute: F) -> Result<()>
    where
        F: FnOnce() -> Option<Interest>,
    {
        let mut current = lock(&self.interest);
        let desired = compute();
        match (*current, desired) {
            (None, None) => {}
            (Some(_), None) => self.poller.unregister_fd(self.fd)?,
            (None, Some(interest)) => self.poller.register_fd(self.fd, self.token, interest)?,
            (Some(old), Some(new)) if old == new => return Ok(()),
            (Some(_), Some(interest)) => self.poller.reregister_fd(self.fd, self.token, interest)?,
        }
        tracing::trace!(fd = self.fd, token = ?self.token, ?desired, "interest updated");
        *current = desired;
        Ok(())
    }

    /// Marks the descriptor connected for the platform hook.
    pub fn set_connected(&self) {
        if let Some(hook) = &self.hook {
            hook.on_connected(self.fd);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()?.as_socket()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()?.as_socket()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // unconnected datagram sockets answer ENOTCONN, which is fine
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            tracing::trace!(fd = self.fd, kind = ?self.kind, error = %e, "shutdown skipped");
        }
        if let Some(hook) = &self.hook {
            hook.on_close(self.fd);
        }
        let registered = lock(&self.interest).is_some();
        let socket = Arc::clone(&self.socket);
        self.poller
            .deregister_fd(self.fd, self.token, registered, move |_| drop(socket));
        tracing::trace!(fd = self.fd, token = ?self.token, "handle released");
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("kind", &self.kind)
            .finish()
    }
}

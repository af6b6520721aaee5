use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use bytes::Bytes;

use super::Socket;
use crate::net::errors::SockError;

/// Receives each chunk read from the socket, with the sender address for
/// datagram sockets.
pub type ReadCallback = Box<dyn Fn(Bytes, Option<SocketAddr>) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&SockError) + Send + Sync>;
pub type AcceptCallback = Box<dyn Fn(Arc<Socket>) + Send + Sync>;
/// Called once the outbound queue drains. Returning false unregisters it.
pub type FlushCallback = Box<dyn Fn() -> bool + Send + Sync>;
pub type ConnectCallback = Box<dyn FnOnce(SockError) + Send>;

/// Callback slots. Each is swapped atomically and read by cloning the
/// `Arc` out, so a callback is always invoked without any lock held and a
/// concurrent replacement never tears.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) read: ArcSwapOption<ReadCallback>,
    pub(crate) err: ArcSwapOption<ErrorCallback>,
    pub(crate) accept: ArcSwapOption<AcceptCallback>,
    pub(crate) flush: ArcSwapOption<FlushCallback>,
}

impl Socket {
    pub fn set_on_read<F>(&self, cb: F)
    where
        F: Fn(Bytes, Option<SocketAddr>) + Send + Sync + 'static,
    {
        self.callbacks.read.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn set_on_err<F>(&self, cb: F)
    where
        F: Fn(&SockError) + Send + Sync + 'static,
    {
        self.callbacks.err.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn set_on_accept<F>(&self, cb: F)
    where
        F: Fn(Arc<Socket>) + Send + Sync + 'static,
    {
        self.callbacks.accept.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn set_on_flush<F>(&self, cb: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.callbacks.flush.store(Some(Arc::new(Box::new(cb))));
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.read.store(None);
        self.callbacks.err.store(None);
        self.callbacks.accept.store(None);
        self.callbacks.flush.store(None);
    }

    pub(crate) fn deliver_read(&self, data: Bytes, from: Option<SocketAddr>) {
        match self.callbacks.read.load_full() {
            Some(cb) => cb(data, from),
            None => tracing::trace!(bytes = data.len(), "no read callback, data discarded"),
        }
    }

    pub(crate) fn deliver_err(&self, err: &SockError) {
        match self.callbacks.err.load_full() {
            Some(cb) => cb(err),
            None => tracing::debug!(kind = ?err.kind(), error = %err, "no error callback"),
        }
    }

    /// Hands an accepted socket to the consumer. Returns false if nobody
    /// is listening for it.
    pub(crate) fn deliver_accept(&self, peer: Arc<Socket>) -> bool {
        match self.callbacks.accept.load_full() {
            Some(cb) => {
                cb(peer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn deliver_flush(&self) {
        let Some(cb) = self.callbacks.flush.load_full() else {
            return;
        };
        if !cb() {
            // only unregister the callback that asked for it
            let _ = self.callbacks.flush.compare_and_swap(&cb, None);
        }
    }
}

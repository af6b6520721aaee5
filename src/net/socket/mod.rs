//! The socket engine.
//!
//! A [`Socket`] owns at most one [`Handle`] at a time together with the
//! outbound queue and the consumer callbacks. Readiness events are handled
//! on the loop thread; `send` and friends may be called from any thread.
//!
//! Lock order: handle slot, then queue. Interest updates compute under the
//! handle's interest lock and may take the queue and pending-connect locks
//! from there; nothing takes the interest lock while holding either.

mod callbacks;
mod connect;
mod io;

use std::{
    net::{IpAddr, SocketAddr},
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
};

use mio::{event::Event, Interest, Token};

pub use callbacks::{AcceptCallback, ConnectCallback, ErrorCallback, FlushCallback, ReadCallback};
use callbacks::Callbacks;
use connect::PendingConnect;

use crate::{
    error::lock,
    handler::EventHandler,
    net::{
        config::SocketConfig,
        errors::SockError,
        handle::{Handle, SockKind},
        packet::{Backpressure, OutboundQueue},
    },
    poll::PollHandle,
};

pub struct Socket {
    poller: Arc<PollHandle>,
    config: SocketConfig,
    handle: Mutex<Option<Arc<Handle>>>,
    queue: OutboundQueue,
    callbacks: Callbacks,
    recv_enabled: AtomicBool,
    max_send_packets: AtomicUsize,
    drop_on_overflow: AtomicBool,
    connecting: Mutex<Option<PendingConnect>>,
    weak_self: Weak<Socket>,
}

impl Socket {
    pub fn new(poller: Arc<PollHandle>, config: SocketConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            recv_enabled: AtomicBool::new(config.recv_enabled),
            max_send_packets: AtomicUsize::new(config.max_send_packets.max(1)),
            drop_on_overflow: AtomicBool::new(config.drop_on_overflow),
            poller,
            config,
            handle: Mutex::new(None),
            queue: OutboundQueue::new(),
            callbacks: Callbacks::default(),
            connecting: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn poller(&self) -> &Arc<PollHandle> {
        &self.poller
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Gates read-ready handling. Disabling drops read interest so no data
    /// callback fires until receiving is enabled again.
    pub fn enable_recv(&self, enabled: bool) {
        if self.recv_enabled.swap(enabled, Ordering::AcqRel) != enabled {
            self.sync_interest();
        }
    }

    pub fn is_recv_enabled(&self) -> bool {
        self.recv_enabled.load(Ordering::Acquire)
    }

    /// Sets the queue length at which new packets are dropped.
    pub fn set_send_pkt_size(&self, max_packets: usize) {
        self.max_send_packets
            .store(max_packets.max(1), Ordering::Release);
    }

    pub fn set_should_drop_packet(&self, drop: bool) {
        self.drop_on_overflow.store(drop, Ordering::Release);
    }

    pub fn queued_packets(&self) -> usize {
        self.queue.len()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.current_handle().map(|h| h.raw_fd())
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.handle).is_none()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_handle()?.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current_handle()?.peer_addr()
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_addr().map(|a| a.ip())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr().map(|a| a.ip())
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.peer_addr().map(|a| a.port())
    }

    /// Releases the handle and every queued packet without invoking the
    /// error callback. Idempotent.
    pub fn close(&self) {
        // an abandoned connect never reports
        let pending = lock(&self.connecting).take();
        drop(pending);
        let handle = lock(&self.handle).take();
        let dropped = self.queue.clear();
        if let Some(handle) = handle {
            tracing::debug!(fd = handle.raw_fd(), dropped, "socket closed");
        }
    }

    /// Raises `err` through the error path: the handle is torn down and the
    /// error callback runs once. Returns false if the socket was already
    /// closed, in which case nothing is reported.
    pub fn emit_err(&self, err: SockError) -> bool {
        self.teardown(None, err)
    }

    /// Tears down the handle identified by `token` (any handle when None)
    /// and reports `err`. Only the caller that actually took the handle
    /// reports, so a failure is delivered exactly once.
    pub(crate) fn teardown(&self, token: Option<Token>, err: SockError) -> bool {
        let Some(handle) = self.take_handle_if(token) else {
            return false;
        };
        let pending = lock(&self.connecting).take();
        let dropped = self.queue.clear();
        tracing::debug!(
            fd = handle.raw_fd(),
            kind = ?err.kind(),
            error = %err,
            dropped,
            "socket torn down"
        );
        drop(handle);
        match pending.and_then(PendingConnect::into_callback) {
            Some(on_result) => on_result(err),
            None => self.deliver_err(&err),
        }
        true
    }

    pub(crate) fn current_handle(&self) -> Option<Arc<Handle>> {
        lock(&self.handle).clone()
    }

    fn is_current(&self, handle: &Handle) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|h| h.token() == handle.token())
    }

    fn take_handle_if(&self, token: Option<Token>) -> Option<Arc<Handle>> {
        let mut slot = lock(&self.handle);
        match (slot.as_ref(), token) {
            (Some(_), None) => slot.take(),
            (Some(h), Some(token)) if h.token() == token => slot.take(),
            _ => None,
        }
    }

    /// Makes `handle` the active one and routes its events here. The old
    /// handle, if any, is released outside the slot lock.
    pub(crate) fn install(&self, handle: Arc<Handle>, register: bool) {
        let events = SocketEvents {
            socket: self.weak_self.clone(),
            handle: Arc::downgrade(&handle),
        };
        self.poller.insert_handler(handle.token(), Arc::new(events));
        let old = lock(&self.handle).replace(Arc::clone(&handle));
        drop(old);
        if register {
            self.sync_handle_interest(&handle);
        }
    }

    /// Re-evaluates the interest set of the active handle.
    pub(crate) fn sync_interest(&self) {
        if let Some(handle) = self.current_handle() {
            self.sync_handle_interest(&handle);
        }
    }

    fn sync_handle_interest(&self, handle: &Arc<Handle>) {
        if let Err(err) = self.apply_interest(handle) {
            self.teardown(Some(handle.token()), err);
        }
    }

    /// Like `sync_handle_interest`, but leaves the failure to the caller.
    fn apply_interest(&self, handle: &Arc<Handle>) -> Result<(), SockError> {
        handle
            .update_interest(|| self.desired_interest(handle))
            .map_err(|e| {
                tracing::warn!(fd = handle.raw_fd(), error = %e, "failed to update interest");
                SockError::other(e.to_string())
            })
    }

    /// Drops the handle identified by `token` together with the queue,
    /// without reporting. False if another path got there first.
    fn release(&self, token: Token, err: &SockError) -> bool {
        let Some(handle) = self.take_handle_if(Some(token)) else {
            return false;
        };
        let dropped = self.queue.clear();
        tracing::debug!(fd = handle.raw_fd(), error = %err, dropped, "socket torn down");
        true
    }

    fn desired_interest(&self, handle: &Handle) -> Option<Interest> {
        if handle.kind() == SockKind::Listener {
            return Some(Interest::READABLE);
        }
        let connecting = lock(&self.connecting)
            .as_ref()
            .is_some_and(|p| p.token() == handle.token());
        if connecting {
            return Some(Interest::WRITABLE);
        }
        let read = self.is_recv_enabled().then_some(Interest::READABLE);
        let write = self.queue.is_write_armed().then_some(Interest::WRITABLE);
        match (read, write) {
            (Some(read), Some(write)) => Some(read | write),
            (read, write) => read.or(write),
        }
    }

    fn backpressure(&self) -> Backpressure {
        Backpressure {
            max_packets: self.max_send_packets.load(Ordering::Acquire),
            drop_on_overflow: self.drop_on_overflow.load(Ordering::Acquire),
            send_timeout: self.config.send_timeout,
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let pending = lock(&self.connecting).take();
        drop(pending);
        self.queue.clear();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("handle", &self.current_handle())
            .field("queued", &self.queue.len())
            .field("recv_enabled", &self.is_recv_enabled())
            .finish()
    }
}

/// Poller-side entry for one handle. Events for a handle that is no longer
/// the socket's active one are ignored.
struct SocketEvents {
    socket: Weak<Socket>,
    handle: Weak<Handle>,
}

impl EventHandler for SocketEvents {
    fn handle_event(&self, event: &Event) {
        let (Some(socket), Some(handle)) = (self.socket.upgrade(), self.handle.upgrade()) else {
            return;
        };
        if !socket.is_current(&handle) {
            return;
        }
        socket.on_event(&handle, event);
    }
}

use std::{
    io::{self, Read},
    mem::MaybeUninit,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use mio::event::Event;
use socket2::{Domain, Protocol, SockAddr, Type};

use super::Socket;
use crate::{
    error::lock,
    net::{
        errors::SockError,
        handle::{Handle, SockKind},
        packet::{Drain, Payload, SendFlags, Submitted},
    },
};

impl Socket {
    /// Sends on the connected stream with the configured TCP flags.
    ///
    /// Returns the number of bytes accepted: everything when written or
    /// queued, 0 when the socket is closed or the packet was dropped.
    pub fn send(&self, data: &[u8]) -> usize {
        self.send_with_flags(data, self.config.tcp_flags)
    }

    pub fn send_bytes(&self, data: Bytes) -> usize {
        self.real_send(Payload::Shared(data), None, self.config.tcp_flags)
    }

    pub fn send_with_flags(&self, data: &[u8], flags: SendFlags) -> usize {
        self.real_send(Payload::Borrowed(data), None, flags)
    }

    /// Sends one datagram to `addr` with the configured UDP flags.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> usize {
        self.send_to_with_flags(data, addr, self.config.udp_flags)
    }

    pub fn send_bytes_to(&self, data: Bytes, addr: SocketAddr) -> usize {
        self.real_send(Payload::Shared(data), Some(addr.into()), self.config.udp_flags)
    }

    pub fn send_to_with_flags(&self, data: &[u8], addr: SocketAddr, flags: SendFlags) -> usize {
        self.real_send(Payload::Borrowed(data), Some(addr.into()), flags)
    }

    fn real_send(&self, payload: Payload<'_>, addr: Option<SockAddr>, flags: SendFlags) -> usize {
        let limits = self.backpressure();
        let len = payload.len();
        // the slot stays locked across the submission so a concurrent
        // teardown cannot clear the queue in between
        let (token, outcome) = {
            let slot = lock(&self.handle);
            let Some(handle) = slot.as_ref() else {
                return 0;
            };
            let outcome = self
                .queue
                .submit(handle.socket(), payload, addr, flags, &limits);
            (handle.token(), outcome)
        };

        match outcome {
            Submitted::Sent(n) => n,
            Submitted::Queued { accepted, arm } => {
                if arm {
                    self.sync_interest();
                }
                accepted
            }
            Submitted::Dropped => {
                tracing::warn!(
                    bytes = len,
                    max_packets = limits.max_packets,
                    "send queue full, packet dropped"
                );
                0
            }
            Submitted::Stalled => {
                self.teardown(Some(token), SockError::timeout("send timed out"));
                0
            }
            Submitted::Failed(e) => {
                self.teardown(Some(token), SockError::from_io(&e));
                0
            }
        }
    }

    pub(super) fn on_event(&self, handle: &Arc<Handle>, event: &Event) {
        if handle.kind() == SockKind::Listener {
            if event.is_readable() {
                self.on_accept(handle);
            }
            return;
        }
        if self.is_connecting(handle.token()) {
            if event.is_writable() || event.is_error() || event.is_write_closed() {
                self.on_connected(handle);
            }
            return;
        }

        if event.is_readable() || event.is_read_closed() {
            self.on_read(handle);
        }
        if event.is_writable() && self.is_current(handle) {
            self.on_write(handle);
        }
        if event.is_error() && self.is_current(handle) {
            let err = match handle.socket().take_error() {
                Ok(Some(e)) | Err(e) => SockError::from_io(&e),
                Ok(None) => return,
            };
            self.teardown(Some(handle.token()), err);
        }
    }

    /// Reads until the kernel has nothing left, handing each chunk to the
    /// read callback in a freshly allocated buffer.
    fn on_read(&self, handle: &Arc<Handle>) {
        let quantum = self.config.read_quantum;
        while self.is_recv_enabled() && self.is_current(handle) {
            let mut buf = vec![0u8; quantum];
            let received = match handle.kind() {
                SockKind::Datagram => {
                    recv_datagram(handle.socket(), &mut buf).map(|(n, from)| (n, from.as_socket()))
                }
                _ => recv_stream(handle.socket(), &mut buf).map(|n| (n, None)),
            };

            match received {
                Ok((0, _)) if handle.kind() == SockKind::Stream => {
                    tracing::debug!(fd = handle.raw_fd(), "peer closed");
                    self.teardown(Some(handle.token()), SockError::eof("end of file"));
                    return;
                }
                Ok((n, from)) => {
                    buf.truncate(n);
                    self.deliver_read(Bytes::from(buf), from);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.teardown(Some(handle.token()), SockError::from_io(&e));
                    return;
                }
            }
        }
    }

    fn on_write(&self, handle: &Arc<Handle>) {
        match self.queue.drain(handle.socket()) {
            Drain::Flushed => {
                self.sync_handle_interest(handle);
                self.deliver_flush();
            }
            Drain::Pending => {}
            Drain::Failed(e) => {
                self.teardown(Some(handle.token()), SockError::from_io(&e));
            }
        }
    }

    /// Accepts until the backlog is empty. Each connection becomes its own
    /// `Socket`; read interest is only registered after the accept callback
    /// ran, so the consumer can install its callbacks first.
    fn on_accept(&self, listener: &Arc<Handle>) {
        loop {
            let (stream, addr) = match listener.socket().accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    tracing::warn!(fd = listener.raw_fd(), error = %e, "accept failed");
                    self.teardown(Some(listener.token()), SockError::from_io(&e));
                    return;
                }
            };
            let peer = addr.as_socket();
            if let Err(e) = stream.set_nonblocking(true) {
                tracing::warn!(?peer, error = %e, "cannot make accepted socket non-blocking");
                continue;
            }
            if self.config.no_delay {
                if let Err(e) = stream.set_tcp_nodelay(true) {
                    tracing::debug!(?peer, error = %e, "cannot set TCP_NODELAY");
                }
            }

            let socket = Socket::new(Arc::clone(&self.poller), self.config.clone());
            let handle = Arc::new(Handle::new(
                stream,
                SockKind::Stream,
                Arc::clone(&self.poller),
                self.config.hook.clone(),
            ));
            handle.set_connected();
            tracing::debug!(?peer, fd = handle.raw_fd(), "accepted connection");
            socket.install(handle, false);

            if self.deliver_accept(Arc::clone(&socket)) {
                socket.sync_interest();
            } else {
                tracing::debug!(?peer, "no accept callback, connection dropped");
            }
        }
    }

    /// Binds a listening stream socket and starts accepting.
    ///
    /// `local_ip` defaults to the IPv4 wildcard. Failures are returned
    /// directly and never reach the error callback.
    pub fn listen(&self, port: u16, local_ip: Option<&str>, backlog: i32) -> Result<(), SockError> {
        self.close();
        let addr = local_addr(local_ip, port)?;
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        let handle = Arc::new(Handle::new(
            socket,
            SockKind::Listener,
            Arc::clone(&self.poller),
            self.config.hook.clone(),
        ));
        tracing::info!(local = ?handle.local_addr(), backlog, "listening");
        self.install(handle, true);
        self.ensure_open()
    }

    /// Binds a datagram socket; reading starts at once.
    pub fn bind_udp(&self, port: u16, local_ip: Option<&str>) -> Result<(), SockError> {
        self.close();
        let addr = local_addr(local_ip, port)?;
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let handle = Arc::new(Handle::new(
            socket,
            SockKind::Datagram,
            Arc::clone(&self.poller),
            self.config.hook.clone(),
        ));
        tracing::info!(local = ?handle.local_addr(), "udp socket bound");
        self.install(handle, true);
        self.ensure_open()
    }

    // registration can fail inside install, which tears the handle down
    fn ensure_open(&self) -> Result<(), SockError> {
        if self.is_closed() {
            Err(SockError::other("failed to register with the poller"))
        } else {
            Ok(())
        }
    }
}

fn local_addr(local_ip: Option<&str>, port: u16) -> Result<SocketAddr, SockError> {
    let ip = match local_ip {
        Some(ip) => ip
            .parse::<IpAddr>()
            .map_err(|e| SockError::other(format!("invalid local address {ip}: {e}")))?,
        None => IpAddr::from([0, 0, 0, 0]),
    };
    Ok(SocketAddr::new(ip, port))
}

fn recv_stream(socket: &socket2::Socket, buf: &mut [u8]) -> io::Result<usize> {
    let mut reader = socket;
    reader.read(buf)
}

fn recv_datagram(socket: &socket2::Socket, buf: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    // SAFETY: `buf` is initialized and recv_from only ever writes into it,
    // so viewing it as `MaybeUninit<u8>` is sound.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_from(uninit)
}

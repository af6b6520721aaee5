//! # Mill-Socket
//! A non-blocking, callback-driven socket engine on top of a small reactor.
//!
//! Mill-Socket drives TCP and UDP sockets from a single event loop thread built
//! on [`mio`]. Producers on any thread hand bytes to a [`Socket`](net::socket::Socket);
//! whatever the kernel does not take at once is queued and flushed when the
//! descriptor becomes writable, with a bounded queue as backpressure.
//! ## Features
//! - **Runtime-agnostic**: no async runtime, just handlers and callbacks
//! - **Never blocks**: connect, send and close all return immediately
//! - **Backpressure**: bounded outbound queue that drops the newest packet when full
//! - **Safe teardown**: descriptors are closed on the loop thread after deregistration
//! - **Sessions**: per-connection protocol objects scheduled on a pinned worker
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│   Reactor    │───▶│ PollHandle  │──▶ timers, deferred closes
//! └─────────────┘    └──────────────┘    └─────────────┘
//!                                               │ readiness
//!                                               ▼
//!                    ┌──────────────┐    ┌─────────────┐
//!                    │ TcpServer    │───▶│   Socket    │──▶ Handle + OutboundQueue
//!                    └──────────────┘    └─────────────┘
//!                           │
//!                           ▼
//!                    ┌──────────────┐
//!                    │ ThreadPool   │──▶ Session callbacks
//!                    └──────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_socket::{net::{Socket, SocketConfig}, EventLoop};
//! use std::{sync::Arc, thread};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_loop = Arc::new(EventLoop::default());
//!     let udp = Socket::new(event_loop.handle(), SocketConfig::default());
//!
//!     let echo = Arc::downgrade(&udp);
//!     udp.set_on_read(move |data, from| {
//!         if let (Some(sock), Some(from)) = (echo.upgrade(), from) {
//!             sock.send_bytes_to(data, from);
//!         }
//!     });
//!     udp.bind_udp(9000, Some("127.0.0.1"))?;
//!
//!     event_loop.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`EventLoop`]: owns the reactor, registers raw sources, runs and stops the loop
//! - [`net`]: the socket engine, its configuration and the session layer
//! - [`poll`]: handler registry, deferred tasks and timer scheduling
//! - [`thread_pool`]: workers for session callbacks
//! - [`error`]: loop-level errors; socket errors live in [`net::errors`]

#![cfg_attr(feature = "unstable-mpmc", feature(mpmc_channel))]

use std::sync::Arc;

use mio::{Interest, Token};
pub mod error;
pub mod handler;
pub mod net;
pub mod poll;
pub mod reactor;
pub mod thread_pool;
pub mod timer;

pub use handler::EventHandler;
pub use mio::event::Event;

use crate::{
    error::Result,
    poll::PollHandle,
    reactor::{DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS},
};

/// Re-exports of the types most programs touch.
///
/// ```rust
/// use mill_socket::prelude::*;
/// ```
pub mod prelude {
    pub use crate::handler::EventHandler;
    pub use crate::net::{
        ErrorKind, SendFlags, Session, SessionContext, SockError, Socket, SocketConfig,
        TcpServer, TcpServerConfig,
    };
    pub use crate::reactor::{self, Reactor};
    pub use crate::thread_pool::{self, ThreadPool};
    pub use crate::EventLoop;
}

/// The event loop: one reactor, run on whichever thread calls [`run`](Self::run).
///
/// Sockets are created against [`handle`](Self::handle) and may be used from
/// any thread; their readiness handlers always execute on the loop thread.
///
/// ## Example
///
/// ```rust,no_run
/// use mill_socket::EventLoop;
/// use std::{sync::Arc, thread, time::Duration};
///
/// let event_loop = Arc::new(EventLoop::new(512, 50)?);
/// let runner = Arc::clone(&event_loop);
/// let handle = thread::spawn(move || runner.run());
///
/// thread::sleep(Duration::from_millis(100));
/// event_loop.stop();
/// handle.join().unwrap()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct EventLoop {
    reactor: reactor::Reactor,
}

impl Default for EventLoop {
    /// Creates an `EventLoop` with [`DEFAULT_EVENTS_CAPACITY`] events per poll
    /// and a [`DEFAULT_POLL_TIMEOUT_MS`] poll timeout.
    ///
    /// # Panics
    ///
    /// Panics if the OS poller cannot be created.
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS)
            .expect("failed to create the OS poller")
    }
}

impl EventLoop {
    /// ## Arguments
    /// * `events_capacity` - Maximum number of events handled per poll (typical: 512-4096)
    /// * `poll_timeout_ms` - Upper bound on one poll; timers shorten it as needed
    pub fn new(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        let reactor = reactor::Reactor::new(events_capacity, poll_timeout_ms)?;
        Ok(Self { reactor })
    }

    /// The poller shared by every socket of this loop.
    pub fn handle(&self) -> Arc<PollHandle> {
        self.reactor.handle()
    }

    /// Registers a raw mio source with its own handler.
    ///
    /// Sockets created through [`net::Socket`] register themselves; this is
    /// for anything else that should be driven by the same loop.
    pub fn register<H, S>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + Send + Sync + 'static,
        S: mio::event::Source + ?Sized,
    {
        self.reactor
            .poll_handle
            .register(source, token, interests, handler)
    }

    pub fn deregister<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.reactor.poll_handle.deregister(source, token)
    }

    /// Runs the loop on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }

    /// Signals the loop to stop after the current iteration. Thread-safe.
    pub fn stop(&self) {
        self.reactor.get_shutdown_handle().shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }
}

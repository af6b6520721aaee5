//! Non-blocking TCP and UDP sockets driven by the event loop.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────┐              │
//! │  │ TcpServer    │────────▶│ Your Session    │              │
//! │  │              │          │ (on_recv, ...)  │              │
//! │  └──────────────┘          └─────────────────┘              │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ accept               │ pinned worker
//!              ▼                      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Socket                             │
//! │  ┌──────────┐       ┌──────────────┐       ┌───────────┐    │
//! │  │ Handle   │       │ OutboundQueue│       │ Callbacks │    │
//! │  │ (fd)     │       │ (backpressure│       │ (swapped  │    │
//! │  │          │       │  + flush)    │       │  atomically)   │
//! │  └──────────┘       └──────────────┘       └───────────┘    │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ readiness (loop thread)
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 PollHandle (epoll/kqueue)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sending never blocks: bytes the kernel does not take right away are
//! queued as packets and flushed on write-ready. When the queue holds
//! `max_send_packets` packets, further packets are dropped (or queued
//! without bound when dropping is disabled). Every failure is classified
//! once as a [`SockError`] and reported once through the error callback,
//! after which the socket is closed.
//!
//! # Example
//!
//! ```rust,no_run
//! use mill_socket::net::{Session, SessionContext, TcpServer, TcpServerConfig};
//! use mill_socket::{thread_pool::ThreadPool, EventLoop};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Session for Echo {
//!     fn on_recv(&self, ctx: &SessionContext, data: Bytes) {
//!         ctx.send_bytes(data);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let event_loop = EventLoop::default();
//! let pool = Arc::new(ThreadPool::new(4));
//! let server = TcpServer::new(event_loop.handle(), pool, TcpServerConfig::default(), |_| Echo);
//! server.start(8080, Some("127.0.0.1"))?;
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod handle;
pub mod packet;
pub mod session;
pub mod socket;

pub use config::{SocketConfig, SocketConfigBuilder, TcpServerConfig, TcpServerConfigBuilder};
pub use errors::{ErrorKind, SockError};
pub use handle::{Handle, NoopHook, SockKind, SocketHook};
pub use packet::{OutboundQueue, Packet, SendFlags};
pub use session::{Session, SessionContext, SessionId, TcpServer};
pub use socket::Socket;

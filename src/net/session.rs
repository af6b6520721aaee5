//! Accepted-connection sessions on top of the socket engine.
//!
//! A [`TcpServer`] listens with one [`Socket`] and wraps every accepted
//! connection in a user [`Session`]. All callbacks of one session run on the
//! same worker of the [`ThreadPool`], in the order the loop produced them.
//!
//! ```text
//! Session Storage:
//!   DashMap<SessionId, Entry>
//!        ├──> SessionId(1) ──> Entry { session, ctx: { sock, pool } }
//!        └──> SessionId(N) ──> Entry { session, ctx: { sock, pool } }
//! ```

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use bytes::Bytes;
use dashmap::DashMap;

use crate::{
    error::{lock, Result},
    net::{config::TcpServerConfig, errors::SockError, socket::Socket},
    poll::PollHandle,
    thread_pool::ThreadPool,
    timer::TimerHandle,
};

/// Unique identifier for sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Application protocol for one accepted connection.
pub trait Session: Send + Sync + 'static {
    /// Called with every chunk read from the connection
    fn on_recv(&self, ctx: &SessionContext, data: Bytes);

    /// Called once when the connection fails or is shut down. The session
    /// is forgotten by its server afterwards.
    fn on_error(&self, ctx: &SessionContext, err: &SockError) {
        let _ = (ctx, err);
    }

    /// Periodic tick, see `TcpServerConfig::manager_interval`
    fn on_manager(&self, ctx: &SessionContext) {
        let _ = ctx;
    }
}

/// What a session gets to talk to its connection with.
#[derive(Clone)]
pub struct SessionContext {
    id: SessionId,
    sock: Arc<Socket>,
    pool: Arc<ThreadPool>,
}

impl SessionContext {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.sock
    }

    pub fn send(&self, data: &[u8]) -> usize {
        self.sock.send(data)
    }

    pub fn send_bytes(&self, data: Bytes) -> usize {
        self.sock.send_bytes(data)
    }

    /// Closes the connection through the error path, so `on_error` runs.
    pub fn shutdown(&self) {
        self.sock.emit_err(SockError::other("self shutdown"));
    }

    /// Like [`shutdown`](Self::shutdown), but queued behind every callback
    /// already scheduled for this session.
    pub fn safe_shutdown(&self) {
        let sock = Arc::clone(&self.sock);
        if let Err(e) = self.spawn(move || {
            sock.emit_err(SockError::other("self shutdown"));
        }) {
            tracing::debug!(session = self.id.0, error = %e, "shutdown not scheduled");
        }
    }

    /// Runs `task` on this session's worker.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.exec_pinned(self.id.0, task)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr()
    }
}

type Factory<S> = Box<dyn Fn(&SessionContext) -> S + Send + Sync>;

struct Entry<S> {
    session: Arc<S>,
    ctx: SessionContext,
}

struct Sessions<S> {
    map: DashMap<SessionId, Entry<S>>,
    pool: Arc<ThreadPool>,
    factory: Factory<S>,
    next_id: AtomicU64,
}

impl<S: Session> Sessions<S> {
    fn accept(self: &Arc<Self>, sock: Arc<Socket>) {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let ctx = SessionContext {
            id,
            sock: Arc::clone(&sock),
            pool: Arc::clone(&self.pool),
        };
        let session = Arc::new((self.factory)(&ctx));
        tracing::debug!(session = id.0, peer = ?ctx.peer_addr(), "session opened");

        let (s, c) = (Arc::clone(&session), ctx.clone());
        sock.set_on_read(move |data, _| {
            let (session, ctx) = (Arc::clone(&s), c.clone());
            if let Err(e) = c.spawn(move || session.on_recv(&ctx, data)) {
                tracing::debug!(session = id.0, error = %e, "recv dropped");
            }
        });

        let (s, c) = (Arc::clone(&session), ctx.clone());
        let sessions = Arc::downgrade(self);
        sock.set_on_err(move |err| {
            let (session, ctx, err) = (Arc::clone(&s), c.clone(), err.clone());
            let sessions = Weak::clone(&sessions);
            let result = c.spawn(move || {
                session.on_error(&ctx, &err);
                if let Some(sessions) = sessions.upgrade() {
                    sessions.map.remove(&ctx.id);
                }
                // the callbacks hold the context, which holds the socket
                ctx.sock.clear_callbacks();
                tracing::debug!(session = ctx.id.0, error = %err, "session closed");
            });
            if let Err(e) = result {
                tracing::debug!(session = id.0, error = %e, "error not delivered");
            }
        });

        self.map.insert(id, Entry { session, ctx });
    }

    fn tick(&self) {
        for entry in self.map.iter() {
            let (session, ctx) = (Arc::clone(&entry.session), entry.ctx.clone());
            if let Err(e) = entry.ctx.spawn(move || session.on_manager(&ctx)) {
                tracing::debug!(session = entry.key().0, error = %e, "manager tick dropped");
            }
        }
    }

    fn close_all(&self) {
        let sockets: Vec<Arc<Socket>> = self
            .map
            .iter()
            .map(|entry| Arc::clone(&entry.ctx.sock))
            .collect();
        self.map.clear();
        for sock in sockets {
            sock.close();
            sock.clear_callbacks();
        }
    }
}

/// Listens on one port and runs a `Session` per accepted connection.
pub struct TcpServer<S: Session> {
    listener: Arc<Socket>,
    sessions: Arc<Sessions<S>>,
    config: TcpServerConfig,
    manager: Mutex<Option<TimerHandle>>,
}

impl<S: Session> TcpServer<S> {
    pub fn new<F>(
        poller: Arc<PollHandle>,
        pool: Arc<ThreadPool>,
        config: TcpServerConfig,
        factory: F,
    ) -> Self
    where
        F: Fn(&SessionContext) -> S + Send + Sync + 'static,
    {
        Self {
            listener: Socket::new(poller, config.socket.clone()),
            sessions: Arc::new(Sessions {
                map: DashMap::new(),
                pool,
                factory: Box::new(factory),
                next_id: AtomicU64::new(1),
            }),
            config,
            manager: Mutex::new(None),
        }
    }

    /// Binds `ip:port` (wildcard when `ip` is None) and starts accepting.
    pub fn start(&self, port: u16, ip: Option<&str>) -> std::result::Result<(), SockError> {
        let sessions = Arc::downgrade(&self.sessions);
        self.listener.set_on_accept(move |sock| {
            if let Some(sessions) = sessions.upgrade() {
                sessions.accept(sock);
            }
        });
        self.listener.set_on_err(|err| {
            tracing::error!(error = %err, "listener failed");
        });
        self.listener.listen(port, ip, self.config.backlog)?;

        let sessions = Arc::downgrade(&self.sessions);
        let timer = self
            .listener
            .poller()
            .schedule_repeating(self.config.manager_interval, move || match sessions.upgrade() {
                Some(sessions) => {
                    sessions.tick();
                    true
                }
                None => false,
            });
        if let Some(old) = lock(&self.manager).replace(timer) {
            old.cancel();
        }
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_port()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.map.len()
    }

    /// Stops accepting and closes every session without calling `on_error`.
    pub fn stop(&self) {
        if let Some(timer) = lock(&self.manager).take() {
            timer.cancel();
        }
        self.listener.close();
        self.listener.clear_callbacks();
        self.sessions.close_all();
    }
}

impl<S: Session> Drop for TcpServer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

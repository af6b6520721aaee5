use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, LazyLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use mill_socket::{
    net::{Session, SessionContext, SockError, TcpServer, TcpServerConfig},
    thread_pool::ThreadPool,
    EventLoop,
};
use tracing_subscriber::EnvFilter;

static EVENT_LOOP: LazyLock<EventLoop> = LazyLock::new(EventLoop::default);

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Echoes every byte back and drops connections idle for too long.
struct EchoSession {
    last_seen: std::sync::Mutex<Instant>,
    echoed: AtomicUsize,
}

impl Session for EchoSession {
    fn on_recv(&self, ctx: &SessionContext, data: Bytes) {
        *self.last_seen.lock().unwrap() = Instant::now();
        self.echoed.fetch_add(data.len(), Ordering::Relaxed);
        ctx.send_bytes(data);
    }

    fn on_error(&self, ctx: &SessionContext, err: &SockError) {
        tracing::info!(
            session = ctx.id().as_u64(),
            bytes = self.echoed.load(Ordering::Relaxed),
            %err,
            "session finished"
        );
    }

    fn on_manager(&self, ctx: &SessionContext) {
        if self.last_seen.lock().unwrap().elapsed() > IDLE_TIMEOUT {
            tracing::info!(session = ctx.id().as_u64(), "idle, closing");
            ctx.safe_shutdown();
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|p| p.parse::<u16>())
        .transpose()
        .context("port must be a number")?
        .unwrap_or(8080);

    let pool = Arc::new(ThreadPool::default());
    let server = TcpServer::new(EVENT_LOOP.handle(), pool, TcpServerConfig::default(), |ctx| {
        tracing::info!(session = ctx.id().as_u64(), peer = ?ctx.peer_addr(), "new session");
        EchoSession {
            last_seen: std::sync::Mutex::new(Instant::now()),
            echoed: AtomicUsize::new(0),
        }
    });
    server
        .start(port, Some("127.0.0.1"))
        .with_context(|| format!("cannot listen on port {port}"))?;

    tracing::info!(port, "echo server listening");
    EVENT_LOOP.run()?;
    Ok(())
}

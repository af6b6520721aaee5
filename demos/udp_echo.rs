use std::sync::Arc;

use anyhow::Context;
use mill_socket::{
    net::{Socket, SocketConfig},
    EventLoop,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let event_loop = EventLoop::default();
    let socket = Socket::new(event_loop.handle(), SocketConfig::default());

    let echo = Arc::downgrade(&socket);
    socket.set_on_read(move |data, from| {
        let (Some(sock), Some(from)) = (echo.upgrade(), from) else {
            return;
        };
        tracing::debug!(%from, bytes = data.len(), "datagram");
        sock.send_bytes_to(data, from);
    });
    socket.set_on_err(|err| tracing::error!(%err, "udp socket failed"));
    socket
        .bind_udp(9000, Some("127.0.0.1"))
        .context("cannot bind udp port 9000")?;

    tracing::info!(local = ?socket.local_addr(), "udp echo ready");
    event_loop.run()?;
    Ok(())
}

use std::{fmt, sync::Arc, time::Duration};

use crate::net::{handle::SocketHook, packet::SendFlags};

pub const DEFAULT_MAX_SEND_PACKETS: usize = 256;
pub const DEFAULT_READ_QUANTUM: usize = 64 * 1024;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MANAGER_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Per-socket configuration.
///
/// Use `SocketConfig::builder()` for ergonomic construction; every unset
/// field keeps its default.
///
/// ## Backpressure
///
/// - max_send_packets: queue length at which new packets start being dropped
/// - drop_on_overflow: when false the queue grows without bound and the
///   caller is responsible for pacing
/// - send_timeout: raise a timeout error when queued data made no progress
///   for this long (None disables)
#[derive(Clone)]
pub struct SocketConfig {
    pub max_send_packets: usize,
    pub drop_on_overflow: bool,
    pub recv_enabled: bool,
    /// Size of the buffer allocated for each receive call
    pub read_quantum: usize,
    pub tcp_flags: SendFlags,
    pub udp_flags: SendFlags,
    pub send_timeout: Option<Duration>,
    /// Enable TCP_NODELAY on connected and accepted streams
    pub no_delay: bool,
    pub hook: Option<Arc<dyn SocketHook>>,
}

impl SocketConfig {
    pub fn builder() -> SocketConfigBuilder {
        SocketConfigBuilder::new()
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_send_packets: DEFAULT_MAX_SEND_PACKETS,
            drop_on_overflow: true,
            recv_enabled: true,
            read_quantum: DEFAULT_READ_QUANTUM,
            tcp_flags: SendFlags::TCP_DEFAULT,
            udp_flags: SendFlags::UDP_DEFAULT,
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            no_delay: true,
            hook: None,
        }
    }
}

impl fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConfig")
            .field("max_send_packets", &self.max_send_packets)
            .field("drop_on_overflow", &self.drop_on_overflow)
            .field("recv_enabled", &self.recv_enabled)
            .field("read_quantum", &self.read_quantum)
            .field("tcp_flags", &self.tcp_flags)
            .field("udp_flags", &self.udp_flags)
            .field("send_timeout", &self.send_timeout)
            .field("no_delay", &self.no_delay)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct SocketConfigBuilder {
    max_send_packets: Option<usize>,
    drop_on_overflow: Option<bool>,
    recv_enabled: Option<bool>,
    read_quantum: Option<usize>,
    tcp_flags: Option<SendFlags>,
    udp_flags: Option<SendFlags>,
    send_timeout: Option<Option<Duration>>,
    no_delay: Option<bool>,
    hook: Option<Arc<dyn SocketHook>>,
}

impl SocketConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_send_packets(mut self, max: usize) -> Self {
        self.max_send_packets = Some(max);
        self
    }

    pub fn drop_on_overflow(mut self, enabled: bool) -> Self {
        self.drop_on_overflow = Some(enabled);
        self
    }

    pub fn recv_enabled(mut self, enabled: bool) -> Self {
        self.recv_enabled = Some(enabled);
        self
    }

    pub fn read_quantum(mut self, size: usize) -> Self {
        self.read_quantum = Some(size);
        self
    }

    pub fn tcp_flags(mut self, flags: SendFlags) -> Self {
        self.tcp_flags = Some(flags);
        self
    }

    pub fn udp_flags(mut self, flags: SendFlags) -> Self {
        self.udp_flags = Some(flags);
        self
    }

    pub fn send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn SocketHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> SocketConfig {
        let default = SocketConfig::default();
        SocketConfig {
            // a partial write must always be able to queue its remainder
            max_send_packets: self.max_send_packets.unwrap_or(default.max_send_packets).max(1),
            drop_on_overflow: self.drop_on_overflow.unwrap_or(default.drop_on_overflow),
            recv_enabled: self.recv_enabled.unwrap_or(default.recv_enabled),
            read_quantum: self.read_quantum.unwrap_or(default.read_quantum).max(1),
            tcp_flags: self.tcp_flags.unwrap_or(default.tcp_flags),
            udp_flags: self.udp_flags.unwrap_or(default.udp_flags),
            send_timeout: self.send_timeout.unwrap_or(default.send_timeout),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            hook: self.hook.or(default.hook),
        }
    }
}

/// Configuration for [`TcpServer`](crate::net::session::TcpServer).
#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    pub backlog: i32,
    /// Period of the `on_manager` tick delivered to every session
    pub manager_interval: Duration,
    /// Applied to the listener and inherited by accepted sockets
    pub socket: SocketConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            manager_interval: DEFAULT_MANAGER_INTERVAL,
            socket: SocketConfig::default(),
        }
    }
}

impl TcpServerConfig {
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct TcpServerConfigBuilder {
    backlog: Option<i32>,
    manager_interval: Option<Duration>,
    socket: Option<SocketConfig>,
}

impl TcpServerConfigBuilder {
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn manager_interval(mut self, interval: Duration) -> Self {
        self.manager_interval = Some(interval);
        self
    }

    pub fn socket(mut self, socket: SocketConfig) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            backlog: self.backlog.unwrap_or(default.backlog),
            manager_interval: self.manager_interval.unwrap_or(default.manager_interval),
            socket: self.socket.unwrap_or(default.socket),
        }
    }
}

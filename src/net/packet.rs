//! Outbound packets and the per-socket send queue.
//!
//! ```text
//!   send() ──▶ queue idle? ──yes──▶ immediate non-blocking write
//!                 │                      │ remainder
//!                 no                     ▼
//!                 └──────────────▶ VecDeque<Packet> ──▶ drain() on write-ready
//! ```
//!
//! Packets leave strictly in the order they were submitted. A packet is
//! never merged with, or split across, another one.

use std::{
    collections::VecDeque,
    io,
    ops::BitOr,
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;
use socket2::SockAddr;

use crate::error::lock;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const FLAG_NOSIGNAL: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const FLAG_NOSIGNAL: i32 = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const FLAG_MORE: i32 = libc::MSG_MORE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const FLAG_MORE: i32 = 0;

const FLAG_DONTWAIT: i32 = libc::MSG_DONTWAIT;

/// `send(2)` flags. Flags the platform lacks are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SendFlags(i32);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    pub const NOSIGNAL: SendFlags = SendFlags(FLAG_NOSIGNAL);
    pub const DONTWAIT: SendFlags = SendFlags(FLAG_DONTWAIT);
    pub const MORE: SendFlags = SendFlags(FLAG_MORE);
    pub const TCP_DEFAULT: SendFlags = SendFlags(FLAG_NOSIGNAL | FLAG_DONTWAIT);
    pub const UDP_DEFAULT: SendFlags = SendFlags(FLAG_NOSIGNAL | FLAG_DONTWAIT);

    pub const fn from_bits(bits: i32) -> Self {
        SendFlags(bits)
    }

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// The one place bytes leave the process.
pub trait PacketSink {
    /// A single non-blocking send of `data`, to `addr` when given.
    fn send_packet(&self, data: &[u8], addr: Option<&SockAddr>, flags: SendFlags)
        -> io::Result<usize>;
}

impl PacketSink for socket2::Socket {
    fn send_packet(
        &self,
        data: &[u8],
        addr: Option<&SockAddr>,
        flags: SendFlags,
    ) -> io::Result<usize> {
        loop {
            let result = match addr {
                Some(addr) => self.send_to_with_flags(data, addr, flags.bits()),
                None => self.send_with_flags(data, flags.bits()),
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Bytes handed to `send`: borrowed ones are only copied if they must wait.
#[derive(Debug)]
pub enum Payload<'a> {
    Borrowed(&'a [u8]),
    Shared(Bytes),
}

impl Payload<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Borrowed(data) => data,
            Payload::Shared(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes from `offset` on, as an owned buffer.
    fn into_bytes(self, offset: usize) -> Bytes {
        match self {
            Payload::Borrowed(data) => Bytes::copy_from_slice(&data[offset..]),
            Payload::Shared(data) => data.slice(offset..),
        }
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(data: &'a [u8]) -> Self {
        Payload::Borrowed(data)
    }
}

impl From<Bytes> for Payload<'_> {
    fn from(data: Bytes) -> Self {
        Payload::Shared(data)
    }
}

/// One atomic unit of outbound bytes, consumed from the front.
#[derive(Debug)]
pub struct Packet {
    data: Bytes,
    cursor: usize,
    addr: Option<SockAddr>,
    flags: SendFlags,
}

impl Packet {
    pub fn new(data: Bytes, addr: Option<SockAddr>, flags: SendFlags) -> Self {
        Self {
            data,
            cursor: 0,
            addr,
            flags,
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Bytes already transmitted.
    pub fn sent(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == self.data.len()
    }

    pub fn addr(&self) -> Option<&SockAddr> {
        self.addr.as_ref()
    }

    pub fn flags(&self) -> SendFlags {
        self.flags
    }

    fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }

    /// Attempts to transmit the remaining bytes once.
    pub fn send<S: PacketSink + ?Sized>(&mut self, sink: &S) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = sink.send_packet(self.remaining(), self.addr.as_ref(), self.flags)?;
        self.advance(n);
        Ok(n)
    }
}

/// Queue limits applied on every submission.
#[derive(Debug, Clone, Copy)]
pub struct Backpressure {
    pub max_packets: usize,
    pub drop_on_overflow: bool,
    pub send_timeout: Option<Duration>,
}

/// Outcome of [`OutboundQueue::submit`].
#[derive(Debug)]
pub enum Submitted {
    /// The immediate write took everything.
    Sent(usize),
    /// (Part of) the payload was queued. `arm` asks the caller to register
    /// write interest; it is true for exactly one submission per drain cycle.
    Queued { accepted: usize, arm: bool },
    /// The queue was full and the payload was discarded.
    Dropped,
    /// The queue made no progress for longer than the send timeout.
    Stalled,
    Failed(io::Error),
}

/// Outcome of one [`OutboundQueue::drain`] pass.
#[derive(Debug)]
pub enum Drain {
    /// The queue is empty and write interest has been released.
    Flushed,
    /// The kernel stopped accepting bytes; wait for the next write-ready.
    Pending,
    Failed(io::Error),
}

struct QueueState {
    packets: VecDeque<Packet>,
    // a packet popped by drain() and being transmitted outside the lock
    in_flight: bool,
    write_armed: bool,
    last_progress: Instant,
    epoch: u64,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.packets.len() + usize::from(self.in_flight)
    }

    fn is_idle(&self) -> bool {
        self.packets.is_empty() && !self.in_flight
    }

    fn arm(&mut self) -> bool {
        !std::mem::replace(&mut self.write_armed, true)
    }
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::new(),
                in_flight: false,
                write_armed: false,
                last_progress: Instant::now(),
                epoch: 0,
            }),
        }
    }

    /// Packets waiting, including one being transmitted.
    pub fn len(&self) -> usize {
        lock(&self.state).queued()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).is_idle()
    }

    pub fn is_write_armed(&self) -> bool {
        lock(&self.state).write_armed
    }

    /// Sends or queues `payload`.
    ///
    /// The immediate write is only attempted when nothing is queued or in
    /// flight, and the lock is held across it, so concurrent producers
    /// cannot interleave their bytes.
    pub fn submit<S: PacketSink + ?Sized>(
        &self,
        sink: &S,
        payload: Payload<'_>,
        addr: Option<SockAddr>,
        flags: SendFlags,
        limits: &Backpressure,
    ) -> Submitted {
        if payload.is_empty() {
            return Submitted::Sent(0);
        }
        let mut state = lock(&self.state);

        if !state.is_idle() {
            if let Some(timeout) = limits.send_timeout {
                if state.last_progress.elapsed() > timeout {
                    return Submitted::Stalled;
                }
            }
            if limits.drop_on_overflow && state.queued() >= limits.max_packets {
                return Submitted::Dropped;
            }
            let accepted = payload.len();
            state
                .packets
                .push_back(Packet::new(payload.into_bytes(0), addr, flags));
            let arm = state.arm();
            return Submitted::Queued { accepted, arm };
        }

        let total = payload.len();
        let sent = match sink.send_packet(payload.as_slice(), addr.as_ref(), flags) {
            Ok(n) => n.min(total),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Submitted::Failed(e),
        };
        state.last_progress = Instant::now();
        if sent == total {
            return Submitted::Sent(sent);
        }

        state
            .packets
            .push_back(Packet::new(payload.into_bytes(sent), addr, flags));
        let arm = state.arm();
        Submitted::Queued {
            accepted: total,
            arm,
        }
    }

    /// Transmits queued packets until the queue empties or the sink stops
    /// accepting bytes. Only one caller may drain at a time.
    pub fn drain<S: PacketSink + ?Sized>(&self, sink: &S) -> Drain {
        loop {
            let (mut packet, epoch) = {
                let mut state = lock(&self.state);
                match state.packets.pop_front() {
                    Some(packet) => {
                        state.in_flight = true;
                        (packet, state.epoch)
                    }
                    None => {
                        state.write_armed = false;
                        return Drain::Flushed;
                    }
                }
            };

            let result = packet.send(sink);

            let mut state = lock(&self.state);
            state.in_flight = false;
            if state.epoch != epoch {
                // cleared while transmitting; the packet belongs to a dead handle
                return Drain::Pending;
            }
            match result {
                Ok(n) => {
                    if n > 0 {
                        state.last_progress = Instant::now();
                    }
                    if packet.is_empty() {
                        continue;
                    }
                    state.packets.push_front(packet);
                    return Drain::Pending;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    state.packets.push_front(packet);
                    return Drain::Pending;
                }
                Err(e) => {
                    state.packets.push_front(packet);
                    return Drain::Failed(e);
                }
            }
        }
    }

    /// Drops every queued packet and releases write interest.
    pub fn clear(&self) -> usize {
        let mut state = lock(&self.state);
        let dropped = state.queued();
        state.packets.clear();
        state.write_armed = false;
        state.epoch = state.epoch.wrapping_add(1);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, sync::Arc};

    /// Accepts at most `chunk` bytes per call and `budget` calls per
    /// write-ready window, then reports would-block.
    struct ThrottledSink {
        chunk: usize,
        budget: usize,
        calls: Cell<usize>,
        out: Mutex<Vec<u8>>,
    }

    impl ThrottledSink {
        fn new(chunk: usize, budget: usize) -> Self {
            Self {
                chunk,
                budget,
                calls: Cell::new(0),
                out: Mutex::new(Vec::new()),
            }
        }

        fn next_window(&self) {
            self.calls.set(0);
        }

        fn delivered(&self) -> Vec<u8> {
            self.out.lock().unwrap().clone()
        }
    }

    impl PacketSink for ThrottledSink {
        fn send_packet(
            &self,
            data: &[u8],
            _addr: Option<&SockAddr>,
            _flags: SendFlags,
        ) -> io::Result<usize> {
            if self.calls.get() >= self.budget {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.calls.set(self.calls.get() + 1);
            let n = data.len().min(self.chunk);
            self.out.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    struct BlockedSink;

    impl PacketSink for BlockedSink {
        fn send_packet(&self, _: &[u8], _: Option<&SockAddr>, _: SendFlags) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    struct BrokenSink;

    impl PacketSink for BrokenSink {
        fn send_packet(&self, _: &[u8], _: Option<&SockAddr>, _: SendFlags) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    fn limits(max_packets: usize, drop_on_overflow: bool) -> Backpressure {
        Backpressure {
            max_packets,
            drop_on_overflow,
            send_timeout: None,
        }
    }

    #[test]
    fn test_packet_cursor() {
        let sink = ThrottledSink::new(3, usize::MAX);
        let mut packet = Packet::new(Bytes::from_static(b"abcdefg"), None, SendFlags::NONE);

        assert_eq!(packet.send(&sink).unwrap(), 3);
        assert_eq!(packet.remaining(), b"defg");
        assert_eq!(packet.sent(), 3);
        packet.send(&sink).unwrap();
        packet.send(&sink).unwrap();
        assert!(packet.is_empty());
        assert_eq!(packet.send(&sink).unwrap(), 0);
        assert_eq!(sink.delivered(), b"abcdefg");
    }

    #[test]
    fn test_immediate_write_needs_no_queue() {
        let queue = OutboundQueue::new();
        let sink = ThrottledSink::new(usize::MAX, usize::MAX);

        let result = queue.submit(&sink, b"hello"[..].into(), None, SendFlags::NONE, &limits(4, true));
        assert!(matches!(result, Submitted::Sent(5)));
        assert!(queue.is_empty());
        assert!(!queue.is_write_armed());
    }

    #[test]
    fn test_partial_write_takes_three_write_ready_passes() {
        const K: usize = 512;
        let queue = OutboundQueue::new();
        let sink = ThrottledSink::new(K, 1);
        let payload: Vec<u8> = (0..3 * K).map(|i| (i % 251) as u8).collect();

        // the immediate attempt finds the kernel buffer full
        let blocked = queue.submit(&BlockedSink, payload.as_slice().into(), None, SendFlags::NONE, &limits(4, true));
        assert!(matches!(blocked, Submitted::Queued { accepted, arm: true } if accepted == 3 * K));

        let mut passes = 0;
        let outcome = loop {
            sink.next_window();
            passes += 1;
            match queue.drain(&sink) {
                Drain::Pending => continue,
                other => break other,
            }
        };

        assert!(matches!(outcome, Drain::Flushed));
        assert_eq!(passes, 3);
        assert_eq!(sink.delivered(), payload);
        assert!(!queue.is_write_armed());
    }

    #[test]
    fn test_overflow_rejects_newest() {
        let queue = OutboundQueue::new();
        let limits = limits(3, true);

        let mut accepted = Vec::new();
        for i in 0..10u8 {
            match queue.submit(&BlockedSink, [i; 4][..].into(), None, SendFlags::NONE, &limits) {
                Submitted::Queued { accepted: n, .. } => accepted.push((i, n)),
                Submitted::Dropped => {}
                other => panic!("unexpected {other:?}"),
            }
            assert!(queue.len() <= 3);
        }
        assert_eq!(accepted, vec![(0, 4), (1, 4), (2, 4)]);

        let sink = ThrottledSink::new(usize::MAX, usize::MAX);
        assert!(matches!(queue.drain(&sink), Drain::Flushed));
        assert_eq!(sink.delivered(), [[0u8; 4], [1; 4], [2; 4]].concat());
    }

    #[test]
    fn test_unbounded_without_drop_policy() {
        let queue = OutboundQueue::new();
        let limits = limits(3, false);
        for _ in 0..50 {
            queue.submit(&BlockedSink, b"x"[..].into(), None, SendFlags::NONE, &limits);
        }
        assert_eq!(queue.len(), 50);
    }

    #[test]
    fn test_arm_once_per_cycle() {
        let queue = OutboundQueue::new();
        let limits = limits(16, true);
        let arms: Vec<bool> = (0..3)
            .map(|_| {
                match queue.submit(&BlockedSink, b"ab"[..].into(), None, SendFlags::NONE, &limits) {
                    Submitted::Queued { arm, .. } => arm,
                    other => panic!("unexpected {other:?}"),
                }
            })
            .collect();
        assert_eq!(arms, vec![true, false, false]);

        let sink = ThrottledSink::new(usize::MAX, usize::MAX);
        assert!(matches!(queue.drain(&sink), Drain::Flushed));
        assert!(matches!(
            queue.submit(&BlockedSink, b"ab"[..].into(), None, SendFlags::NONE, &limits),
            Submitted::Queued { arm: true, .. }
        ));
    }

    #[test]
    fn test_send_timeout_stalls() {
        let queue = OutboundQueue::new();
        let limits = Backpressure {
            max_packets: 16,
            drop_on_overflow: true,
            send_timeout: Some(Duration::from_millis(20)),
        };
        queue.submit(&BlockedSink, b"a"[..].into(), None, SendFlags::NONE, &limits);
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(
            queue.submit(&BlockedSink, b"b"[..].into(), None, SendFlags::NONE, &limits),
            Submitted::Stalled
        ));
    }

    #[test]
    fn test_hard_error_surfaces() {
        let queue = OutboundQueue::new();
        let limits = limits(16, true);
        assert!(matches!(
            queue.submit(&BrokenSink, b"a"[..].into(), None, SendFlags::NONE, &limits),
            Submitted::Failed(_)
        ));
        queue.submit(&BlockedSink, b"a"[..].into(), None, SendFlags::NONE, &limits);
        assert!(matches!(queue.drain(&BrokenSink), Drain::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_clear_discards_everything() {
        let queue = OutboundQueue::new();
        let limits = limits(16, true);
        for _ in 0..5 {
            queue.submit(&BlockedSink, b"abc"[..].into(), None, SendFlags::NONE, &limits);
        }
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert!(!queue.is_write_armed());
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order() {
        struct SharedSink(Mutex<Vec<u8>>);
        impl PacketSink for SharedSink {
            fn send_packet(&self, data: &[u8], _: Option<&SockAddr>, _: SendFlags) -> io::Result<usize> {
                let n = data.len().min(3);
                self.0.lock().unwrap().extend_from_slice(&data[..n]);
                Ok(n)
            }
        }

        let queue = Arc::new(OutboundQueue::new());
        let sink = Arc::new(SharedSink(Mutex::new(Vec::new())));
        let limits = limits(usize::MAX, false);

        let producers: Vec<_> = (0..4u8)
            .map(|t| {
                let queue = queue.clone();
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        queue.submit(&*sink, [t, i, t, i, t][..].into(), None, SendFlags::NONE, &limits);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        while !matches!(queue.drain(&*sink), Drain::Flushed) {}

        let out = sink.0.lock().unwrap().clone();
        assert_eq!(out.len(), 4 * 50 * 5);
        // packets never interleave: every 5-byte frame is intact
        let mut next = [0u8; 4];
        for frame in out.chunks(5) {
            let t = frame[0];
            assert_eq!(frame, [t, next[t as usize], t, next[t as usize], t]);
            next[t as usize] += 1;
        }
    }
}

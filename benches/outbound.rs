use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_socket::net::packet::{Backpressure, Drain, OutboundQueue, PacketSink, Payload, SendFlags};
use socket2::SockAddr;
use std::{cell::Cell, io};

/// Accepts `window` bytes, then reports would-block until reopened.
struct WindowSink {
    window: usize,
    left: Cell<usize>,
}

impl WindowSink {
    fn new(window: usize) -> Self {
        Self {
            window,
            left: Cell::new(window),
        }
    }

    fn reopen(&self) {
        self.left.set(self.window);
    }
}

impl PacketSink for WindowSink {
    fn send_packet(&self, data: &[u8], _: Option<&SockAddr>, _: SendFlags) -> io::Result<usize> {
        let n = data.len().min(self.left.get());
        if n == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.left.set(self.left.get() - n);
        Ok(n)
    }
}

fn limits() -> Backpressure {
    Backpressure {
        max_packets: usize::MAX,
        drop_on_overflow: false,
        send_timeout: None,
    }
}

fn bench_immediate_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("immediate_write");
    for size in [64usize, 1500, 64 * 1024] {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let queue = OutboundQueue::new();
            let sink = WindowSink::new(usize::MAX);
            let limits = limits();
            b.iter(|| {
                black_box(queue.submit(
                    &sink,
                    Payload::Borrowed(payload.as_slice()),
                    None,
                    SendFlags::TCP_DEFAULT,
                    &limits,
                ))
            });
        });
    }
    group.finish();
}

fn bench_queue_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_and_drain");
    for packets in [16usize, 256] {
        group.throughput(Throughput::Elements(packets as u64));
        group.bench_with_input(BenchmarkId::from_parameter(packets), &packets, |b, &packets| {
            let payload = vec![0u8; 1500];
            let limits = limits();
            b.iter(|| {
                let queue = OutboundQueue::new();
                // a closed window forces everything into the queue
                let sink = WindowSink::new(0);
                for _ in 0..packets {
                    queue.submit(&sink, Payload::Borrowed(&payload), None, SendFlags::TCP_DEFAULT, &limits);
                }
                let sink = WindowSink::new(16 * 1024);
                loop {
                    match queue.drain(&sink) {
                        Drain::Flushed => break,
                        Drain::Pending => sink.reopen(),
                        Drain::Failed(e) => panic!("{e}"),
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_immediate_write, bench_queue_and_drain);
criterion_main!(benches);

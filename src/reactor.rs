use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use mio::{Events, Poll};

use crate::{
    error::{lock, Result},
    poll::{PollHandle, WAKE_TOKEN},
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

struct PollState {
    poll: Poll,
    events: Events,
}

/// Single-threaded readiness loop.
///
/// Whichever thread calls [`Reactor::run`] becomes the loop thread: every
/// handler, deferred task and timer executes there, one at a time.
pub struct Reactor {
    pub(crate) poll_handle: Arc<PollHandle>,
    state: Mutex<PollState>,
    poll_timeout: Duration,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl Reactor {
    pub fn new(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        let poll = Poll::new()?;
        let poll_handle = Arc::new(PollHandle::new(poll.registry().try_clone()?)?);
        Ok(Self {
            poll_handle,
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(events_capacity),
            }),
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> Arc<PollHandle> {
        Arc::clone(&self.poll_handle)
    }

    /// Runs the loop until a stop is requested.
    ///
    /// A stop requested before `run` is entered still counts: the call
    /// returns after draining deferred work. The request is consumed on
    /// return, so the reactor can be run again.
    pub fn run(&self) -> Result<()> {
        let mut state = lock(&self.state);
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!("reactor started");

        let mut result = Ok(());
        while !self.stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.turn(&mut state) {
                result = Err(e);
                break;
            }
        }
        // release descriptors whose close was queued during the last turn
        self.poll_handle.drain_deferred();

        self.running.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        tracing::debug!("reactor stopped");
        result
    }

    /// One loop iteration: poll, dispatch, run deferred work, fire timers.
    fn turn(&self, state: &mut PollState) -> Result<()> {
        let timeout = self.next_timeout();
        let PollState { poll, events } = state;

        if let Err(e) = poll.poll(events, Some(timeout)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            // the handler is cloned out so it may touch the registry itself
            match self.poll_handle.handler(event.token()) {
                Some(handler) => handler.handle_event(event),
                None => tracing::trace!(token = ?event.token(), "event for unknown token"),
            }
        }

        for task in self.poll_handle.take_deferred() {
            task();
        }

        self.poll_handle.timers().fire_expired(Instant::now());
        Ok(())
    }

    fn next_timeout(&self) -> Duration {
        if self.poll_handle.has_deferred() {
            return Duration::ZERO;
        }
        match self.poll_handle.timers().next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.poll_timeout),
            None => self.poll_timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn get_shutdown_handle(&self) -> ShutdownHandle<'_> {
        ShutdownHandle { reactor: self }
    }
}

pub struct ShutdownHandle<'a> {
    reactor: &'a Reactor,
}

impl ShutdownHandle<'_> {
    pub fn shutdown(&self) {
        self.reactor.stop_requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.reactor.poll_handle.wake() {
            tracing::warn!(error = %e, "failed to wake reactor for shutdown");
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // sockets may outlive the reactor; closes they queued after the
        // loop stopped would otherwise wait for the last poller reference
        self.poll_handle.drain_deferred();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{event::Event, net::UdpSocket, Interest};
    use std::sync::atomic::AtomicUsize;

    fn spawn(reactor: &Arc<Reactor>) -> std::thread::JoinHandle<()> {
        let reactor = Arc::clone(reactor);
        std::thread::spawn(move || reactor.run().unwrap())
    }

    #[test]
    fn test_reactor_creation() {
        let reactor = Reactor::new(DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS);
        assert!(reactor.is_ok());
    }

    #[test]
    fn test_reactor_start_stop() {
        let reactor = Arc::new(Reactor::new(64, 50).unwrap());
        let handle = spawn(&reactor);

        std::thread::sleep(Duration::from_millis(50));
        assert!(reactor.is_running());
        reactor.get_shutdown_handle().shutdown();
        handle.join().unwrap();
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_stop_before_run_returns() {
        let reactor = Arc::new(Reactor::new(64, 50).unwrap());
        reactor.get_shutdown_handle().shutdown();

        let (tx, rx) = std::sync::mpsc::channel();
        let runner = Arc::clone(&reactor);
        std::thread::spawn(move || {
            let _ = tx.send(runner.run().is_ok());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert!(!reactor.is_running());

        // the request was consumed, a second run needs its own stop
        let handle = spawn(&reactor);
        std::thread::sleep(Duration::from_millis(50));
        assert!(reactor.is_running());
        reactor.get_shutdown_handle().shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_closes_queued_after_stop_run_on_drop() {
        let reactor = Arc::new(Reactor::new(64, 20).unwrap());
        let handle = spawn(&reactor);
        reactor.get_shutdown_handle().shutdown();
        handle.join().unwrap();

        let poller = reactor.handle();
        let token = poller.next_token();
        let closed = Arc::new(AtomicBool::new(false));
        let c = closed.clone();
        poller.deregister_fd(-1, token, false, move |_| c.store(true, Ordering::SeqCst));
        assert!(!closed.load(Ordering::SeqCst));

        // the poller is still referenced here, so only the reactor drains it
        drop(reactor);
        assert!(closed.load(Ordering::SeqCst));
        assert!(!poller.has_deferred());
    }

    #[test]
    fn test_event_dispatch() {
        let reactor = Arc::new(Reactor::new(64, 20).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut socket = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let token = reactor.poll_handle.next_token();
        let counter_clone = counter.clone();
        reactor
            .poll_handle
            .register(&mut socket, token, Interest::READABLE, move |event: &Event| {
                if event.is_readable() {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let handle = spawn(&reactor);
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        reactor.get_shutdown_handle().shutdown();
        handle.join().unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_timers_and_deferred_run_on_loop() {
        let reactor = Arc::new(Reactor::new(64, 500).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = spawn(&reactor);

        let c = counter.clone();
        reactor.poll_handle.schedule(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = counter.clone();
        reactor.poll_handle.defer(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });

        // the poll timeout is long; the timer still fires on time because
        // scheduling wakes the loop and shortens its wait
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 11);

        reactor.get_shutdown_handle().shutdown();
        handle.join().unwrap();
    }
}

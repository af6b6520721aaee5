use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use mio::{unix::SourceFd, Interest, Registry, Token};

use crate::{
    error::{lock, Result},
    handler::EventHandler,
    timer::{TimerHandle, TimerQueue},
};

/// Token reserved for the loop's waker.
pub const WAKE_TOKEN: Token = Token(0);

pub type SharedHandler = Arc<dyn EventHandler + Send + Sync>;
pub type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// The thread-safe half of the reactor.
///
/// Everything a socket needs from the poller lives here: token allocation,
/// interest registration, the handler table, deferred tasks and timers.
/// The `mio::Poll` itself stays inside the [`Reactor`](crate::reactor::Reactor)
/// which is the only place events are waited on.
pub struct PollHandle {
    registry: Registry,
    handlers: RwLock<HashMap<Token, SharedHandler>>,
    deferred: Mutex<Vec<Deferred>>,
    timers: Arc<TimerQueue>,
    waker: mio::Waker,
    next_token: AtomicUsize,
}

impl PollHandle {
    pub fn new(registry: Registry) -> Result<Self> {
        let waker = mio::Waker::new(&registry, WAKE_TOKEN)?;
        Ok(PollHandle {
            registry,
            handlers: RwLock::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            timers: Arc::new(TimerQueue::new()),
            waker,
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        })
    }

    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register<H, S>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
        handler: H,
    ) -> Result<()>
    where
        H: EventHandler + Send + Sync + 'static,
        S: mio::event::Source + ?Sized,
    {
        src.register(&self.registry, token, interest)?;
        self.insert_handler(token, Arc::new(handler));
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S, token: Token) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.remove_handler(token);
        src.deregister(&self.registry)?;
        Ok(())
    }

    pub fn insert_handler(&self, token: Token, handler: SharedHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(token, handler);
    }

    pub fn remove_handler(&self, token: Token) -> Option<SharedHandler> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&token)
    }

    pub fn handler(&self, token: Token) -> Option<SharedHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&token).cloned()
    }

    pub fn handler_count(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.len()
    }

    pub fn register_fd(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), token, interest)?;
        Ok(())
    }

    pub fn reregister_fd(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), token, interest)?;
        Ok(())
    }

    /// Removes `fd` from the kernel interest set but keeps its handler.
    pub fn unregister_fd(&self, fd: RawFd) -> Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    /// Asynchronous deregistration.
    ///
    /// The handler entry is dropped immediately so no further event for
    /// `token` is dispatched. The kernel deregistration and `completion` run
    /// on the loop thread after the event batch being dispatched, so the
    /// descriptor is never closed while the loop is iterating over it. The
    /// completion receives whether the kernel deregistration succeeded and
    /// must own whatever closes `fd`.
    pub fn deregister_fd<F>(&self, fd: RawFd, token: Token, registered: bool, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.remove_handler(token);
        let registry = match self.registry.try_clone() {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!(fd, error = %e, "cannot clone registry, closing without deregistration");
                self.defer(move || completion(false));
                return;
            }
        };
        self.defer(move || {
            let ok = if registered {
                registry.deregister(&mut SourceFd(&fd)).is_ok()
            } else {
                true
            };
            tracing::trace!(fd, ?token, ok, "descriptor deregistered");
            completion(ok);
        });
    }

    /// Queues `task` to run on the loop thread after the current event batch.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.deferred).push(Box::new(task));
        let _ = self.wake();
    }

    pub(crate) fn take_deferred(&self) -> Vec<Deferred> {
        std::mem::take(&mut *lock(&self.deferred))
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !lock(&self.deferred).is_empty()
    }

    /// Runs queued tasks until none are left, including any they queue.
    pub(crate) fn drain_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = self.take_deferred();
            if batch.is_empty() {
                return ran;
            }
            ran += batch.len();
            for task in batch {
                task();
            }
        }
    }

    /// Runs `task` once on the loop thread after `after` has elapsed.
    pub fn schedule<F>(&self, after: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        self.schedule_repeating(after, move || {
            if let Some(task) = task.take() {
                task();
            }
            false
        })
    }

    /// Runs `task` every `every` on the loop thread until it returns false
    /// or the returned handle is cancelled.
    pub fn schedule_repeating<F>(&self, every: Duration, task: F) -> TimerHandle
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let id = self.timers.schedule(every, Box::new(task));
        let _ = self.wake();
        TimerHandle::new(id, Arc::downgrade(&self.timers))
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn wake(&self) -> Result<()> {
        Ok(self.waker.wake()?)
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        let ran = self.drain_deferred();
        if ran > 0 {
            tracing::trace!(ran, "deferred tasks run on poller drop");
        }
    }
}

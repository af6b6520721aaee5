#[cfg(feature = "unstable-mpmc")]
use std::sync::mpmc as channel;
#[cfg(not(feature = "unstable-mpmc"))]
use std::sync::mpsc as channel;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread::{Builder, JoinHandle},
};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Worker threads used to run session callbacks off the event loop thread.
///
/// Every worker owns its own channel, so tasks pinned to one worker with
/// [`ThreadPool::exec_pinned`] execute in submission order.
pub struct ThreadPool {
    workers: Vec<Worker>,
    senders: Vec<channel::Sender<WorkerMessage>>,
    next_worker: AtomicUsize,
}

impl Default for ThreadPool {
    fn default() -> Self {
        let default_capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_POOL_CAPACITY);
        Self::new(default_capacity)
    }
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::channel::<WorkerMessage>();
            workers.push(Worker::new(id, receiver));
            senders.push(sender);
        }

        Self {
            workers,
            senders,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // Round-robin dispatch
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
        self.send_to(index, Box::new(task))
    }

    /// Runs `task` on the worker selected by `key`.
    pub fn exec_pinned<F>(&self, key: u64, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_to(key as usize, Box::new(task))
    }

    fn send_to(&self, index: usize, task: Task) -> Result<()> {
        self.senders[index % self.senders.len()]
            .send(WorkerMessage::Task(task))
            .map_err(|_| Error::PoolClosed)
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        let current = std::thread::current().id();
        for worker in &mut self.workers {
            if let Some(t) = worker.take_thread() {
                // a task holding the last reference drops the pool on its own worker
                if t.thread().id() != current {
                    let _ = t.join();
                }
            }
        }
    }
}

struct Worker {
    #[allow(dead_code)]
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: channel::Receiver<WorkerMessage>) -> Self {
        let thread = Some(
            Builder::new()
                .name(format!("mill-socket-worker-{id}"))
                .spawn(move || {
                    while let Ok(message) = receiver.recv() {
                        match message {
                            WorkerMessage::Task(task) => task(),
                            WorkerMessage::Terminate => break,
                        }
                    }
                })
                .expect("Couldn't create the worker thread"),
        );

        Self { id, thread }
    }

    fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

use std::{
    io,
    sync::{Mutex, MutexGuard},
};

use crate::net::errors::SockError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the event loop plumbing itself.
///
/// Socket-level failures are classified separately as [`SockError`] and are
/// delivered through the socket's error callback rather than returned here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("thread pool is shut down")]
    PoolClosed,
    #[error(transparent)]
    Sock(#[from] SockError),
}

/// Locks a mutex, recovering the guard if a panicking callback poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! One-shot and repeating timers driven by the event loop.
//!
//! The reactor asks [`TimerQueue::next_deadline`] before every poll so the
//! poll timeout never overshoots the earliest timer, then calls
//! [`TimerQueue::fire_expired`] once the poll returns. Tasks therefore run on
//! the loop thread, serialized with readiness handlers.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{Mutex, Weak},
    time::{Duration, Instant},
};

use crate::error::lock;

/// A timer task. Returning `true` re-arms it after the same interval.
pub type TimerTask = Box<dyn FnMut() -> bool + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct TimerEntry {
    interval: Duration,
    task: TimerTask,
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
    // the entry currently executing is out of `entries`
    running: Option<TimerId>,
    running_cancelled: bool,
}

#[derive(Default)]
pub struct TimerQueue {
    state: Mutex<TimerState>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, after: Duration, task: TimerTask) -> TimerId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = TimerId(state.next_id);
        state.heap.push(Reverse((Instant::now() + after, id)));
        state.entries.insert(
            id,
            TimerEntry {
                interval: after,
                task,
            },
        );
        id
    }

    /// Cancels a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = lock(&self.state);
        if state.entries.remove(&id).is_some() {
            return true;
        }
        if state.running == Some(id) && !state.running_cancelled {
            state.running_cancelled = true;
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline of a live timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut state = lock(&self.state);
        while let Some(Reverse((deadline, id))) = state.heap.peek().copied() {
            if state.entries.contains_key(&id) {
                return Some(deadline);
            }
            state.heap.pop();
        }
        None
    }

    /// Runs every timer whose deadline is at or before `now`.
    ///
    /// The state lock is released while a task runs, so tasks may schedule
    /// or cancel timers themselves. A repeating timer fires at most once per
    /// call; its next deadline only becomes visible once the pass is over.
    pub fn fire_expired(&self, now: Instant) -> usize {
        let mut fired = 0;
        let mut rearmed = Vec::new();
        loop {
            let (id, mut entry) = {
                let mut state = lock(&self.state);
                let Some(Reverse((deadline, id))) = state.heap.peek().copied() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                state.heap.pop();
                let Some(entry) = state.entries.remove(&id) else {
                    continue;
                };
                state.running = Some(id);
                state.running_cancelled = false;
                (id, entry)
            };

            let again = (entry.task)();
            fired += 1;

            let mut state = lock(&self.state);
            let cancelled = state.running_cancelled;
            state.running = None;
            state.running_cancelled = false;
            if again && !cancelled {
                let base = Instant::now().max(now);
                rearmed.push(Reverse((base + entry.interval, id)));
                state.entries.insert(id, entry);
            }
        }
        if !rearmed.is_empty() {
            lock(&self.state).heap.extend(rearmed);
        }
        fired
    }
}

/// Cancellation handle returned by the poller's scheduling calls.
#[derive(Clone)]
pub struct TimerHandle {
    id: TimerId,
    timers: Weak<TimerQueue>,
}

impl TimerHandle {
    pub(crate) fn new(id: TimerId, timers: Weak<TimerQueue>) -> Self {
        Self { id, timers }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn cancel(&self) -> bool {
        match self.timers.upgrade() {
            Some(timers) => timers.cancel(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting(counter: &Arc<AtomicUsize>, again: bool) -> TimerTask {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            again
        })
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timers = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, ms) in [(3u8, 30u64), (1, 10), (2, 20)] {
            let order = order.clone();
            timers.schedule(
                Duration::from_millis(ms),
                Box::new(move || {
                    order.lock().unwrap().push(label);
                    false
                }),
            );
        }

        let fired = timers.fire_expired(Instant::now() + Duration::from_millis(50));
        assert_eq!(fired, 3);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_not_yet_expired() {
        let timers = TimerQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        timers.schedule(Duration::from_secs(60), counting(&counter, false));

        assert_eq!(timers.fire_expired(Instant::now()), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timers.next_deadline().is_some());
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let timers = TimerQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = timers.schedule(Duration::ZERO, counting(&counter, false));

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert_eq!(timers.fire_expired(Instant::now()), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(timers.next_deadline().is_none());
    }

    #[test]
    fn test_repeating_timer_rearms() {
        let timers = TimerQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = timers.schedule(Duration::ZERO, counting(&counter, true));

        timers.fire_expired(Instant::now());
        timers.fire_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(timers.len(), 1);

        assert!(timers.cancel(id));
        timers.fire_expired(Instant::now() + Duration::from_millis(2));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_repeating_timer_fires_once_per_pass() {
        let timers = TimerQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        timers.schedule(Duration::ZERO, counting(&counter, true));
        let slow = Arc::new(AtomicUsize::new(0));
        timers.schedule(Duration::from_millis(1), counting(&slow, true));

        // far enough ahead that every re-armed deadline is already due
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(timers.fire_expired(later), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(slow.load(Ordering::SeqCst), 1);

        // re-armed relative to the pass, never in the past of it
        let next = timers.next_deadline().unwrap();
        assert!(next >= later);
        assert_eq!(timers.len(), 2);
    }

    #[test]
    fn test_cancel_from_inside_task() {
        let timers = Arc::new(TimerQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

        let task = {
            let timers = Arc::downgrade(&timers);
            let slot = slot.clone();
            let counter = counter.clone();
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if let (Some(timers), Some(id)) = (timers.upgrade(), *slot.lock().unwrap()) {
                    timers.cancel(id);
                }
                true
            })
        };
        let id = timers.schedule(Duration::ZERO, task);
        *slot.lock().unwrap() = Some(id);

        timers.fire_expired(Instant::now());
        timers.fire_expired(Instant::now() + Duration::from_millis(5));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_handle_outlives_queue() {
        let timers = Arc::new(TimerQueue::new());
        let id = timers.schedule(Duration::from_secs(1), Box::new(|| false));
        let handle = TimerHandle::new(id, Arc::downgrade(&timers));
        drop(timers);
        assert!(!handle.cancel());
    }
}

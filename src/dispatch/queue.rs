use crate::core::{DbError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const SPIN_MIN: usize = 4;
const SPIN_MAX: usize = 256;
/// A wake-up arriving this quickly after the previous one counts as bursty
/// load and grows the spin limit.
const WAKE_WINDOW: Duration = Duration::from_millis(1);

/// Bounded request queue feeding the worker pool.
///
/// Idle workers spin over `try_pop` for an adaptive number of rounds before
/// parking on the notify, cutting wake latency under bursty load.
pub struct RequestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    spin_limit: AtomicUsize,
    last_wake: Mutex<Instant>,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            spin_limit: AtomicUsize::new(SPIN_MIN),
            last_wake: Mutex::new(Instant::now()),
        }
    }

    /// Enqueue an item; a full queue reports exhaustion instead of blocking
    /// the producer.
    pub fn push(&self, item: T) -> Result<()> {
        {
            let mut inner = self.inner.lock()?;
            if inner.len() >= self.capacity {
                return Err(DbError::NoMemory(format!(
                    "request queue is full ({} entries)",
                    self.capacity
                )));
            }
            inner.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().ok()?.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dequeue, spinning briefly before sleeping on the notify.
    pub async fn pop(&self) -> T {
        let limit = self.spin_limit.load(Ordering::Relaxed);
        for _ in 0..limit {
            if let Some(item) = self.try_pop() {
                return item;
            }
            tokio::task::yield_now().await;
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
            self.tune_spin();
            if let Some(item) = self.try_pop() {
                return item;
            }
        }
    }

    /// Grow the spin limit when wake-ups arrive back to back, shrink it when
    /// the queue goes quiet.
    fn tune_spin(&self) {
        let mut last = match self.last_wake.lock() {
            Ok(last) => last,
            Err(_) => return,
        };
        let now = Instant::now();
        let elapsed = now.duration_since(*last);
        *last = now;
        let current = self.spin_limit.load(Ordering::Relaxed);
        let next = if elapsed < WAKE_WINDOW {
            (current * 2).min(SPIN_MAX)
        } else {
            (current / 2).max(SPIN_MIN)
        };
        self.spin_limit.store(next, Ordering::Relaxed);
    }
}

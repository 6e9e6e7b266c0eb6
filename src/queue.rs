//! FIFO of jobs ready to run, plus a timer wheel of retries waiting out their
//! backoff.
//!
//! Workers block in [`JobQueue::dequeue`]. Pausing stops dequeues without
//! touching the contents; closing wakes every worker with `None`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::state_machine::JobId;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Delayed {
    due: Instant,
    seq: u64,
    id: JobId,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
    paused: bool,
    closed: bool,
}

impl QueueState {
    /// Moves retries whose backoff elapsed to the back of the ready list, in
    /// due order.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.due > now {
                break;
            }
            if let Some(Reverse(d)) = self.delayed.pop() {
                self.ready.push_back(d.id);
            }
        }
    }
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a job to the ready list. Returns `false` once closed.
    pub fn enqueue(&self, id: JobId) -> bool {
        {
            let mut st = self.state();
            if st.closed {
                return false;
            }
            st.ready.push_back(id);
        }
        self.notify.notify_waiters();
        true
    }

    /// Schedules a job to become ready at `due`.
    pub fn enqueue_delayed(&self, id: JobId, due: Instant) -> bool {
        {
            let mut st = self.state();
            if st.closed {
                return false;
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.delayed.push(Reverse(Delayed { due, seq, id }));
        }
        self.notify.notify_waiters();
        true
    }

    /// Waits for the next ready job. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut st = self.state();
                if st.closed {
                    return None;
                }
                st.promote_due(Instant::now());
                if !st.paused
                    && let Some(id) = st.ready.pop_front()
                {
                    return Some(id);
                }
                st.delayed.peek().map(|Reverse(d)| d.due)
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn pause(&self) {
        self.state().paused = true;
        tracing::info!("Queue paused");
    }

    pub fn resume(&self) {
        self.state().paused = false;
        self.notify.notify_waiters();
        tracing::info!("Queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Drains every queued entry without dispatching it and returns the ids
    /// (ready first, then delayed in due order). The caller marks them
    /// cancelled in the registry.
    pub fn cancel_all(&self) -> Vec<JobId> {
        let mut st = self.state();
        let mut ids: Vec<JobId> = st.ready.drain(..).collect();
        let mut delayed = std::mem::take(&mut st.delayed).into_sorted_vec();
        // into_sorted_vec on Reverse yields latest first
        delayed.reverse();
        ids.extend(delayed.into_iter().map(|Reverse(d)| d.id));
        ids
    }

    /// Rejects further enqueues and releases every blocked `dequeue`.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Ready plus delayed entries.
    pub fn len(&self) -> usize {
        let st = self.state();
        st.ready.len() + st.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

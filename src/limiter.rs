//! FIFO counting semaphore with runtime resize.
//!
//! The hub owns two instances, one bounding concurrent retrieval work and one
//! bounding concurrent extraction work. Both are shared by every worker.
//!
//! # Fairness
//!
//! Requests are granted strictly in arrival order. A request that would fit
//! in the free capacity still waits if an earlier request is queued, so large
//! requests are never starved by a stream of small ones.
//!
//! # Resize
//!
//! [`RateLimiter::resize`] takes effect immediately for new grants. Shrinking
//! below the current in-use count never revokes a lease: the excess is
//! reclaimed as holders release.
//!
//! # Usage
//!
//! ```ignore
//! let limiter = RateLimiter::new("retrieval", 5);
//! let lease = limiter.acquire(1).await?;
//! // ... external call ...
//! limiter.release(lease)?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::LimiterError;

type Grant = Result<u64, LimiterError>;

/// Point-in-time view of a limiter, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterStats {
    pub name: String,
    pub capacity: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub peak_in_use: usize,
    pub release_errors: u64,
}

struct Waiter {
    ticket: u64,
    units: usize,
    tx: oneshot::Sender<Grant>,
}

struct LimiterState {
    capacity: usize,
    in_use: usize,
    waiters: VecDeque<Waiter>,
    /// Lease id → units held.
    outstanding: HashMap<u64, usize>,
    next_lease: u64,
    next_ticket: u64,
    peak_in_use: usize,
    release_errors: u64,
    closed: bool,
}

impl LimiterState {
    fn grant(&mut self, units: usize) -> u64 {
        let id = self.next_lease;
        self.next_lease += 1;
        self.in_use += units;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
        self.outstanding.insert(id, units);
        id
    }

    fn revoke(&mut self, id: u64) -> bool {
        match self.outstanding.remove(&id) {
            Some(units) => {
                self.in_use -= units;
                true
            }
            None => false,
        }
    }

    /// Hands out capacity to queued requests, head first, stopping at the
    /// first request that does not fit.
    fn grant_waiting(&mut self) {
        while let Some(front) = self.waiters.front() {
            if self.in_use + front.units > self.capacity {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let id = self.grant(waiter.units);
            if waiter.tx.send(Ok(id)).is_err() {
                self.revoke(id);
            }
        }
    }
}

struct Inner {
    name: String,
    state: Mutex<LimiterState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_units(&self, id: u64) -> Result<(), LimiterError> {
        let mut st = self.state();
        if st.revoke(id) {
            st.grant_waiting();
            return Ok(());
        }
        st.release_errors += 1;
        drop(st);
        let err = LimiterError::Release {
            limiter: self.name.clone(),
            lease_id: id,
        };
        tracing::error!(limiter = %self.name, lease_id = id, "Lease accounting violated: {err}");
        Err(err)
    }
}

/// A held unit (or units) of a limiter's capacity.
///
/// Dropping a lease returns its units, so a lease can never outlive the scope
/// that acquired it. [`RateLimiter::release`] is the explicit form.
pub struct Lease {
    id: u64,
    units: usize,
    owner: Option<Arc<Inner>>,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Returns the units to the limiter that granted them.
    pub fn release(mut self) -> Result<(), LimiterError> {
        match self.owner.take() {
            Some(owner) => owner.release_units(self.id),
            None => Err(LimiterError::Release {
                limiter: String::new(),
                lease_id: self.id,
            }),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            tracing::trace!(limiter = %owner.name, lease_id = self.id, "Lease dropped");
            let _ = owner.release_units(self.id);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("units", &self.units)
            .field("limiter", &self.owner.as_ref().map(|o| o.name.as_str()))
            .finish()
    }
}

/// Removes an abandoned request from the wait list, or gives back units
/// granted to a request whose caller stopped waiting.
struct PendingAcquire<'a> {
    inner: &'a Inner,
    ticket: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = self.inner.state();
        if let Some(pos) = st.waiters.iter().position(|w| w.ticket == self.ticket) {
            st.waiters.remove(pos);
            st.grant_waiting();
        } else if let Ok(Ok(id)) = self.rx.try_recv() {
            st.revoke(id);
            st.grant_waiting();
        }
    }
}

/// Shared, cloneable handle to one limiter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(LimiterState {
                    capacity,
                    in_use: 0,
                    waiters: VecDeque::new(),
                    outstanding: HashMap::new(),
                    next_lease: 1,
                    next_ticket: 1,
                    peak_in_use: 0,
                    release_errors: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Waits until `units` are free and every earlier request was served.
    ///
    /// Dropping the returned future before it completes leaves no trace:
    /// the request leaves the queue, or its grant is returned.
    pub async fn acquire(&self, units: usize) -> Result<Lease, LimiterError> {
        if units == 0 {
            return Err(LimiterError::ZeroUnits);
        }

        let (ticket, rx) = {
            let mut st = self.inner.state();
            if st.closed {
                return Err(self.shutdown_error());
            }
            if st.waiters.is_empty() && st.in_use + units <= st.capacity {
                let id = st.grant(units);
                return Ok(self.lease(id, units));
            }
            let (tx, rx) = oneshot::channel();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.waiters.push_back(Waiter { ticket, units, tx });
            (ticket, rx)
        };

        let mut pending = PendingAcquire {
            inner: &self.inner,
            ticket,
            rx,
            settled: false,
        };
        let grant = (&mut pending.rx).await;
        pending.settled = true;

        match grant {
            Ok(Ok(id)) => Ok(self.lease(id, units)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(self.shutdown_error()),
        }
    }

    /// Returns a lease's units. A lease granted by a different limiter is
    /// rejected with [`LimiterError::Release`] and goes back to its owner.
    pub fn release(&self, mut lease: Lease) -> Result<(), LimiterError> {
        let owned = lease
            .owner
            .as_ref()
            .is_some_and(|owner| Arc::ptr_eq(owner, &self.inner));
        if owned {
            lease.owner = None;
            return self.inner.release_units(lease.id);
        }

        self.inner.state().release_errors += 1;
        let err = LimiterError::Release {
            limiter: self.inner.name.clone(),
            lease_id: lease.id,
        };
        tracing::error!(
            limiter = %self.inner.name,
            lease_id = lease.id,
            "Foreign lease released: {err}"
        );
        Err(err)
    }

    /// Changes capacity. Waiters that now fit are granted immediately.
    pub fn resize(&self, capacity: usize) {
        let mut st = self.inner.state();
        let previous = st.capacity;
        st.capacity = capacity;
        st.grant_waiting();
        tracing::info!(
            limiter = %self.inner.name,
            previous,
            capacity,
            in_use = st.in_use,
            "Limiter resized"
        );
    }

    /// Fails every queued request and all future ones with
    /// [`LimiterError::Shutdown`]. Outstanding leases may still be released.
    pub fn shutdown(&self) {
        let mut st = self.inner.state();
        st.closed = true;
        let drained = st.waiters.len();
        for waiter in st.waiters.drain(..) {
            let _ = waiter.tx.send(Err(LimiterError::Shutdown {
                limiter: self.inner.name.clone(),
            }));
        }
        tracing::debug!(limiter = %self.inner.name, drained, "Limiter shut down");
    }

    pub fn capacity(&self) -> usize {
        self.inner.state().capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.state().in_use
    }

    pub fn stats(&self) -> LimiterStats {
        let st = self.inner.state();
        LimiterStats {
            name: self.inner.name.clone(),
            capacity: st.capacity,
            in_use: st.in_use,
            waiting: st.waiters.len(),
            peak_in_use: st.peak_in_use,
            release_errors: st.release_errors,
        }
    }

    fn lease(&self, id: u64, units: usize) -> Lease {
        Lease {
            id,
            units,
            owner: Some(Arc::clone(&self.inner)),
        }
    }

    fn shutdown_error(&self) -> LimiterError {
        LimiterError::Shutdown {
            limiter: self.inner.name.clone(),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn wait_for_waiters(limiter: &RateLimiter, n: usize) {
        while limiter.stats().waiting < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn acquire_and_release_track_in_use() {
        let limiter = RateLimiter::new("retrieval", 2);
        let a = limiter.acquire(1).await.unwrap();
        let b = limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.in_use(), 2);

        limiter.release(a).unwrap();
        assert_eq!(limiter.in_use(), 1);
        b.release().unwrap();
        assert_eq!(limiter.in_use(), 0);
        assert_eq!(limiter.stats().peak_in_use, 2);
    }

    #[tokio::test]
    async fn dropping_a_lease_returns_units() {
        let limiter = RateLimiter::new("extraction", 1);
        {
            let _lease = limiter.acquire(1).await.unwrap();
            assert_eq!(limiter.in_use(), 1);
        }
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn zero_units_rejected() {
        let limiter = RateLimiter::new("retrieval", 1);
        assert_eq!(limiter.acquire(0).await.unwrap_err(), LimiterError::ZeroUnits);
    }

    #[tokio::test]
    async fn waiter_granted_after_release() {
        let limiter = RateLimiter::new("retrieval", 1);
        let held = limiter.acquire(1).await.unwrap();

        let l = limiter.clone();
        let task = tokio::spawn(async move { l.acquire(1).await.map(|lease| lease.id()) });
        wait_for_waiters(&limiter, 1).await;

        limiter.release(held).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn grants_in_fifo_order() {
        let limiter = RateLimiter::new("retrieval", 1);
        let held = limiter.acquire(1).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for name in ["A", "B", "C"] {
            let l = limiter.clone();
            let tx = tx.clone();
            let before = limiter.stats().waiting;
            tokio::spawn(async move {
                let lease = l.acquire(1).await.unwrap();
                tx.send(name).unwrap();
                tokio::task::yield_now().await;
                drop(lease);
            });
            wait_for_waiters(&limiter, before + 1).await;
        }

        drop(held);
        let order = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ];
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn small_request_does_not_overtake_queued_large_one() {
        let limiter = RateLimiter::new("retrieval", 2);
        let held = limiter.acquire(1).await.unwrap();

        let l = limiter.clone();
        let large = tokio::spawn(async move { l.acquire(2).await });
        wait_for_waiters(&limiter, 1).await;

        // One unit is free, but the queued request for two comes first.
        let small = timeout(Duration::from_millis(20), limiter.acquire(1)).await;
        assert!(small.is_err());
        assert_eq!(limiter.stats().waiting, 1);

        drop(held);
        let lease = large.await.unwrap().unwrap();
        assert_eq!(lease.units(), 2);
        assert_eq!(limiter.in_use(), 2);
    }

    #[tokio::test]
    async fn abandoned_acquire_leaves_no_trace() {
        let limiter = RateLimiter::new("retrieval", 1);
        let held = limiter.acquire(1).await.unwrap();

        let attempt = timeout(Duration::from_millis(10), limiter.acquire(1)).await;
        assert!(attempt.is_err());
        assert_eq!(limiter.stats().waiting, 0);

        drop(held);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn shrink_is_reclaimed_lazily() {
        let limiter = RateLimiter::new("retrieval", 2);
        let a = limiter.acquire(1).await.unwrap();
        let b = limiter.acquire(1).await.unwrap();

        limiter.resize(1);
        assert_eq!(limiter.in_use(), 2);

        drop(a);
        assert!(timeout(Duration::from_millis(10), limiter.acquire(1)).await.is_err());

        drop(b);
        let c = limiter.acquire(1).await.unwrap();
        assert_eq!(limiter.in_use(), 1);
        drop(c);
    }

    #[tokio::test]
    async fn grow_grants_waiters() {
        let limiter = RateLimiter::new("extraction", 0);
        let l = limiter.clone();
        let task = tokio::spawn(async move { l.acquire(1).await.map(|lease| lease.id()) });
        wait_for_waiters(&limiter, 1).await;

        assert!(timeout(Duration::from_millis(10), limiter.acquire(1)).await.is_err());
        limiter.resize(2);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn foreign_lease_is_a_release_error() {
        let retrieval = RateLimiter::new("retrieval", 1);
        let extraction = RateLimiter::new("extraction", 1);
        let lease = retrieval.acquire(1).await.unwrap();

        let err = extraction.release(lease).unwrap_err();
        assert!(matches!(err, LimiterError::Release { .. }));
        assert_eq!(extraction.stats().release_errors, 1);
        // The rejected lease went back to its owner.
        assert_eq!(retrieval.in_use(), 0);
        assert_eq!(extraction.in_use(), 0);
    }

    #[tokio::test]
    async fn shutdown_fails_waiters() {
        let limiter = RateLimiter::new("retrieval", 0);
        let l = limiter.clone();
        let task = tokio::spawn(async move { l.acquire(1).await.map(|lease| lease.id()) });
        wait_for_waiters(&limiter, 1).await;

        limiter.shutdown();
        assert!(matches!(
            task.await.unwrap(),
            Err(LimiterError::Shutdown { .. })
        ));
        assert!(matches!(
            limiter.acquire(1).await,
            Err(LimiterError::Shutdown { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_use_never_exceeds_capacity_under_contention() {
        let limiter = RateLimiter::new("retrieval", 3);
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let l = limiter.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let lease = l.acquire(1).await.unwrap();
                    assert!(l.in_use() <= 3);
                    tokio::task::yield_now().await;
                    l.release(lease).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let stats = limiter.stats();
        assert!(stats.peak_in_use <= 3);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.release_errors, 0);
    }
}

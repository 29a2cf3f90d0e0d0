//! Connection Pool with capacity and idle timeout management
//!
//! Bounds the number of live proxy connections and keeps healthy ones for
//! reuse. Every live connection, idle or handed out, holds one slot; slots
//! are returned when a connection is closed, whether through `release` or
//! by dropping the handle.
//!
//! The state lives behind a single `parking_lot::Mutex`. Critical sections
//! are O(1) and no I/O runs under the lock: opening a new connection happens
//! after a slot has been reserved and the lock released.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::Result;
use crate::error::Error;

/// Default idle timeout for pooled connections
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct IdleConnection<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

impl<C> IdleConnection<C> {
    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.idle_since.elapsed() > idle_timeout
    }
}

struct PoolState<C> {
    /// Released connections, most recent last
    idle: Vec<IdleConnection<C>>,
    /// Idle plus handed-out connections
    live: usize,
}

struct PoolInner<C> {
    capacity: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState<C>>,
    next_id: AtomicU64,
    opened: AtomicU64,
    reused: AtomicU64,
}

impl<C> PoolInner<C> {
    fn free_slot(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
    }
}

/// Holds one live slot; frees it on drop unless disarmed.
struct Slot<C> {
    pool: Arc<PoolInner<C>>,
    armed: bool,
}

impl<C> Slot<C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for Slot<C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}

/// A connection handed out by the pool
pub struct PooledConnection<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    healthy: bool,
    slot: Slot<C>,
}

impl<C> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Mark the connection as not reusable; it is closed on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub opened: u64,
    pub reused: u64,
}

/// Bounded pool of live connections
pub struct ConnectionPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                idle_timeout,
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(capacity.min(64)),
                    live: 0,
                }),
                next_id: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Take the most recently released idle connection, or reserve a slot
    /// and open a new one with `open`.
    ///
    /// Fails with `ResourceExhausted` when every slot is taken and nothing
    /// is idle. A failed or cancelled `open` gives its slot back.
    pub async fn acquire<F, Fut>(&self, open: F) -> Result<PooledConnection<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let slot = {
            let mut state = self.inner.state.lock();

            while let Some(idle) = state.idle.pop() {
                if idle.is_expired(self.inner.idle_timeout) {
                    // dropping closes it
                    state.live = state.live.saturating_sub(1);
                    continue;
                }

                drop(state);
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                trace!("Pool: reusing connection #{}", idle.id);
                return Ok(PooledConnection {
                    id: idle.id,
                    conn: idle.conn,
                    created_at: idle.created_at,
                    healthy: true,
                    slot: self.slot(),
                });
            }

            if state.live >= self.inner.capacity {
                debug!("Pool: exhausted ({} live)", state.live);
                return Err(Error::ResourceExhausted);
            }
            state.live += 1;
            self.slot()
        };

        let conn = open().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        trace!("Pool: opened connection #{}", id);

        Ok(PooledConnection {
            id,
            conn,
            created_at: Instant::now(),
            healthy: true,
            slot,
        })
    }

    /// Return a connection. Healthy ones go back to the idle set, the rest
    /// are closed and their slot freed.
    pub fn release(&self, conn: PooledConnection<C>) {
        let PooledConnection {
            id,
            conn,
            created_at,
            healthy,
            slot,
        } = conn;

        if !healthy {
            trace!("Pool: closing connection #{}", id);
            drop(conn);
            drop(slot);
            return;
        }

        slot.disarm();
        self.inner.state.lock().idle.push(IdleConnection {
            id,
            conn,
            created_at,
            idle_since: Instant::now(),
        });
    }

    /// Open connections until `target` are idle or capacity is reached.
    ///
    /// Returns how many were opened. Stops at the first failed open.
    pub async fn refill<F, Fut>(&self, target: usize, open: F) -> Result<usize>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut opened = 0;
        loop {
            {
                let state = self.inner.state.lock();
                if state.idle.len() >= target || state.live >= self.inner.capacity {
                    break;
                }
            }

            let conn = self.acquire(&open).await?;
            self.release(conn);
            opened += 1;
        }

        if opened > 0 {
            debug!("Pool: pre-warmed {} connections", opened);
        }
        Ok(opened)
    }

    /// Close idle connections past the idle timeout.
    pub fn cleanup(&self) -> usize {
        let expired: Vec<IdleConnection<C>> = {
            let mut state = self.inner.state.lock();
            let idle_timeout = self.inner.idle_timeout;
            let (expired, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|c| c.is_expired(idle_timeout));
            state.idle = fresh;
            state.live = state.live.saturating_sub(expired.len());
            expired
        };

        if !expired.is_empty() {
            debug!("Pool: cleaned up {} expired connections", expired.len());
        }
        expired.len()
    }

    /// Close every idle connection. Handed-out connections keep their slot
    /// until they are released or dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<IdleConnection<C>> = {
            let mut state = self.inner.state.lock();
            let drained = std::mem::take(&mut state.idle);
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        drained.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn stats(&self) -> PoolStats {
        let (live, idle) = {
            let state = self.inner.state.lock();
            (state.live, state.idle.len())
        };

        PoolStats {
            capacity: self.inner.capacity,
            live,
            idle,
            opened: self.inner.opened.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
        }
    }

    fn slot(&self) -> Slot<C> {
        Slot {
            pool: self.inner.clone(),
            armed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn open_ok() -> Result<u32> {
        Ok(7)
    }

    fn pool(capacity: usize) -> ConnectionPool<u32> {
        ConnectionPool::new(capacity, DEFAULT_IDLE_TIMEOUT)
    }

    #[tokio::test]
    async fn test_capacity_exhausted() {
        let pool = pool(2);
        let a = pool.acquire(open_ok).await.unwrap();
        let b = pool.acquire(open_ok).await.unwrap();
        assert!(matches!(
            pool.acquire(open_ok).await.err().unwrap(),
            Error::ResourceExhausted
        ));
        assert_eq!(pool.live_count(), 2);

        pool.release(a);
        assert!(pool.acquire(open_ok).await.is_ok());
        drop(b);
    }

    #[tokio::test]
    async fn test_release_reuses_last_in_first_out() {
        let pool = pool(4);
        let a = pool.acquire(open_ok).await.unwrap();
        let b = pool.acquire(open_ok).await.unwrap();
        let (id_a, id_b) = (a.id(), b.id());
        assert_ne!(id_a, id_b);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 2);

        let c = pool.acquire(open_ok).await.unwrap();
        assert_eq!(c.id(), id_b);
        let d = pool.acquire(open_ok).await.unwrap();
        assert_eq!(d.id(), id_a);

        let stats = pool.stats();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.reused, 2);
        assert_eq!(stats.live, 2);
    }

    #[tokio::test]
    async fn test_unhealthy_release_frees_slot() {
        let pool = pool(1);
        let mut conn = pool.acquire(open_ok).await.unwrap();
        conn.mark_unhealthy();
        assert!(!conn.is_healthy());
        pool.release(conn);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.live_count(), 0);
        let again = pool.acquire(open_ok).await.unwrap();
        assert_eq!(*again, 7);
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_slot() {
        let pool = pool(1);
        let conn = pool.acquire(open_ok).await.unwrap();
        drop(conn);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_frees_slot() {
        let pool = pool(1);
        let err = pool
            .acquire(|| async { Err::<u32, _>(Error::ConnectionTimeout) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionTimeout));
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_idle_dropped() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(2, Duration::ZERO);
        let conn = pool.acquire(open_ok).await.unwrap();
        let id = conn.id();
        pool.release(conn);
        std::thread::sleep(Duration::from_millis(5));

        let fresh = pool.acquire(open_ok).await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(pool.live_count(), 1);

        pool.release(fresh);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_refill_and_clear() {
        let pool = pool(3);
        assert_eq!(pool.refill(2, open_ok).await.unwrap(), 2);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.refill(2, open_ok).await.unwrap(), 0);

        assert_eq!(pool.clear(), 2);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_exceeds_capacity() {
        let pool = pool(8);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    if let Ok(conn) = pool.acquire(open_ok).await {
                        peak.fetch_max(pool.live_count(), Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        pool.release(conn);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 8);
        assert!(pool.live_count() <= 8);
    }
}

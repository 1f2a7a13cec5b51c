//! Lock managers coordinating readers, the single writer applying a commit
//! and the single in-flight transaction.
//!
//! * the read/write manager is shared for readers and exclusive for the
//!   writer; waiting writers block new readers;
//! * the transaction manager is a plain exclusive lock, orthogonal to the
//!   read/write pair. Acquire it before the write lock and release it after.
//!
//! Both hand out [`Lock`] values that release on drop. When tracking is
//! enabled every live lock is registered with the thread that took it and a
//! backtrace, which [`LockCoordinator::active_locks`] reports.

use crate::error::{Result, StoreError};
use log::{debug, warn};
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Read,
    Write,
    Transaction,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
            LockKind::Transaction => "transaction",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key of a tracked lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

/// Diagnostic record of a lock that is currently held.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub id: LockId,
    pub kind: LockKind,
    pub thread: String,
    pub acquired_at: SystemTime,
    pub backtrace: String,
    thread_id: ThreadId,
}

#[derive(Default)]
struct Tracker {
    next: AtomicU64,
    active: Mutex<BTreeMap<LockId, LockInfo>>,
}

impl Tracker {
    fn register(&self, kind: LockKind) -> LockId {
        let id = LockId(self.next.fetch_add(1, Ordering::Relaxed));
        let current = thread::current();
        let info = LockInfo {
            id,
            kind,
            thread: current.name().unwrap_or("<unnamed>").to_string(),
            acquired_at: SystemTime::now(),
            backtrace: Backtrace::force_capture().to_string(),
            thread_id: current.id(),
        };
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, info);
        }
        id
    }

    fn unregister(&self, id: LockId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
    }

    /// Warn when the calling thread already holds a lock that conflicts
    /// with the exclusive `kind` it is about to wait for.
    fn check_reentry(&self, kind: LockKind) {
        let me = thread::current().id();
        let Ok(active) = self.active.lock() else { return };
        let conflicting = active.values().find(|info| {
            info.thread_id == me
                && match kind {
                    LockKind::Transaction => info.kind == LockKind::Transaction,
                    LockKind::Write => info.kind != LockKind::Transaction,
                    LockKind::Read => info.kind == LockKind::Write,
                }
        });
        if let Some(info) = conflicting {
            warn!(
                "Thread {} requests a {kind} lock while holding {} lock {:?}; this will likely deadlock. Held lock acquired at:\n{}",
                info.thread, info.kind, info.id, info.backtrace
            );
        }
    }

    fn snapshot(&self) -> Vec<LockInfo> {
        self.active
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::IllegalState("lock manager state poisoned".into())
}

/// Block on `cond` until `ready` holds or the optional timeout expires.
fn wait_for<'a, S>(
    mut guard: MutexGuard<'a, S>,
    cond: &Condvar,
    timeout: Option<Duration>,
    kind: LockKind,
    mut ready: impl FnMut(&S) -> bool,
) -> std::result::Result<MutexGuard<'a, S>, (MutexGuard<'a, S>, StoreError)> {
    let start = Instant::now();
    while !ready(&guard) {
        match timeout {
            None => {
                guard = match cond.wait(guard) {
                    Ok(g) => g,
                    Err(p) => return Err((p.into_inner(), poisoned(()))),
                };
            }
            Some(limit) => {
                let waited = start.elapsed();
                if waited >= limit {
                    return Err((
                        guard,
                        StoreError::LockTimeout {
                            kind: kind.as_str(),
                            waited,
                        },
                    ));
                }
                guard = match cond.wait_timeout(guard, limit - waited) {
                    Ok((g, _)) => g,
                    Err(p) => return Err((p.into_inner().0, poisoned(()))),
                };
            }
        }
    }
    Ok(guard)
}

trait Release: Send + Sync {
    fn release(&self, kind: LockKind);
}

#[derive(Default)]
struct RwState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

/// Shared read / exclusive write lock with writer preference.
pub struct ReadWriteLockManager {
    state: Mutex<RwState>,
    cond: Condvar,
    timeout: Option<Duration>,
}

impl ReadWriteLockManager {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(RwState::default()),
            cond: Condvar::new(),
            timeout,
        }
    }

    fn acquire_read(&self) -> Result<()> {
        let guard = self.state.lock().map_err(poisoned)?;
        let mut guard = wait_for(guard, &self.cond, self.timeout, LockKind::Read, |s| {
            !s.writer && s.waiting_writers == 0
        })
        .map_err(|(_, e)| e)?;
        guard.readers += 1;
        Ok(())
    }

    fn acquire_write(&self) -> Result<()> {
        let mut guard = self.state.lock().map_err(poisoned)?;
        guard.waiting_writers += 1;
        match wait_for(guard, &self.cond, self.timeout, LockKind::Write, |s| {
            !s.writer && s.readers == 0
        }) {
            Ok(mut guard) => {
                guard.waiting_writers -= 1;
                guard.writer = true;
                Ok(())
            }
            Err((mut guard, e)) => {
                guard.waiting_writers -= 1;
                // readers held back by this writer may proceed
                self.cond.notify_all();
                Err(e)
            }
        }
    }
}

impl Release for ReadWriteLockManager {
    fn release(&self, kind: LockKind) {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match kind {
            LockKind::Write => guard.writer = false,
            _ => guard.readers = guard.readers.saturating_sub(1),
        }
        self.cond.notify_all();
    }
}

/// Plain exclusive lock.
pub struct ExclusiveLockManager {
    held: Mutex<bool>,
    cond: Condvar,
    timeout: Option<Duration>,
}

impl ExclusiveLockManager {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            held: Mutex::new(false),
            cond: Condvar::new(),
            timeout,
        }
    }

    fn acquire(&self, kind: LockKind) -> Result<()> {
        let guard = self.held.lock().map_err(poisoned)?;
        let mut guard =
            wait_for(guard, &self.cond, self.timeout, kind, |held| !*held).map_err(|(_, e)| e)?;
        *guard = true;
        Ok(())
    }
}

impl Release for ExclusiveLockManager {
    fn release(&self, _kind: LockKind) {
        let mut guard = match self.held.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        *guard = false;
        self.cond.notify_one();
    }
}

/// A held lock. Released by [`Lock::release`] or when dropped.
pub struct Lock {
    kind: LockKind,
    manager: Option<Arc<dyn Release>>,
    tracked: Option<(Arc<Tracker>, LockId)>,
}

impl Lock {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.manager.is_some()
    }

    /// Release the lock; later calls do nothing.
    pub fn release(&mut self) {
        if let Some(manager) = self.manager.take() {
            if let Some((tracker, id)) = self.tracked.take() {
                tracker.unregister(id);
            }
            manager.release(self.kind);
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Read, write and transaction locks of one store.
pub struct LockCoordinator {
    rw: Arc<ReadWriteLockManager>,
    txn: Arc<ExclusiveLockManager>,
    tracker: Option<Arc<Tracker>>,
}

impl LockCoordinator {
    pub fn new(track_locks: bool, timeout: Option<Duration>) -> Self {
        if track_locks {
            debug!("Lock tracking enabled");
        }
        Self {
            rw: Arc::new(ReadWriteLockManager::new(timeout)),
            txn: Arc::new(ExclusiveLockManager::new(timeout)),
            tracker: track_locks.then(|| Arc::new(Tracker::default())),
        }
    }

    fn handle(&self, kind: LockKind, manager: Arc<dyn Release>) -> Lock {
        let tracked = self
            .tracker
            .as_ref()
            .map(|t| (Arc::clone(t), t.register(kind)));
        Lock {
            kind,
            manager: Some(manager),
            tracked,
        }
    }

    fn check_reentry(&self, kind: LockKind) {
        if let Some(t) = &self.tracker {
            t.check_reentry(kind);
        }
    }

    /// Shared lock held while reading the indexes.
    pub fn read_lock(&self) -> Result<Lock> {
        self.check_reentry(LockKind::Read);
        self.rw.acquire_read()?;
        Ok(self.handle(LockKind::Read, self.rw.clone()))
    }

    /// Exclusive lock held while a commit is applied.
    pub fn write_lock(&self) -> Result<Lock> {
        self.check_reentry(LockKind::Write);
        self.rw.acquire_write()?;
        Ok(self.handle(LockKind::Write, self.rw.clone()))
    }

    /// Exclusive lock held for the whole life of a transaction.
    pub fn transaction_lock(&self) -> Result<Lock> {
        self.check_reentry(LockKind::Transaction);
        self.txn.acquire(LockKind::Transaction)?;
        Ok(self.handle(LockKind::Transaction, self.txn.clone()))
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker.is_some()
    }

    /// Locks currently held; empty unless tracking is enabled.
    pub fn active_locks(&self) -> Vec<LockInfo> {
        self.tracker
            .as_ref()
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn readers_share_and_writer_excludes() {
        let coord = Arc::new(LockCoordinator::new(false, Some(Duration::from_millis(50))));
        let r1 = coord.read_lock().unwrap();
        let r2 = coord.read_lock().unwrap();
        assert!(matches!(
            coord.write_lock(),
            Err(StoreError::LockTimeout { kind: "write", .. })
        ));
        drop(r1);
        drop(r2);
        let w = coord.write_lock().unwrap();
        assert!(matches!(coord.read_lock(), Err(StoreError::LockTimeout { .. })));
        drop(w);
        assert!(coord.read_lock().is_ok());
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let rw = ReadWriteLockManager::new(Some(Duration::from_millis(20)));
        rw.state.lock().unwrap().waiting_writers = 1;
        assert!(matches!(
            rw.acquire_read(),
            Err(StoreError::LockTimeout { kind: "read", .. })
        ));
        rw.state.lock().unwrap().waiting_writers = 0;
        assert!(rw.acquire_read().is_ok());
    }

    #[test]
    fn writer_proceeds_once_readers_leave() {
        let coord = Arc::new(LockCoordinator::new(false, None));
        let reader = coord.read_lock().unwrap();
        let (tx, rx) = mpsc::channel();
        let c = Arc::clone(&coord);
        let writer = thread::spawn(move || {
            let w = c.write_lock().unwrap();
            tx.send(()).unwrap();
            drop(w);
        });
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
        drop(reader);
        rx.recv().unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn transaction_lock_is_exclusive_and_times_out() {
        let coord = LockCoordinator::new(false, Some(Duration::from_millis(30)));
        let mut t = coord.transaction_lock().unwrap();
        // orthogonal to read/write
        let _w = coord.write_lock().unwrap();
        let err = coord.transaction_lock().unwrap_err();
        assert!(err.is_recoverable());
        t.release();
        t.release();
        assert!(!t.is_active());
        assert!(coord.transaction_lock().is_ok());
    }

    #[test]
    fn tracker_lists_held_locks() {
        let coord = LockCoordinator::new(true, None);
        assert!(coord.active_locks().is_empty());
        let r = coord.read_lock().unwrap();
        let t = coord.transaction_lock().unwrap();
        let active = coord.active_locks();
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|i| i.kind == LockKind::Read));
        assert!(active.iter().all(|i| !i.backtrace.is_empty()));
        drop(r);
        drop(t);
        assert!(coord.active_locks().is_empty());
    }
}

//! Per-resource read/write locks with ownership tracking
//!
//! Many readers or one writer per resource. Holders are recorded by
//! [`LockOwner`] so a crashed or hung caller's locks can be dropped with
//! [`LockManager::force_release_all`], and a background sweep force-releases
//! locks held longer than `lock_timeout`. Acquisition never errors: it
//! returns `false` on timeout.
//!
//! Locks are created lazily and kept for the lifetime of the manager.

use crate::config::LockConfig;
use crate::metrics;
use crate::resource::ResourceId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of a lock holder
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockOwner(String);

impl LockOwner {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Owner named after the calling thread
    pub fn current_thread() -> Self {
        let thread = std::thread::current();
        match thread.name() {
            Some(name) => Self(format!("thread:{}:{:?}", name, thread.id())),
            None => Self(format!("thread:{:?}", thread.id())),
        }
    }

    /// Fresh owner that collides with nothing
    pub fn new_unique() -> Self {
        Self(format!("owner:{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
struct LockState {
    /// Re-entrant read holds per owner
    readers: HashMap<LockOwner, u32>,
    /// Writer and its re-entrant hold count
    writer: Option<(LockOwner, u32)>,
    /// Set when the lock goes from free to held
    acquired_at: Option<Instant>,
}

impl LockState {
    fn reader_count(&self) -> u32 {
        self.readers.values().sum()
    }

    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn mark_held(&mut self) {
        if self.acquired_at.is_none() {
            self.acquired_at = Some(Instant::now());
        }
    }

    fn mark_if_free(&mut self) {
        if self.is_free() {
            self.acquired_at = None;
        }
    }

    fn try_read(&mut self, owner: &LockOwner) -> bool {
        if self.writer.is_some() {
            return false;
        }
        self.mark_held();
        *self.readers.entry(owner.clone()).or_insert(0) += 1;
        true
    }

    fn try_write(&mut self, owner: &LockOwner) -> bool {
        if let Some((holder, count)) = &mut self.writer {
            if *holder == *owner {
                *count += 1;
                return true;
            }
            return false;
        }
        if !self.readers.is_empty() {
            return false;
        }
        self.mark_held();
        self.writer = Some((owner.clone(), 1));
        true
    }

    /// Drop every hold of `owner`; returns whether it held anything
    fn evict(&mut self, owner: &LockOwner) -> bool {
        let mut held = self.readers.remove(owner).is_some();
        if matches!(&self.writer, Some((holder, _)) if holder == owner) {
            self.writer = None;
            held = true;
        }
        self.mark_if_free();
        held
    }

    fn clear(&mut self) {
        self.readers.clear();
        self.writer = None;
        self.acquired_at = None;
    }
}

#[derive(Debug, Default)]
struct ResourceLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Observed state of one lock
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub reader_count: u32,
    pub writer: Option<LockOwner>,
    pub owners: Vec<LockOwner>,
    pub held_for: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

impl Mode {
    fn label(self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
        }
    }
}

/// Lock table keyed by resource id
pub struct LockManager {
    locks: DashMap<ResourceId, Arc<ResourceLock>>,
    default_timeout: Duration,
    lock_timeout: Duration,
}

impl LockManager {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            locks: DashMap::new(),
            default_timeout: config.default_timeout(),
            lock_timeout: config.lock_timeout(),
        }
    }

    fn lock_for(&self, id: &ResourceId) -> Arc<ResourceLock> {
        if let Some(lock) = self.locks.get(id) {
            return lock.value().clone();
        }
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ResourceLock::default()))
            .value()
            .clone()
    }

    fn acquire(
        &self,
        id: &ResourceId,
        owner: &LockOwner,
        mode: Mode,
        timeout: Option<Duration>,
        blocking: bool,
    ) -> bool {
        let lock = self.lock_for(id);
        // Too large to represent means no deadline
        let deadline = Instant::now().checked_add(timeout.unwrap_or(self.default_timeout));
        let mut state = lock.state.lock();

        loop {
            let acquired = match mode {
                Mode::Read => state.try_read(owner),
                Mode::Write => state.try_write(owner),
            };
            if acquired {
                return true;
            }
            if !blocking {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if lock.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => lock.cond.wait(&mut state),
            }
        }

        // One last attempt after the deadline wakeup
        let acquired = blocking
            && match mode {
                Mode::Read => state.try_read(owner),
                Mode::Write => state.try_write(owner),
            };
        if !acquired {
            metrics::LOCK_TIMEOUTS
                .with_label_values(&[mode.label()])
                .inc();
            debug!(
                resource = %id,
                owner = %owner,
                mode = mode.label(),
                blocking,
                "Lock acquisition timed out"
            );
        }
        acquired
    }

    /// Acquire a shared lock; `timeout` defaults to the configured one
    pub fn acquire_read(
        &self,
        id: &ResourceId,
        owner: &LockOwner,
        timeout: Option<Duration>,
        blocking: bool,
    ) -> bool {
        self.acquire(id, owner, Mode::Read, timeout, blocking)
    }

    /// Acquire the exclusive lock; `timeout` defaults to the configured one
    pub fn acquire_write(
        &self,
        id: &ResourceId,
        owner: &LockOwner,
        timeout: Option<Duration>,
        blocking: bool,
    ) -> bool {
        self.acquire(id, owner, Mode::Write, timeout, blocking)
    }

    pub fn release_read(&self, id: &ResourceId, owner: &LockOwner) -> bool {
        let Some(lock) = self.locks.get(id).map(|l| l.value().clone()) else {
            return false;
        };
        let mut state = lock.state.lock();
        let released = match state.readers.get(owner).copied() {
            Some(count) if count > 1 => {
                state.readers.insert(owner.clone(), count - 1);
                true
            }
            Some(_) => {
                state.readers.remove(owner);
                true
            }
            None => false,
        };
        if released {
            state.mark_if_free();
            lock.cond.notify_all();
        }
        released
    }

    pub fn release_write(&self, id: &ResourceId, owner: &LockOwner) -> bool {
        let Some(lock) = self.locks.get(id).map(|l| l.value().clone()) else {
            return false;
        };
        let mut state = lock.state.lock();
        let holds = match &state.writer {
            Some((holder, count)) if holder == owner => Some(*count),
            _ => None,
        };
        let released = match holds {
            Some(count) if count > 1 => {
                state.writer = Some((owner.clone(), count - 1));
                true
            }
            Some(_) => {
                state.writer = None;
                true
            }
            None => false,
        };
        if released {
            state.mark_if_free();
            lock.cond.notify_all();
        }
        released
    }

    /// Trade a read hold for the write lock
    ///
    /// Not atomic: the read hold is released before the write lock is
    /// requested, so another writer may get in between. Callers must
    /// re-validate the resource after a successful upgrade.
    pub fn upgrade(&self, id: &ResourceId, owner: &LockOwner, timeout: Option<Duration>) -> bool {
        if !self.release_read(id, owner) {
            return false;
        }
        self.acquire_write(id, owner, timeout, true)
    }

    /// Drop every lock held by `owner`; returns the number of locks touched
    pub fn force_release_all(&self, owner: &LockOwner) -> usize {
        let locks: Vec<Arc<ResourceLock>> =
            self.locks.iter().map(|entry| entry.value().clone()).collect();

        let mut released = 0;
        for lock in locks {
            let mut state = lock.state.lock();
            if state.evict(owner) {
                released += 1;
                lock.cond.notify_all();
            }
        }
        if released > 0 {
            metrics::LOCKS_FORCE_RELEASED.inc_by(released as u64);
            warn!(owner = %owner, released, "Force-released all locks of owner");
        }
        released
    }

    /// Force-release locks held longer than `lock_timeout`
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let locks: Vec<(ResourceId, Arc<ResourceLock>)> = self
            .locks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut released = 0;
        for (id, lock) in locks {
            let mut state = lock.state.lock();
            let expired = state
                .acquired_at
                .map(|at| now.saturating_duration_since(at) > self.lock_timeout)
                .unwrap_or(false);
            if expired {
                warn!(
                    resource = %id,
                    readers = state.reader_count(),
                    writer = ?state.writer.as_ref().map(|(owner, _)| owner.as_str()),
                    "Lock held past timeout, force-releasing"
                );
                state.clear();
                lock.cond.notify_all();
                released += 1;
            }
        }
        if released > 0 {
            metrics::LOCKS_FORCE_RELEASED.inc_by(released as u64);
        }
        released
    }

    pub fn lock_info(&self, id: &ResourceId) -> Option<LockInfo> {
        let lock = self.locks.get(id).map(|l| l.value().clone())?;
        let state = lock.state.lock();
        let mut owners: Vec<LockOwner> = state.readers.keys().cloned().collect();
        if let Some((writer, _)) = &state.writer {
            owners.push(writer.clone());
        }
        owners.sort();
        Some(LockInfo {
            reader_count: state.reader_count(),
            writer: state.writer.as_ref().map(|(owner, _)| owner.clone()),
            owners,
            held_for: state.acquired_at.map(|at| at.elapsed()),
        })
    }

    /// Number of locks ever created
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Shared lock released when the guard drops
    pub fn read(
        &self,
        id: &ResourceId,
        owner: &LockOwner,
        timeout: Option<Duration>,
    ) -> Option<LockGuard<'_>> {
        self.acquire_read(id, owner, timeout, true)
            .then(|| LockGuard::new(self, id, owner, Mode::Read))
    }

    /// Exclusive lock released when the guard drops
    pub fn write(
        &self,
        id: &ResourceId,
        owner: &LockOwner,
        timeout: Option<Duration>,
    ) -> Option<LockGuard<'_>> {
        self.acquire_write(id, owner, timeout, true)
            .then(|| LockGuard::new(self, id, owner, Mode::Write))
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

/// RAII hold on a resource lock
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    id: ResourceId,
    owner: LockOwner,
    mode: Mode,
}

impl<'a> LockGuard<'a> {
    fn new(manager: &'a LockManager, id: &ResourceId, owner: &LockOwner, mode: Mode) -> Self {
        Self {
            manager,
            id: id.clone(),
            owner: owner.clone(),
            mode,
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    pub fn is_write(&self) -> bool {
        self.mode == Mode::Write
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let released = match self.mode {
            Mode::Read => self.manager.release_read(&self.id, &self.owner),
            Mode::Write => self.manager.release_write(&self.id, &self.owner),
        };
        if !released {
            // Already force-released by the sweep
            debug!(resource = %self.id, owner = %self.owner, "Guarded lock was already released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("render_cache", name)
    }

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn test_huge_timeout_waits_without_deadline() {
        let manager = Arc::new(LockManager::default());
        let id = rid("forever");
        let writer = LockOwner::new("writer");
        assert!(manager.acquire_write(&id, &writer, None, false));

        // Non-blocking attempts ignore the timeout entirely
        assert!(!manager.acquire_read(&id, &LockOwner::new("peek"), Some(Duration::MAX), false));

        let reader = {
            let manager = manager.clone();
            let id = id.clone();
            thread::spawn(move || {
                manager.acquire_read(&id, &LockOwner::new("reader"), Some(Duration::MAX), true)
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(manager.release_write(&id, &writer));
        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_readers_share_writer_excludes() {
        let manager = LockManager::default();
        let (a, b, c) = (LockOwner::new("a"), LockOwner::new("b"), LockOwner::new("c"));
        let id = rid("r1");

        assert!(manager.acquire_read(&id, &a, SHORT, true));
        assert!(manager.acquire_read(&id, &b, SHORT, true));
        assert!(!manager.acquire_write(&id, &c, SHORT, true));

        assert!(manager.release_read(&id, &a));
        assert!(manager.release_read(&id, &b));
        assert!(manager.acquire_write(&id, &c, SHORT, true));
        assert!(!manager.acquire_read(&id, &a, None, false));

        let info = manager.lock_info(&id).unwrap();
        assert_eq!(info.reader_count, 0);
        assert_eq!(info.writer, Some(c));
    }

    #[test]
    fn test_reentrant_per_mode() {
        let manager = LockManager::default();
        let owner = LockOwner::new("loader");
        let id = rid("r2");

        assert!(manager.acquire_write(&id, &owner, SHORT, true));
        assert!(manager.acquire_write(&id, &owner, SHORT, true));
        assert!(manager.release_write(&id, &owner));
        // Still held once
        assert!(!manager.acquire_write(&id, &LockOwner::new("other"), None, false));
        assert!(manager.release_write(&id, &owner));
        assert!(!manager.release_write(&id, &owner));

        assert!(manager.acquire_read(&id, &owner, SHORT, true));
        assert!(manager.acquire_read(&id, &owner, SHORT, true));
        assert_eq!(manager.lock_info(&id).unwrap().reader_count, 2);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let manager = Arc::new(LockManager::default());
        let id = rid("r3");
        let holder = LockOwner::new("holder");
        assert!(manager.acquire_write(&id, &holder, SHORT, true));

        let waiter = {
            let manager = manager.clone();
            let id = id.clone();
            thread::spawn(move || {
                manager.acquire_write(&id, &LockOwner::new("waiter"), Some(Duration::from_secs(5)), true)
            })
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        assert!(manager.release_write(&id, &holder));
        assert!(waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_upgrade() {
        let manager = LockManager::default();
        let owner = LockOwner::new("upgrader");
        let id = rid("r4");

        assert!(!manager.upgrade(&id, &owner, SHORT));
        assert!(manager.acquire_read(&id, &owner, SHORT, true));
        assert!(manager.upgrade(&id, &owner, SHORT));
        let info = manager.lock_info(&id).unwrap();
        assert_eq!(info.writer, Some(owner));
        assert_eq!(info.reader_count, 0);
    }

    #[test]
    fn test_force_release_all() {
        let manager = LockManager::default();
        let crashed = LockOwner::new("crashed");
        assert!(manager.acquire_write(&rid("a"), &crashed, SHORT, true));
        assert!(manager.acquire_read(&rid("b"), &crashed, SHORT, true));

        assert_eq!(manager.force_release_all(&crashed), 2);
        assert!(manager.acquire_write(&rid("a"), &LockOwner::new("next"), SHORT, true));
        assert!(manager.acquire_write(&rid("b"), &LockOwner::new("next"), SHORT, true));
    }

    #[test]
    fn test_sweep_expired() {
        let manager = LockManager::new(&LockConfig {
            lock_timeout_secs: 0,
            ..Default::default()
        });
        let id = rid("stuck");
        assert!(manager.acquire_write(&id, &LockOwner::new("hung"), SHORT, true));

        thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.sweep_expired(), 1);
        assert!(manager.lock_info(&id).unwrap().held_for.is_none());
        assert!(manager.acquire_write(&id, &LockOwner::new("next"), SHORT, true));
    }

    #[test]
    fn test_guards_release_on_drop() {
        let manager = LockManager::default();
        let id = rid("guarded");
        let owner = LockOwner::current_thread();
        {
            let guard = manager.write(&id, &owner, SHORT).unwrap();
            assert!(guard.is_write());
            assert!(manager.read(&id, &LockOwner::new("other"), SHORT).is_none());
        }
        let _read = manager.read(&id, &LockOwner::new("other"), SHORT).unwrap();
        assert_eq!(manager.lock_info(&id).unwrap().reader_count, 1);
    }

    #[test]
    fn test_unique_owners_differ() {
        assert_ne!(LockOwner::new_unique(), LockOwner::new_unique());
    }
}

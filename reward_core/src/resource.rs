//! Re-entrant, holder-owned resource locks.
//!
//! Ownership belongs to a `Holder` token rather than to an OS thread: a
//! reward task keeps the locks its enqueuing callers acquired on its behalf,
//! and compound controller operations re-enter component methods that take
//! the same locks again. Every acquisition yields a `ResourceGuard`; the lock
//! is free once the holder's last guard is dropped.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Result, RewardError};

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Identity under which locks are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Holder(u64);

impl Holder {
    pub fn new() -> Self {
        Self(NEXT_HOLDER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl Default for Holder {
    fn default() -> Self {
        Self::new()
    }
}

/// How long an acquisition may wait for another holder to release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    Immediate,
    Timeout(Duration),
    Forever,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<Holder>,
    depth: usize,
}

#[derive(Debug)]
pub struct ResourceLock {
    name: String,
    state: Mutex<LockState>,
    released: Condvar,
}

impl ResourceLock {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<Holder> {
        self.state.lock().owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    pub fn try_acquire(self: &Arc<Self>, holder: Holder) -> Result<ResourceGuard> {
        self.acquire(holder, LockWait::Immediate)
    }

    pub fn acquire(self: &Arc<Self>, holder: Holder, wait: LockWait) -> Result<ResourceGuard> {
        let deadline = match wait {
            LockWait::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut st = self.state.lock();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(holder);
                    st.depth = 1;
                    break;
                }
                Some(o) if o == holder => {
                    st.depth += 1;
                    break;
                }
                Some(_) => match wait {
                    LockWait::Immediate => {
                        return Err(RewardError::ResourceLocked(self.name.clone()));
                    }
                    LockWait::Forever => self.released.wait(&mut st),
                    LockWait::Timeout(_) => {
                        let until = deadline.unwrap_or_else(Instant::now);
                        if self.released.wait_until(&mut st, until).timed_out()
                            && st.owner.is_some_and(|o| o != holder)
                        {
                            return Err(RewardError::ResourceLocked(self.name.clone()));
                        }
                    }
                },
            }
        }
        Ok(ResourceGuard {
            lock: Arc::clone(self),
            holder,
        })
    }

    fn release(&self, holder: Holder) {
        let mut st = self.state.lock();
        if st.owner != Some(holder) {
            tracing::error!(resource = %self.name, holder = holder.id(), "release by non-owner ignored");
            return;
        }
        st.depth = st.depth.saturating_sub(1);
        if st.depth == 0 {
            st.owner = None;
            drop(st);
            self.released.notify_all();
        }
    }
}

/// One level of ownership of a `ResourceLock`; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ResourceGuard {
    lock: Arc<ResourceLock>,
    holder: Holder,
}

impl ResourceGuard {
    pub fn holder(&self) -> Holder {
        self.holder
    }

    pub fn resource(&self) -> &str {
        self.lock.name()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.lock.release(self.holder);
    }
}

/// A named hardware object guarded by a re-entrant lock.
pub trait Resource {
    fn name(&self) -> &str;
    fn lock(&self) -> &Arc<ResourceLock>;

    fn try_acquire(&self, holder: Holder) -> Result<ResourceGuard> {
        self.lock().try_acquire(holder)
    }

    fn acquire(&self, holder: Holder, wait: LockWait) -> Result<ResourceGuard> {
        self.lock().acquire(holder, wait)
    }
}

/// Guards taken together for a compound operation, acquired in call order.
/// Any failure leaves nothing held.
#[derive(Debug)]
pub struct LockSet {
    holder: Holder,
    wait: LockWait,
    guards: Vec<ResourceGuard>,
}

impl LockSet {
    pub fn new(holder: Holder, wait: LockWait) -> Self {
        Self {
            holder,
            wait,
            guards: Vec::new(),
        }
    }

    pub fn take(&mut self, resource: &dyn Resource) -> Result<()> {
        let guard = resource.acquire(self.holder, self.wait)?;
        self.guards.push(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_holder_reenters_and_releases_at_depth_zero() {
        let lock = ResourceLock::new("pump");
        let h = Holder::new();
        let g1 = lock.try_acquire(h).unwrap();
        let g2 = lock.try_acquire(h).unwrap();
        drop(g1);
        assert_eq!(lock.owner(), Some(h));
        drop(g2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn other_holder_is_refused_immediately() {
        let lock = ResourceLock::new("valve");
        let _g = lock.try_acquire(Holder::new()).unwrap();
        let err = lock.try_acquire(Holder::new()).unwrap_err();
        assert_eq!(err, RewardError::ResourceLocked("valve".into()));
    }

    #[test]
    fn bounded_wait_sees_release_from_another_thread() {
        let lock = ResourceLock::new("fill");
        let g = lock.try_acquire(Holder::new()).unwrap();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(g);
        });
        let h = Holder::new();
        let got = lock.acquire(h, LockWait::Timeout(Duration::from_secs(2)));
        assert!(got.is_ok());
        t.join().unwrap();
    }

    #[test]
    fn bounded_wait_times_out() {
        let lock = ResourceLock::new("fill");
        let _g = lock.try_acquire(Holder::new()).unwrap();
        let err = lock
            .acquire(Holder::new(), LockWait::Timeout(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, RewardError::ResourceLocked(_)));
    }

    #[test]
    fn guards_move_between_threads() {
        let lock = ResourceLock::new("valve");
        let h = Holder::new();
        let g = lock.try_acquire(h).unwrap();
        std::thread::spawn(move || drop(g)).join().unwrap();
        assert!(!lock.is_locked());
    }
}

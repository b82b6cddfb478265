//! Distributed reader-writer lock, local half.
//!
//! The lock is replicated across the chunk swarm: a writer owns the chunk
//! only once every member has granted its slot. Slots are acquired in
//! ascending peer order with the writer's own slot at its own rank, the
//! resource-hierarchy ordering that makes the acquisition deadlock-free.
//! This module holds the per-peer slot state machine (UNLOCKED /
//! READ_LOCKED / ATTEMPTING / WRITE_LOCKED); the RPC round itself lives in
//! the legacy chunk, because the state mutex may not be held while awaiting
//! replies.
//!
//! Remote unlocking can be handled by a different thread than the locking
//! one, hence the explicit mutex + condvar rather than a std lock.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::core::identity::PeerId;
use crate::core::time::LogicalTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    ReadLocked,
    Attempting,
    WriteLocked,
}

#[derive(Debug)]
struct LockInner {
    state: LockState,
    readers: usize,
    holder: Option<PeerId>,
    holder_thread: Option<ThreadId>,
    write_depth: usize,
    attempt_time: LogicalTime,
}

/// Outcome of starting a write attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteAttempt {
    /// Own slot taken; the remaining slots must be collected from the swarm.
    MustRequest { attempt_time: LogicalTime },
    /// Same thread already holds the write lock; depth was increased.
    Reentered,
}

#[derive(Debug)]
pub struct DistributedRwLock {
    own: PeerId,
    inner: Mutex<LockInner>,
    cv: Condvar,
}

impl DistributedRwLock {
    pub fn new(own: PeerId) -> Self {
        Self {
            own,
            inner: Mutex::new(LockInner {
                state: LockState::Unlocked,
                readers: 0,
                holder: None,
                holder_thread: None,
                write_depth: 0,
                attempt_time: LogicalTime::INVALID,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> LockState {
        self.lock_inner().state
    }

    pub fn holder(&self) -> Option<PeerId> {
        self.lock_inner().holder.clone()
    }

    pub fn is_write_locked(&self) -> bool {
        self.lock_inner().state == LockState::WriteLocked
    }

    pub fn is_self_write_locked(&self) -> bool {
        let inner = self.lock_inner();
        inner.state == LockState::WriteLocked && inner.holder.as_ref() == Some(&self.own)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, LockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn held_by_current_thread(inner: &LockInner) -> bool {
        inner.state == LockState::WriteLocked
            && inner.holder_thread == Some(thread::current().id())
    }

    /// Reentrant fast path: take another level if the current thread already
    /// holds the write lock.
    pub fn try_reenter(&self) -> bool {
        let mut inner = self.lock_inner();
        if Self::held_by_current_thread(&inner) {
            inner.write_depth += 1;
            true
        } else {
            false
        }
    }

    /// Local read lock: no RPC. The holder serves consistent reads and
    /// defers remote write requests until it unlocks. Reentrant; also legal
    /// while the same thread holds the write lock.
    pub fn read_lock(&self) {
        let mut inner = self.lock_inner();
        if Self::held_by_current_thread(&inner) {
            inner.write_depth += 1;
            return;
        }
        while !matches!(inner.state, LockState::Unlocked | LockState::ReadLocked) {
            inner = self.cv.wait(inner).unwrap_or_else(|e| e.into_inner());
            if Self::held_by_current_thread(&inner) {
                inner.write_depth += 1;
                return;
            }
        }
        inner.state = LockState::ReadLocked;
        inner.readers += 1;
    }

    pub fn read_unlock(&self) {
        let mut inner = self.lock_inner();
        if Self::held_by_current_thread(&inner) {
            // Paired with a read_lock taken under the write lock.
            inner.write_depth -= 1;
            assert!(inner.write_depth > 0, "read_unlock consumed the write lock");
            return;
        }
        assert!(
            inner.state == LockState::ReadLocked && inner.readers > 0,
            "read_unlock without read lock"
        );
        inner.readers -= 1;
        if inner.readers == 0 {
            inner.state = LockState::Unlocked;
            self.cv.notify_all();
        }
    }

    /// Take the own slot: wait until unlocked, then move to ATTEMPTING.
    /// Incoming remote requests are deferred from here on.
    pub fn start_write_attempt(&self, attempt_time: LogicalTime) -> WriteAttempt {
        let mut inner = self.lock_inner();
        if Self::held_by_current_thread(&inner) {
            inner.write_depth += 1;
            return WriteAttempt::Reentered;
        }
        while inner.state != LockState::Unlocked {
            inner = self.cv.wait(inner).unwrap_or_else(|e| e.into_inner());
            if Self::held_by_current_thread(&inner) {
                inner.write_depth += 1;
                return WriteAttempt::Reentered;
            }
        }
        inner.state = LockState::Attempting;
        inner.attempt_time = attempt_time;
        WriteAttempt::MustRequest { attempt_time }
    }

    /// All slots collected.
    pub fn write_acquired(&self) {
        let mut inner = self.lock_inner();
        assert!(
            inner.state == LockState::Attempting,
            "write_acquired outside an attempt"
        );
        inner.state = LockState::WriteLocked;
        inner.holder = Some(self.own.clone());
        inner.holder_thread = Some(thread::current().id());
        inner.write_depth = 1;
        inner.attempt_time = LogicalTime::INVALID;
    }

    /// Abandon an attempt (peer unreachable in drop-peer mode).
    pub fn abort_write_attempt(&self) {
        let mut inner = self.lock_inner();
        assert!(
            inner.state == LockState::Attempting,
            "abort_write_attempt outside an attempt"
        );
        inner.state = LockState::Unlocked;
        inner.attempt_time = LogicalTime::INVALID;
        self.cv.notify_all();
    }

    /// Transfer the held write lock to the calling thread. Used when a
    /// commit's write phase is handed to a background thread.
    pub fn adopt_write_lock(&self) {
        let mut inner = self.lock_inner();
        assert!(
            inner.state == LockState::WriteLocked && inner.holder.as_ref() == Some(&self.own),
            "adopt_write_lock without holding the write lock"
        );
        inner.holder_thread = Some(thread::current().id());
    }

    /// Release one level of the reentrant write lock; returns true when the
    /// lock is fully released and the unlock broadcast must go out.
    pub fn write_unlock(&self) -> bool {
        let mut inner = self.lock_inner();
        assert!(
            Self::held_by_current_thread(&inner),
            "write_unlock by non-holder thread"
        );
        inner.write_depth -= 1;
        if inner.write_depth > 0 {
            return false;
        }
        inner.state = LockState::Unlocked;
        inner.holder = None;
        inner.holder_thread = None;
        self.cv.notify_all();
        true
    }

    /// Handle a remote peer's request for our slot. The reply is deferred —
    /// by blocking — while the slot is read-locked, attempting or held;
    /// on grant, the remote peer becomes the recorded write holder.
    ///
    /// `attempt_time` orders contemporaries in the logs; the grant decision
    /// itself rests on the slot ordering.
    pub fn grant_remote(&self, peer: &PeerId, attempt_time: LogicalTime) {
        let mut inner = self.lock_inner();
        while inner.state != LockState::Unlocked {
            inner = self.cv.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
        tracing::trace!(%peer, %attempt_time, "granting chunk lock slot");
        inner.state = LockState::WriteLocked;
        inner.holder = Some(peer.clone());
        inner.holder_thread = None;
        inner.write_depth = 0;
    }

    /// Handle a remote peer's unlock broadcast.
    pub fn release_remote(&self, peer: &PeerId) {
        let mut inner = self.lock_inner();
        if inner.holder.as_ref() != Some(peer) {
            // Unlock from a peer we never recorded; we may have joined the
            // swarm after the grant round. Nothing to release.
            return;
        }
        inner.state = LockState::Unlocked;
        inner.holder = None;
        inner.holder_thread = None;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn t(v: u64) -> LogicalTime {
        LogicalTime::from_serialized(v)
    }

    #[test]
    fn write_attempt_acquire_release() {
        let lock = DistributedRwLock::new(peer("127.0.0.1:1"));
        assert_eq!(
            lock.start_write_attempt(t(1)),
            WriteAttempt::MustRequest { attempt_time: t(1) }
        );
        lock.write_acquired();
        assert!(lock.is_self_write_locked());
        assert!(lock.write_unlock());
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn write_lock_is_reentrant_per_thread() {
        let lock = DistributedRwLock::new(peer("127.0.0.1:1"));
        lock.start_write_attempt(t(1));
        lock.write_acquired();
        assert!(lock.try_reenter());
        assert!(!lock.write_unlock(), "inner release keeps the lock");
        assert!(lock.write_unlock());
        assert!(!lock.try_reenter());
    }

    #[test]
    fn read_lock_is_reentrant() {
        let lock = DistributedRwLock::new(peer("127.0.0.1:1"));
        lock.read_lock();
        lock.read_lock();
        assert_eq!(lock.state(), LockState::ReadLocked);
        lock.read_unlock();
        assert_eq!(lock.state(), LockState::ReadLocked);
        lock.read_unlock();
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    #[test]
    fn remote_grant_waits_for_local_reader() {
        let lock = Arc::new(DistributedRwLock::new(peer("127.0.0.1:1")));
        lock.read_lock();

        let remote = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            remote.grant_remote(&peer("127.0.0.1:2"), t(5));
        });

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(lock.state(), LockState::ReadLocked, "grant must be deferred");
        lock.read_unlock();
        handle.join().unwrap();
        assert_eq!(lock.holder(), Some(peer("127.0.0.1:2")));
    }

    #[test]
    fn remote_grant_waits_for_local_attempt() {
        let lock = Arc::new(DistributedRwLock::new(peer("127.0.0.1:1")));
        lock.start_write_attempt(t(3));

        let remote = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            remote.grant_remote(&peer("127.0.0.1:2"), t(1));
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(lock.state(), LockState::Attempting, "grant deferred");
        lock.abort_write_attempt();
        handle.join().unwrap();
        assert_eq!(lock.holder(), Some(peer("127.0.0.1:2")));
    }

    #[test]
    fn remote_grant_waits_for_local_writer() {
        let lock = Arc::new(DistributedRwLock::new(peer("127.0.0.1:1")));
        lock.start_write_attempt(t(3));
        lock.write_acquired();

        let remote = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            remote.grant_remote(&peer("127.0.0.1:2"), t(10));
        });
        std::thread::sleep(Duration::from_millis(30));
        assert!(lock.is_self_write_locked());
        lock.write_unlock();
        handle.join().unwrap();
        assert_eq!(lock.holder(), Some(peer("127.0.0.1:2")));
    }

    #[test]
    fn release_remote_frees_the_slot() {
        let lock = DistributedRwLock::new(peer("127.0.0.1:1"));
        lock.grant_remote(&peer("127.0.0.1:2"), t(5));
        assert_eq!(lock.state(), LockState::WriteLocked);
        lock.release_remote(&peer("127.0.0.1:2"));
        assert_eq!(lock.state(), LockState::Unlocked);
        // Unknown unlocks are ignored.
        lock.release_remote(&peer("127.0.0.1:9"));
    }

    #[test]
    fn read_under_own_write_lock_is_allowed() {
        let lock = DistributedRwLock::new(peer("127.0.0.1:1"));
        lock.start_write_attempt(t(1));
        lock.write_acquired();
        lock.read_lock();
        lock.read_unlock();
        assert!(lock.is_self_write_locked());
        assert!(lock.write_unlock());
    }
}

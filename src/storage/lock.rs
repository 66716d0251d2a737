//! In-process emulation of SQLite's 5-level advisory locking protocol.
//!
//! Every backend keys lock state by the file's canonical name (absolute path
//! or object key), so any number of connections to the same database share
//! one `LockState` regardless of which handle opened it first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlite_vfs::LockKind;

/// How long an exclusive acquisition spins for readers to drain before
/// reporting busy.
const EXCLUSIVE_SPIN: Duration = Duration::from_micros(25);

#[derive(Debug, Default)]
struct LockState {
    shared_count: u32,
    reserved: bool,
    pending: bool,
    handles: usize,
}

/// Process-wide table of per-file lock states.
#[derive(Debug, Default)]
pub struct LockRegistry {
    states: Mutex<HashMap<String, Arc<Mutex<LockState>>>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new handle for `key`, creating the shared state on first use.
    pub fn acquire(self: &Arc<Self>, key: &str) -> LockHandle {
        let state = {
            let mut states = self.states.lock().unwrap();
            Arc::clone(states.entry(key.to_string()).or_default())
        };
        state.lock().unwrap().handles += 1;
        LockHandle {
            registry: Arc::clone(self),
            key: key.to_string(),
            state,
            level: LockKind::None,
        }
    }
}

/// One connection's view onto a shared [LockState].
#[derive(Debug)]
pub struct LockHandle {
    registry: Arc<LockRegistry>,
    key: String,
    state: Arc<Mutex<LockState>>,
    level: LockKind,
}

impl LockHandle {
    pub fn level(&self) -> LockKind {
        self.level
    }

    /// Try to raise the lock to `to`. Returns whether the transition was
    /// granted; a denied transition leaves the shared state consistent and the
    /// caller free to retry.
    pub fn lock(&mut self, to: LockKind) -> bool {
        if to <= self.level {
            return self.unlock(to);
        }

        let mut state = self.state.lock().unwrap();
        match to {
            LockKind::None => true,
            LockKind::Shared => {
                // A staged writer blocks new readers.
                if state.pending {
                    return false;
                }
                state.shared_count += 1;
                self.level = LockKind::Shared;
                true
            }
            LockKind::Reserved => {
                if state.reserved {
                    return false;
                }
                state.reserved = true;
                self.level = LockKind::Reserved;
                true
            }
            LockKind::Pending | LockKind::Exclusive => {
                if self.level < LockKind::Reserved {
                    if state.reserved {
                        return false;
                    }
                    state.reserved = true;
                }
                state.pending = true;
                self.level = LockKind::Pending;

                // Wait briefly for the remaining readers (besides us) to drain.
                let deadline = Instant::now() + EXCLUSIVE_SPIN;
                while state.shared_count > 1 {
                    if Instant::now() >= deadline {
                        // Stay at PENDING; the engine retries per its busy policy.
                        return false;
                    }
                    drop(state);
                    std::hint::spin_loop();
                    state = self.state.lock().unwrap();
                }
                self.level = LockKind::Exclusive;
                true
            }
        }
    }

    /// Drop the lock down to `to`, releasing whichever flags this handle holds
    /// above it.
    pub fn unlock(&mut self, to: LockKind) -> bool {
        if to >= self.level {
            return true;
        }

        let mut state = self.state.lock().unwrap();
        if self.level >= LockKind::Pending {
            state.pending = false;
        }
        if self.level >= LockKind::Reserved {
            state.reserved = false;
        }
        if to == LockKind::None && self.level >= LockKind::Shared {
            state.shared_count = state.shared_count.saturating_sub(1);
        }
        self.level = to;
        true
    }

    /// Whether this handle or any other holds at least a reserved lock.
    pub fn reserved(&self) -> bool {
        self.level >= LockKind::Reserved || self.state.lock().unwrap().reserved
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.unlock(LockKind::None);
        let remaining = {
            let mut state = self.state.lock().unwrap();
            state.handles -= 1;
            state.handles
        };
        if remaining == 0 {
            let mut states = self.registry.states.lock().unwrap();
            // Re-check under the map guard; another handle may have registered.
            if states
                .get(&self.key)
                .is_some_and(|s| s.lock().unwrap().handles == 0)
            {
                states.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_stack() {
        let registry = LockRegistry::new();
        let mut a = registry.acquire("db");
        let mut b = registry.acquire("db");

        assert!(a.lock(LockKind::Shared));
        assert!(b.lock(LockKind::Shared));
        assert_eq!(a.level(), LockKind::Shared);
        assert_eq!(b.level(), LockKind::Shared);
    }

    #[test]
    fn reserved_is_exclusive_between_handles() {
        let registry = LockRegistry::new();
        let mut a = registry.acquire("db");
        let mut b = registry.acquire("db");

        assert!(a.lock(LockKind::Shared));
        assert!(b.lock(LockKind::Shared));
        assert!(a.lock(LockKind::Reserved));
        assert!(!b.lock(LockKind::Reserved));
        assert!(b.reserved());

        assert!(a.unlock(LockKind::Shared));
        assert!(b.lock(LockKind::Reserved));
    }

    #[test]
    fn exclusive_denied_while_second_reader_holds_on() {
        let registry = LockRegistry::new();
        let mut writer = registry.acquire("db");
        let mut reader = registry.acquire("db");

        assert!(writer.lock(LockKind::Shared));
        assert!(reader.lock(LockKind::Shared));
        assert!(!writer.lock(LockKind::Exclusive));
        assert_eq!(writer.level(), LockKind::Pending);

        // Pending blocks any new shared acquisition.
        let mut late = registry.acquire("db");
        assert!(!late.lock(LockKind::Shared));

        // Once the reader drains, the retry succeeds.
        assert!(reader.unlock(LockKind::None));
        assert!(writer.lock(LockKind::Exclusive));
        assert_eq!(writer.level(), LockKind::Exclusive);
    }

    #[test]
    fn unlock_releases_flags_in_order() {
        let registry = LockRegistry::new();
        let mut a = registry.acquire("db");

        assert!(a.lock(LockKind::Shared));
        assert!(a.lock(LockKind::Exclusive));
        assert!(a.unlock(LockKind::Shared));
        assert_eq!(a.level(), LockKind::Shared);

        // Reserved and pending are free again for someone else.
        let mut b = registry.acquire("db");
        assert!(b.lock(LockKind::Shared));
        assert!(b.lock(LockKind::Reserved));
        assert!(!a.reserved() || b.level() == LockKind::Reserved);

        assert!(a.unlock(LockKind::None));
        assert_eq!(a.level(), LockKind::None);
    }

    #[test]
    fn state_is_dropped_with_last_handle() {
        let registry = LockRegistry::new();
        let a = registry.acquire("db");
        let b = registry.acquire("db");
        drop(a);
        assert_eq!(registry.states.lock().unwrap().len(), 1);
        drop(b);
        assert!(registry.states.lock().unwrap().is_empty());
    }
}

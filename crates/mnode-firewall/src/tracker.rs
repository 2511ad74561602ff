//! Reference-counted rule tracking
//!
//! Several independent callers may ask for the same rule (allow the same
//! IP, block traffic for two sessions). The rule must be installed once,
//! on the first request, and removed once, after the last holder lets go.
//!
//! ```text
//!  count: 0 ──apply()──▶ 1 ──▶ 2 ──▶ ... ──▶ 1 ──undo()──▶ 0
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Action that reverts an applied rule
pub type Undo = Box<dyn FnOnce() + Send>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RefCount {
    count: usize,
    undo: Undo,
}

/// Counter map keyed by logical reference name (`block-traffic`,
/// `allow:<host>`). Not synchronized on its own; callers keep it behind
/// the same lock as whatever other state must change atomically with it.
#[derive(Default)]
pub struct RefCounts {
    entries: HashMap<String, RefCount>,
}

impl RefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a hold on `key`, running `apply` only on the 0 → 1 transition.
    ///
    /// When `apply` fails nothing is registered.
    pub fn acquire<E>(
        &mut self,
        key: &str,
        apply: impl FnOnce() -> Result<Undo, E>,
    ) -> Result<(), E> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.count += 1;
            return Ok(());
        }

        let undo = apply()?;
        self.entries
            .insert(key.to_string(), RefCount { count: 1, undo });
        Ok(())
    }

    /// Drop one hold on `key`, running the stored undo on the 1 → 0
    /// transition. Returns true when the undo ran. Releasing an unknown
    /// key is a no-op.
    pub fn release(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.count -= 1;
        if entry.count > 0 {
            return false;
        }
        if let Some(entry) = self.entries.remove(key) {
            (entry.undo)();
        }
        true
    }

    /// Number of active holders for `key`
    pub fn count(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |e| e.count)
    }
}

impl fmt::Debug for RefCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v.count)))
            .finish()
    }
}

/// Thread-safe [`RefCounts`] handing out [`RuleRemover`]s
#[derive(Clone, Default)]
pub struct RuleTracker {
    counts: Arc<Mutex<RefCounts>>,
}

impl RuleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `apply` if nobody holds `key` yet and return a handle that
    /// releases this caller's hold.
    pub fn tracking_call<E>(
        &self,
        key: &str,
        apply: impl FnOnce() -> Result<Undo, E>,
    ) -> Result<RuleRemover, E> {
        lock(&self.counts).acquire(key, apply)?;

        let counts = Arc::clone(&self.counts);
        let key = key.to_string();
        Ok(RuleRemover::new(move || {
            lock(&counts).release(&key);
        }))
    }

    /// Number of active holders for `key`
    pub fn count(&self, key: &str) -> usize {
        lock(&self.counts).count(key)
    }
}

/// Single-use release handle returned by every allow/block call.
///
/// [`remove`](RuleRemover::remove) releases the hold exactly once; later
/// calls do nothing. Dropping the handle does not release anything.
pub struct RuleRemover {
    release: Mutex<Option<Undo>>,
}

impl RuleRemover {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Handle that never had anything to release
    pub fn noop() -> Self {
        Self {
            release: Mutex::new(None),
        }
    }

    /// One handle releasing all of `removers`, in order
    pub fn combine(removers: Vec<RuleRemover>) -> Self {
        Self::new(move || {
            for remover in &removers {
                remover.remove();
            }
        })
    }

    /// Release the hold. Idempotent.
    pub fn remove(&self) {
        let release = lock(&self.release).take();
        if let Some(release) = release {
            release();
        }
    }

    /// Whether there is nothing (left) to release
    pub fn is_released(&self) -> bool {
        lock(&self.release).is_none()
    }
}

impl fmt::Debug for RuleRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRemover")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_apply(
        applied: &Arc<AtomicUsize>,
        undone: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> Result<Undo, ()> + use<> {
        let applied = Arc::clone(applied);
        let undone = Arc::clone(undone);
        move || {
            applied.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(move || {
                undone.fetch_add(1, Ordering::SeqCst);
            }) as Undo)
        }
    }

    #[test]
    fn test_apply_once_undo_after_last_release() {
        let tracker = RuleTracker::new();
        let applied = Arc::new(AtomicUsize::new(0));
        let undone = Arc::new(AtomicUsize::new(0));

        let removers: Vec<_> = (0..5)
            .map(|_| tracker.tracking_call("k", counting_apply(&applied, &undone)).unwrap())
            .collect();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.count("k"), 5);

        for (i, remover) in removers.iter().enumerate() {
            assert_eq!(undone.load(Ordering::SeqCst), 0, "undone early at {i}");
            remover.remove();
        }
        assert_eq!(undone.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.count("k"), 0);
    }

    #[test]
    fn test_double_release_is_noop() {
        let tracker = RuleTracker::new();
        let applied = Arc::new(AtomicUsize::new(0));
        let undone = Arc::new(AtomicUsize::new(0));

        let first = tracker.tracking_call("k", counting_apply(&applied, &undone)).unwrap();
        let second = tracker.tracking_call("k", counting_apply(&applied, &undone)).unwrap();

        first.remove();
        first.remove();
        assert_eq!(tracker.count("k"), 1);
        assert_eq!(undone.load(Ordering::SeqCst), 0);

        second.remove();
        second.remove();
        assert_eq!(tracker.count("k"), 0);
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_apply_registers_nothing() {
        let tracker = RuleTracker::new();
        let result = tracker.tracking_call("k", || Err::<Undo, _>("boom"));
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(tracker.count("k"), 0);

        // next caller gets a fresh apply
        let applied = Arc::new(AtomicUsize::new(0));
        let undone = Arc::new(AtomicUsize::new(0));
        let remover = tracker.tracking_call("k", counting_apply(&applied, &undone)).unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        remover.remove();
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reapply_after_full_release() {
        let tracker = RuleTracker::new();
        let applied = Arc::new(AtomicUsize::new(0));
        let undone = Arc::new(AtomicUsize::new(0));

        tracker.tracking_call("k", counting_apply(&applied, &undone)).unwrap().remove();
        tracker.tracking_call("k", counting_apply(&applied, &undone)).unwrap().remove();

        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(undone.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_holders() {
        let tracker = RuleTracker::new();
        let applied = Arc::new(AtomicUsize::new(0));
        let undone = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let apply = counting_apply(&applied, &undone);
                thread::spawn(move || tracker.tracking_call("k", apply).unwrap())
            })
            .collect();
        let removers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.count("k"), 8);

        let handles: Vec<_> = removers
            .into_iter()
            .map(|r| thread::spawn(move || r.remove()))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(undone.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.count("k"), 0);
    }

    #[test]
    fn test_combined_remover() {
        let tracker = RuleTracker::new();
        let a = tracker.tracking_call("a", || Ok::<Undo, ()>(Box::new(|| {}))).unwrap();
        let b = tracker.tracking_call("b", || Ok::<Undo, ()>(Box::new(|| {}))).unwrap();

        let both = RuleRemover::combine(vec![a, b]);
        assert!(!both.is_released());
        both.remove();
        assert!(both.is_released());
        assert_eq!(tracker.count("a"), 0);
        assert_eq!(tracker.count("b"), 0);
    }

    #[test]
    fn test_noop_remover() {
        let remover = RuleRemover::noop();
        assert!(remover.is_released());
        remover.remove();
    }
}

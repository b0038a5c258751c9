//! Cooperative cancellation shared by everything a session spawns.
//!
//! A `Cancel` is a cheap clonable flag plus a list of once-only hooks. The
//! hooks close blocking resources (the multiplexer, listeners) so that
//! threads parked in IO wake up with a benign error instead of polling a
//! flag they cannot observe while blocked.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
pub struct Cancel {
  inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
  cancelled: AtomicBool,
  hooks: Mutex<Vec<Hook>>,
}

impl Cancel {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fires the cancellation. Idempotent; hooks run at most once, on the
  /// first caller's thread.
  pub fn cancel(&self) {
    if self.inner.cancelled.swap(true, Ordering::SeqCst) {
      return;
    }
    let hooks = std::mem::take(&mut *self.inner.hooks.lock());
    for hook in hooks {
      hook();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Registers a hook to run on cancellation. If cancellation already
  /// fired, the hook runs immediately on the calling thread.
  pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
    if self.is_cancelled() {
      hook();
      return;
    }
    let mut hooks = self.inner.hooks.lock();
    // Re-check under the lock so a racing cancel() cannot strand the hook.
    if self.inner.cancelled.load(Ordering::SeqCst) {
      drop(hooks);
      hook();
    } else {
      hooks.push(Box::new(hook));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn hooks_run_exactly_once() {
    let cancel = Cancel::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    cancel.on_cancel(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    cancel.cancel();
    cancel.cancel();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(cancel.is_cancelled());
  }

  #[test]
  fn late_hooks_run_immediately() {
    let cancel = Cancel::new();
    cancel.cancel();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    cancel.on_cancel(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
}

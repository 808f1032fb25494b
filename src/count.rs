//! Owner counting for completion states.
//!
//! Every handle that refers to a completion state (a [`Future`](crate::Future),
//! each [`SharedFuture`](crate::SharedFuture) clone, a [`Promise`](crate::Promise))
//! is one owner. The count starts at "one owner, zero extras" and the last release
//! reports itself so the state can run its zero-owner hook exactly once.
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicIsize, Ordering};

pub(crate) struct SharedCount {
    extra_owners: AtomicIsize,
}

impl SharedCount {
    pub(crate) const fn new() -> Self {
        Self {
            extra_owners: AtomicIsize::new(0),
        }
    }

    pub(crate) fn add_owner(&self) {
        // A new owner is always cloned from an existing one, so no ordering is needed here.
        self.extra_owners.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one owner. Returns `true` when this was the last one; the caller must then run
    /// the zero-owner hook and must not release again.
    pub(crate) fn release_owner(&self) -> bool {
        self.extra_owners.fetch_sub(1, Ordering::AcqRel) == 0
    }

    pub(crate) fn use_count(&self) -> usize {
        (self.extra_owners.load(Ordering::Acquire) + 1).max(0) as usize
    }
}

impl Debug for SharedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCount")
            .field("use_count", &self.use_count())
            .finish()
    }
}

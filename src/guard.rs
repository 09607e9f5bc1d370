use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{Error, Result};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Tracks which single thread is currently inside the engine on behalf of one
/// handle (connection, cursor or blob).
///
/// Entry from a second thread while another is inside fails fast with a
/// threading violation; it never blocks or queues. Ownership moves freely
/// between threads between calls, and same-thread re-entry (a callback running
/// nested SQL) is permitted.
#[derive(Debug, Default)]
pub(crate) struct AffinityTag {
    owner: AtomicU64,
    depth: AtomicUsize,
}

impl AffinityTag {
    pub(crate) const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enter(&self) -> Result<AffinityGuard<'_>> {
        let me = current_thread_id();
        match self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(current) if current == me => {}
            Err(_) => return Err(Error::ThreadingViolation),
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(AffinityGuard { tag: self })
    }
}

pub(crate) struct AffinityGuard<'a> {
    tag: &'a AffinityTag,
}

impl Drop for AffinityGuard<'_> {
    fn drop(&mut self) {
        if self.tag.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.tag.owner.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn same_thread_reentry_is_allowed() {
        let tag = AffinityTag::new();
        let outer = tag.enter().unwrap();
        let inner = tag.enter().unwrap();
        drop(inner);
        drop(outer);
        // Fully released: a fresh entry succeeds.
        assert!(tag.enter().is_ok());
    }

    #[test]
    fn concurrent_entry_from_another_thread_fails_fast() {
        let tag = Arc::new(AffinityTag::new());
        let guard = tag.enter().unwrap();

        let tag2 = Arc::clone(&tag);
        let result = std::thread::spawn(move || match tag2.enter() {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(Error::ThreadingViolation)));
        drop(guard);
    }

    #[test]
    fn ownership_moves_between_threads_when_serialized() {
        let tag = Arc::new(AffinityTag::new());
        {
            let _guard = tag.enter().unwrap();
        }
        let tag2 = Arc::clone(&tag);
        let ok = std::thread::spawn(move || tag2.enter().is_ok())
            .join()
            .unwrap();
        assert!(ok);
    }
}

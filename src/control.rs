//! Cooperative control primitives
//!
//! Pause, dynamic parallelism and terminal-state signalling shared by the
//! scheduler and the request types:
//! - `PauseToken`: a cheap observable flag consumers check between items
//! - `DynamicSemaphore`: a counting semaphore whose capacity can grow or
//!   shrink at runtime, with RAII permits
//! - `Latch`: a one-shot awaitable signalled exactly once
//! - `link_token`: joins an external cancellation source into a child token

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Observable pause flag. Not a hard suspend: consumers poll it at
/// cooperative checkpoints.
#[derive(Clone, Default)]
pub struct PauseToken {
    inner: Arc<PauseInner>,
}

#[derive(Default)]
struct PauseInner {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Suspends the caller while the token is paused.
    pub async fn wait_if_paused(&self) {
        while self.inner.paused.load(Ordering::SeqCst) {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            // Register before re-checking, or a resume between the check and
            // the await is lost.
            notified.as_mut().enable();
            if !self.inner.paused.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

/// Counting semaphore with a runtime-adjustable permit count.
///
/// Growing releases permits immediately. Shrinking first forgets idle
/// permits; the remainder is absorbed as outstanding permits are dropped,
/// so in-flight work is never interrupted.
#[derive(Clone)]
pub struct DynamicSemaphore {
    inner: Arc<SemInner>,
}

struct SemInner {
    semaphore: Arc<Semaphore>,
    shape: Mutex<SemShape>,
}

struct SemShape {
    capacity: usize,
    /// Permits owed back to a shrink, consumed on release instead of being
    /// returned to the pool.
    deficit: usize,
}

impl DynamicSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SemInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                shape: Mutex::new(SemShape {
                    capacity,
                    deficit: 0,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.shape.lock().unwrap().capacity
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Acquires one permit, released when the returned guard drops.
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        permit.forget();
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Adjusts the permit count, taking effect immediately for growth and as
    /// outstanding work completes for shrinkage.
    pub fn set_capacity(&self, new_capacity: usize) {
        let mut shape = self.inner.shape.lock().unwrap();
        if new_capacity == shape.capacity {
            return;
        }
        if new_capacity > shape.capacity {
            let mut grow = new_capacity - shape.capacity;
            let paid = grow.min(shape.deficit);
            shape.deficit -= paid;
            grow -= paid;
            if grow > 0 {
                self.inner.semaphore.add_permits(grow);
            }
        } else {
            let shrink = shape.capacity - new_capacity;
            let reclaimed = self.inner.semaphore.forget_permits(shrink);
            shape.deficit += shrink - reclaimed;
        }
        shape.capacity = new_capacity;
    }
}

/// RAII permit from a [`DynamicSemaphore`]. Dropping it returns the permit,
/// or pays down a pending shrink.
pub struct Permit {
    inner: Arc<SemInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut shape = self.inner.shape.lock().unwrap();
        if shape.deficit > 0 {
            shape.deficit -= 1;
        } else {
            self.inner.semaphore.add_permits(1);
        }
    }
}

/// One-shot awaitable signalled on first `open()`. Later opens are no-ops.
#[derive(Default)]
pub struct Latch {
    opened: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually opened the latch.
    pub fn open(&self) -> bool {
        let first = !self.opened.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        while !self.opened.load(Ordering::SeqCst) {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.opened.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }
}

/// Creates a child of `parent` that is also cancelled whenever `external`
/// fires. The forwarding task ends once either side resolves or `until`
/// opens, so it never outlives the request it serves.
pub fn link_token(
    parent: &CancellationToken,
    external: &CancellationToken,
    until: Arc<Latch>,
) -> CancellationToken {
    let linked = parent.child_token();
    let external = external.clone();
    let forward = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = external.cancelled() => forward.cancel(),
            _ = forward.cancelled() => {}
            _ = until.wait() => {}
        }
    });
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pause_token_gates_waiters() {
        let pause = PauseToken::new();
        pause.pause();
        assert!(pause.is_paused());

        let gate = {
            let pause = pause.clone();
            tokio::spawn(async move { pause.wait_if_paused().await })
        };
        tokio::task::yield_now().await;
        assert!(!gate.is_finished());

        pause.resume();
        tokio::time::timeout(Duration::from_secs(1), gate)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_semaphore_grow_releases_immediately() {
        let sem = DynamicSemaphore::new(1);
        let _held = sem.acquire().await;
        assert_eq!(sem.available(), 0);

        sem.set_capacity(3);
        assert_eq!(sem.available(), 2);
        assert_eq!(sem.capacity(), 3);
    }

    #[tokio::test]
    async fn test_semaphore_shrink_absorbs_releases() {
        let sem = DynamicSemaphore::new(3);
        let a = sem.acquire().await;
        let b = sem.acquire().await;
        assert_eq!(sem.available(), 1);

        // Shrink to 1: one idle permit is forgotten, one release is owed.
        sem.set_capacity(1);
        assert_eq!(sem.available(), 0);

        drop(a);
        assert_eq!(sem.available(), 0, "first release pays the deficit");
        drop(b);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_latch_opens_once() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;

        assert!(latch.open());
        assert!(!latch.open(), "second open must report already-open");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Waiting on an open latch returns immediately.
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_link_token_observes_both_parents() {
        let parent = CancellationToken::new();
        let external = CancellationToken::new();
        let linked = link_token(&parent, &external, Arc::new(Latch::new()));
        assert!(!linked.is_cancelled());

        external.cancel();
        tokio::time::timeout(Duration::from_secs(1), linked.cancelled())
            .await
            .unwrap();
        assert!(!parent.is_cancelled(), "cancellation must not flow upward");

        let parent = CancellationToken::new();
        let external = CancellationToken::new();
        let linked = link_token(&parent, &external, Arc::new(Latch::new()));
        parent.cancel();
        assert!(linked.is_cancelled());
        assert!(!external.is_cancelled());
    }
}

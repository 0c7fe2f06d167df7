//! Priority Channel
//!
//! A multi-producer multi-consumer async queue with K priority levels.
//! Readers always receive the lowest-index non-empty level first, FIFO within
//! a level.
//!
//! Key features:
//! - Non-blocking `try_write` / `try_read` fast paths
//! - Async `read` with direct writer-to-reader hand-off when readers are parked
//! - `wait_to_read` observers woken on every enqueue
//! - Idempotent `complete()`: writes fail afterwards, reads drain the backlog
//!   first, then fail with a channel-closed error

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::errors::EngineError;

/// Number of priority levels used by the engine (High, Normal, Low).
pub const DEFAULT_LEVELS: usize = 3;

pub struct PriorityChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for PriorityChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ChannelInner<T> {
    levels: usize,
    /// Items currently sitting in the level queues. Hand-offs to parked
    /// readers bypass the queues and never appear here.
    len: AtomicUsize,
    /// Every write the channel has accepted, hand-offs included. Monotone.
    written: AtomicUsize,
    state: Mutex<ChannelState<T>>,
}

struct ChannelState<T> {
    queues: Vec<VecDeque<T>>,
    /// Parked `read` calls, oldest first. A write hands its item to the head
    /// reader directly; a dead sender (dropped read future) is skipped.
    readers: VecDeque<oneshot::Sender<(usize, T)>>,
    /// Parked `wait_to_read` observers, all woken on every enqueue.
    waiters: Vec<oneshot::Sender<bool>>,
    /// Parked `closed` observers, resolved once done and fully drained.
    drained: Vec<oneshot::Sender<()>>,
    done: bool,
}

impl<T> PriorityChannel<T> {
    pub fn new(levels: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                levels,
                len: AtomicUsize::new(0),
                written: AtomicUsize::new(0),
                state: Mutex::new(ChannelState {
                    queues: (0..levels).map(|_| VecDeque::new()).collect(),
                    readers: VecDeque::new(),
                    waiters: Vec::new(),
                    drained: Vec::new(),
                    done: false,
                }),
            }),
        }
    }

    pub fn levels(&self) -> usize {
        self.inner.levels
    }

    /// Items currently queued. Items handed directly to a parked reader never
    /// appear here.
    pub fn len(&self) -> usize {
        self.inner.len.load(Ordering::SeqCst)
    }

    /// Total writes accepted over the channel's lifetime, items handed
    /// directly to a parked reader included. Never decreases.
    pub fn count(&self) -> usize {
        self.inner.written.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().unwrap().done
    }

    /// Enqueues an item at the given priority level. Never blocks; returns
    /// `false` only after `complete()` was called.
    pub fn try_write(&self, priority: usize, item: T) -> bool {
        let priority = priority.min(self.inner.levels - 1);
        let mut st = self.inner.state.lock().unwrap();
        if st.done {
            return false;
        }

        // Hand the item straight to the oldest parked reader. Senders whose
        // read future was dropped return the item so the next reader (or the
        // queue) gets it.
        let mut item = item;
        while let Some(tx) = st.readers.pop_front() {
            match tx.send((priority, item)) {
                Ok(()) => {
                    self.inner.written.fetch_add(1, Ordering::SeqCst);
                    return true;
                }
                Err((_, returned)) => item = returned,
            }
        }

        st.queues[priority].push_back(item);
        self.inner.len.fetch_add(1, Ordering::SeqCst);
        self.inner.written.fetch_add(1, Ordering::SeqCst);
        for tx in st.waiters.drain(..) {
            let _ = tx.send(true);
        }
        true
    }

    /// Unbounded write; completes synchronously. Fails only on a completed
    /// channel.
    pub async fn write(&self, priority: usize, item: T) -> Result<(), EngineError> {
        if self.try_write(priority, item) {
            Ok(())
        } else {
            Err(EngineError::ChannelClosed)
        }
    }

    /// Non-blocking read scanning priorities in order.
    pub fn try_read(&self) -> Option<(usize, T)> {
        let mut st = self.inner.state.lock().unwrap();
        let hit = Self::dequeue(&self.inner, &mut st);
        if hit.is_some() {
            Self::check_drained(&self.inner, &mut st);
        }
        hit
    }

    /// Suspends until an item is available or the channel is completed and
    /// drained.
    pub async fn read(&self) -> Result<(usize, T), EngineError> {
        loop {
            let rx = {
                let mut st = self.inner.state.lock().unwrap();
                if let Some(hit) = Self::dequeue(&self.inner, &mut st) {
                    Self::check_drained(&self.inner, &mut st);
                    return Ok(hit);
                }
                if st.done {
                    return Err(EngineError::ChannelClosed);
                }
                let (tx, rx) = oneshot::channel();
                st.readers.push_back(tx);
                rx
            };
            match (Handoff {
                channel: self,
                rx: Some(rx),
            })
            .await
            {
                Some(hit) => return Ok(hit),
                // Sender dropped: completed, or a writer skipped this entry.
                // Loop to re-check the channel state.
                None => continue,
            }
        }
    }

    /// Resolves `true` once data is available, `false` if the channel was
    /// completed while empty.
    pub async fn wait_to_read(&self) -> bool {
        let rx = {
            let mut st = self.inner.state.lock().unwrap();
            if st.queues.iter().any(|q| !q.is_empty()) {
                return true;
            }
            if st.done {
                return false;
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(false)
    }

    /// Marks the channel complete. Idempotent. Parked readers fail with a
    /// channel-closed error, parked waiters resolve `false`, queued items stay
    /// readable until drained.
    pub fn complete(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if st.done {
            return;
        }
        st.done = true;
        st.readers.clear();
        for tx in st.waiters.drain(..) {
            let _ = tx.send(false);
        }
        Self::check_drained(&self.inner, &mut st);
    }

    /// Resolves once `complete()` was called and every queued item was read.
    pub async fn closed(&self) {
        let rx = {
            let mut st = self.inner.state.lock().unwrap();
            if st.done && st.queues.iter().all(|q| q.is_empty()) {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.drained.push(tx);
            rx
        };
        let _ = rx.await;
    }

    fn dequeue(inner: &ChannelInner<T>, st: &mut ChannelState<T>) -> Option<(usize, T)> {
        for priority in 0..inner.levels {
            if let Some(item) = st.queues[priority].pop_front() {
                inner.len.fetch_sub(1, Ordering::SeqCst);
                return Some((priority, item));
            }
        }
        None
    }

    /// Pushes a recovered item back to the head of its level so ordering is
    /// preserved, re-offering it to parked readers first. The item was
    /// already counted when it was first written.
    fn reinsert_front(&self, priority: usize, item: T) {
        let mut st = self.inner.state.lock().unwrap();
        let mut item = item;
        while let Some(tx) = st.readers.pop_front() {
            match tx.send((priority, item)) {
                Ok(()) => return,
                Err((_, returned)) => item = returned,
            }
        }
        st.queues[priority].push_front(item);
        self.inner.len.fetch_add(1, Ordering::SeqCst);
        for tx in st.waiters.drain(..) {
            let _ = tx.send(true);
        }
    }

    fn check_drained(_inner: &ChannelInner<T>, st: &mut ChannelState<T>) {
        if st.done && st.queues.iter().all(|q| q.is_empty()) {
            for tx in st.drained.drain(..) {
                let _ = tx.send(());
            }
        }
    }
}

impl<T: Clone> PriorityChannel<T> {
    /// Clones the item a `try_read` would return, without removing it.
    pub fn try_peek(&self) -> Option<(usize, T)> {
        let st = self.inner.state.lock().unwrap();
        for priority in 0..self.inner.levels {
            if let Some(item) = st.queues[priority].front() {
                return Some((priority, item.clone()));
            }
        }
        None
    }
}

impl<T> Default for PriorityChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_LEVELS)
    }
}

/// Await half of a writer-to-reader hand-off. If the future is dropped after
/// a writer already sent an item (read raced with cancellation), the item is
/// pushed back to the front of its level instead of being lost.
struct Handoff<'a, T> {
    channel: &'a PriorityChannel<T>,
    rx: Option<oneshot::Receiver<(usize, T)>>,
}

impl<T> Future for Handoff<'_, T> {
    type Output = Option<(usize, T)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let rx = this.rx.as_mut().expect("handoff polled after completion");
        match Pin::new(rx).poll(cx) {
            Poll::Ready(result) => {
                this.rx = None;
                Poll::Ready(result.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Handoff<'_, T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok((priority, item)) = rx.try_recv() {
                self.channel.reinsert_front(priority, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Context;

    #[test]
    fn test_priority_order() {
        let chan: PriorityChannel<&str> = PriorityChannel::default();
        assert!(chan.try_write(2, "low"));
        assert!(chan.try_write(0, "high"));
        assert!(chan.try_write(1, "normal"));

        assert_eq!(chan.try_read(), Some((0, "high")));
        assert_eq!(chan.try_read(), Some((1, "normal")));
        assert_eq!(chan.try_read(), Some((2, "low")));
        assert_eq!(chan.try_read(), None);
    }

    #[test]
    fn test_fifo_within_level() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        for i in 0..5 {
            chan.try_write(1, i);
        }
        for i in 0..5 {
            assert_eq!(chan.try_read(), Some((1, i)));
        }
    }

    #[test]
    fn test_complete_drains_then_fails() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        chan.try_write(0, 1);
        chan.try_write(1, 2);
        chan.complete();

        assert!(!chan.try_write(0, 3), "writes must fail after complete");
        assert_eq!(chan.try_read(), Some((0, 1)));
        assert_eq!(chan.try_read(), Some((1, 2)));
        assert_eq!(chan.try_read(), None);
    }

    #[tokio::test]
    async fn test_read_fails_after_drained() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        chan.try_write(0, 7);
        chan.complete();
        assert_eq!(chan.read().await.unwrap().1, 7);
        assert!(matches!(
            chan.read().await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_hands_off_to_parked_reader() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        let reader = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.read().await })
        };
        // Give the reader a chance to park itself.
        tokio::task::yield_now().await;
        chan.try_write(1, 42);
        assert_eq!(reader.await.unwrap().unwrap(), (1, 42));
        // Direct hand-off bypasses the queues but still counts as a write.
        assert_eq!(chan.len(), 0);
        assert_eq!(chan.count(), 1);
    }

    #[tokio::test]
    async fn test_count_never_decreases() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        chan.try_write(0, 1);
        chan.try_write(2, 2);
        assert_eq!(chan.count(), 2);

        chan.try_read();
        chan.try_read();
        assert_eq!(chan.len(), 0);
        assert_eq!(chan.count(), 2, "reads must not touch the write total");

        chan.complete();
        assert!(!chan.try_write(0, 3));
        assert_eq!(chan.count(), 2, "refused writes are not counted");
    }

    #[tokio::test]
    async fn test_stale_reader_is_skipped() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        {
            use futures_util::FutureExt;
            // Poll once to park a reader, then drop the future.
            let fut = chan.read();
            assert!(fut.now_or_never().is_none());
        }
        assert!(chan.try_write(0, 9));
        assert_eq!(chan.try_read(), Some((0, 9)));
    }

    #[tokio::test]
    async fn test_dropped_read_does_not_lose_raced_item() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let mut fut = Box::pin(chan.read());
        assert!(fut.as_mut().poll(&mut cx).is_pending());

        // The write lands in the parked reader's slot.
        assert!(chan.try_write(2, 5));
        assert_eq!(chan.len(), 0);

        // Dropping the never-completed read must put the item back.
        drop(fut);
        assert_eq!(chan.try_read(), Some((2, 5)));
    }

    #[tokio::test]
    async fn test_wait_to_read() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        let waiter = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.wait_to_read().await })
        };
        tokio::task::yield_now().await;
        chan.try_write(0, 1);
        assert!(waiter.await.unwrap());

        chan.try_read();
        let waiter = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.wait_to_read().await })
        };
        tokio::task::yield_now().await;
        chan.complete();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_drain() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        chan.try_write(0, 1);
        chan.complete();

        let closed = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(!closed.is_finished());

        chan.try_read();
        closed.await.unwrap();
    }

    #[test]
    fn test_try_peek_leaves_item() {
        let chan: PriorityChannel<u32> = PriorityChannel::default();
        chan.try_write(1, 3);
        assert_eq!(chan.try_peek(), Some((1, 3)));
        assert_eq!(chan.len(), 1);
        assert_eq!(chan.try_read(), Some((1, 3)));
    }
}

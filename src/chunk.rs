//! Chunked-download coordination
//!
//! All N sibling `LoadRequest`s of one chunked download share a
//! `ChunkCoordinator`: per-chunk progress slots, the memoized content length,
//! the merge latch, and the CAS flags that elect a single merger (and a
//! single fallback winner when the server turns out not to honor ranges).
//! The root's completion callback and progress reporter are captured here at
//! construction so whichever sibling finishes the merge can fire them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio::sync::OnceCell;

use crate::control::Latch;
use crate::load::{LoadRequest, ProgressFn};
use crate::request::{CompletedCallback, Runnable};

/// Aggregate progress is forwarded to the user on every Nth per-chunk update
/// to avoid storming tiny reports.
const PROGRESS_THROTTLE: usize = 4;

/// Per-chunk bookkeeping slot.
#[derive(Debug, Default, Clone)]
pub(crate) struct ChunkSlot {
    pub percentage: f64,
    pub is_finished: bool,
    pub is_copied: bool,
}

pub(crate) struct ChunkCoordinator {
    chunk_count: usize,
    slots: Mutex<Vec<ChunkSlot>>,
    /// Total bytes written across all siblings.
    bytes_written: AtomicU64,
    /// Memoized HEAD probe result; `None` when the server sent no length.
    content_length: OnceCell<Option<u64>>,
    /// Filename resolved by the first sibling to see a response.
    file_name: OnceLock<String>,
    is_copying: AtomicBool,
    fallback: AtomicBool,
    merge_done: Arc<Latch>,
    merge_while_progress: bool,
    progress: Option<ProgressFn>,
    on_completed: Mutex<Option<CompletedCallback<PathBuf>>>,
    siblings: Mutex<Vec<Weak<LoadRequest>>>,
    progress_ticks: AtomicUsize,
}

impl ChunkCoordinator {
    pub(crate) fn new(
        chunk_count: usize,
        merge_while_progress: bool,
        progress: Option<ProgressFn>,
        on_completed: Option<CompletedCallback<PathBuf>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chunk_count,
            slots: Mutex::new(vec![ChunkSlot::default(); chunk_count]),
            bytes_written: AtomicU64::new(0),
            content_length: OnceCell::new(),
            file_name: OnceLock::new(),
            is_copying: AtomicBool::new(false),
            fallback: AtomicBool::new(false),
            merge_done: Arc::new(Latch::new()),
            merge_while_progress,
            progress,
            on_completed: Mutex::new(on_completed),
            siblings: Mutex::new(Vec::new()),
            progress_ticks: AtomicUsize::new(0),
        })
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub(crate) fn merge_while_progress(&self) -> bool {
        self.merge_while_progress
    }

    pub(crate) fn merge_latch(&self) -> Arc<Latch> {
        Arc::clone(&self.merge_done)
    }

    pub(crate) fn content_length_cell(&self) -> &OnceCell<Option<u64>> {
        &self.content_length
    }

    pub(crate) fn file_name_cell(&self) -> &OnceLock<String> {
        &self.file_name
    }

    pub(crate) fn set_siblings(&self, requests: Vec<Weak<LoadRequest>>) {
        *self.siblings.lock().unwrap() = requests;
    }

    /// Live sibling handles, excluding `index`.
    pub(crate) fn siblings_except(&self, index: usize) -> Vec<Arc<dyn Runnable>> {
        self.siblings
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .filter_map(|(_, weak)| weak.upgrade().map(|arc| arc as Arc<dyn Runnable>))
            .collect()
    }

    pub(crate) fn root(&self) -> Option<Arc<LoadRequest>> {
        self.siblings.lock().unwrap().first()?.upgrade()
    }

    pub(crate) fn add_bytes(&self, n: u64) -> u64 {
        self.bytes_written.fetch_add(n, Ordering::Relaxed) + n
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Updates one chunk's progress slot and forwards the throttled mean to
    /// the user-visible reporter.
    pub(crate) fn record_progress(&self, index: usize, percentage: f64) {
        let mean = {
            let mut slots = self.slots.lock().unwrap();
            slots[index].percentage = percentage;
            slots.iter().map(|s| s.percentage).sum::<f64>() / self.chunk_count as f64
        };
        let tick = self.progress_ticks.fetch_add(1, Ordering::Relaxed);
        if tick % PROGRESS_THROTTLE == 0 {
            if let Some(progress) = &self.progress {
                progress(mean);
            }
        }
    }

    /// Pushes a final value straight through the throttle.
    pub(crate) fn report_progress_now(&self, value: f64) {
        if let Some(progress) = &self.progress {
            progress(value);
        }
    }

    /// Marks chunk `index` finished; returns `true` when every chunk is.
    pub(crate) fn mark_finished(&self, index: usize) -> bool {
        let mut slots = self.slots.lock().unwrap();
        {
            let slot = &mut slots[index];
            slot.is_finished = true;
            slot.percentage = 1.0;
            // Chunk 0's part file is the merge target; it never needs copying.
            if index == 0 {
                slot.is_copied = true;
            }
        }
        slots.iter().all(|s| s.is_finished)
    }

    pub(crate) fn all_copied(&self) -> bool {
        self.slots.lock().unwrap().iter().all(|s| s.is_copied)
    }

    /// Index of the next chunk ready to be appended to the merge target:
    /// the first uncopied slot, provided it is finished and every slot
    /// before it was copied.
    pub(crate) fn next_mergeable(&self) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        for (i, slot) in slots.iter().enumerate() {
            if slot.is_copied {
                continue;
            }
            return if slot.is_finished { Some(i) } else { None };
        }
        None
    }

    pub(crate) fn mark_copied(&self, index: usize) {
        self.slots.lock().unwrap()[index].is_copied = true;
    }

    /// Elects the single merging sibling. The loser of the race skips the
    /// merge; the winner must call `end_copy`.
    pub(crate) fn try_begin_copy(&self) -> bool {
        self.is_copying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_copy(&self) {
        self.is_copying.store(false, Ordering::SeqCst);
    }

    /// Elects the single range-fallback winner.
    pub(crate) fn begin_fallback(&self) -> bool {
        self.fallback
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Hands the captured completion callback to the merging sibling.
    pub(crate) fn take_on_completed(&self) -> Option<CompletedCallback<PathBuf>> {
        self.on_completed.lock().unwrap().take()
    }

    pub(crate) fn take_progress(&self) -> Option<ProgressFn> {
        self.progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_finished_reports_all() {
        let coord = ChunkCoordinator::new(3, false, None, None);
        assert!(!coord.mark_finished(1));
        assert!(!coord.mark_finished(0));
        assert!(coord.mark_finished(2), "last chunk must report all-finished");
    }

    #[test]
    fn test_next_mergeable_respects_order() {
        let coord = ChunkCoordinator::new(3, false, None, None);
        // Chunk 2 finishing first is not mergeable until 0 and 1 are copied.
        coord.mark_finished(2);
        assert_eq!(coord.next_mergeable(), None);

        // Chunk 0 is the merge target and counts as copied; chunk 1 is not
        // finished yet, so nothing can merge.
        coord.mark_finished(0);
        assert_eq!(coord.next_mergeable(), None);

        coord.mark_finished(1);
        assert_eq!(coord.next_mergeable(), Some(1));
        coord.mark_copied(1);
        assert_eq!(coord.next_mergeable(), Some(2));
        coord.mark_copied(2);
        assert_eq!(coord.next_mergeable(), None);
        assert!(coord.all_copied());
    }

    #[test]
    fn test_copy_election_is_exclusive() {
        let coord = ChunkCoordinator::new(2, false, None, None);
        assert!(coord.try_begin_copy());
        assert!(!coord.try_begin_copy());
        coord.end_copy();
        assert!(coord.try_begin_copy());
    }

    #[test]
    fn test_fallback_elects_once() {
        let coord = ChunkCoordinator::new(4, false, None, None);
        assert!(coord.begin_fallback());
        assert!(!coord.begin_fallback());
    }

    #[test]
    fn test_progress_throttled_mean() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let coord = ChunkCoordinator::new(
            2,
            false,
            Some({
                let reported = Arc::clone(&reported);
                Arc::new(move |p: f64| reported.lock().unwrap().push(p))
            }),
            None,
        );

        // First tick always passes the throttle.
        coord.record_progress(0, 0.5);
        assert_eq!(*reported.lock().unwrap(), vec![0.25]);

        coord.record_progress(1, 0.5);
        coord.record_progress(0, 1.0);
        coord.record_progress(1, 1.0);
        // Ticks 1..3 were swallowed; the fifth lands again.
        coord.record_progress(1, 1.0);
        assert_eq!(reported.lock().unwrap().len(), 2);
    }
}

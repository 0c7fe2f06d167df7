//! Request Scheduler
//!
//! Multiplexes every in-flight request onto a bounded worker pool. One
//! logical drain loop per handler reads requests off the priority channel,
//! acquires a permit from the dynamic semaphore and executes the request body
//! in a spawned worker.
//!
//! Key features:
//! - Degree of parallelism follows observed throughput (see [`SpeedMeter`]),
//!   unless an explicit maximum overrides it
//! - Cooperative pause/resume between items; in-flight work always finishes
//! - A swappable cancellation source: global cancel stops everything, and a
//!   fresh source re-arms the handler without losing queued requests
//! - Failure policy: a failed request goes back to the channel until its
//!   retry budget is spent, honoring the configured back-off
//!
//! Two process-wide instances exist: [`main_handler`] for lightweight
//! requests and [`download_handler`] for file transfers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::channel::PriorityChannel;
use crate::control::{DynamicSemaphore, PauseToken};
use crate::request::{dispatch, Dispatched, RequestState, Runnable};
use crate::speed::{ParallelismHints, SpeedMeter};

/// Point-in-time snapshot of a handler's workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerStatus {
    /// Requests waiting in the priority channel.
    pub queued: usize,
    /// Request bodies currently executing.
    pub running: usize,
    /// Current degree of parallelism.
    pub capacity: usize,
    pub is_paused: bool,
}

/// A priority-scheduled request executor.
pub struct Handler {
    channel: PriorityChannel<Arc<dyn Runnable>>,
    semaphore: DynamicSemaphore,
    meter: SpeedMeter,
    pause: PauseToken,
    cancel: Mutex<CancellationToken>,
    max_override: Mutex<Option<usize>>,
    running: AtomicUsize,
    loop_active: AtomicBool,
}

impl Handler {
    pub fn new() -> Arc<Self> {
        Self::with_hints(ParallelismHints::default())
    }

    pub fn with_hints(hints: ParallelismHints) -> Arc<Self> {
        let meter = SpeedMeter::new(hints);
        let semaphore = DynamicSemaphore::new(meter.auto_parallelism());
        Arc::new(Self {
            channel: PriorityChannel::default(),
            semaphore,
            meter,
            pause: PauseToken::new(),
            cancel: Mutex::new(CancellationToken::new()),
            max_override: Mutex::new(None),
            running: AtomicUsize::new(0),
            loop_active: AtomicBool::new(false),
        })
    }

    /// Stops reading new items; in-flight requests run to completion.
    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(self: &Arc<Self>) {
        self.pause.resume();
        if !self.channel.is_empty() {
            self.ensure_running();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Cancels the scheduler's token: every request linked to it observes the
    /// cancellation and the drain loop exits.
    pub fn cancel_all(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Replaces a cancelled token with a fresh one so the handler can be used
    /// again. Queued requests survive; they relink on their next dispatch.
    pub fn create_new_cancellation_source(self: &Arc<Self>) {
        {
            let mut cancel = self.cancel.lock().unwrap();
            if !cancel.is_cancelled() {
                return;
            }
            *cancel = CancellationToken::new();
        }
        if !self.channel.is_empty() {
            self.ensure_running();
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// Pins the degree of parallelism; `None` returns control to the
    /// throughput-based automatic.
    pub fn set_max_parallelism(&self, max: Option<usize>) {
        *self.max_override.lock().unwrap() = max;
        self.apply_parallelism();
    }

    /// Feeds one bytes/sec observation into the throughput meter and adjusts
    /// the worker pool accordingly.
    pub fn add_speed(&self, bytes_per_sec: f64) {
        self.meter.add_speed(bytes_per_sec);
        self.apply_parallelism();
    }

    pub fn mean_speed(&self) -> f64 {
        self.meter.mean_bytes_per_sec()
    }

    pub fn status(&self) -> HandlerStatus {
        HandlerStatus {
            queued: self.channel.len(),
            running: self.running.load(Ordering::SeqCst),
            capacity: self.semaphore.capacity(),
            is_paused: self.pause.is_paused(),
        }
    }

    /// Closes the intake: queued requests still drain, new ones are refused.
    pub fn close(&self) {
        self.channel.complete();
    }

    /// Resolves once the handler was closed and fully drained.
    pub async fn closed(&self) {
        self.channel.closed().await;
    }

    fn apply_parallelism(&self) {
        let capacity = self
            .max_override
            .lock()
            .unwrap()
            .unwrap_or_else(|| self.meter.auto_parallelism());
        self.semaphore.set_capacity(capacity.max(1));
    }

    pub(crate) fn enqueue(self: &Arc<Self>, request: Arc<dyn Runnable>) {
        let level = request.core().priority().level();
        if !self.channel.try_write(level, Arc::clone(&request)) {
            tracing::warn!("handler intake is closed, failing request");
            if request.core().to_terminal(RequestState::Failed) {
                request.notify_failed();
            }
            return;
        }
        self.ensure_running();
    }

    fn ensure_running(self: &Arc<Self>) {
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let handler = Arc::clone(self);
            tokio::spawn(async move { handler.run_loop().await });
        }
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::debug!("scheduler drain loop started");
        loop {
            // Cooperative checkpoints between items.
            self.pause.wait_if_paused().await;
            let token = self.cancel_token();
            if token.is_cancelled() {
                break;
            }

            let request = tokio::select! {
                _ = token.cancelled() => break,
                read = self.channel.read() => match read {
                    Ok((_, request)) => request,
                    // Completed and drained: orderly shutdown.
                    Err(_) => break,
                },
            };

            let permit = tokio::select! {
                _ = token.cancelled() => {
                    // Already dequeued, so this one counts as in-flight.
                    if request.core().to_terminal(RequestState::Cancelled) {
                        request.notify_cancelled();
                    }
                    break;
                }
                permit = self.semaphore.acquire() => permit,
            };

            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                handler.running.fetch_add(1, Ordering::SeqCst);
                let outcome = dispatch(Arc::clone(&request)).await;
                handler.running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);

                if let Dispatched::Requeue { delay } = outcome {
                    if let Some(delay) = delay {
                        let token = request.core().token();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {
                                if request.core().to_terminal(RequestState::Cancelled) {
                                    request.notify_cancelled();
                                }
                                return;
                            }
                        }
                    }
                    handler.enqueue(request);
                }
            });
        }
        self.loop_active.store(false, Ordering::SeqCst);
        tracing::debug!("scheduler drain loop stopped");

        // Items that arrived while the loop was exiting must not starve.
        if !self.channel.is_empty()
            && !self.channel.is_completed()
            && !self.cancel_token().is_cancelled()
            && !self.pause.is_paused()
        {
            self.ensure_running();
        }
    }
}

lazy_static! {
    static ref MAIN_HANDLER: Arc<Handler> = Handler::new();
    static ref DOWNLOAD_HANDLER: Arc<Handler> = Handler::new();
}

/// Shared handler for lightweight requests (status probes, user jobs).
pub fn main_handler() -> Arc<Handler> {
    Arc::clone(&MAIN_HANDLER)
}

/// Shared handler for file downloads.
pub fn download_handler() -> Arc<Handler> {
    Arc::clone(&DOWNLOAD_HANDLER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{OwnRequest, Priority, Request, RequestOptions, RequestState};
    use std::time::Duration;

    fn request_on(
        handler: &Arc<Handler>,
        priority: Priority,
        log: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> Arc<OwnRequest> {
        OwnRequest::new(
            {
                let log = Arc::clone(log);
                move |_token| {
                    let log = Arc::clone(&log);
                    async move {
                        log.lock().unwrap().push(tag);
                        true
                    }
                }
            },
            RequestOptions {
                priority,
                handler: Some(Arc::clone(handler)),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_priority_ordering_with_single_worker() {
        let handler = Handler::new();
        handler.set_max_parallelism(Some(1));
        handler.pause();

        let log = Arc::new(Mutex::new(Vec::new()));
        let low = request_on(&handler, Priority::Low, &log, "low");
        let high = request_on(&handler, Priority::High, &log, "high");

        handler.resume();
        high.wait().await;
        low.wait().await;
        assert_eq!(*log.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_parallelism_limit_is_honored() {
        let handler = Handler::new();
        handler.set_max_parallelism(Some(2));

        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut requests = Vec::new();
        for _ in 0..6 {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            requests.push(OwnRequest::new(
                move |_token| {
                    let concurrent = Arc::clone(&concurrent);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        true
                    }
                },
                RequestOptions {
                    handler: Some(Arc::clone(&handler)),
                    ..Default::default()
                },
            ));
        }
        for request in &requests {
            request.wait().await;
        }
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "more running bodies than permits: {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_cancel_all_then_rearm() {
        let handler = Handler::new();
        handler.set_max_parallelism(Some(1));

        let request = OwnRequest::new(
            |token| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => true,
                    _ = token.cancelled() => false,
                }
            },
            RequestOptions {
                handler: Some(Arc::clone(&handler)),
                ..Default::default()
            },
        );

        // Let it start, then pull the plug.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.cancel_all();
        request.wait().await;
        assert_eq!(request.state(), RequestState::Cancelled);

        handler.create_new_cancellation_source();
        let revived = OwnRequest::new(
            |_token| async { true },
            RequestOptions {
                handler: Some(Arc::clone(&handler)),
                ..Default::default()
            },
        );
        revived.wait().await;
        assert_eq!(revived.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_pause_defers_queued_requests() {
        let handler = Handler::new();
        handler.pause();

        let log = Arc::new(Mutex::new(Vec::new()));
        let request = request_on(&handler, Priority::Normal, &log, "ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().unwrap().is_empty(), "paused handler must not run");
        assert_eq!(request.state(), RequestState::Available);

        handler.resume();
        request.wait().await;
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let handler = Handler::new();
        handler.set_max_parallelism(Some(3));
        let status = handler.status();
        assert_eq!(status.capacity, 3);
        assert_eq!(status.running, 0);
        assert!(!status.is_paused);
    }
}

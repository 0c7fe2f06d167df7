//! Request lifecycle
//!
//! Every unit of work the scheduler runs is a request with the state machine
//!
//! `OnHold → Waiting → Available → Running → {Completed, Failed, Cancelled}`
//!
//! Terminal states are absorbing. Only the scheduler moves a request from
//! `Available` to `Running`; only the worker executing it moves it out of
//! `Running`; the owner moves it between `OnHold` and the ready states.
//! A one-shot latch resolves on first entry into any terminal state, and the
//! notification callbacks fire at most once each.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::control::{link_token, Latch};
use crate::errors::EngineError;
use crate::handler::{main_handler, Handler};
use crate::http;

/// Default timeout applied to status probes.
const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Created but not handed to a scheduler.
    OnHold,
    /// Deploy delay running; becomes `Available` when it elapses.
    Waiting,
    /// Queued, waiting for a worker.
    Available,
    /// A worker is executing the request body.
    Running,
    /// Finished successfully.
    Completed,
    /// Retry budget exhausted.
    Failed,
    /// A cancellation token fired.
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

/// Priority level mapped onto the scheduler channel (0 = High … 2 = Low).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub(crate) fn level(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

pub type StartedCallback = Box<dyn FnOnce() + Send>;
pub type CompletedCallback<T> = Box<dyn FnOnce(T) + Send>;
pub type FailedCallback = Box<dyn FnOnce(Option<Response>) + Send>;
pub type CancelledCallback = Box<dyn FnOnce() + Send>;

/// Per-request configuration. `T` is the success payload handed to
/// `on_completed`.
pub struct RequestOptions<T> {
    pub priority: Priority,
    /// Enqueue immediately on construction.
    pub auto_start: bool,
    /// Delay applied on each `start` before the request becomes available.
    pub deploy_delay: Option<Duration>,
    /// Maximum worker invocations before the request fails.
    pub try_counter: u32,
    /// Back-off between retry attempts.
    pub delay_between_attempts: Option<Duration>,
    /// External cancellation source linked with the scheduler's.
    pub cancel_token: Option<CancellationToken>,
    /// Scheduler override; defaults to the shared main handler (or the
    /// download handler for `LoadRequest`).
    pub handler: Option<Arc<Handler>>,
    pub on_started: Option<StartedCallback>,
    pub on_completed: Option<CompletedCallback<T>>,
    pub on_failed: Option<FailedCallback>,
    pub on_cancelled: Option<CancelledCallback>,
}

impl<T> Default for RequestOptions<T> {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            auto_start: true,
            deploy_delay: None,
            try_counter: 3,
            delay_between_attempts: None,
            cancel_token: None,
            handler: None,
            on_started: None,
            on_completed: None,
            on_failed: None,
            on_cancelled: None,
        }
    }
}

/// The four notification slots, emptied as they fire so each runs at most
/// once.
pub(crate) struct CallbackSet<T> {
    pub on_started: Option<StartedCallback>,
    pub on_completed: Option<CompletedCallback<T>>,
    pub on_failed: Option<FailedCallback>,
    pub on_cancelled: Option<CancelledCallback>,
}

/// State shared by every request variant.
pub(crate) struct RequestCore {
    state: Mutex<RequestState>,
    priority: Priority,
    deploy_delay: Option<Duration>,
    try_counter: u32,
    delay_between_attempts: Option<Duration>,
    handler: Arc<Handler>,
    external_token: Option<CancellationToken>,
    token: Mutex<CancellationToken>,
    attempts: AtomicU32,
    finished: Arc<Latch>,
    /// Back-reference set right after construction; lets `&self` methods
    /// reach the owning `Arc` for enqueueing.
    self_ref: Mutex<Option<Weak<dyn Runnable>>>,
}

impl RequestCore {
    pub(crate) fn new<T>(
        options: &mut RequestOptions<T>,
        handler: Arc<Handler>,
    ) -> (Self, CallbackSet<T>) {
        let finished = Arc::new(Latch::new());
        let external = options.cancel_token.take();
        let token = match &external {
            Some(ext) => link_token(&handler.cancel_token(), ext, Arc::clone(&finished)),
            None => handler.cancel_token().child_token(),
        };
        let callbacks = CallbackSet {
            on_started: options.on_started.take(),
            on_completed: options.on_completed.take(),
            on_failed: options.on_failed.take(),
            on_cancelled: options.on_cancelled.take(),
        };
        let core = Self {
            state: Mutex::new(RequestState::OnHold),
            priority: options.priority,
            deploy_delay: options.deploy_delay,
            try_counter: options.try_counter.max(1),
            delay_between_attempts: options.delay_between_attempts,
            handler,
            external_token: external,
            token: Mutex::new(token),
            attempts: AtomicU32::new(0),
            finished,
            self_ref: Mutex::new(None),
        };
        (core, callbacks)
    }

    pub(crate) fn set_self(&self, this: Weak<dyn Runnable>) {
        *self.self_ref.lock().unwrap() = Some(this.clone());
        // A user-supplied token must deliver `on_cancelled` even while the
        // request sits idle between state transitions.
        if let Some(external) = self.external_token.clone() {
            let finished = self.finished();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => {
                        if let Some(request) = this.upgrade() {
                            let core = request.core();
                            core.cancel_token_now();
                            if core.state() != RequestState::Running
                                && core.to_terminal(RequestState::Cancelled)
                            {
                                request.notify_cancelled();
                            }
                        }
                    }
                    _ = finished.wait() => {}
                }
            });
        }
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<dyn Runnable>> {
        self.self_ref.lock().unwrap().as_ref()?.upgrade()
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Burns the remaining retry budget; the next failure is terminal. Used
    /// for validation errors discovered mid-run.
    pub(crate) fn exhaust_attempts(&self) {
        self.attempts.store(self.try_counter, Ordering::SeqCst);
    }

    pub(crate) fn finished(&self) -> Arc<Latch> {
        Arc::clone(&self.finished)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.lock().unwrap().clone()
    }

    pub(crate) fn cancel_token_now(&self) {
        self.token.lock().unwrap().cancel();
    }

    pub(crate) fn try_transition(&self, from: RequestState, to: RequestState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Moves into a terminal state unless one was already reached. Returns
    /// `true` only for the transition that actually happened, so callbacks
    /// fire exactly once.
    pub(crate) fn to_terminal(&self, to: RequestState) -> bool {
        debug_assert!(to.is_terminal());
        {
            let mut state = self.state.lock().unwrap();
            if state.is_terminal() {
                return false;
            }
            *state = to;
        }
        self.finished.open();
        true
    }

    /// Moves any non-terminal, non-running state back to `OnHold`.
    pub(crate) fn hold(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if matches!(
            *state,
            RequestState::Waiting | RequestState::Available | RequestState::Running
        ) {
            *state = RequestState::OnHold;
            true
        } else {
            false
        }
    }

    /// Rebuilds the linked cancellation source after a cancelled token was
    /// observed on a request that never reached a terminal state.
    pub(crate) fn relink(&self) {
        let mut token = self.token.lock().unwrap();
        if !token.is_cancelled() {
            return;
        }
        *token = match &self.external_token {
            Some(ext) => link_token(&self.handler.cancel_token(), ext, self.finished()),
            None => self.handler.cancel_token().child_token(),
        };
    }
}

/// Result of one worker invocation of a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    /// Counts against the retry budget.
    Failed,
    /// Internal re-run (range fallback, offset re-resolution); not charged.
    Retry,
    /// The owner paused the request mid-run.
    Paused,
    Cancelled,
}

/// What the scheduler worker should do after `dispatch` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Done,
    Requeue { delay: Option<Duration> },
    Skipped,
}

/// Internal contract every request variant implements.
#[async_trait]
pub(crate) trait Runnable: Send + Sync {
    fn core(&self) -> &RequestCore;

    /// Executes one attempt of the request body.
    async fn run(self: Arc<Self>) -> RunOutcome;

    fn notify_started(&self) {}
    fn notify_completed(&self) {}
    fn notify_failed(&self) {}
    fn notify_cancelled(&self) {}

    /// Latch the public `wait` suspends on. Chunked downloads point this at
    /// the coordinator's merge latch.
    fn wait_latch(&self) -> Arc<Latch> {
        self.core().finished()
    }

    /// Family members an owner action fans out to (chunk siblings).
    fn siblings(&self) -> Vec<Arc<dyn Runnable>> {
        Vec::new()
    }
}

/// Owner-facing surface shared by all request variants.
#[async_trait]
pub trait Request: Send + Sync {
    fn state(&self) -> RequestState;
    fn priority(&self) -> Priority;
    /// Failed attempts so far.
    fn attempts(&self) -> u32;
    /// Enqueues the request. Valid only from `OnHold`; a no-op otherwise.
    fn start(&self);
    /// Takes the request (and any chunk siblings) off the scheduler at the
    /// next cooperative checkpoint. `start` resumes it.
    fn pause(&self);
    /// Cancels the request; `on_cancelled` fires exactly once.
    fn cancel(&self);
    /// Resolves once a terminal state is reached (for chunked downloads:
    /// once the merge finished or the download died).
    async fn wait(&self);
}

#[async_trait]
impl<R> Request for R
where
    R: Runnable + Sized + 'static,
{
    fn state(&self) -> RequestState {
        self.core().state()
    }

    fn priority(&self) -> Priority {
        self.core().priority()
    }

    fn attempts(&self) -> u32 {
        self.core().attempts()
    }

    fn start(&self) {
        let Some(this) = self.core().self_arc() else {
            return;
        };
        for sibling in this.siblings() {
            start_request(sibling);
        }
        start_request(this);
    }

    fn pause(&self) {
        pause_request(self);
        for sibling in self.siblings() {
            pause_request(sibling.as_ref());
        }
    }

    fn cancel(&self) {
        cancel_request(self);
        for sibling in self.siblings() {
            cancel_request(sibling.as_ref());
        }
    }

    async fn wait(&self) {
        self.wait_latch().wait().await;
    }
}

/// Deploys a request: applies the deploy delay, transitions to `Available`
/// and enqueues it on its handler.
pub(crate) fn start_request(request: Arc<dyn Runnable>) {
    let deploy_delay = {
        let core = request.core();
        if core.state() != RequestState::OnHold {
            return;
        }
        core.relink();
        core.deploy_delay
    };

    match deploy_delay {
        Some(delay) => {
            if !request
                .core()
                .try_transition(RequestState::OnHold, RequestState::Waiting)
            {
                return;
            }
            tokio::spawn(async move {
                let token = request.core().token();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let core = request.core();
                        if core.try_transition(RequestState::Waiting, RequestState::Available) {
                            core.handler().enqueue(Arc::clone(&request));
                        }
                    }
                    _ = token.cancelled() => {
                        if request.core().to_terminal(RequestState::Cancelled) {
                            request.notify_cancelled();
                        }
                    }
                }
            });
        }
        None => {
            if request
                .core()
                .try_transition(RequestState::OnHold, RequestState::Available)
            {
                request.core().handler().enqueue(Arc::clone(&request));
            }
        }
    }
}

pub(crate) fn pause_request(request: &dyn Runnable) {
    request.core().hold();
}

pub(crate) fn cancel_request(request: &dyn Runnable) {
    let core = request.core();
    core.cancel_token_now();
    // A running body observes the token itself; everything else is
    // terminalized here so `on_cancelled` is delivered even while the
    // request sits in a queue.
    if core.state() != RequestState::Running && core.to_terminal(RequestState::Cancelled) {
        request.notify_cancelled();
    }
}

/// One worker invocation: `Available → Running`, execute, then settle the
/// next state per the scheduler failure policy.
pub(crate) async fn dispatch(request: Arc<dyn Runnable>) -> Dispatched {
    let core = request.core();
    if !core.try_transition(RequestState::Available, RequestState::Running) {
        return Dispatched::Skipped;
    }
    // A queued request that survived a global cancel relinks against the
    // handler's fresh source here.
    core.relink();
    request.notify_started();

    let token = core.token();
    let outcome = tokio::select! {
        _ = token.cancelled() => RunOutcome::Cancelled,
        outcome = Arc::clone(&request).run() => outcome,
    };

    match outcome {
        RunOutcome::Completed => {
            if core.to_terminal(RequestState::Completed) {
                request.notify_completed();
            }
            Dispatched::Done
        }
        RunOutcome::Cancelled => {
            if core.to_terminal(RequestState::Cancelled) {
                request.notify_cancelled();
            }
            Dispatched::Done
        }
        RunOutcome::Paused => Dispatched::Done,
        RunOutcome::Retry => {
            if core.try_transition(RequestState::Running, RequestState::Available) {
                Dispatched::Requeue { delay: None }
            } else {
                Dispatched::Done
            }
        }
        RunOutcome::Failed => {
            if token.is_cancelled() {
                if core.to_terminal(RequestState::Cancelled) {
                    request.notify_cancelled();
                }
                return Dispatched::Done;
            }
            let attempts = core.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts < core.try_counter
                && core.try_transition(RequestState::Running, RequestState::Available)
            {
                Dispatched::Requeue {
                    delay: core.delay_between_attempts,
                }
            } else {
                if core.to_terminal(RequestState::Failed) {
                    request.notify_failed();
                }
                Dispatched::Done
            }
        }
    }
}

/// Probes a URL with a HEAD request; succeeds iff the server answers 2xx.
pub struct StatusRequest {
    core: RequestCore,
    url: String,
    timeout: Duration,
    headers: HeaderMap,
    callbacks: Mutex<CallbackSet<Response>>,
    last_response: Mutex<Option<Response>>,
}

impl StatusRequest {
    pub fn new(
        url: impl Into<String>,
        options: RequestOptions<Response>,
    ) -> Result<Arc<Self>, EngineError> {
        Self::with_timeout(url, DEFAULT_STATUS_TIMEOUT, options)
    }

    /// Same as [`StatusRequest::new`] with the default 10 s probe timeout
    /// overridden.
    pub fn with_timeout(
        url: impl Into<String>,
        timeout: Duration,
        mut options: RequestOptions<Response>,
    ) -> Result<Arc<Self>, EngineError> {
        let url = validate_url(url.into())?;
        let handler = options.handler.take().unwrap_or_else(main_handler);
        let auto_start = options.auto_start;
        let (core, callbacks) = RequestCore::new(&mut options, handler);

        let request = Arc::new(Self {
            core,
            url,
            timeout,
            headers: HeaderMap::new(),
            callbacks: Mutex::new(callbacks),
            last_response: Mutex::new(None),
        });
        let this: Arc<dyn Runnable> = request.clone();
        request.core.set_self(Arc::downgrade(&this));
        if auto_start {
            request.start();
        }
        Ok(request)
    }

    /// The probed URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The most recent response, consumable once.
    pub fn take_response(&self) -> Option<Response> {
        self.last_response.lock().unwrap().take()
    }
}

#[async_trait]
impl Runnable for StatusRequest {
    fn core(&self) -> &RequestCore {
        &self.core
    }

    async fn run(self: Arc<Self>) -> RunOutcome {
        let token = self.core.token();
        match http::head(
            &self.url,
            http::DEFAULT_USER_AGENT,
            &self.headers,
            Some(self.timeout),
            &token,
        )
        .await
        {
            Ok(response) => {
                let success = response.status().is_success();
                *self.last_response.lock().unwrap() = Some(response);
                if success {
                    RunOutcome::Completed
                } else {
                    RunOutcome::Failed
                }
            }
            Err(EngineError::Cancelled) => RunOutcome::Cancelled,
            Err(error) => {
                tracing::debug!(url = %self.url, error = %error, "status probe failed");
                RunOutcome::Failed
            }
        }
    }

    fn notify_started(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_started.take() {
            cb();
        }
    }

    fn notify_completed(&self) {
        let cb = self.callbacks.lock().unwrap().on_completed.take();
        if let Some(cb) = cb {
            if let Some(response) = self.last_response.lock().unwrap().take() {
                cb(response);
            }
        }
    }

    fn notify_failed(&self) {
        let cb = self.callbacks.lock().unwrap().on_failed.take();
        if let Some(cb) = cb {
            cb(self.last_response.lock().unwrap().take());
        }
    }

    fn notify_cancelled(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_cancelled.take() {
            cb();
        }
    }
}

type OwnJob = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wraps a caller-supplied async function as a schedulable request. The
/// function receives the request's linked cancellation token and reports
/// success with its boolean return.
pub struct OwnRequest {
    core: RequestCore,
    job: OwnJob,
    callbacks: Mutex<CallbackSet<bool>>,
}

impl OwnRequest {
    pub fn new<F, Fut>(job: F, mut options: RequestOptions<bool>) -> Arc<Self>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handler = options.handler.take().unwrap_or_else(main_handler);
        let auto_start = options.auto_start;
        let (core, callbacks) = RequestCore::new(&mut options, handler);

        let request = Arc::new(Self {
            core,
            job: Box::new(move |token| Box::pin(job(token))),
            callbacks: Mutex::new(callbacks),
        });
        let this: Arc<dyn Runnable> = request.clone();
        request.core.set_self(Arc::downgrade(&this));
        if auto_start {
            request.start();
        }
        request
    }
}

#[async_trait]
impl Runnable for OwnRequest {
    fn core(&self) -> &RequestCore {
        &self.core
    }

    async fn run(self: Arc<Self>) -> RunOutcome {
        if (self.job)(self.core.token()).await {
            RunOutcome::Completed
        } else {
            RunOutcome::Failed
        }
    }

    fn notify_started(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_started.take() {
            cb();
        }
    }

    fn notify_completed(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_completed.take() {
            cb(true);
        }
    }

    fn notify_failed(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_failed.take() {
            cb(None);
        }
    }

    fn notify_cancelled(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_cancelled.take() {
            cb();
        }
    }
}

pub(crate) fn validate_url(url: String) -> Result<String, EngineError> {
    if url.trim().is_empty() {
        return Err(EngineError::Validation("url must not be empty".into()));
    }
    url::Url::parse(&url)
        .map_err(|e| EngineError::Validation(format!("invalid url {:?}: {}", url, e)))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn on_hold<T>() -> RequestOptions<T> {
        RequestOptions {
            auto_start: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_own_request_completes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let request = OwnRequest::new(
            {
                let hits = Arc::clone(&hits);
                move |_token| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        true
                    }
                }
            },
            RequestOptions {
                on_completed: Some(Box::new({
                    let seen = Arc::clone(&seen);
                    move |ok| {
                        assert!(ok);
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                ..Default::default()
            },
        );

        request.wait().await;
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_counts_invocations() {
        let hits = Arc::new(AtomicUsize::new(0));
        let request = OwnRequest::new(
            {
                let hits = Arc::clone(&hits);
                move |_token| {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { n >= 3 }
                }
            },
            RequestOptions {
                try_counter: 3,
                ..Default::default()
            },
        );

        request.wait().await;
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(hits.load(Ordering::SeqCst), 3, "fail, fail, succeed");
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_once() {
        let failures = Arc::new(AtomicUsize::new(0));
        let request = OwnRequest::new(
            |_token| async { false },
            RequestOptions {
                try_counter: 2,
                on_failed: Some(Box::new({
                    let failures = Arc::clone(&failures);
                    move |_| {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                ..Default::default()
            },
        );

        request.wait().await;
        assert_eq!(request.state(), RequestState::Failed);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_start_is_noop() {
        let request = OwnRequest::new(|_token| async { true }, on_hold());
        request.cancel();
        assert_eq!(request.state(), RequestState::Cancelled);

        request.start();
        assert_eq!(request.state(), RequestState::Cancelled);
        request.wait().await;
    }

    #[tokio::test]
    async fn test_cancelled_callback_fires_once() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let request = OwnRequest::new(
            |_token| async { true },
            RequestOptions {
                auto_start: false,
                on_cancelled: Some(Box::new({
                    let cancels = Arc::clone(&cancels);
                    move || {
                        cancels.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                ..Default::default()
            },
        );

        request.cancel();
        request.cancel();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_token_cancels_idle_request() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let external = CancellationToken::new();
        let request = OwnRequest::new(
            |_token| async { true },
            RequestOptions {
                auto_start: false,
                cancel_token: Some(external.clone()),
                on_cancelled: Some(Box::new({
                    let cancels = Arc::clone(&cancels);
                    move || {
                        cancels.fetch_add(1, Ordering::SeqCst);
                    }
                })),
                ..Default::default()
            },
        );

        // No worker ever touched the request; the external token alone must
        // terminalize it and deliver the callback.
        external.cancel();
        tokio::time::timeout(Duration::from_secs(1), request.wait())
            .await
            .unwrap();
        assert_eq!(request.state(), RequestState::Cancelled);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(request.core().token().is_cancelled());
    }

    #[tokio::test]
    async fn test_deploy_delay_goes_through_waiting() {
        let request = OwnRequest::new(
            |_token| async { true },
            RequestOptions {
                deploy_delay: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        assert_eq!(request.state(), RequestState::Waiting);
        request.wait().await;
        assert_eq!(request.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_status_request_rejects_bad_url() {
        assert!(StatusRequest::new("", on_hold()).is_err());
        assert!(StatusRequest::new("not a url", on_hold()).is_err());
    }
}

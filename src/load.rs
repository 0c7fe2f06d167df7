//! File download requests
//!
//! `LoadRequest` drives the full download pipeline:
//!
//! probe length → (optional chunk split) → ranged GET → streamed writes into
//! a temporary part file → merge → atomic rename.
//!
//! Key behaviors:
//! - Resumable: in `Append` mode the on-disk part file is the authoritative
//!   byte count, across pauses and across process restarts
//! - Chunked: N sibling requests share one `ChunkCoordinator`, each fetching
//!   a deterministic byte range into `<name>_<i>.chunk`
//! - Range fallback: a 200 (or 416) answer to a chunked range GET cancels the
//!   siblings and recycles the family into a single-stream download
//! - Filename negotiation: user name, then Content-Disposition, then the URL,
//!   with MIME-derived extensions and `name(i).ext` collision handling

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::OnceCell;

use crate::chunk::ChunkCoordinator;
use crate::control::Latch;
use crate::errors::EngineError;
use crate::fsutil;
use crate::handler::download_handler;
use crate::http;
use crate::request::{
    cancel_request, validate_url, CallbackSet, Request, RequestCore, RequestOptions, RequestState,
    RunOutcome, Runnable,
};

/// User-visible progress reporter. Receives values in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Fallback filename when neither the headers nor the URL suggest one.
const FALLBACK_FILE_NAME: &str = "requested_download";

/// Buffer in front of the part file.
const WRITE_BUFFER: usize = 64 * 1024;

/// How the destination file is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Truncate any existing destination and part file.
    Overwrite,
    /// Never touch existing files; pick `name(i).ext` instead.
    Create,
    /// Resume into an existing part file; the bytes on disk are authoritative.
    #[default]
    Append,
}

/// Optional byte range of the remote file to fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadRange {
    /// First byte, inclusive.
    pub start: Option<u64>,
    /// Last byte, inclusive.
    pub end: Option<u64>,
}

impl LoadRange {
    pub fn new(start: Option<u64>, end: Option<u64>) -> Self {
        Self { start, end }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(EngineError::Validation(format!(
                    "range start {} must lie before end {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    /// Drops an `end` the server's length makes unsatisfiable.
    fn clamped(mut self, total: Option<u64>) -> Self {
        if let (Some(total), Some(end)) = (total, self.end) {
            if end >= total {
                self.end = None;
            }
        }
        self
    }

    /// Canonical effective length: only `start` set ⇒ `total - start`; only
    /// `end` set ⇒ `end + 1`; both ⇒ `end - start + 1`.
    fn effective_length(&self, total: Option<u64>) -> Option<u64> {
        match (self.start, self.end) {
            (start, Some(end)) => Some(end + 1 - start.unwrap_or(0)),
            (start, None) => total.map(|t| t.saturating_sub(start.unwrap_or(0))),
        }
    }
}

/// Configuration for a [`LoadRequest`].
pub struct LoadOptions {
    /// Generic request options; `on_completed` receives the final path.
    pub base: RequestOptions<PathBuf>,
    pub mode: WriteMode,
    /// Fixed filename; server and URL suggestions are ignored when set.
    pub file_name: Option<String>,
    /// Defaults to the platform download folder.
    pub destination_path: Option<PathBuf>,
    /// Directory for part files; defaults to the destination.
    pub temporary_path: Option<PathBuf>,
    /// Extensions (with or without leading dot) that hard-reject a download.
    pub excluded_extensions: Vec<String>,
    pub progress: Option<ProgressFn>,
    /// Per-send timeout.
    pub timeout: Option<Duration>,
    pub range: LoadRange,
    /// `0` or `1` downloads in one stream; `>= 2` splits into that many
    /// ranged sibling requests.
    pub chunks: usize,
    /// Merge finished chunks into the head file as soon as they complete
    /// instead of waiting for the last one.
    pub merge_while_progress: bool,
    /// Extra request headers merged into every send.
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            base: RequestOptions::default(),
            mode: WriteMode::default(),
            file_name: None,
            destination_path: None,
            temporary_path: None,
            excluded_extensions: Vec::new(),
            progress: None,
            timeout: None,
            range: LoadRange::default(),
            chunks: 0,
            merge_while_progress: false,
            headers: HeaderMap::new(),
            user_agent: None,
        }
    }
}

struct NameState {
    current: String,
    /// Response-based resolution and mode application happened.
    resolved: bool,
    user_named: bool,
}

/// A resumable, optionally chunked file download.
pub struct LoadRequest {
    core: RequestCore,
    url: String,
    mode: Mutex<WriteMode>,
    requested_range: LoadRange,
    destination_dir: PathBuf,
    temp_dir: PathBuf,
    excluded_extensions: Vec<String>,
    timeout: Option<Duration>,
    headers: HeaderMap,
    user_agent: String,
    name: Mutex<NameState>,
    bytes_written: AtomicU64,
    /// Memoized probe result for single-stream requests; chunked families
    /// share the coordinator's cell instead.
    content_length: OnceCell<Option<u64>>,
    progress: Mutex<Option<ProgressFn>>,
    callbacks: Mutex<CallbackSet<PathBuf>>,
    final_path: Mutex<Option<PathBuf>>,
    last_response: Mutex<Option<Response>>,
    coordinator: Mutex<Option<Arc<ChunkCoordinator>>>,
    chunk_index: usize,
    /// Whole-family completion latch held by the chunked root; `wait` on the
    /// root resolves on merge completion, not on its own chunk.
    family_latch: Option<Arc<Latch>>,
    /// Strong handles the root keeps on its chunk siblings.
    retained: Mutex<Vec<Arc<LoadRequest>>>,
}

impl LoadRequest {
    /// Validates the options, prepares directories and part files, spawns
    /// chunk siblings when requested, and auto-starts if configured.
    pub fn new(url: impl Into<String>, mut options: LoadOptions) -> Result<Arc<Self>, EngineError> {
        let url = validate_url(url.into())?;
        options.range.validate()?;

        let mut mode = options.mode;
        // A ranged download can never append meaningfully.
        if mode == WriteMode::Append && options.range.start.is_some() {
            mode = WriteMode::Create;
        }

        let destination_dir = options
            .destination_path
            .take()
            .or_else(fsutil::download_folder)
            .unwrap_or_else(std::env::temp_dir);
        let temp_dir = options
            .temporary_path
            .take()
            .unwrap_or_else(|| destination_dir.clone());
        std::fs::create_dir_all(&destination_dir)?;
        std::fs::create_dir_all(&temp_dir)?;

        let excluded_extensions: Vec<String> = options
            .excluded_extensions
            .iter()
            .map(|e| format!(".{}", e.trim_start_matches('.')))
            .collect();

        let (initial_name, user_named) = match options.file_name.take() {
            Some(name) => (fsutil::remove_invalid_chars(&name), true),
            None => (guess_name_from_url(&url), false),
        };
        reject_excluded(&initial_name, &excluded_extensions)?;

        let chunks = options.chunks;
        let handler = options
            .base
            .handler
            .take()
            .unwrap_or_else(download_handler);
        let auto_start = options.base.auto_start;
        let user_agent = options
            .user_agent
            .take()
            .unwrap_or_else(|| http::DEFAULT_USER_AGENT.to_string());

        if chunks >= 2 {
            let coordinator = ChunkCoordinator::new(
                chunks,
                options.merge_while_progress,
                options.progress.take(),
                options.base.on_completed.take(),
            );
            let root_callbacks = CallbackSet {
                on_started: options.base.on_started.take(),
                // Captured by the coordinator; fired by the merging sibling.
                on_completed: None,
                on_failed: options.base.on_failed.take(),
                on_cancelled: options.base.on_cancelled.take(),
            };

            let root = Self::build(
                &url,
                &options,
                root_callbacks,
                None,
                mode,
                &destination_dir,
                &temp_dir,
                &excluded_extensions,
                &initial_name,
                user_named,
                &user_agent,
                Arc::clone(&handler),
                Some(Arc::clone(&coordinator)),
                0,
            );
            let mut family = vec![Arc::downgrade(&root)];
            for index in 1..chunks {
                let sibling = Self::build(
                    &url,
                    &options,
                    CallbackSet {
                        on_started: None,
                        on_completed: None,
                        on_failed: None,
                        on_cancelled: None,
                    },
                    None,
                    mode,
                    &destination_dir,
                    &temp_dir,
                    &excluded_extensions,
                    &initial_name,
                    user_named,
                    &user_agent,
                    Arc::clone(&handler),
                    Some(Arc::clone(&coordinator)),
                    index,
                );
                family.push(Arc::downgrade(&sibling));
                // The coordinator only holds weak handles; the root keeps its
                // siblings alive for as long as it lives itself.
                root.retained.lock().unwrap().push(sibling);
            }
            coordinator.set_siblings(family);

            if auto_start {
                root.start();
            }
            return Ok(root);
        }

        let callbacks = CallbackSet {
            on_started: options.base.on_started.take(),
            on_completed: options.base.on_completed.take(),
            on_failed: options.base.on_failed.take(),
            on_cancelled: options.base.on_cancelled.take(),
        };
        let progress = options.progress.take();
        let request = Self::build(
            &url,
            &options,
            callbacks,
            progress,
            mode,
            &destination_dir,
            &temp_dir,
            &excluded_extensions,
            &initial_name,
            user_named,
            &user_agent,
            handler,
            None,
            0,
        );

        // Adopt pre-existing files for resumption.
        if mode == WriteMode::Append {
            let part = request.part_path();
            let destination = destination_dir.join(&initial_name);
            if !part.exists() && destination.exists() {
                std::fs::rename(&destination, &part)?;
            }
            request
                .bytes_written
                .store(fsutil::file_len(&part), Ordering::SeqCst);
        }

        if auto_start {
            request.start();
        }
        Ok(request)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        url: &str,
        options: &LoadOptions,
        callbacks: CallbackSet<PathBuf>,
        progress: Option<ProgressFn>,
        mode: WriteMode,
        destination_dir: &Path,
        temp_dir: &Path,
        excluded_extensions: &[String],
        initial_name: &str,
        user_named: bool,
        user_agent: &str,
        handler: Arc<crate::handler::Handler>,
        coordinator: Option<Arc<ChunkCoordinator>>,
        chunk_index: usize,
    ) -> Arc<Self> {
        // Scheduling-only copy; the notification callbacks arrive separately.
        let mut base: RequestOptions<PathBuf> = RequestOptions {
            priority: options.base.priority,
            auto_start: false,
            deploy_delay: options.base.deploy_delay,
            try_counter: options.base.try_counter,
            delay_between_attempts: options.base.delay_between_attempts,
            cancel_token: options.base.cancel_token.clone(),
            ..Default::default()
        };
        let (core, _) = RequestCore::new(&mut base, handler);
        let family_latch = coordinator
            .as_ref()
            .filter(|_| chunk_index == 0)
            .map(|c| c.merge_latch());

        let request = Arc::new(Self {
            core,
            url: url.to_string(),
            mode: Mutex::new(mode),
            requested_range: options.range,
            destination_dir: destination_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            excluded_extensions: excluded_extensions.to_vec(),
            timeout: options.timeout,
            headers: options.headers.clone(),
            user_agent: user_agent.to_string(),
            name: Mutex::new(NameState {
                current: initial_name.to_string(),
                resolved: false,
                user_named,
            }),
            bytes_written: AtomicU64::new(0),
            content_length: OnceCell::new(),
            progress: Mutex::new(progress),
            callbacks: Mutex::new(callbacks),
            final_path: Mutex::new(None),
            last_response: Mutex::new(None),
            coordinator: Mutex::new(coordinator),
            chunk_index,
            family_latch,
            retained: Mutex::new(Vec::new()),
        });
        let this: Arc<dyn Runnable> = request.clone();
        request.core.set_self(Arc::downgrade(&this));
        request
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current (possibly still unresolved) filename.
    pub fn file_name(&self) -> String {
        self.name.lock().unwrap().current.clone()
    }

    /// Final destination path, available once the download completed.
    pub fn destination(&self) -> Option<PathBuf> {
        self.final_path.lock().unwrap().clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    fn coordinator(&self) -> Option<Arc<ChunkCoordinator>> {
        self.coordinator.lock().unwrap().clone()
    }

    fn part_path(&self) -> PathBuf {
        let name = self.file_name();
        match self.coordinator() {
            Some(_) => self.temp_dir.join(fsutil::chunk_name(&name, self.chunk_index)),
            None => self.temp_dir.join(fsutil::part_name(&name)),
        }
    }

    /// Memoized HEAD probe. Probe failures degrade to an unknown length; only
    /// cancellation aborts.
    async fn probe_total(&self) -> Result<Option<u64>, EngineError> {
        let token = self.core.token();
        let init = || async {
            match http::probe(
                &self.url,
                &self.user_agent,
                &self.headers,
                self.timeout,
                &token,
            )
            .await
            {
                Ok(probe) => Ok(probe.content_length),
                Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
                Err(error) => {
                    tracing::debug!(url = %self.url, error = %error, "length probe failed");
                    Ok(None)
                }
            }
        };
        match self.coordinator() {
            Some(coord) => coord
                .content_length_cell()
                .get_or_try_init(init)
                .await
                .copied(),
            None => self.content_length.get_or_try_init(init).await.copied(),
        }
    }

    /// Byte range this request is responsible for: the user range for a
    /// single stream, a deterministic slice of it for chunk `i`.
    fn assigned_range(&self, total: Option<u64>) -> (u64, Option<u64>, Option<u64>) {
        let range = self.requested_range.clamped(total);
        let base_start = range.start.unwrap_or(0);
        let length = range.effective_length(total);

        match self.coordinator() {
            // Caller guarantees a known length before splitting.
            Some(coord) => match chunk_bounds(
                self.chunk_index,
                coord.chunk_count(),
                base_start,
                length.unwrap_or(0),
            ) {
                Some((start, end)) => (start, Some(end), Some(end + 1 - start)),
                None => (base_start, None, Some(0)),
            },
            None => (base_start, range.end, length),
        }
    }

    /// Resolves the final filename from the response and applies the write
    /// mode. Returns `true` when the on-disk offset no longer matches the
    /// byte the server was asked to start at, forcing a re-request.
    fn resolve_file_name(
        &self,
        response: &Response,
        total: Option<u64>,
    ) -> Result<bool, EngineError> {
        if self.name.lock().unwrap().resolved {
            // Already negotiated in an earlier attempt.
            return Ok(false);
        }

        let name = match self.coordinator() {
            // One sibling computes, picking a collision-free name; the rest
            // adopt it verbatim so every part file agrees.
            Some(coord) => coord
                .file_name_cell()
                .get_or_init(|| self.pick_name(response))
                .clone(),
            None => self.pick_name(response),
        };

        {
            let mut state = self.name.lock().unwrap();
            state.current = name;
            state.resolved = true;
        }
        reject_excluded(&self.file_name(), &self.excluded_extensions).map_err(|e| {
            self.core.exhaust_attempts();
            e
        })?;
        // Every sibling applies the mode to its own part file; stale bytes
        // from an earlier run must not survive under the negotiated name.
        self.apply_mode(total)
    }

    /// Computes the resolved name, including the `Create`-mode `name(i).ext`
    /// dance against existing files.
    fn pick_name(&self, response: &Response) -> String {
        let mut name = self.compute_name(response);
        if *self.mode.lock().unwrap() == WriteMode::Create {
            name = fsutil::free_file_name(&self.destination_dir, &self.temp_dir, &name);
        }
        name
    }

    /// Filename preference order: user name, Content-Disposition, last URL
    /// segment, fallback constant; extension derived from the MIME type or
    /// the URL when missing.
    fn compute_name(&self, response: &Response) -> String {
        let state = self.name.lock().unwrap();
        if state.user_named {
            return state.current.clone();
        }
        drop(state);

        let mut name = http::filename_from_headers(response.headers())
            .or_else(|| guess_segment_from_url(&self.url))
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

        if !name.contains('.') {
            let from_mime = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
                .and_then(|ct| fsutil::extension_for_mime(&ct));
            let extension = from_mime
                .map(|e| e.to_string())
                .or_else(|| url_extension(&self.url));
            if let Some(ext) = extension {
                name = format!("{}.{}", name, ext);
            }
        }

        fsutil::remove_invalid_chars(&name)
    }

    fn apply_mode(&self, total: Option<u64>) -> Result<bool, EngineError> {
        let mode = *self.mode.lock().unwrap();
        let assumed = self.bytes_written.load(Ordering::SeqCst);
        match mode {
            WriteMode::Overwrite => {
                // The destination is shared family state; only the root (or a
                // single-stream request) truncates it.
                if self.chunk_index == 0 {
                    let destination = self.destination_dir.join(self.file_name());
                    if destination.exists() {
                        std::fs::remove_file(&destination)?;
                    }
                }
                let part = self.part_path();
                if part.exists() {
                    std::fs::remove_file(&part)?;
                }
                self.bytes_written.store(0, Ordering::SeqCst);
                Ok(assumed != 0)
            }
            WriteMode::Create => {
                // Naming already went through `pick_name`; a fresh name means
                // a fresh part file.
                self.bytes_written.store(0, Ordering::SeqCst);
                Ok(assumed != 0)
            }
            WriteMode::Append => {
                let on_disk = fsutil::file_len(&self.part_path());
                if let Some(total) = total {
                    if on_disk > total {
                        if self.coordinator().is_some() {
                            self.core.exhaust_attempts();
                            return Err(EngineError::Validation(format!(
                                "part file holds {} bytes but the server reports {}",
                                on_disk, total
                            )));
                        }
                        std::fs::remove_file(self.part_path()).ok();
                        self.bytes_written.store(0, Ordering::SeqCst);
                        return Ok(assumed != 0);
                    }
                }
                self.bytes_written.store(on_disk, Ordering::SeqCst);
                Ok(on_disk != assumed)
            }
        }
    }

    /// Server answered a chunked range GET with something other than 206:
    /// elect a winner, cancel the other siblings, restore the root's
    /// callbacks and dissolve its coordinator so it re-runs (or, for the
    /// root itself, keeps streaming the full-body response).
    fn trigger_fallback(&self, coord: &Arc<ChunkCoordinator>) {
        if coord.begin_fallback() {
            tracing::info!(
                url = %self.url,
                "server ignored the range request, collapsing to a single stream"
            );
            for sibling in coord.siblings_except(0) {
                cancel_request(sibling.as_ref());
            }
            if let Some(root) = coord.root() {
                *root.progress.lock().unwrap() = coord.take_progress();
                root.callbacks.lock().unwrap().on_completed = coord.take_on_completed();
                *root.coordinator.lock().unwrap() = None;
            }
        }
    }

    async fn stream_body(
        &self,
        response: Response,
        expected_len: Option<u64>,
    ) -> Result<RunOutcome, EngineError> {
        let token = self.core.token();
        let part = self.part_path();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part)
            .await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        let mut stream = response.bytes_stream();

        let started = Instant::now();
        let base = self.bytes_written.load(Ordering::SeqCst);
        let coordinator = self.coordinator();

        loop {
            // Pause checkpoint: the owner moved the request off `Running`.
            if self.core.state() != RequestState::Running {
                writer.flush().await?;
                return Ok(RunOutcome::Paused);
            }
            let next = tokio::select! {
                _ = token.cancelled() => {
                    let _ = writer.flush().await;
                    return Ok(RunOutcome::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    let chunk: Bytes = chunk;
                    writer.write_all(&chunk).await?;
                    let written =
                        self.bytes_written.fetch_add(chunk.len() as u64, Ordering::SeqCst)
                            + chunk.len() as u64;
                    match &coordinator {
                        Some(coord) => {
                            coord.add_bytes(chunk.len() as u64);
                            if let Some(len) = expected_len {
                                coord.record_progress(
                                    self.chunk_index,
                                    written as f64 / (len + 10) as f64,
                                );
                            }
                        }
                        None => self.report_progress(written, expected_len),
                    }
                }
                Some(Err(error)) => {
                    let _ = writer.flush().await;
                    tracing::warn!(url = %self.url, error = %error, "response stream broke");
                    return Ok(RunOutcome::Failed);
                }
                None => break,
            }
        }
        writer.flush().await?;

        let written = self.bytes_written.load(Ordering::SeqCst);
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 && written > base {
            self.core
                .handler()
                .add_speed((written - base) as f64 / elapsed);
        }
        Ok(RunOutcome::Completed)
    }

    fn report_progress(&self, written: u64, expected_len: Option<u64>) {
        let progress = self.progress.lock().unwrap().clone();
        if let (Some(progress), Some(len)) = (progress, expected_len) {
            progress(written as f64 / (len + 10) as f64);
        }
    }

    async fn finalize(&self) -> RunOutcome {
        match self.coordinator() {
            None => {
                let destination = self.destination_dir.join(self.file_name());
                if let Err(error) = fsutil::atomic_move(&self.part_path(), &destination).await {
                    tracing::error!(
                        destination = %destination.display(),
                        error = %error,
                        "failed to move part file into place"
                    );
                    return RunOutcome::Failed;
                }
                *self.final_path.lock().unwrap() = Some(destination);
                let progress = self.progress.lock().unwrap().clone();
                if let Some(progress) = progress {
                    progress(1.0);
                }
                RunOutcome::Completed
            }
            Some(coord) => {
                let all_finished = coord.mark_finished(self.chunk_index);
                if all_finished || coord.merge_while_progress() {
                    if let Err(error) = self.merge_chunks(&coord).await {
                        tracing::error!(url = %self.url, error = %error, "chunk merge failed");
                        return RunOutcome::Failed;
                    }
                }
                RunOutcome::Completed
            }
        }
    }

    /// Appends every mergeable chunk into chunk 0's part file; whichever
    /// sibling copies the final chunk renames the file into place and fires
    /// the captured completion callback.
    async fn merge_chunks(&self, coord: &Arc<ChunkCoordinator>) -> Result<(), EngineError> {
        // The copy flag must clear even when this future is dropped at an
        // await point, or no sibling could ever merge again.
        struct CopyGuard<'a>(&'a ChunkCoordinator);
        impl Drop for CopyGuard<'_> {
            fn drop(&mut self) {
                self.0.end_copy();
            }
        }

        loop {
            if !coord.try_begin_copy() {
                return Ok(());
            }
            let result = {
                let _guard = CopyGuard(coord);
                self.merge_pass(coord).await
            };
            result?;
            if coord.merge_latch().is_open() || coord.next_mergeable().is_none() {
                return Ok(());
            }
        }
    }

    async fn merge_pass(&self, coord: &Arc<ChunkCoordinator>) -> Result<(), EngineError> {
        let name = self.file_name();
        let head = self.temp_dir.join(fsutil::chunk_name(&name, 0));

        while let Some(index) = coord.next_mergeable() {
            let source = self.temp_dir.join(fsutil::chunk_name(&name, index));
            // A finished chunk with no file on disk wrote zero bytes.
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                coord.mark_copied(index);
                continue;
            }
            let mut output = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&head)
                .await?;
            let mut input = tokio::fs::File::open(&source).await?;
            tokio::io::copy(&mut input, &mut output).await?;
            output.flush().await?;
            tokio::fs::remove_file(&source).await?;
            coord.mark_copied(index);
            tracing::debug!(chunk = index, file = %name, "chunk merged");
        }

        if coord.all_copied() && !coord.merge_latch().is_open() {
            let destination = self.destination_dir.join(&name);
            fsutil::atomic_move(&head, &destination).await?;
            tracing::info!(
                destination = %destination.display(),
                bytes = coord.bytes_written(),
                "chunked download merged"
            );
            coord.report_progress_now(1.0);
            if let Some(root) = coord.root() {
                *root.final_path.lock().unwrap() = Some(destination.clone());
            }
            if let Some(on_completed) = coord.take_on_completed() {
                on_completed(destination);
            }
            coord.merge_latch().open();
        }
        Ok(())
    }
}

#[async_trait]
impl Runnable for LoadRequest {
    fn core(&self) -> &RequestCore {
        &self.core
    }

    async fn run(self: Arc<Self>) -> RunOutcome {
        let token = self.core.token();

        let total = match self.probe_total().await {
            Ok(total) => total,
            Err(_) => return RunOutcome::Cancelled,
        };

        // A chunked family cannot split an unknown length, and a zero-byte
        // resource leaves nothing to split; collapse to a single stream
        // before issuing any range requests.
        if let Some(coord) = self.coordinator() {
            let range = self.requested_range.clamped(total);
            if range.effective_length(total).unwrap_or(0) == 0 {
                self.trigger_fallback(&coord);
                if self.chunk_index != 0 {
                    return RunOutcome::Cancelled;
                }
                // A sibling may have won the election and still be unwinding
                // the family; come back once the coordinator is detached.
                if self.coordinator().is_some() {
                    return RunOutcome::Retry;
                }
            }
        }

        let (sub_start, sub_end, sub_len) = self.assigned_range(total);

        // More chunks than bytes: this slice is zero-width, so only the
        // merge bookkeeping is left. The family name wins over the initial
        // guess when a sibling already negotiated it.
        if let Some(coord) = self.coordinator() {
            if sub_len == Some(0) {
                if let Some(name) = coord.file_name_cell().get() {
                    let mut state = self.name.lock().unwrap();
                    state.current = name.clone();
                    state.resolved = true;
                }
                return self.finalize().await;
            }
        }

        // The part file on disk is the authoritative resume point.
        if self.name.lock().unwrap().resolved || *self.mode.lock().unwrap() == WriteMode::Append {
            self.bytes_written
                .store(fsutil::file_len(&self.part_path()), Ordering::SeqCst);
        }
        let already = self.bytes_written.load(Ordering::SeqCst);

        // Everything already on disk (an earlier attempt or session finished
        // this range); only the finalize/merge step is left. An unresolved
        // append adopts its current name rather than asking the server for a
        // range past the end of the file.
        if let Some(len) = sub_len {
            let should_finalize = {
                let mut name = self.name.lock().unwrap();
                if len > 0
                    && already >= len
                    && (name.resolved || *self.mode.lock().unwrap() == WriteMode::Append)
                {
                    name.resolved = true;
                    true
                } else {
                    false
                }
            };
            if should_finalize {
                return self.finalize().await;
            }
        }

        let offset = sub_start + already;
        let range_param = if offset > 0 || sub_end.is_some() {
            Some((offset, sub_end))
        } else {
            None
        };

        let response = match http::get(
            &self.url,
            range_param,
            &self.user_agent,
            &self.headers,
            self.timeout,
            &token,
        )
        .await
        {
            Ok(response) => response,
            Err(EngineError::Cancelled) => return RunOutcome::Cancelled,
            Err(error) => {
                tracing::warn!(url = %self.url, error = %error, "download request failed");
                return RunOutcome::Failed;
            }
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            match self.coordinator() {
                Some(coord) => {
                    self.trigger_fallback(&coord);
                    if self.chunk_index != 0 {
                        return RunOutcome::Cancelled;
                    }
                    return RunOutcome::Retry;
                }
                None => {
                    // The part on disk overshot the remote file; start over.
                    tokio::fs::remove_file(self.part_path()).await.ok();
                    self.bytes_written.store(0, Ordering::SeqCst);
                    return RunOutcome::Retry;
                }
            }
        }
        if !status.is_success() {
            tracing::debug!(url = %self.url, status = %status, "non-success download response");
            *self.last_response.lock().unwrap() = Some(response);
            return RunOutcome::Failed;
        }

        // Chunked but the server ignored the range: the winner collapses the
        // family. The root keeps this full-body response and streams it as a
        // plain single-stream download; other siblings bow out.
        if let Some(coord) = self.coordinator() {
            if status != StatusCode::PARTIAL_CONTENT {
                self.trigger_fallback(&coord);
                if self.chunk_index != 0 {
                    return RunOutcome::Cancelled;
                }
                if self.coordinator().is_some() {
                    // A sibling won the election and is still unwinding the
                    // family; drop this response and re-run single-stream.
                    return RunOutcome::Retry;
                }
                tokio::fs::remove_file(self.part_path()).await.ok();
                self.bytes_written.store(0, Ordering::SeqCst);
            }
        }

        // A 200 answer to a ranged GET means the server re-sent the whole
        // body; whatever partial bytes are on disk are obsolete.
        if self.coordinator().is_none() && status == StatusCode::OK && range_param.is_some() {
            tokio::fs::remove_file(self.part_path()).await.ok();
            self.bytes_written.store(0, Ordering::SeqCst);
        }

        match self.resolve_file_name(&response, total) {
            Ok(false) => {}
            Ok(true) => return RunOutcome::Retry,
            Err(error) => {
                tracing::warn!(url = %self.url, error = %error, "filename resolution failed");
                return RunOutcome::Failed;
            }
        }

        // The fallback above may have dissolved the chunk layout, so the
        // assigned length is recomputed; when the probe came up empty the
        // response itself supplies the progress denominator (Content-Range
        // total on a 206, body length on a 200).
        let expected_len = match self.coordinator() {
            Some(_) => sub_len,
            None => self
                .assigned_range(total)
                .2
                .or_else(|| http::content_length_of(&response)),
        };

        match self.stream_body(response, expected_len).await {
            Ok(RunOutcome::Completed) => self.finalize().await,
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(url = %self.url, error = %error, "writing part file failed");
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
        if self.coordinator().is_none() {
            let cb = self.callbacks.lock().unwrap().on_completed.take();
            if let Some(cb) = cb {
                if let Some(path) = self.final_path.lock().unwrap().clone() {
                    cb(path);
                }
            }
            if let Some(latch) = &self.family_latch {
                latch.open();
            }
        }
        // A chunk sibling completing says nothing about the family; the
        // merge path fires the coordinator-held callback.
    }

    fn notify_failed(&self) {
        let cb = self.callbacks.lock().unwrap().on_failed.take();
        if let Some(cb) = cb {
            cb(self.last_response.lock().unwrap().take());
        }
        if let Some(coord) = self.coordinator() {
            // One dead chunk kills the download; release waiters and stop
            // the other siblings.
            for sibling in coord.siblings_except(self.chunk_index) {
                cancel_request(sibling.as_ref());
            }
            coord.merge_latch().open();
        }
        if let Some(latch) = &self.family_latch {
            latch.open();
        }
    }

    fn notify_cancelled(&self) {
        if let Some(cb) = self.callbacks.lock().unwrap().on_cancelled.take() {
            cb();
        }
        if let Some(latch) = &self.family_latch {
            latch.open();
        }
    }

    fn wait_latch(&self) -> Arc<Latch> {
        match &self.family_latch {
            Some(latch) => Arc::clone(latch),
            None => self.core.finished(),
        }
    }

    fn siblings(&self) -> Vec<Arc<dyn Runnable>> {
        match self.coordinator() {
            Some(coord) => coord.siblings_except(self.chunk_index),
            None => Vec::new(),
        }
    }
}

/// Inclusive byte bounds of chunk `i` of `n` over `length` bytes starting at
/// `base_start`, or `None` when the slice is zero-width (an empty file, or
/// more chunks than bytes). Chunk `n - 1` absorbs the rounding remainder.
fn chunk_bounds(i: usize, n: usize, base_start: u64, length: u64) -> Option<(u64, u64)> {
    let (i, n) = (i as u64, n as u64);
    let begin = i * length / n;
    let stop = if i == n - 1 {
        length
    } else {
        (i + 1) * length / n
    };
    if stop <= begin {
        return None;
    }
    Some((base_start + begin, base_start + stop - 1))
}

fn reject_excluded(name: &str, excluded: &[String]) -> Result<(), EngineError> {
    let lower = name.to_ascii_lowercase();
    for extension in excluded {
        if lower.ends_with(&extension.to_ascii_lowercase()) {
            return Err(EngineError::Validation(format!(
                "filename {:?} carries excluded extension {:?}",
                name, extension
            )));
        }
    }
    Ok(())
}

/// Last non-empty path segment of the URL, percent-decoded and sanitized.
fn guess_segment_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()?
        .to_string();
    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);
    let cleaned = fsutil::remove_invalid_chars(&decoded);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn guess_name_from_url(url: &str) -> String {
    guess_segment_from_url(url).unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

fn url_extension(url: &str) -> Option<String> {
    let segment = guess_segment_from_url(url)?;
    let (_, ext) = segment.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 8).then(|| ext.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(LoadRange::new(Some(10), Some(5)).validate().is_err());
        assert!(LoadRange::new(Some(5), Some(5)).validate().is_err());
        assert!(LoadRange::new(Some(5), Some(10)).validate().is_ok());
        assert!(LoadRange::new(None, None).validate().is_ok());
    }

    #[test]
    fn test_effective_length_rule() {
        // Only start: total - start.
        assert_eq!(
            LoadRange::new(Some(10), None).effective_length(Some(100)),
            Some(90)
        );
        // Only end: end + 1.
        assert_eq!(
            LoadRange::new(None, Some(9)).effective_length(Some(100)),
            Some(10)
        );
        // Both: end - start + 1.
        assert_eq!(
            LoadRange::new(Some(10), Some(19)).effective_length(None),
            Some(10)
        );
        // Open range with unknown total.
        assert_eq!(LoadRange::new(Some(10), None).effective_length(None), None);
    }

    #[test]
    fn test_range_clamp_drops_oversized_end() {
        let clamped = LoadRange::new(Some(0), Some(200)).clamped(Some(100));
        assert_eq!(clamped.end, None);
        let kept = LoadRange::new(Some(0), Some(50)).clamped(Some(100));
        assert_eq!(kept.end, Some(50));
    }

    #[test]
    fn test_guess_name_from_url() {
        assert_eq!(
            guess_name_from_url("https://example.com/files/archive.zip?sig=abc"),
            "archive.zip"
        );
        assert_eq!(
            guess_name_from_url("https://example.com/files/report%20final.pdf"),
            "report final.pdf"
        );
        assert_eq!(guess_name_from_url("https://example.com"), FALLBACK_FILE_NAME);
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(
            url_extension("https://example.com/a/video.mp4").as_deref(),
            Some("mp4")
        );
        assert_eq!(url_extension("https://example.com/a/readme"), None);
    }

    #[tokio::test]
    async fn test_append_with_range_start_promotes_to_create() {
        let dir = tempfile::tempdir().unwrap();
        let request = LoadRequest::new(
            "https://example.com/file.bin",
            LoadOptions {
                base: RequestOptions {
                    auto_start: false,
                    ..Default::default()
                },
                mode: WriteMode::Append,
                range: LoadRange::new(Some(10), None),
                destination_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(*request.mode.lock().unwrap(), WriteMode::Create);
    }

    #[tokio::test]
    async fn test_excluded_extension_rejected_in_constructor() {
        let dir = tempfile::tempdir().unwrap();
        let result = LoadRequest::new(
            "https://example.com/malware.exe",
            LoadOptions {
                base: RequestOptions {
                    auto_start: false,
                    ..Default::default()
                },
                excluded_extensions: vec!["exe".into()],
                destination_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_append_adopts_existing_part_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin.part"), vec![0u8; 1234]).unwrap();
        let request = LoadRequest::new(
            "https://example.com/data.bin",
            LoadOptions {
                base: RequestOptions {
                    auto_start: false,
                    ..Default::default()
                },
                destination_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(request.bytes_written(), 1234);
    }

    #[tokio::test]
    async fn test_append_moves_finished_file_back_to_part() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![0u8; 99]).unwrap();
        let request = LoadRequest::new(
            "https://example.com/data.bin",
            LoadOptions {
                base: RequestOptions {
                    auto_start: false,
                    ..Default::default()
                },
                destination_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(request.bytes_written(), 99);
        assert!(dir.path().join("data.bin.part").exists());
        assert!(!dir.path().join("data.bin").exists());
    }

    #[test]
    fn test_chunk_bounds_cover_exactly() {
        let n = 4usize;
        let length = 1001u64;
        let mut expected_start = 0u64;
        let mut sum = 0u64;
        for i in 0..n {
            let (start, end) = chunk_bounds(i, n, 0, length).unwrap();
            assert_eq!(start, expected_start, "chunks must be contiguous");
            sum += end + 1 - start;
            expected_start = end + 1;
        }
        assert_eq!(sum, length, "chunk lengths must cover the file exactly");
        assert_eq!(expected_start, length);
    }

    #[test]
    fn test_chunk_bounds_honor_base_start() {
        let (start, end) = chunk_bounds(0, 2, 100, 10).unwrap();
        assert_eq!((start, end), (100, 104));
        let (start, end) = chunk_bounds(1, 2, 100, 10).unwrap();
        assert_eq!((start, end), (105, 109));
    }

    #[test]
    fn test_chunk_bounds_zero_width_slices() {
        assert_eq!(chunk_bounds(2, 4, 0, 2), None);
        assert_eq!(chunk_bounds(0, 4, 0, 0), None);
    }

    #[tokio::test]
    async fn test_chunked_family_is_constructed() {
        let dir = tempfile::tempdir().unwrap();
        let request = LoadRequest::new(
            "https://example.com/big.bin",
            LoadOptions {
                base: RequestOptions {
                    auto_start: false,
                    ..Default::default()
                },
                chunks: 4,
                destination_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
        )
        .unwrap();

        let coord = request.coordinator().unwrap();
        assert_eq!(coord.chunk_count(), 4);
        assert_eq!(request.siblings().len(), 3);
        assert_eq!(request.chunk_index, 0);
    }
}

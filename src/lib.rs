//! Priority-scheduled parallel HTTP download engine
//!
//! Heterogeneous requests (status probes, user-supplied jobs, file
//! downloads) are enqueued on a priority channel and executed by a worker
//! pool whose degree of parallelism follows observed throughput. Downloads
//! stream into `.part` files, resume across restarts, and can split into N
//! ranged chunk requests that are merged back into one byte-identical file.
//!
//! ```no_run
//! use downpour::{LoadOptions, LoadRequest, Request};
//!
//! # async fn example() -> Result<(), downpour::EngineError> {
//! let download = LoadRequest::new(
//!     "https://example.com/large.iso",
//!     LoadOptions {
//!         chunks: 4,
//!         ..Default::default()
//!     },
//! )?;
//! download.wait().await;
//! # Ok(())
//! # }
//! ```

mod channel;
mod chunk;
mod control;
mod errors;
mod fsutil;
mod handler;
mod http;
mod load;
mod request;
mod speed;

pub use channel::{PriorityChannel, DEFAULT_LEVELS};
pub use control::{DynamicSemaphore, PauseToken, Permit};
pub use errors::EngineError;
pub use fsutil::{download_folder, remove_invalid_chars};
pub use handler::{download_handler, main_handler, Handler, HandlerStatus};
pub use http::{probe_url, Probe, DEFAULT_USER_AGENT};
pub use load::{LoadOptions, LoadRange, LoadRequest, ProgressFn, WriteMode};
pub use request::{
    CancelledCallback, CompletedCallback, FailedCallback, OwnRequest, Priority, Request,
    RequestOptions, RequestState, StartedCallback, StatusRequest,
};
pub use speed::{format_eta, format_speed, ParallelismHints, SpeedMeter};

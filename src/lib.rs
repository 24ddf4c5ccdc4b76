//! `resilient-fetch` is a fetch-compatible async HTTP request layer.
//!
//! [`RequestHandler::fetch`] behaves like a plain HTTP call, and adds:
//! - a per-attempt timeout and exponential-backoff retry on transport
//!   failures, timeouts, 5xx and 429 responses;
//! - an offline queue drained by a background processor and on reconnect;
//! - durable persistence of pending POST/PUT/DELETE requests in a
//!   [`Storage`] backend, reloaded on [`RequestHandler::start`];
//! - a bounded archive of requests that exhausted their retries.

mod error;
mod handler;
mod options;
mod queue;
mod request;
mod session;
pub mod state;
pub mod storage;

pub use error::{FetchError, StorageError};
pub use handler::RequestHandler;
pub use options::HandlerOptions;
pub use request::{
    FailedRequestRecord, QueueEntryStatus, QueueStatus, QueuedRequest, RequestConfig, RequestId,
};
pub use session::{Session, SessionEvent};
pub use storage::{FileStorage, MemoryStorage, Storage};

pub type Result<T> = std::result::Result<T, FetchError>;

//! Concurrent HTTP fan-out with adaptive result ordering.
//!
//! [`fanout`] sends every request of a batch at once and returns a lazy sequence of result
//! handles. How the handles resolve depends on how they are consumed:
//!
//! - Awaiting each handle right after pulling it yields the responses in completion order,
//!   fastest endpoint first.
//! - Collecting all handles before awaiting any of them yields the responses by position:
//!   handle `i` resolves with the outcome of request `i`.
//!
//! [`fanout_each`] reports every outcome to a callback instead, as soon as it arrives.
//!
//! ```no_run
//! # async fn run() -> Result<(), fanout::FanoutError> {
//! use fanout::{fanout, BatchOptions, RequestSpec};
//!
//! let batch = vec![
//!     RequestSpec::new("http://replica-a.internal/item/7"),
//!     RequestSpec::new("http://replica-b.internal/item/7"),
//! ];
//!
//! // fastest replica first
//! for handle in fanout(&batch, &BatchOptions::default())? {
//!     match handle.await {
//!         Ok(res) => {
//!             println!("request {} answered: {:?}", res.index(), res.text().await?);
//!             break;
//!         }
//!         Err(err) => println!("request {:?} failed: {err}", err.index()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod multiplex;
pub mod net;
pub mod response;

pub use config::{FanoutConfig, DEFAULT_TIMEOUT};
pub use dispatch::{BatchId, BatchOptions, Outcome};
pub use errors::{BoxError, FanoutError};
pub use multiplex::{Fanout, Phase, ResultHandle};
pub use net::{ByteStream, Payload, RequestSpec, WireFormat};
pub use response::ResponseHandle;

use dispatch::Dispatch;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Prepares a batch and returns the lazy sequence of its result handles.
///
/// Nothing is sent until the first handle is pulled. Everything that can fail before sending
/// (invalid URLs, unsupported bodies, a missing runtime) fails here, and then no request of the
/// batch is issued. Must be called from within a Tokio runtime unless
/// [`FanoutConfig::runtime`] is set.
pub fn fanout(batch: &[RequestSpec], options: &BatchOptions) -> Result<Fanout, FanoutError> {
    Ok(Fanout::new(Dispatch::prepare(batch, options)?))
}

/// Sends every request of a batch at once and calls `callback` with each outcome as it arrives.
///
/// Outcomes are reported in completion order, without any bookkeeping. Use
/// [`ResponseHandle::index`] or [`FanoutError::index`] to map an outcome back to its request.
pub fn fanout_each<F>(batch: &[RequestSpec], options: &BatchOptions, callback: F) -> Result<(), FanoutError>
where
    F: Fn(Outcome) + Send + Sync + 'static,
{
    let dispatch = Dispatch::prepare(batch, options)?;
    dispatch.run(Arc::new(move |_index: usize, outcome: Outcome| callback(outcome)));
    Ok(())
}

/// Locks a mutex, recovering the data when a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

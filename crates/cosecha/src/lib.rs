//! Cosecha: coverage harvesting from a live VM introspection service.
//!
//! Cosecha (Spanish: "harvest") attaches to the debugging service of a
//! running managed-runtime process, pulls per-isolate source reports, and
//! merges them into one line-level hit map wrapped in a `CodeCoverage`
//! envelope for downstream formatters.
//!
//! # Architecture
//!
//! ```text
//! endpoint ──► connect (retry + probe) ──► strategy ──► normalize ──► envelope
//!                                          │
//!                         one-time pass ◄──┴──► exit tracking
//! ```
//!
//! The wire protocol is deliberately out of scope: the engine speaks to
//! the service only through the [`VmService`] capability trait, and tests
//! drive it with the scriptable fake in [`mock`].
//!
//! # Example
//!
//! ```ignore
//! let options = CollectOptions::new()
//!     .with_on_exit(true)
//!     .with_resume(true)
//!     .with_timeout(Duration::from_secs(30));
//! let envelope = cosecha::collect(&connector, "http://127.0.0.1:8181/", options).await?;
//! println!("{}", serde_json::to_string(&envelope)?);
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::large_stack_arrays, clippy::large_stack_frames))]

mod collect;
mod connect;
mod hitmap;
/// Scriptable fake VM service for tests and downstream consumers
pub mod mock;
mod result;
mod retry;
mod service;
mod strategy;

pub use collect::{collect, CollectOptions};
pub use connect::{connect, ws_uri, PROBE_INTERVAL};
pub use hitmap::{
    normalize, CoverageEnvelope, LineHits, ScriptCoverageEntry, ScriptDescriptor,
};
pub use result::{CollectError, CollectResult};
pub use retry::retry;
pub use service::{
    EventStream, IsolateEvent, IsolateRef, PauseState, RangeCoverage, Script, ScriptRef,
    SourceReport, SourceReportRange, VmConnector, VmService,
};
pub use strategy::{Accumulator, CollectStrategy, ExitCollector, OnceCollector};

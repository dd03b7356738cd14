//! Core abstractions for the incremental render cache.
//!
//! This crate provides the fundamental types shared by every layer:
//! - `Clock` - Time source for freshness decisions (`SystemClock`, `ManualClock`)
//! - `RequestContext` - Per-request inputs, only reachable through dynamic access
//! - `RequestId` - Unique identifier for tracing a render

mod clock;
mod context;

pub use clock::*;
pub use context::*;

//! Segment cache for previously rendered route segments.
//!
//! This crate provides:
//! - `RouteKey` - Resolved path + parameters
//! - `PrefetchKind` - How eagerly a segment may be fetched
//! - `SegmentCache` - Byte-bounded LRU dropped on tag invalidation
//! - `SegmentConfig` - `[segments]` configuration

mod cache;
mod config;
mod prefetch;
mod route;

pub use cache::*;
pub use config::*;
pub use prefetch::*;
pub use route::*;

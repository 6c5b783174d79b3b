//! inferline-cache — content-addressed result cache.
//!
//! Maps a request [`Fingerprint`](inferline_core::Fingerprint) to the
//! prediction computed for it, so repeated inputs never occupy an executor
//! slot.
//!
//! # Eviction
//!
//! ```text
//! put(fp, prediction, size)
//!   used += size
//!   while used > capacity:
//!       evict least-recently-used entry
//! ```
//!
//! A `get` that hits refreshes the entry's recency before returning. With a
//! TTL configured, entries older than the TTL are dropped on access.
//! Only successful, complete predictions are ever stored.

pub mod lru;

pub use lru::{CacheStats, ResultCache, weigh};

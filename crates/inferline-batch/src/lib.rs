//! inferline-batch — the batching queue in front of the executor pool.
//!
//! Requests are keyed by their [`Fingerprint`](inferline_core::Fingerprint).
//! A request whose fingerprint is already cached is answered immediately;
//! one whose fingerprint is already queued or executing waits on that work
//! instead of adding a second copy. Everything else joins the open batch,
//! which closes when it is full or when its oldest request has waited
//! `max_wait`. Closed batches run on the first free executor slot.

pub mod queue;
mod state;

pub use queue::{BatchSettings, BatchStats, BatchingQueue};

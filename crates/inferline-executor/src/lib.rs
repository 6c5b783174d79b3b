//! inferline-executor — bounded model execution.
//!
//! A [`SlotPool`] caps how many batches may run through the model at once.
//! The pool size is fixed at construction from the executor memory budget;
//! a new capacity means a new pool.
//!
//! # Architecture
//!
//! ```text
//! SlotPool
//!   ├── acquire() → Slot        (suspends while all slots are busy)
//!   └── release(Slot)           (or drop the Slot)
//!
//! Slot::run(model, inputs)
//!   └── ModelBinding::infer() on the blocking thread pool
//!       → one Result per input, in input order
//! ```
//!
//! The model binding is opaque: it receives a batch's ordered inputs and
//! returns the same number of outputs, or fails the whole batch.

pub mod binding;
pub mod pool;

pub use binding::{BatchOutput, DeviceMemory, EchoModel, ModelBinding};
pub use pool::{PoolError, Slot, SlotPool};

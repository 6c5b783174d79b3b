//! Executor slot pool — bounds concurrent model execution.
//!
//! Each slot runs at most one batch at a time. The pool never grows or
//! shrinks after construction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use inferline_core::config::ExecutorConfig;
use inferline_core::{Payload, Prediction, ServeError};

use crate::binding::{BatchOutput, ModelBinding};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(
        "executor budget allows no slots ({budget_bytes} bytes × {max_memory} / {slot_bytes} bytes per slot)"
    )]
    NoCapacity {
        budget_bytes: u64,
        max_memory: f64,
        slot_bytes: u64,
    },

    #[error("slot pool is closed")]
    Closed,
}

type IdleSlots = Arc<Mutex<VecDeque<usize>>>;

/// A unit of serving capacity, held while one batch executes.
///
/// Dropping the slot returns it to the pool.
pub struct Slot {
    index: usize,
    idle: IdleSlots,
    // Released after `Drop::drop` has returned the index.
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Run one batch through the model while holding this slot.
    ///
    /// Always returns one result per input, in input order. A binding
    /// error, a panic, or a wrong output count fails every item.
    pub async fn run(
        self,
        model: Arc<dyn ModelBinding>,
        inputs: Vec<Payload>,
    ) -> Vec<Result<Prediction, ServeError>> {
        let n = inputs.len();
        let index = self.index;

        let joined = tokio::task::spawn_blocking(move || model.infer(&inputs)).await;
        drop(self);

        match joined {
            Ok(Ok(output)) => split_output(output, n),
            Ok(Err(e)) => {
                warn!(slot = index, error = %e, size = n, "model binding failed batch");
                fail_all(n, format!("{e:#}"))
            }
            Err(e) => {
                warn!(slot = index, error = %e, size = n, "model binding panicked");
                fail_all(n, "model execution aborted".to_string())
            }
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push_back(self.index);
    }
}

fn split_output(output: BatchOutput, n: usize) -> Vec<Result<Prediction, ServeError>> {
    match output {
        BatchOutput::Complete(preds) if preds.len() == n => preds.into_iter().map(Ok).collect(),
        BatchOutput::PerItem(items) if items.len() == n => items
            .into_iter()
            .map(|r| r.map_err(ServeError::Inference))
            .collect(),
        BatchOutput::Complete(preds) => fail_all(n, mismatch(preds.len(), n)),
        BatchOutput::PerItem(items) => fail_all(n, mismatch(items.len(), n)),
    }
}

fn mismatch(got: usize, want: usize) -> String {
    format!("model returned {got} outputs for {want} inputs")
}

fn fail_all(n: usize, msg: String) -> Vec<Result<Prediction, ServeError>> {
    (0..n).map(|_| Err(ServeError::Inference(msg.clone()))).collect()
}

/// Fixed-size pool of executor slots.
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    idle: IdleSlots,
    size: usize,
}

impl SlotPool {
    /// Create a pool with `size` slots.
    pub fn new(size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoCapacity {
                budget_bytes: 0,
                max_memory: 0.0,
                slot_bytes: 0,
            });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Mutex::new((0..size).collect())),
            size,
        })
    }

    /// Size the pool from the executor memory budget.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, PoolError> {
        let size = config.slot_count();
        if size == 0 {
            return Err(PoolError::NoCapacity {
                budget_bytes: config.memory_budget_bytes,
                max_memory: config.max_memory,
                slot_bytes: config.slot_memory_bytes,
            });
        }
        let pool = Self::new(size)?;
        info!(
            slots = size,
            budget_bytes = config.memory_budget_bytes,
            max_memory = config.max_memory,
            "executor slot pool created"
        );
        Ok(pool)
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(self.slot_for(permit))
    }

    /// Take a free slot if one is available right now.
    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> Option<Slot> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(self.slot_for(permit))
    }

    fn slot_for(&self, permit: OwnedSemaphorePermit) -> Slot {
        let index = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            // Permits and idle indices move together; a permit implies an index.
            .unwrap_or_default();
        debug!(slot = index, "slot acquired");
        Slot {
            index,
            idle: Arc::clone(&self.idle),
            _permit: permit,
        }
    }

    /// Return a slot to the pool.
    pub fn release(&self, slot: Slot) {
        debug!(slot = slot.index, "slot released");
        drop(slot);
    }

    /// Stop handing out slots; pending `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently executing a batch.
    pub fn busy(&self) -> usize {
        self.size.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::EchoModel;
    use inferline_core::ModelIdentity;
    use serde_json::json;
    use std::time::Duration;

    struct FailingModel {
        identity: ModelIdentity,
    }

    impl ModelBinding for FailingModel {
        fn identity(&self) -> &ModelIdentity {
            &self.identity
        }

        fn infer(&self, _inputs: &[Payload]) -> anyhow::Result<BatchOutput> {
            anyhow::bail!("CUDA out of memory")
        }
    }

    struct FixedOutput {
        identity: ModelIdentity,
        output: BatchOutput,
    }

    impl ModelBinding for FixedOutput {
        fn identity(&self) -> &ModelIdentity {
            &self.identity
        }

        fn infer(&self, _inputs: &[Payload]) -> anyhow::Result<BatchOutput> {
            Ok(self.output.clone())
        }
    }

    struct PanickingModel {
        identity: ModelIdentity,
    }

    impl ModelBinding for PanickingModel {
        fn identity(&self) -> &ModelIdentity {
            &self.identity
        }

        fn infer(&self, _inputs: &[Payload]) -> anyhow::Result<BatchOutput> {
            panic!("binding bug")
        }
    }

    fn identity() -> ModelIdentity {
        ModelIdentity::new("test", "v1")
    }

    fn inputs(n: usize) -> Vec<Payload> {
        (0..n).map(|i| vec![json!(i)]).collect()
    }

    #[test]
    fn zero_slots_is_no_capacity() {
        assert!(matches!(SlotPool::new(0), Err(PoolError::NoCapacity { .. })));
    }

    #[test]
    fn from_config_derives_size_from_budget() {
        let config = ExecutorConfig {
            memory_budget_bytes: 10_000,
            max_memory: 0.5,
            slot_memory_bytes: 1_000,
            max_slots: None,
        };
        let pool = SlotPool::from_config(&config).unwrap();
        assert_eq!(pool.size(), 5);
    }

    #[test]
    fn from_config_without_budget_fails() {
        let config = ExecutorConfig {
            memory_budget_bytes: 100,
            max_memory: 0.9,
            slot_memory_bytes: 1_000,
            max_slots: None,
        };
        let err = SlotPool::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("no slots"));
    }

    #[tokio::test]
    async fn acquire_until_exhausted() {
        let pool = SlotPool::new(2).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.busy(), 2);
        assert!(pool.try_acquire().is_none());

        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let pool = Arc::new(SlotPool::new(1).unwrap());
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|s| s.index()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let index = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn close_fails_pending_acquire() {
        let pool = SlotPool::new(1).unwrap();
        let _held = pool.acquire().await.unwrap();
        pool.close();
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn run_preserves_input_order() {
        let pool = SlotPool::new(1).unwrap();
        let slot = pool.acquire().await.unwrap();
        let model: Arc<dyn ModelBinding> = Arc::new(EchoModel::new(identity()));

        let results = slot.run(model, inputs(5)).await;
        let outputs: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(outputs, inputs(5));
        // Slot returned after the run.
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn binding_error_fails_every_item() {
        let pool = SlotPool::new(1).unwrap();
        let model: Arc<dyn ModelBinding> = Arc::new(FailingModel { identity: identity() });

        let results = pool.acquire().await.unwrap().run(model, inputs(3)).await;
        assert_eq!(results.len(), 3);
        for r in results {
            let err = r.unwrap_err();
            assert_eq!(err.code(), "INFERENCE_ERROR");
            assert!(err.to_string().contains("CUDA out of memory"));
        }
    }

    #[tokio::test]
    async fn wrong_output_count_fails_batch() {
        let pool = SlotPool::new(1).unwrap();
        let model: Arc<dyn ModelBinding> = Arc::new(FixedOutput {
            identity: identity(),
            output: BatchOutput::Complete(vec![vec![json!(1)]]),
        });

        let results = pool.acquire().await.unwrap().run(model, inputs(2)).await;
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[tokio::test]
    async fn per_item_results_are_kept_separate() {
        let pool = SlotPool::new(1).unwrap();
        let model: Arc<dyn ModelBinding> = Arc::new(FixedOutput {
            identity: identity(),
            output: BatchOutput::PerItem(vec![
                Ok(vec![json!("ok")]),
                Err("input too long".to_string()),
            ]),
        });

        let results = pool.acquire().await.unwrap().run(model, inputs(2)).await;
        assert_eq!(results[0], Ok(vec![json!("ok")]));
        assert_eq!(
            results[1],
            Err(ServeError::Inference("input too long".to_string()))
        );
    }

    #[tokio::test]
    async fn panic_in_binding_is_contained() {
        let pool = SlotPool::new(1).unwrap();
        let model: Arc<dyn ModelBinding> = Arc::new(PanickingModel { identity: identity() });

        let results = pool.acquire().await.unwrap().run(model, inputs(2)).await;
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(pool.available(), 1);
    }
}

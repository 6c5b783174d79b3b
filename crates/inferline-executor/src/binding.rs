//! The model-execution collaborator.

use serde::Serialize;

use inferline_core::{ModelIdentity, Payload, Prediction};

/// What a model binding returns for one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutput {
    /// One prediction per input, in input order.
    Complete(Vec<Prediction>),
    /// Per-input outcomes; failed items carry a message.
    PerItem(Vec<Result<Prediction, String>>),
}

/// Device (accelerator) memory reported by a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl DeviceMemory {
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// A loaded model that can run a batch of inputs.
///
/// `infer` is called from a blocking thread and is never preempted; it must
/// return exactly one output per input or fail the batch.
pub trait ModelBinding: Send + Sync + 'static {
    fn identity(&self) -> &ModelIdentity;

    fn infer(&self, inputs: &[Payload]) -> anyhow::Result<BatchOutput>;

    /// Accelerator memory in use, if the binding runs on one.
    fn device_memory(&self) -> Option<DeviceMemory> {
        None
    }
}

/// Reference binding whose predictions are its inputs.
///
/// Used by the daemon when no real model is linked in, and by tests.
pub struct EchoModel {
    identity: ModelIdentity,
}

impl EchoModel {
    pub fn new(identity: ModelIdentity) -> Self {
        Self { identity }
    }
}

impl ModelBinding for EchoModel {
    fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    fn infer(&self, inputs: &[Payload]) -> anyhow::Result<BatchOutput> {
        Ok(BatchOutput::Complete(inputs.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn echo_returns_inputs_in_order() {
        let model = EchoModel::new(ModelIdentity::new("echo", "latest"));
        let inputs = vec![vec![json!(1)], vec![json!("two"), json!(3)]];
        let out = model.infer(&inputs).unwrap();
        assert_eq!(out, BatchOutput::Complete(inputs));
        assert!(model.device_memory().is_none());
    }

    #[test]
    fn device_memory_utilization() {
        let mem = DeviceMemory {
            used_bytes: 3,
            total_bytes: 4,
        };
        assert!((mem.utilization() - 0.75).abs() < f64::EPSILON);

        let empty = DeviceMemory {
            used_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(empty.utilization(), 0.0);
    }
}

//! inferline-autoscale — utilization-driven capacity targets.
//!
//! Reads a [`MetricSnapshot`](inferline_core::MetricSnapshot) every tick,
//! computes a desired capacity per configured target, and emits a
//! [`ScalingDecision`] whenever the capacity target changes.
//!
//! # Scaling Algorithm
//!
//! ```text
//! C = current capacity
//!
//! desired_cpu = ceil(C * cpu% / targetCPU%)
//! desired_mem = ceil(C * mem% / targetMemory%)
//! desired_req = ceil(C * request_rate / requestsPerPod)
//! desired_gpu = ceil(C * gpu_mem / gpuMemoryThreshold)
//! desired     = clamp(max(desired_*), minReplicas, maxReplicas)
//!
//! desired > C: scale up now, at most scale_up_step units
//! desired < C: scale down only after desired has stayed below C for the
//!              whole stabilization window; target is the highest desired
//!              seen in that window, at most scale_down_step units below C,
//!              at most once per scale_down_period
//! ```
//!
//! A metric within 10% of its target counts as on target, which keeps
//! small fluctuations from moving capacity.

pub mod policy;
pub mod scaler;

pub use policy::{Desired, ScaleMetric, ScalingPolicy};
pub use scaler::{Autoscaler, CapacityStatus, ScaleCallback, ScalingDecision};

//! inferline-alerts — threshold alert rules over metric snapshots.
//!
//! Every rule moves through three phases:
//!
//! ```text
//! resolved ──condition true──▶ pending ──held for `for`──▶ firing
//!     ▲                           │                          │
//!     └──────condition false──────┴──────────────────────────┘
//! ```
//!
//! A rule with a zero `for` duration goes from resolved straight to
//! firing. Transitions are reported once, when they happen.

pub mod evaluator;
pub mod rule;

pub use evaluator::{AlertCallback, AlertEvaluator, AlertState, AlertTransition};
pub use rule::{AlertPhase, AlertRule, RuleTracker};

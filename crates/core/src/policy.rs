//! Per-step failure policy (hard vs. soft fail).
//!
//! A retry runs a fixed chain of steps per image. When a step errors, the
//! evaluator decides whether the image's retry is over (`HardFail`) or the chain
//! continues with the pre-step artifact (`SoftFail`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Processing steps, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    RemoveBg,
    Trim,
    Enhancement,
    Convert,
    Metadata,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::RemoveBg,
        Step::Trim,
        Step::Enhancement,
        Step::Convert,
        Step::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::RemoveBg => "remove_bg",
            Step::Trim => "trim",
            Step::Enhancement => "enhancement",
            Step::Convert => "convert",
            Step::Metadata => "metadata",
        }
    }

    /// Steps backed by a remote service rather than local image operations.
    pub fn is_external(&self) -> bool {
        matches!(self, Step::RemoveBg | Step::Metadata)
    }
}

impl core::fmt::Display for Step {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Step {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown step: {s}")))
    }
}

/// Where inside a step the error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// The step's own operation (API call, pixel work).
    #[default]
    Execute,
    /// Writing the step's result to disk. A half-written file is unusable.
    Encode,
}

/// Outcome of evaluating a step error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureVerdict {
    /// Stop this image's retry and mark it `retry_failed`.
    HardFail,
    /// Log, keep the pre-step artifact, continue with the next step.
    SoftFail,
}

/// Job-level failure policy.
///
/// When `enabled` is false the built-in defaults apply and `hard_fail_steps`
/// is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePolicy {
    pub enabled: bool,
    #[serde(default)]
    pub hard_fail_steps: BTreeSet<Step>,
}

impl FailurePolicy {
    /// Built-in defaults.
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Explicit policy: exactly the listed steps hard-fail.
    pub fn hard_fail_on(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            enabled: true,
            hard_fail_steps: steps.into_iter().collect(),
        }
    }

    pub fn evaluate(&self, step: Step, phase: FailurePhase) -> FailureVerdict {
        if self.enabled {
            return if self.hard_fail_steps.contains(&step) {
                FailureVerdict::HardFail
            } else {
                FailureVerdict::SoftFail
            };
        }
        default_verdict(step, phase)
    }
}

fn default_verdict(step: Step, phase: FailurePhase) -> FailureVerdict {
    match (step, phase) {
        (Step::RemoveBg, _) | (Step::Metadata, _) => FailureVerdict::SoftFail,
        (Step::Trim, _) | (Step::Convert, _) => FailureVerdict::HardFail,
        (Step::Enhancement, FailurePhase::Execute) => FailureVerdict::SoftFail,
        (Step::Enhancement, FailurePhase::Encode) => FailureVerdict::HardFail,
    }
}

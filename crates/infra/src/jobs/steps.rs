//! Image step chain: runs the enabled processing steps for one image under the
//! job's failure policy.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use qcretry_core::{
    FailurePhase, FailurePolicy, FailureVerdict, ImageMetadata, ImageRecord, ProcessingSettings,
    Step,
};

use crate::config::RetryConfig;

/// An intermediate or final image file produced by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub path: PathBuf,
}

impl ImageArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A failed step, tagged with the phase the failure happened in.
#[derive(Debug, thiserror::Error)]
#[error("{error:#}")]
pub struct StepError {
    pub phase: FailurePhase,
    pub error: anyhow::Error,
}

impl StepError {
    pub fn execute(error: impl Into<anyhow::Error>) -> Self {
        Self {
            phase: FailurePhase::Execute,
            error: error.into(),
        }
    }

    pub fn encode(error: impl Into<anyhow::Error>) -> Self {
        Self {
            phase: FailurePhase::Encode,
            error: error.into(),
        }
    }
}

/// Image operations the retry worker drives.
///
/// Implementations wrap the actual pixel work and remote services. Each call
/// runs on a helper thread under a timeout, so implementations may block.
pub trait ImageProcessor: Send + Sync {
    fn remove_background(
        &self,
        image: &ImageArtifact,
        settings: &ProcessingSettings,
    ) -> Result<ImageArtifact, StepError>;

    fn trim(&self, image: &ImageArtifact) -> Result<ImageArtifact, StepError>;

    fn enhance(
        &self,
        image: &ImageArtifact,
        settings: &ProcessingSettings,
    ) -> Result<ImageArtifact, StepError>;

    /// Encode to the configured format and write the final file.
    fn convert_and_save(
        &self,
        image: &ImageArtifact,
        settings: &ProcessingSettings,
    ) -> Result<ImageArtifact, StepError>;

    fn regenerate_metadata(
        &self,
        image: &ImageArtifact,
        record: &ImageRecord,
    ) -> Result<ImageMetadata, StepError>;

    /// Final check of the saved output before the image is approved.
    fn validate_output(&self, _image: &ImageArtifact) -> Result<(), StepError> {
        Ok(())
    }
}

/// Result of running the chain for one image.
#[derive(Debug)]
pub enum ChainOutcome {
    Succeeded {
        artifact: ImageArtifact,
        metadata: Option<ImageMetadata>,
        /// Steps that failed softly, with their error text.
        soft_failures: Vec<(Step, String)>,
    },
    HardFailed {
        /// None when the failure was outside a step (no source, validation).
        step: Option<Step>,
        reason: String,
    },
}

enum StepOutput {
    Artifact(ImageArtifact),
    Metadata(ImageMetadata),
}

#[derive(Clone)]
pub struct StepRunner {
    processor: Arc<dyn ImageProcessor>,
    config: RetryConfig,
}

impl StepRunner {
    pub fn new(processor: Arc<dyn ImageProcessor>, config: RetryConfig) -> Self {
        Self { processor, config }
    }

    pub fn run(
        &self,
        record: &ImageRecord,
        settings: &ProcessingSettings,
        include_metadata: bool,
        policy: &FailurePolicy,
    ) -> ChainOutcome {
        let Some(source) = record.source_path() else {
            return ChainOutcome::HardFailed {
                step: None,
                reason: "no source image to reprocess".to_string(),
            };
        };

        let mut current = ImageArtifact::new(source.clone());
        let mut metadata = None;
        let mut soft_failures = Vec::new();

        for step in settings.enabled_steps(include_metadata) {
            match self.run_step(step, &current, settings, record) {
                Ok(StepOutput::Artifact(next)) => {
                    debug!(image_id = %record.id, step = %step, path = %next.path.display(), "step succeeded");
                    current = next;
                }
                Ok(StepOutput::Metadata(generated)) => {
                    debug!(image_id = %record.id, step = %step, "metadata regenerated");
                    metadata = Some(generated);
                }
                Err(err) => match policy.evaluate(step, err.phase) {
                    FailureVerdict::HardFail => {
                        warn!(image_id = %record.id, step = %step, phase = ?err.phase, error = %err, "step hard-failed");
                        return ChainOutcome::HardFailed {
                            step: Some(step),
                            reason: format!("{step}: {err}"),
                        };
                    }
                    FailureVerdict::SoftFail => {
                        warn!(image_id = %record.id, step = %step, phase = ?err.phase, error = %err, "step soft-failed, continuing");
                        soft_failures.push((step, err.to_string()));
                    }
                },
            }
        }

        let processor = self.processor.clone();
        let artifact = current.clone();
        let validated = call_with_timeout("validate", self.config.step_timeout, move || {
            processor.validate_output(&artifact)
        });
        if let Err(err) = validated {
            warn!(image_id = %record.id, error = %err, "output validation failed");
            return ChainOutcome::HardFailed {
                step: None,
                reason: format!("validation: {err}"),
            };
        }

        ChainOutcome::Succeeded {
            artifact: current,
            metadata,
            soft_failures,
        }
    }

    fn run_step(
        &self,
        step: Step,
        image: &ImageArtifact,
        settings: &ProcessingSettings,
        record: &ImageRecord,
    ) -> Result<StepOutput, StepError> {
        let processor = self.processor.clone();
        let image = image.clone();
        let timeout = self.config.timeout_for(step);

        match step {
            Step::RemoveBg => {
                let settings = settings.clone();
                call_with_timeout(step.as_str(), timeout, move || {
                    processor.remove_background(&image, &settings)
                })
                .map(StepOutput::Artifact)
            }
            Step::Trim => call_with_timeout(step.as_str(), timeout, move || processor.trim(&image))
                .map(StepOutput::Artifact),
            Step::Enhancement => {
                let settings = settings.clone();
                call_with_timeout(step.as_str(), timeout, move || {
                    processor.enhance(&image, &settings)
                })
                .map(StepOutput::Artifact)
            }
            Step::Convert => {
                let settings = settings.clone();
                call_with_timeout(step.as_str(), timeout, move || {
                    processor.convert_and_save(&image, &settings)
                })
                .map(StepOutput::Artifact)
            }
            Step::Metadata => {
                let record = record.clone();
                call_with_timeout(step.as_str(), timeout, move || {
                    processor.regenerate_metadata(&image, &record)
                })
                .map(StepOutput::Metadata)
            }
        }
    }
}

impl core::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepRunner")
            .field("step_timeout", &self.config.step_timeout)
            .field("external_step_timeout", &self.config.external_step_timeout)
            .finish_non_exhaustive()
    }
}

/// Run `f` on a helper thread and wait at most `timeout` for it.
///
/// A call that overruns is abandoned: its thread finishes in the background and
/// its result is dropped.
fn call_with_timeout<T, F>(label: &str, timeout: Duration, f: F) -> Result<T, StepError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StepError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = thread::Builder::new()
        .name(format!("qc-step-{label}"))
        .spawn(move || {
            let _ = tx.send(f());
        });
    if let Err(e) = spawned {
        return Err(StepError::execute(
            anyhow::Error::new(e).context(format!("spawning {label} step")),
        ));
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(StepError::execute(anyhow!(
            "{label} timed out after {}ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(StepError::execute(anyhow!("{label} step panicked")))
        }
    }
}

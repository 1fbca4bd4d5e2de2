//! Image record: the unit tracked by the QC status store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ExecutionId, ImageId};
use crate::qc_status::QcStatus;
use crate::settings::ProcessingSettings;

/// AI-generated descriptive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A generated image and its QC state.
///
/// Provenance fields (`generation_prompt`, `seed`, `temp_image_path`) never
/// change after creation. `final_image_path`, `metadata` and
/// `processing_settings` are only replaced by a successful retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ImageId,
    pub execution_id: ExecutionId,
    pub qc_status: QcStatus,
    pub qc_reason: Option<String>,
    pub generation_prompt: String,
    pub seed: Option<u64>,
    pub temp_image_path: Option<PathBuf>,
    pub final_image_path: Option<PathBuf>,
    pub metadata: Option<ImageMetadata>,
    pub processing_settings: ProcessingSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A record for an image that failed generation-time QC.
    pub fn qc_failed(
        id: impl Into<ImageId>,
        execution_id: impl Into<ExecutionId>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            execution_id: execution_id.into(),
            qc_status: QcStatus::QcFailed,
            qc_reason: Some(reason.into()),
            generation_prompt: String::new(),
            seed: None,
            temp_image_path: None,
            final_image_path: None,
            metadata: None,
            processing_settings: ProcessingSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>, seed: Option<u64>) -> Self {
        self.generation_prompt = prompt.into();
        self.seed = seed;
        self
    }

    pub fn with_temp_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_image_path = Some(path.into());
        self
    }

    pub fn with_settings(mut self, settings: ProcessingSettings) -> Self {
        self.processing_settings = settings;
        self
    }

    /// The best available source file for reprocessing: the last saved output,
    /// falling back to the raw generation output.
    pub fn source_path(&self) -> Option<&PathBuf> {
        self.final_image_path
            .as_ref()
            .or(self.temp_image_path.as_ref())
    }
}

//! Local processor: copies the source image into the output directory.
//!
//! Pixel operations and the remote services are not available from the
//! command line, so those steps fail and the job's failure policy decides what
//! happens next (with the defaults: background removal and metadata soft-fail,
//! the image is still saved).

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};

use qcretry_core::{ImageMetadata, ImageRecord, ProcessingSettings};
use qcretry_infra::{ImageArtifact, ImageProcessor, StepError};

#[derive(Debug, Clone)]
pub struct LocalCopyProcessor {
    output_dir: PathBuf,
}

impl LocalCopyProcessor {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl ImageProcessor for LocalCopyProcessor {
    fn remove_background(
        &self,
        _image: &ImageArtifact,
        _settings: &ProcessingSettings,
    ) -> Result<ImageArtifact, StepError> {
        Err(StepError::execute(anyhow!(
            "background removal service is not configured"
        )))
    }

    fn trim(&self, image: &ImageArtifact) -> Result<ImageArtifact, StepError> {
        Ok(image.clone())
    }

    fn enhance(
        &self,
        _image: &ImageArtifact,
        _settings: &ProcessingSettings,
    ) -> Result<ImageArtifact, StepError> {
        Err(StepError::execute(anyhow!("image enhancement is not available locally")))
    }

    fn convert_and_save(
        &self,
        image: &ImageArtifact,
        settings: &ProcessingSettings,
    ) -> Result<ImageArtifact, StepError> {
        let source_ext = image
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        let target_ext = settings.convert_to_format.extension();
        if settings.image_convert && source_ext.as_deref() != Some(target_ext) {
            return Err(StepError::execute(anyhow!(
                "converting to {target_ext} is not available locally"
            )));
        }

        let file_name = image
            .path
            .file_name()
            .ok_or_else(|| StepError::execute(anyhow!("{} has no file name", image.path.display())))?;
        let target = self.output_dir.join(file_name);

        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))
            .map_err(StepError::encode)?;
        fs::copy(&image.path, &target)
            .with_context(|| format!("copying {} to {}", image.path.display(), target.display()))
            .map_err(StepError::encode)?;

        Ok(ImageArtifact::new(target))
    }

    fn regenerate_metadata(
        &self,
        _image: &ImageArtifact,
        _record: &ImageRecord,
    ) -> Result<ImageMetadata, StepError> {
        Err(StepError::execute(anyhow!("metadata service is not configured")))
    }

    fn validate_output(&self, image: &ImageArtifact) -> Result<(), StepError> {
        let len = fs::metadata(&image.path)
            .with_context(|| format!("reading {}", image.path.display()))
            .map_err(StepError::execute)?
            .len();
        if len == 0 {
            return Err(StepError::execute(anyhow!("{} is empty", image.path.display())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("qcretry-cli-{}", uuid::Uuid::now_v7()))
    }

    #[test]
    fn copies_source_into_output_dir() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        let source = dir.join("a.png");
        fs::write(&source, b"not really a png").unwrap();

        let processor = LocalCopyProcessor::new(dir.join("out"));
        let saved = processor
            .convert_and_save(&ImageArtifact::new(&source), &ProcessingSettings::default())
            .unwrap();

        assert_eq!(saved.path, dir.join("out").join("a.png"));
        processor.validate_output(&saved).unwrap();

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_source_is_an_encode_failure() {
        let dir = temp_dir();
        let processor = LocalCopyProcessor::new(dir.join("out"));
        let err = processor
            .convert_and_save(&ImageArtifact::new(dir.join("gone.png")), &ProcessingSettings::default())
            .unwrap_err();
        assert_eq!(err.phase, qcretry_core::FailurePhase::Encode);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn format_change_is_refused() {
        let processor = LocalCopyProcessor::new(temp_dir());
        let settings = ProcessingSettings {
            image_convert: true,
            convert_to_format: qcretry_core::OutputFormat::Jpg,
            ..Default::default()
        };
        let err = processor
            .convert_and_save(&ImageArtifact::new("/tmp/a.png"), &settings)
            .unwrap_err();
        assert!(err.to_string().contains("jpg"));
    }
}

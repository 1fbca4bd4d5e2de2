//! Image-processing settings applied during (re)processing.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::policy::Step;

/// Output encoding for the convert/save step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpg,
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

/// Processing configuration for one image.
///
/// Stored on every image record as the "original" settings and supplied per
/// batch as "modified" settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingSettings {
    pub image_enhancement: bool,
    /// Sharpening strength, 0..=10.
    pub sharpening: u8,
    /// Saturation multiplier, 0.0..=2.0 (1.0 leaves colors untouched).
    pub saturation: f32,
    pub image_convert: bool,
    pub convert_to_format: OutputFormat,
    pub jpg_quality: u8,
    pub png_quality: u8,
    /// Fill color used when flattening transparency into a JPG.
    pub jpg_background: String,
    pub remove_bg: bool,
    pub remove_bg_size: String,
    pub trim_transparent_background: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            image_enhancement: false,
            sharpening: 5,
            saturation: 1.4,
            image_convert: false,
            convert_to_format: OutputFormat::Png,
            jpg_quality: 85,
            png_quality: 100,
            jpg_background: "white".to_string(),
            remove_bg: false,
            remove_bg_size: "auto".to_string(),
            trim_transparent_background: false,
        }
    }
}

impl ProcessingSettings {
    pub fn validate(&self) -> DomainResult<()> {
        if self.sharpening > 10 {
            return Err(DomainError::validation(format!(
                "sharpening must be within 0..=10 (got {})",
                self.sharpening
            )));
        }
        if !(self.saturation.is_finite() && (0.0..=2.0).contains(&self.saturation)) {
            return Err(DomainError::validation(format!(
                "saturation must be within 0.0..=2.0 (got {})",
                self.saturation
            )));
        }
        for (name, quality) in [("jpgQuality", self.jpg_quality), ("pngQuality", self.png_quality)] {
            if !(1..=100).contains(&quality) {
                return Err(DomainError::validation(format!(
                    "{name} must be within 1..=100 (got {quality})"
                )));
            }
        }
        if self.remove_bg && self.remove_bg_size.trim().is_empty() {
            return Err(DomainError::validation(
                "removeBgSize is required when removeBg is enabled",
            ));
        }
        Ok(())
    }

    /// Steps these settings turn on, in execution order.
    ///
    /// `convert` is always present: every retry re-encodes and saves its result.
    /// `metadata` is decided per job, not per image.
    pub fn enabled_steps(&self, include_metadata: bool) -> Vec<Step> {
        let mut steps = Vec::with_capacity(Step::ALL.len());
        if self.remove_bg {
            steps.push(Step::RemoveBg);
            if self.trim_transparent_background {
                steps.push(Step::Trim);
            }
        }
        if self.image_enhancement {
            steps.push(Step::Enhancement);
        }
        steps.push(Step::Convert);
        if include_metadata {
            steps.push(Step::Metadata);
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ProcessingSettings::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let settings = ProcessingSettings {
            jpg_quality: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(DomainError::Validation(msg)) if msg.contains("jpgQuality")));

        let settings = ProcessingSettings {
            saturation: f32::NAN,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn trim_requires_background_removal() {
        let settings = ProcessingSettings {
            trim_transparent_background: true,
            ..Default::default()
        };
        assert_eq!(settings.enabled_steps(false), vec![Step::Convert]);

        let settings = ProcessingSettings {
            remove_bg: true,
            trim_transparent_background: true,
            image_enhancement: true,
            ..Default::default()
        };
        assert_eq!(
            settings.enabled_steps(true),
            vec![
                Step::RemoveBg,
                Step::Trim,
                Step::Enhancement,
                Step::Convert,
                Step::Metadata
            ]
        );
    }

    #[test]
    fn deserializes_partial_camel_case_payload() {
        let settings: ProcessingSettings = serde_json::from_str(
            r#"{"imageEnhancement": true, "convertToFormat": "jpg", "jpgQuality": 70}"#,
        )
        .unwrap();
        assert!(settings.image_enhancement);
        assert_eq!(settings.convert_to_format, OutputFormat::Jpg);
        assert_eq!(settings.jpg_quality, 70);
        assert_eq!(settings.png_quality, 100);
    }
}

//! Pipeline configuration and its file loading.
//!
//! Every mode switch and threshold lives in [`PipelineConfig`], handed to the
//! engine at construction. Files are TOML or JSON, chosen by extension; missing
//! keys take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::DEFAULT_DEDUPE_IOU;
use crate::mask::{Padding, DEFAULT_COVERAGE_CEILING};
use crate::retry::RetryPolicy;
use crate::structural::StructuralValidator;

/// Which edit chain the engine starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum EditMode {
    /// Mask-guided inpaint, then content-aware removal, then occlusion.
    #[default]
    Generative,
    /// Local pixelation, then occlusion.
    Distort,
    /// Occlusion only.
    Occlude,
}

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    #[must_use]
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Everything that tunes a remediation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Edit chain to use.
    pub mode: EditMode,
    /// Also detect on the 180°-rotated image.
    pub multi_angle: bool,
    /// Detection risk below which the image is already clean.
    pub clean_threshold: f32,
    /// Verified risk at or below which no remediation pass runs.
    pub acceptable_risk: f32,
    /// Risk reported after masking, regardless of what the verifier says.
    pub masked_risk_score: f32,
    /// Risk assumed when detection is unavailable.
    pub degraded_risk_score: f32,
    /// Brands assumed when detection is unavailable and none were suspected.
    pub generic_brands: Vec<String>,
    /// IoU above which cross-angle detections are duplicates.
    pub dedupe_iou: f32,
    /// IoU above which residual regions are merged before remediation.
    pub merge_iou: f32,
    /// Growth applied to regions when rasterizing.
    pub padding: Padding,
    /// Mask coverage above which a mask is rejected.
    pub coverage_ceiling: f32,
    /// Longest allowed image side; larger inputs are downscaled.
    pub max_dimension: u32,
    /// Fill color for occlusion.
    pub occlusion_color: [u8; 3],
    /// Block edge for pixelation.
    pub pixelation_block: u32,
    /// Structural validation thresholds.
    pub structural: StructuralValidator,
    /// Retry policy for every capability call.
    pub retry: RetryPolicy,
    /// Concurrent runs in batch processing.
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: EditMode::default(),
            multi_angle: true,
            clean_threshold: 20.0,
            acceptable_risk: 30.0,
            masked_risk_score: 35.0,
            degraded_risk_score: 80.0,
            generic_brands: vec!["brand logo".to_string(), "brand text".to_string()],
            dedupe_iou: DEFAULT_DEDUPE_IOU,
            merge_iou: 0.3,
            padding: Padding::default(),
            coverage_ceiling: DEFAULT_COVERAGE_CEILING,
            max_dimension: 2048,
            occlusion_color: [0, 0, 0],
            pixelation_block: crate::editing::DEFAULT_PIXELATION_BLOCK,
            structural: StructuralValidator::default(),
            retry: RetryPolicy::default(),
            concurrency: 2,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a configuration file, format chosen by extension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the extension is unknown, the file cannot be
    /// read or parsed, or a value is out of range.
    pub fn load(path: &Path) -> Result<Self> {
        let format = ConfigFormat::from_extension(path).ok_or_else(|| {
            Error::Config(format!(
                "unsupported config file extension: {:?}",
                path.extension()
            ))
        })?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_str_with(&content, format)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on parse failure or out-of-range values.
    pub fn from_str_with(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))?,
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("failed to parse JSON config: {e}")))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every value is in range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("clean_threshold", self.clean_threshold),
            ("acceptable_risk", self.acceptable_risk),
            ("masked_risk_score", self.masked_risk_score),
            ("degraded_risk_score", self.degraded_risk_score),
        ] {
            check_range(name, value, 0.0, 100.0)?;
        }
        check_range("dedupe_iou", self.dedupe_iou, 0.0, 1.0)?;
        check_range("merge_iou", self.merge_iou, 0.0, 1.0)?;
        check_range("coverage_ceiling", self.coverage_ceiling, f32::EPSILON, 1.0)?;
        check_range(
            "structural.max_significant_ratio",
            self.structural.max_significant_ratio,
            0.0,
            1.0,
        )?;
        check_range("structural.max_avg_diff", self.structural.max_avg_diff, 0.0, 255.0)?;

        if let Padding::Percent(pct) = self.padding {
            if !pct.is_finite() || pct < 0.0 {
                return Err(Error::Config(format!(
                    "padding percent must be a non-negative number, got {pct}"
                )));
            }
        }
        for (name, value) in [
            ("max_dimension", self.max_dimension),
            ("structural.comparison_size", self.structural.comparison_size),
            ("retry.max_attempts", self.retry.max_attempts),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.pixelation_block < 2 {
            return Err(Error::Config("pixelation_block must be at least 2".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be positive".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{name} must be within {min}..={max}, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mode, EditMode::Generative);
        assert_relative_eq!(config.masked_risk_score, 35.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.structural.comparison_size, 512);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_str_with(
            r#"
mode = "distort"
masked_risk_score = 40
padding = { percent = 10.0 }

[retry]
max_attempts = 5
"#,
            ConfigFormat::Toml,
        )
        .unwrap();
        assert_eq!(config.mode, EditMode::Distort);
        assert_relative_eq!(config.masked_risk_score, 40.0);
        assert_eq!(config.padding, Padding::Percent(10.0));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_relative_eq!(config.clean_threshold, 20.0);
    }

    #[test]
    fn json_is_accepted() {
        let config = PipelineConfig::from_str_with(
            r#"{"mode": "occlude", "occlusion_color": [255, 255, 255], "padding": {"pixels": 0}}"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(config.mode, EditMode::Occlude);
        assert_eq!(config.occlusion_color, [255, 255, 255]);
        assert_eq!(config.padding, Padding::Pixels(0));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let bad = PipelineConfig {
            merge_iou: 1.5,
            ..PipelineConfig::default()
        };
        let msg = bad.validate().unwrap_err().to_string();
        assert!(msg.contains("merge_iou"));

        let bad = PipelineConfig {
            concurrency: 0,
            ..PipelineConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = PipelineConfig {
            masked_risk_score: f32::NAN,
            ..PipelineConfig::default()
        };
        assert!(bad.validate().is_err());

        assert!(PipelineConfig::from_str_with("mode = \"blur\"", ConfigFormat::Toml).is_err());
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("pipeline.toml");
        std::fs::write(&toml_path, "concurrency = 4\n").unwrap();
        assert_eq!(PipelineConfig::load(&toml_path).unwrap().concurrency, 4);

        let json_path = dir.path().join("pipeline.JSON");
        std::fs::write(&json_path, "{\"multi_angle\": false}").unwrap();
        assert!(!PipelineConfig::load(&json_path).unwrap().multi_angle);

        let yaml_path = dir.path().join("pipeline.yaml");
        std::fs::write(&yaml_path, "concurrency: 4").unwrap();
        assert!(matches!(
            PipelineConfig::load(&yaml_path),
            Err(Error::Config(_))
        ));
        assert!(PipelineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}

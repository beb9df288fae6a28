//! Pixel-level guard against edits that damage non-target content.
//!
//! Both images are reduced to a fixed-size grayscale thumbnail. A correct
//! brand-removal edit changes a small, local fraction of it; a recomposed
//! product changes most of it.

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::Image;

/// Confidence reported when the check itself could not run.
pub const FALLBACK_CONFIDENCE: f32 = 0.3;

/// Thresholds for [`StructuralValidator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralValidator {
    /// Edge of the square comparison thumbnail.
    pub comparison_size: u32,
    /// Mean absolute difference (0–255) at or above which an edit is rejected.
    pub max_avg_diff: f32,
    /// Fraction of significantly changed pixels at or above which an edit is rejected.
    pub max_significant_ratio: f32,
    /// Per-pixel difference counted as significant.
    pub pixel_threshold: u8,
}

impl Default for StructuralValidator {
    fn default() -> Self {
        Self {
            comparison_size: 512,
            max_avg_diff: 30.0,
            max_significant_ratio: 0.20,
            pixel_threshold: 50,
        }
    }
}

/// Outcome of a structural comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralVerdict {
    /// Whether the edit kept the image structure.
    pub is_valid: bool,
    /// How much the verdict can be trusted, 0–1.
    pub confidence: f32,
    /// Mean absolute grayscale difference, 0–255.
    pub avg_diff: f32,
    /// Fraction of pixels whose difference exceeds the per-pixel threshold.
    pub significant_ratio: f32,
    /// Why the edit was rejected, or why the check was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StructuralValidator {
    /// Compare `original` with `edited`.
    ///
    /// Never fails: if the comparison cannot run, the edit is reported valid with
    /// [`FALLBACK_CONFIDENCE`] and the problem is logged.
    #[must_use]
    pub fn validate(&self, original: &Image, edited: &Image) -> StructuralVerdict {
        match self.measure(original, edited) {
            Ok((avg_diff, significant_ratio)) => self.judge(avg_diff, significant_ratio),
            Err(e) => {
                warn!("structural check skipped: {e}");
                StructuralVerdict {
                    is_valid: true,
                    confidence: FALLBACK_CONFIDENCE,
                    avg_diff: 0.0,
                    significant_ratio: 0.0,
                    reason: Some(format!("check skipped: {e}")),
                }
            }
        }
    }

    /// Apply the thresholds to precomputed statistics.
    #[must_use]
    pub fn judge(&self, avg_diff: f32, significant_ratio: f32) -> StructuralVerdict {
        let too_different = avg_diff >= self.max_avg_diff;
        let too_widespread = significant_ratio >= self.max_significant_ratio;
        let reason = match (too_different, too_widespread) {
            (false, false) => None,
            (true, false) => Some(format!(
                "average difference {avg_diff:.1} exceeds {:.1}",
                self.max_avg_diff
            )),
            (false, true) => Some(format!(
                "{:.1}% of pixels changed significantly (limit {:.1}%)",
                significant_ratio * 100.0,
                self.max_significant_ratio * 100.0
            )),
            (true, true) => Some(format!(
                "average difference {avg_diff:.1} and {:.1}% changed pixels exceed limits",
                significant_ratio * 100.0
            )),
        };
        let is_valid = reason.is_none();

        // Distance from the nearest threshold, scaled into 0.5–1.0.
        let margin = (1.0 - avg_diff / self.max_avg_diff.max(f32::EPSILON))
            .abs()
            .min((1.0 - significant_ratio / self.max_significant_ratio.max(f32::EPSILON)).abs())
            .min(1.0);
        let confidence = 0.5 + margin / 2.0;

        debug!(avg_diff, significant_ratio, is_valid, "structural comparison");
        StructuralVerdict {
            is_valid,
            confidence,
            avg_diff,
            significant_ratio,
            reason,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn measure(&self, original: &Image, edited: &Image) -> Result<(f32, f32)> {
        if original.is_empty() || edited.is_empty() {
            return Err(Error::StructuralViolation("empty image".into()));
        }
        if self.comparison_size == 0 {
            return Err(Error::Config("comparison size must be positive".into()));
        }

        let a = self.thumbnail(original);
        let b = self.thumbnail(edited);

        let mut total = 0_u64;
        let mut significant = 0_u64;
        for (pa, pb) in a.pixels().zip(b.pixels()) {
            let diff = pa[0].abs_diff(pb[0]);
            total += u64::from(diff);
            if diff > self.pixel_threshold {
                significant += 1;
            }
        }
        let n = u64::from(a.width()) * u64::from(a.height());
        Ok((total as f32 / n as f32, significant as f32 / n as f32))
    }

    fn thumbnail(&self, image: &Image) -> GrayImage {
        let gray = imageops::grayscale(image.pixels());
        imageops::resize(
            &gray,
            self.comparison_size,
            self.comparison_size,
            FilterType::Triangle,
        )
    }
}

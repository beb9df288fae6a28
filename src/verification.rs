//! Offline verifier based on residual texture.
//!
//! Brand marks are high-contrast detail: lettering and logo edges. Occluded or
//! distorted regions lose that detail, so a region whose luminance spread has
//! collapsed is treated as cleaned and a region that still shows texture is
//! reported as residual.

use std::collections::BTreeSet;

use image::RgbImage;
use tracing::debug;

use crate::capability::{Detector, Verifier};
use crate::error::ProviderError;
use crate::geometry::PixelBox;
use crate::types::{Image, Verification};

/// Default minimum luminance standard deviation (in `[0, 1]`) counted as texture.
pub const DEFAULT_MIN_TEXTURE: f32 = 10.0 / 255.0;

/// Re-locates regions with a [`Detector`] and flags those that still show texture.
#[derive(Debug, Clone)]
pub struct ContrastVerifier<D> {
    locator: D,
    min_texture: f32,
    acceptable_risk: f32,
}

impl<D: Detector> ContrastVerifier<D> {
    /// Verifier using `locator` to find candidate regions.
    pub fn new(locator: D, acceptable_risk: f32) -> Self {
        Self {
            locator,
            min_texture: DEFAULT_MIN_TEXTURE,
            acceptable_risk,
        }
    }

    /// Override the texture threshold.
    #[must_use]
    pub fn with_min_texture(mut self, min_texture: f32) -> Self {
        self.min_texture = min_texture;
        self
    }
}

impl<D: Detector> Verifier for ContrastVerifier<D> {
    fn verify(
        &self,
        image: &Image,
        brands: &BTreeSet<String>,
    ) -> Result<Verification, ProviderError> {
        let located = self.locator.detect(image)?;
        let (w, h) = image.dimensions();

        let residual_regions: Vec<_> = located
            .regions
            .into_iter()
            .filter(|r| brands.is_empty() || brands.contains(&r.brand))
            .filter(|r| match r.to_pixel_box(w, h) {
                Ok(pb) => {
                    let texture = stddev(&region_to_grayscale(image.pixels(), pb));
                    debug!(brand = %r.brand, texture, "residual texture");
                    texture >= self.min_texture
                }
                Err(_) => false,
            })
            .collect();

        let risk_score = if residual_regions.is_empty() {
            0.0
        } else {
            located.risk_score.clamp(0.0, 100.0)
        };
        Ok(Verification {
            risk_score,
            is_clean: risk_score <= self.acceptable_risk,
            residual_regions,
        })
    }
}

/// Grayscale values in `[0, 1]` for a pixel box.
///
/// Uses luminance formula: `0.299*R + 0.587*G + 0.114*B`.
fn region_to_grayscale(img: &RgbImage, area: PixelBox) -> Vec<f32> {
    let mut gray = Vec::with_capacity(usize::try_from(area.area()).unwrap_or(0));
    for y in area.min_y..area.max_y.min(img.height()) {
        for x in area.min_x..area.max_x.min(img.width()) {
            let px = img.get_pixel(x, y);
            let lum =
                0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]);
            gray.push(lum / 255.0);
        }
    }
    gray
}

/// Compute standard deviation of a float slice.
fn stddev(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = data.len() as f32;
    let mean = data.iter().sum::<f32>() / n;
    let variance = data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    variance.sqrt()
}

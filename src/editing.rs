//! Edit strategies and the two local editors that never need a provider.
//!
//! Content-aware removal and mask-guided inpainting are external [`Editor`]s
//! supplied by the caller. Occlusion and pixelation run in-process on the pixel
//! buffer, so the pipeline always has a last resort that cannot fail for lack of
//! a network.

use std::collections::BTreeSet;
use std::fmt;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::capability::{EditHint, Editor};
use crate::error::ProviderError;
use crate::mask::{rasterize, Mask, Padding};
use crate::types::Image;

/// Default pixelation block edge in pixels.
pub const DEFAULT_PIXELATION_BLOCK: u32 = 12;

/// The interchangeable ways of removing brand content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Prompt-driven generative edit without a mask.
    ContentAware,
    /// Generative inpaint constrained to a rasterized mask.
    MaskInpaint,
    /// Downsample and blur the regions in place.
    Pixelate,
    /// Paint solid rectangles over the regions.
    Occlude,
}

impl Strategy {
    /// Whether the strategy relies on an external generative editor.
    #[must_use]
    pub fn is_generative(self) -> bool {
        matches!(self, Self::ContentAware | Self::MaskInpaint)
    }

    /// Whether the strategy only obscures content (and so yields a masked result).
    #[must_use]
    pub fn is_local(self) -> bool {
        !self.is_generative()
    }

    /// Whether the strategy needs a mask in its hint.
    #[must_use]
    pub fn needs_mask(self) -> bool {
        matches!(self, Self::MaskInpaint)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ContentAware => "content-aware",
            Self::MaskInpaint => "mask-inpaint",
            Self::Pixelate => "pixelate",
            Self::Occlude => "occlude",
        })
    }
}

/// The area a local editor works on: the hint's mask when it fits the image,
/// otherwise the hint's regions rasterized with `padding`.
fn target_mask(image: &Image, hint: &EditHint, padding: Padding) -> Result<Mask, ProviderError> {
    let (w, h) = image.dimensions();
    let mask = match &hint.mask {
        Some(m) if m.width() == w && m.height() == h && !m.is_blank() => m.clone(),
        _ => rasterize(&hint.regions, w, h, padding),
    };
    if mask.is_blank() {
        return Err(ProviderError::Permanent("no target area to edit".into()));
    }
    Ok(mask)
}

/// Paints every masked pixel with a solid color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcclusionEditor {
    /// Fill color.
    pub color: [u8; 3],
    /// Padding applied when rasterizing regions.
    pub padding: Padding,
}

impl Default for OcclusionEditor {
    fn default() -> Self {
        Self {
            color: [0, 0, 0],
            padding: Padding::default(),
        }
    }
}

impl OcclusionEditor {
    /// Occlusion with the given color and padding.
    #[must_use]
    pub fn new(color: [u8; 3], padding: Padding) -> Self {
        Self { color, padding }
    }

    /// Occlude `mask` on a copy of `image`.
    #[must_use]
    pub fn apply(&self, image: &Image, mask: &Mask) -> Image {
        let mut out = image.to_rgb8();
        let fill = Rgb(self.color);
        for (x, y, px) in out.enumerate_pixels_mut() {
            if mask.is_marked(x, y) {
                *px = fill;
            }
        }
        Image::new(out)
    }
}

impl Editor for OcclusionEditor {
    fn edit(
        &self,
        image: &Image,
        hint: &EditHint,
        _brands: &BTreeSet<String>,
    ) -> Result<Image, ProviderError> {
        let mask = target_mask(image, hint, self.padding)?;
        Ok(self.apply(image, &mask))
    }
}

/// Downsamples and blurs the masked area, keeping its rough shape and color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelationEditor {
    /// Edge of one pixelation block in pixels.
    pub block: u32,
    /// Padding applied when rasterizing regions.
    pub padding: Padding,
}

impl Default for PixelationEditor {
    fn default() -> Self {
        Self {
            block: DEFAULT_PIXELATION_BLOCK,
            padding: Padding::default(),
        }
    }
}

impl PixelationEditor {
    /// Pixelation with the given block size and padding.
    #[must_use]
    pub fn new(block: u32, padding: Padding) -> Self {
        Self {
            block: block.max(2),
            padding,
        }
    }

    /// Pixelate `mask` on a copy of `image`.
    #[must_use]
    pub fn apply(&self, image: &Image, mask: &Mask) -> Image {
        let mut out = image.to_rgb8();
        let Some(bounds) = mask.marked_bounds() else {
            return Image::new(out);
        };

        let crop = imageops::crop_imm(
            image.pixels(),
            bounds.min_x,
            bounds.min_y,
            bounds.width(),
            bounds.height(),
        )
        .to_image();
        let distorted = self.distort(&crop);

        for y in 0..bounds.height() {
            for x in 0..bounds.width() {
                let (ix, iy) = (bounds.min_x + x, bounds.min_y + y);
                if mask.is_marked(ix, iy) {
                    out.put_pixel(ix, iy, *distorted.get_pixel(x, y));
                }
            }
        }
        Image::new(out)
    }

    #[allow(clippy::cast_precision_loss)]
    fn distort(&self, crop: &RgbImage) -> RgbImage {
        let (w, h) = crop.dimensions();
        let block = self.block.max(2);
        let small_w = w.div_ceil(block).max(1);
        let small_h = h.div_ceil(block).max(1);

        let small = imageops::resize(crop, small_w, small_h, FilterType::Triangle);
        let blocky = imageops::resize(&small, w, h, FilterType::Nearest);
        imageops::blur(&blocky, block as f32 / 4.0)
    }
}

impl Editor for PixelationEditor {
    fn edit(
        &self,
        image: &Image,
        hint: &EditHint,
        _brands: &BTreeSet<String>,
    ) -> Result<Image, ProviderError> {
        let mask = target_mask(image, hint, self.padding)?;
        Ok(self.apply(image, &mask))
    }
}

//! Core data model shared by every pipeline stage.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{self, Box2d, CoordSpace, PixelBox, UnitPoint, PERMILLE, SNAP_EPSILON};

/// An immutable decoded RGB image.
///
/// Cloning is cheap: the pixel buffer is shared. Every stage that changes pixels
/// produces a new `Image`, so the chain original → edited → remediated stays
/// auditable.
#[derive(Clone)]
pub struct Image {
    pixels: Arc<RgbImage>,
}

impl Image {
    /// Wrap an RGB buffer.
    #[must_use]
    pub fn new(pixels: RgbImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// `(width, height)` in pixels.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Whether either side is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Borrow the pixel buffer.
    #[must_use]
    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Copy the pixel buffer out for editing.
    #[must_use]
    pub fn to_rgb8(&self) -> RgbImage {
        self.pixels.as_ref().clone()
    }

    /// A copy rotated by 180 degrees.
    #[must_use]
    pub fn rotated_180(&self) -> Self {
        Self::new(image::imageops::rotate180(self.pixels.as_ref()))
    }

    /// Whether both handles share the same pixel buffer.
    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({}x{})", self.width(), self.height())
    }
}

impl From<RgbImage> for Image {
    fn from(pixels: RgbImage) -> Self {
        Self::new(pixels)
    }
}

impl From<DynamicImage> for Image {
    fn from(img: DynamicImage) -> Self {
        Self::new(img.to_rgb8())
    }
}

/// What a region contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// A graphic mark.
    #[default]
    Logo,
    /// Brand lettering.
    Text,
    /// A badge, crest or embossed symbol.
    Emblem,
}

/// The outline of a region; the variant fixes its coordinate space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Axis-aligned box in the 0–1000 space.
    #[serde(rename = "box_2d")]
    Box2d(Box2d),
    /// Polygon in the 0–1 space.
    #[serde(rename = "polygon")]
    Polygon(Vec<UnitPoint>),
}

/// A detected or synthetic area of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Brand the region belongs to.
    pub brand: String,
    /// What the region contains.
    #[serde(default)]
    pub kind: RegionKind,
    /// Detection confidence, 0–100.
    #[serde(default)]
    pub confidence: f32,
    /// Outline of the region.
    #[serde(flatten)]
    pub shape: Shape,
}

impl Region {
    /// A logo region with a 0–1000 box.
    #[must_use]
    pub fn with_box(brand: impl Into<String>, bbox: Box2d, confidence: f32) -> Self {
        Self {
            brand: brand.into(),
            kind: RegionKind::Logo,
            confidence,
            shape: Shape::Box2d(bbox),
        }
    }

    /// A logo region with a 0–1 polygon.
    #[must_use]
    pub fn with_polygon(brand: impl Into<String>, points: Vec<UnitPoint>, confidence: f32) -> Self {
        Self {
            brand: brand.into(),
            kind: RegionKind::Logo,
            confidence,
            shape: Shape::Polygon(points),
        }
    }

    /// Tightest 0–1000 box enclosing the shape. Polygon bounds round outward.
    #[must_use]
    pub fn bounding_box(&self) -> Box2d {
        match &self.shape {
            Shape::Box2d(b) => *b,
            Shape::Polygon(points) => polygon_bounds(points),
        }
    }

    /// Pixel-space bounding box for an image of the given size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegenerateRegion`] if the region collapses after conversion.
    pub fn to_pixel_box(&self, width: u32, height: u32) -> Result<PixelBox> {
        match &self.shape {
            Shape::Box2d(b) => b.to_pixel_box(width, height),
            Shape::Polygon(points) => {
                let (min, max) = unit_extent(points).ok_or_else(|| {
                    Error::DegenerateRegion(format!("polygon for {} has no points", self.brand))
                })?;
                geometry::to_pixel_box(
                    [
                        f64::from(min.y),
                        f64::from(min.x),
                        f64::from(max.y),
                        f64::from(max.x),
                    ],
                    CoordSpace::Unit,
                    width,
                    height,
                )
            }
        }
    }

    /// Check the geometric invariants of the shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegenerateRegion`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() {
            return Err(Error::DegenerateRegion(format!(
                "{}: non-finite confidence",
                self.brand
            )));
        }
        match &self.shape {
            Shape::Box2d(b) => b.validate(),
            Shape::Polygon(points) => {
                if points.len() < 3 {
                    return Err(Error::DegenerateRegion(format!(
                        "{}: polygon needs at least 3 points, got {}",
                        self.brand,
                        points.len()
                    )));
                }
                if let Some(p) = points.iter().find(|p| !p.is_in_unit_square()) {
                    return Err(Error::DegenerateRegion(format!(
                        "{}: polygon point ({}, {}) outside 0-1",
                        self.brand, p.x, p.y
                    )));
                }
                self.bounding_box().validate()
            }
        }
    }

    /// Whether [`Region::validate`] succeeds.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The same region as seen in a 180°-rotated copy of the image (and back).
    #[must_use]
    pub fn rotated_180(&self) -> Self {
        let shape = match &self.shape {
            Shape::Box2d(b) => Shape::Box2d(geometry::invert_rotation_180(*b)),
            Shape::Polygon(points) => {
                Shape::Polygon(points.iter().map(UnitPoint::rotated_180).collect())
            }
        };
        Self {
            shape,
            ..self.clone()
        }
    }

    /// The region reduced to its bounding box.
    #[must_use]
    pub fn to_box_region(&self) -> Self {
        Self {
            shape: Shape::Box2d(self.bounding_box()),
            ..self.clone()
        }
    }
}

fn unit_extent(points: &[UnitPoint]) -> Option<(UnitPoint, UnitPoint)> {
    let first = *points.first()?;
    Some(points.iter().fold((first, first), |(min, max), p| {
        (
            UnitPoint::new(min.x.min(p.x), min.y.min(p.y)),
            UnitPoint::new(max.x.max(p.x), max.y.max(p.y)),
        )
    }))
}

#[allow(clippy::cast_possible_truncation)]
fn polygon_bounds(points: &[UnitPoint]) -> Box2d {
    let Some((min, max)) = unit_extent(points) else {
        return Box2d {
            ymin: 0,
            xmin: 0,
            ymax: 0,
            xmax: 0,
        };
    };
    let scale = f64::from(PERMILLE);
    let lo = |v: f32| ((f64::from(v) * scale + SNAP_EPSILON).floor() as i32).clamp(0, PERMILLE);
    let hi = |v: f32| ((f64::from(v) * scale - SNAP_EPSILON).ceil() as i32).clamp(0, PERMILLE);
    Box2d {
        ymin: lo(min.y),
        xmin: lo(min.x),
        ymax: hi(max.y),
        xmax: hi(max.x),
    }
}

/// Output of a detector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Brand names seen in the image.
    #[serde(default)]
    pub brands: BTreeSet<String>,
    /// Overall brand risk, 0–100.
    pub risk_score: f32,
    /// Regions in detection order.
    #[serde(default)]
    pub regions: Vec<Region>,
    /// Number of detection angles that contributed.
    #[serde(default = "one_pass")]
    pub passes: u8,
    /// Set when the detector was unavailable and this is a conservative stand-in.
    #[serde(default)]
    pub degraded: bool,
}

fn one_pass() -> u8 {
    1
}

impl DetectionResult {
    /// Conservative stand-in used when detection is unavailable: high risk, no regions.
    #[must_use]
    pub fn degraded(brands: BTreeSet<String>, risk_score: f32) -> Self {
        Self {
            brands,
            risk_score,
            regions: Vec::new(),
            passes: 0,
            degraded: true,
        }
    }
}

/// Output of a verifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// Remaining brand risk, 0–100.
    pub risk_score: f32,
    /// Where brand signal is still visible, if the verifier can tell.
    #[serde(default)]
    pub residual_regions: Vec<Region>,
    /// The verifier's own verdict.
    pub is_clean: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nike() -> Region {
        Region::with_box(
            "Nike",
            Box2d {
                ymin: 400,
                xmin: 150,
                ymax: 500,
                xmax: 250,
            },
            90.0,
        )
    }

    #[test]
    fn region_json_uses_box_2d_key() {
        let json = r#"{"brand":"Nike","kind":"text","confidence":88,"box_2d":[400,150,500,250]}"#;
        let region: Region = serde_json::from_str(json).unwrap();
        assert_eq!(region.kind, RegionKind::Text);
        assert_eq!(region.bounding_box(), nike().bounding_box());

        let back = serde_json::to_string(&region).unwrap();
        assert!(back.contains("\"box_2d\":[400,150,500,250]"));
    }

    #[test]
    fn polygon_region_parses_and_bounds_round_outward() {
        let json = r#"{"brand":"Puma","polygon":[[0.1,0.2],[0.3055,0.2],[0.3055,0.4]]}"#;
        let region: Region = serde_json::from_str(json).unwrap();
        assert!(region.is_valid());
        let b = region.bounding_box();
        assert_eq!((b.ymin, b.xmin), (200, 100));
        assert_eq!(b.xmax, 306);
    }

    #[test]
    fn polygon_with_two_points_is_degenerate() {
        let region = Region::with_polygon(
            "Puma",
            vec![UnitPoint::new(0.1, 0.1), UnitPoint::new(0.5, 0.5)],
            50.0,
        );
        assert!(matches!(region.validate(), Err(Error::DegenerateRegion(_))));
    }

    #[test]
    fn polygon_outside_unit_square_is_degenerate() {
        let region = Region::with_polygon(
            "Puma",
            vec![
                UnitPoint::new(0.1, 0.1),
                UnitPoint::new(1.5, 0.1),
                UnitPoint::new(0.1, 0.5),
            ],
            50.0,
        );
        assert!(!region.is_valid());
    }

    #[test]
    fn region_rotation_round_trips() {
        let region = nike();
        assert_eq!(region.rotated_180().rotated_180(), region);
    }

    #[test]
    fn image_rotation_moves_pixels_to_opposite_corner() {
        let mut px = RgbImage::new(4, 3);
        px.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let img = Image::new(px);
        let rotated = img.rotated_180();
        assert_eq!(rotated.pixels().get_pixel(3, 2), &image::Rgb([255, 0, 0]));
        assert_eq!(rotated.dimensions(), (4, 3));
        assert!(!rotated.same_buffer(&img));
        assert!(img.clone().same_buffer(&img));
    }

    #[test]
    fn detection_result_defaults_to_single_pass() {
        let json = r#"{"risk_score": 70, "brands": ["Nike"]}"#;
        let det: DetectionResult = serde_json::from_str(json).unwrap();
        assert_eq!(det.passes, 1);
        assert!(!det.degraded);
        assert!(det.regions.is_empty());
    }
}

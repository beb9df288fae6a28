//! Coordinate spaces, box overlap and region deduplication.
//!
//! Detection providers report boxes as `(ymin, xmin, ymax, xmax)` in a 0–1000
//! integer space and polygons as `(x, y)` pairs in a 0–1 float space. Everything
//! here is pure: no I/O, no logging beyond `debug`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::Region;

/// Upper bound of the 0–1000 box space.
pub const PERMILLE: i32 = 1000;

/// A converted edge this close to a whole pixel is float noise and lands on that
/// pixel, so `0.2_f32 * 100` maps to 20 rather than 21.
pub(crate) const SNAP_EPSILON: f64 = 1e-4;

/// IoU above which two detections of the same object collapse into one.
pub const DEFAULT_DEDUPE_IOU: f32 = 0.5;

/// Normalized coordinate space of a set of coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordSpace {
    /// Integers in `0..=1000`.
    Permille,
    /// Floats in `0.0..=1.0`.
    Unit,
}

impl CoordSpace {
    /// The value that maps to the full image extent.
    #[must_use]
    pub fn extent(self) -> f64 {
        match self {
            Self::Permille => f64::from(PERMILLE),
            Self::Unit => 1.0,
        }
    }
}

/// Axis-aligned box in the 0–1000 space, `(ymin, xmin, ymax, xmax)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct Box2d {
    /// Top edge.
    pub ymin: i32,
    /// Left edge.
    pub xmin: i32,
    /// Bottom edge.
    pub ymax: i32,
    /// Right edge.
    pub xmax: i32,
}

impl From<[i32; 4]> for Box2d {
    fn from([ymin, xmin, ymax, xmax]: [i32; 4]) -> Self {
        Self {
            ymin,
            xmin,
            ymax,
            xmax,
        }
    }
}

impl From<Box2d> for [i32; 4] {
    fn from(b: Box2d) -> Self {
        [b.ymin, b.xmin, b.ymax, b.xmax]
    }
}

impl Box2d {
    /// Build a box, checking its invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegenerateRegion`] if the box is empty, inverted or
    /// outside `0..=1000`.
    pub fn new(ymin: i32, xmin: i32, ymax: i32, xmax: i32) -> Result<Self> {
        let b = Self {
            ymin,
            xmin,
            ymax,
            xmax,
        };
        b.validate()?;
        Ok(b)
    }

    /// Check `0 <= min < max <= 1000` on both axes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegenerateRegion`] on violation.
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: i32| (0..=PERMILLE).contains(&v);
        if ![self.ymin, self.xmin, self.ymax, self.xmax]
            .into_iter()
            .all(in_range)
        {
            return Err(Error::DegenerateRegion(format!(
                "box {self:?} outside 0-{PERMILLE}"
            )));
        }
        if self.ymin >= self.ymax || self.xmin >= self.xmax {
            return Err(Error::DegenerateRegion(format!("box {self:?} has no area")));
        }
        Ok(())
    }

    /// Width in permille units, zero if inverted.
    #[must_use]
    pub fn width(&self) -> i32 {
        (self.xmax - self.xmin).max(0)
    }

    /// Height in permille units, zero if inverted.
    #[must_use]
    pub fn height(&self) -> i32 {
        (self.ymax - self.ymin).max(0)
    }

    /// Area in square permille units.
    #[must_use]
    pub fn area(&self) -> i64 {
        i64::from(self.width()) * i64::from(self.height())
    }

    /// Smallest box containing both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            ymin: self.ymin.min(other.ymin),
            xmin: self.xmin.min(other.xmin),
            ymax: self.ymax.max(other.ymax),
            xmax: self.xmax.max(other.xmax),
        }
    }

    /// Area shared by both boxes.
    #[must_use]
    pub fn intersection_area(&self, other: &Self) -> i64 {
        let w = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0);
        let h = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0);
        i64::from(w) * i64::from(h)
    }

    /// Convert to pixels for an image of the given size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegenerateRegion`] if the box collapses after conversion.
    pub fn to_pixel_box(&self, width: u32, height: u32) -> Result<PixelBox> {
        to_pixel_box(
            [
                f64::from(self.ymin),
                f64::from(self.xmin),
                f64::from(self.ymax),
                f64::from(self.xmax),
            ],
            CoordSpace::Permille,
            width,
            height,
        )
    }
}

/// A point in the 0–1 space, serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct UnitPoint {
    /// Horizontal position, 0 at the left edge.
    pub x: f32,
    /// Vertical position, 0 at the top edge.
    pub y: f32,
}

impl UnitPoint {
    /// Build a point.
    #[must_use]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Whether both coordinates are finite and within `0..=1`.
    #[must_use]
    pub fn is_in_unit_square(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }

    /// The same point in a 180°-rotated image.
    #[must_use]
    pub fn rotated_180(&self) -> Self {
        Self::new(1.0 - self.x, 1.0 - self.y)
    }
}

impl From<[f32; 2]> for UnitPoint {
    fn from([x, y]: [f32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<UnitPoint> for [f32; 2] {
    fn from(p: UnitPoint) -> Self {
        [p.x, p.y]
    }
}

/// A box in pixel coordinates. `min` is inclusive, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelBox {
    /// Left column.
    pub min_x: u32,
    /// Top row.
    pub min_y: u32,
    /// One past the right column.
    pub max_x: u32,
    /// One past the bottom row.
    pub max_y: u32,
}

impl PixelBox {
    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    /// Number of pixels covered.
    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Grow by `dx`/`dy` on every edge, clamped to a `width` x `height` image.
    #[must_use]
    pub fn expand(&self, dx: u32, dy: u32, width: u32, height: u32) -> Self {
        Self {
            min_x: self.min_x.saturating_sub(dx),
            min_y: self.min_y.saturating_sub(dy),
            max_x: self.max_x.saturating_add(dx).min(width),
            max_y: self.max_y.saturating_add(dy).min(height),
        }
    }
}

/// Convert `(ymin, xmin, ymax, xmax)` in `space` to pixels.
///
/// Min edges round down and max edges round up, so the pixel box never covers
/// less than the source box. The result is clamped to the image.
///
/// # Errors
///
/// Returns [`Error::DegenerateRegion`] for non-finite input or when
/// `max <= min` on either axis after conversion.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_pixel_box(
    coords: [f64; 4],
    space: CoordSpace,
    width: u32,
    height: u32,
) -> Result<PixelBox> {
    if coords.iter().any(|c| !c.is_finite()) {
        return Err(Error::DegenerateRegion(format!(
            "non-finite coordinates {coords:?}"
        )));
    }
    let [ymin, xmin, ymax, xmax] = coords;
    let extent = space.extent();
    let scale = |v: f64, size: u32| v * f64::from(size) / extent;
    let clamp = |v: f64, size: u32| v.clamp(0.0, f64::from(size)) as u32;

    let pixel = PixelBox {
        min_x: clamp(snap(scale(xmin, width)).floor(), width),
        min_y: clamp(snap(scale(ymin, height)).floor(), height),
        max_x: clamp(snap(scale(xmax, width)).ceil(), width),
        max_y: clamp(snap(scale(ymax, height)).ceil(), height),
    };

    if pixel.max_x <= pixel.min_x || pixel.max_y <= pixel.min_y {
        return Err(Error::DegenerateRegion(format!(
            "{coords:?} collapses to {pixel:?} on a {width}x{height} image"
        )));
    }
    Ok(pixel)
}

fn snap(v: f64) -> f64 {
    let nearest = v.round();
    if (v - nearest).abs() < SNAP_EPSILON {
        nearest
    } else {
        v
    }
}

/// Map a box found in a 180°-rotated image back to the original orientation.
///
/// Applying it twice returns the input.
#[must_use]
pub fn invert_rotation_180(b: Box2d) -> Box2d {
    Box2d {
        ymin: PERMILLE - b.ymax,
        xmin: PERMILLE - b.xmax,
        ymax: PERMILLE - b.ymin,
        xmax: PERMILLE - b.xmin,
    }
}

/// Intersection over union of two boxes in the same space, in `[0, 1]`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn iou(a: &Box2d, b: &Box2d) -> f32 {
    let intersection = a.intersection_area(b);
    let union = a.area() + b.area() - intersection;
    if union <= 0 {
        return 0.0;
    }
    (intersection as f64 / union as f64) as f32
}

/// Drop regions that fail their geometric invariants; clamp confidences to 0–100.
#[must_use]
pub fn sanitize_regions(regions: Vec<Region>) -> Vec<Region> {
    regions
        .into_iter()
        .filter_map(|mut region| match region.validate() {
            Ok(()) => {
                region.confidence = region.confidence.clamp(0.0, 100.0);
                Some(region)
            }
            Err(e) => {
                debug!(brand = %region.brand, "dropping region: {e}");
                None
            }
        })
        .collect()
}

/// Greedily cluster overlapping regions into their union boxes.
///
/// Each unclustered region, in input order, starts an envelope that absorbs every
/// later region whose IoU with the growing envelope exceeds `iou_threshold`. The
/// pass repeats until nothing merges, so the output is a fixed point: merging it
/// again changes nothing. Output regions are boxes carrying the first member's
/// brand and kind and the highest member confidence. Invalid regions are dropped.
#[must_use]
pub fn merge_overlapping(regions: &[Region], iou_threshold: f32) -> Vec<Region> {
    let mut current: Vec<Region> = regions
        .iter()
        .filter(|r| r.is_valid())
        .map(Region::to_box_region)
        .collect();

    loop {
        let (next, merged_any) = merge_pass(&current, iou_threshold);
        current = next;
        if !merged_any {
            return current;
        }
    }
}

fn merge_pass(regions: &[Region], iou_threshold: f32) -> (Vec<Region>, bool) {
    let mut absorbed = vec![false; regions.len()];
    let mut clusters = Vec::with_capacity(regions.len());
    let mut merged_any = false;

    for i in 0..regions.len() {
        if absorbed[i] {
            continue;
        }
        let mut cluster = regions[i].clone();
        let mut envelope = cluster.bounding_box();

        for j in (i + 1)..regions.len() {
            if absorbed[j] {
                continue;
            }
            let candidate = regions[j].bounding_box();
            if iou(&envelope, &candidate) > iou_threshold {
                envelope = envelope.union(&candidate);
                cluster.confidence = cluster.confidence.max(regions[j].confidence);
                absorbed[j] = true;
                merged_any = true;
            }
        }

        cluster.shape = crate::types::Shape::Box2d(envelope);
        clusters.push(cluster);
    }

    (clusters, merged_any)
}

/// Drop later regions that duplicate an already kept one.
///
/// A region is a duplicate when its IoU with any kept region exceeds
/// `iou_threshold`; the first-seen region keeps its shape unchanged.
#[must_use]
pub fn dedupe_by_iou(regions: Vec<Region>, iou_threshold: f32) -> Vec<Region> {
    let mut kept: Vec<Region> = Vec::with_capacity(regions.len());
    for region in regions {
        let bbox = region.bounding_box();
        if kept
            .iter()
            .any(|k| iou(&k.bounding_box(), &bbox) > iou_threshold)
        {
            debug!(brand = %region.brand, "dropping duplicate detection");
            continue;
        }
        kept.push(region);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Shape;
    use approx::assert_relative_eq;

    fn b(ymin: i32, xmin: i32, ymax: i32, xmax: i32) -> Box2d {
        Box2d {
            ymin,
            xmin,
            ymax,
            xmax,
        }
    }

    fn sample_boxes() -> Vec<Box2d> {
        vec![
            b(0, 0, 1000, 1000),
            b(400, 150, 500, 250),
            b(0, 0, 1, 1),
            b(999, 999, 1000, 1000),
            b(123, 456, 789, 987),
            b(10, 900, 20, 1000),
        ]
    }

    #[test]
    fn rotation_inverse_is_an_involution() {
        for bx in sample_boxes() {
            assert_eq!(invert_rotation_180(invert_rotation_180(bx)), bx);
            assert!(invert_rotation_180(bx).validate().is_ok());
        }
    }

    #[test]
    fn rotation_inverse_maps_corners() {
        assert_eq!(
            invert_rotation_180(b(400, 150, 500, 250)),
            b(500, 750, 600, 850)
        );
    }

    #[test]
    fn iou_is_symmetric_and_bounded() {
        let boxes = sample_boxes();
        for a in &boxes {
            assert_relative_eq!(iou(a, a), 1.0);
            for c in &boxes {
                let v = iou(a, c);
                assert!((0.0..=1.0).contains(&v), "iou {v} out of range");
                assert_relative_eq!(v, iou(c, a));
            }
        }
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_relative_eq!(iou(&b(0, 0, 10, 10), &b(20, 20, 30, 30)), 0.0);
        // Touching edges share no area.
        assert_relative_eq!(iou(&b(0, 0, 10, 10), &b(0, 10, 10, 20)), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        // Two 10x10 boxes sharing a 5x10 strip: 50 / 150.
        assert_relative_eq!(
            iou(&b(0, 0, 10, 10), &b(0, 5, 10, 15)),
            1.0 / 3.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn pixel_conversion_rounds_outward() {
        let px = to_pixel_box([333.0, 333.0, 667.0, 667.0], CoordSpace::Permille, 100, 100)
            .unwrap();
        assert_eq!((px.min_x, px.min_y, px.max_x, px.max_y), (33, 33, 67, 67));

        let px = b(400, 150, 500, 250).to_pixel_box(640, 480).unwrap();
        assert_eq!((px.min_x, px.min_y, px.max_x, px.max_y), (96, 192, 160, 240));
    }

    #[test]
    fn pixel_conversion_of_unit_space() {
        let px = to_pixel_box([0.25, 0.5, 0.75, 1.0], CoordSpace::Unit, 200, 100).unwrap();
        assert_eq!((px.min_x, px.min_y, px.max_x, px.max_y), (100, 25, 200, 75));
    }

    #[test]
    fn pixel_conversion_rejects_degenerate_boxes() {
        assert!(matches!(
            to_pixel_box([500.0, 500.0, 500.0, 600.0], CoordSpace::Permille, 100, 100),
            Err(Error::DegenerateRegion(_))
        ));
        assert!(to_pixel_box([f64::NAN, 0.0, 1.0, 1.0], CoordSpace::Unit, 10, 10).is_err());
        // Entirely outside the image collapses after clamping.
        assert!(to_pixel_box([1.5, 1.5, 2.0, 2.0], CoordSpace::Unit, 10, 10).is_err());
    }

    #[test]
    fn pixel_conversion_only_snaps_near_whole_pixels() {
        // Just past a pixel edge still claims the next pixel.
        let px = to_pixel_box([10.2, 10.2, 50.3, 50.3], CoordSpace::Permille, 1000, 1000)
            .unwrap();
        assert_eq!((px.min_x, px.min_y, px.max_x, px.max_y), (10, 10, 51, 51));
        let px = to_pixel_box([0.0, 0.0, 0.500_2, 0.500_2], CoordSpace::Unit, 1000, 1000)
            .unwrap();
        assert_eq!((px.max_x, px.max_y), (501, 501));

        // f32 noise around a whole pixel does not add one.
        let edge = f64::from(0.2_f32);
        let px = to_pixel_box([0.0, 0.0, edge, edge], CoordSpace::Unit, 100, 100).unwrap();
        assert_eq!((px.max_x, px.max_y), (20, 20));
        let px = to_pixel_box([edge, edge, 1.0, 1.0], CoordSpace::Unit, 100, 100).unwrap();
        assert_eq!((px.min_x, px.min_y), (20, 20));
    }

    #[test]
    fn pixel_conversion_never_under_covers_tiny_boxes() {
        let px = b(500, 500, 501, 501).to_pixel_box(10, 10).unwrap();
        assert_eq!((px.width(), px.height()), (1, 1));
    }

    #[test]
    fn box_validation() {
        assert!(Box2d::new(0, 0, 1000, 1000).is_ok());
        assert!(Box2d::new(10, 10, 10, 20).is_err());
        assert!(Box2d::new(20, 10, 10, 20).is_err());
        assert!(Box2d::new(-1, 0, 10, 10).is_err());
        assert!(Box2d::new(0, 0, 10, 1001).is_err());
    }

    #[test]
    fn expand_clamps_to_image() {
        let px = PixelBox {
            min_x: 2,
            min_y: 5,
            max_x: 8,
            max_y: 9,
        };
        let grown = px.expand(4, 4, 10, 10);
        assert_eq!(
            grown,
            PixelBox {
                min_x: 0,
                min_y: 1,
                max_x: 10,
                max_y: 10
            }
        );
    }

    fn region(brand: &str, bx: Box2d, confidence: f32) -> Region {
        Region::with_box(brand, bx, confidence)
    }

    #[test]
    fn merge_combines_overlaps_into_union_box() {
        let regions = vec![
            region("Nike", b(400, 150, 500, 250), 60.0),
            region("Nike", b(410, 160, 510, 260), 90.0),
            region("Adidas", b(0, 0, 50, 50), 70.0),
        ];
        let merged = merge_overlapping(&regions, 0.3);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].brand, "Nike");
        assert_eq!(merged[0].bounding_box(), b(400, 150, 510, 260));
        assert_relative_eq!(merged[0].confidence, 90.0);
        assert_eq!(merged[1].bounding_box(), b(0, 0, 50, 50));
    }

    #[test]
    fn merge_follows_growing_envelope() {
        // A chain where the third box only overlaps the grown envelope enough.
        let regions = vec![
            region("A", b(0, 0, 100, 100), 50.0),
            region("A", b(0, 50, 100, 150), 50.0),
            region("A", b(0, 80, 100, 190), 50.0),
        ];
        let merged = merge_overlapping(&regions, 0.3);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].bounding_box(), b(0, 0, 100, 190));
    }

    #[test]
    fn merge_is_idempotent() {
        let inputs = vec![
            vec![
                region("A", b(0, 0, 100, 100), 50.0),
                region("B", b(300, 300, 400, 400), 50.0),
                region("A", b(0, 60, 100, 160), 50.0),
                region("C", b(0, 130, 100, 260), 50.0),
                region("B", b(320, 320, 420, 420), 50.0),
            ],
            vec![
                region("A", b(0, 0, 10, 10), 10.0),
                region("A", b(0, 0, 10, 10), 20.0),
            ],
            Vec::new(),
        ];
        for threshold in [0.0, 0.1, 0.3, 0.5, 0.9] {
            for rs in &inputs {
                let once = merge_overlapping(rs, threshold);
                let twice = merge_overlapping(&once, threshold);
                assert_eq!(once, twice, "threshold {threshold}");
            }
        }
    }

    #[test]
    fn merge_drops_invalid_regions_and_boxes_polygons() {
        let regions = vec![
            region("bad", b(10, 10, 10, 10), 50.0),
            Region::with_polygon(
                "poly",
                vec![
                    UnitPoint::new(0.1, 0.1),
                    UnitPoint::new(0.2, 0.1),
                    UnitPoint::new(0.2, 0.3),
                ],
                40.0,
            ),
        ];
        let merged = merge_overlapping(&regions, 0.5);
        assert_eq!(merged.len(), 1);
        assert!(matches!(merged[0].shape, Shape::Box2d(_)));
        assert_eq!(merged[0].bounding_box(), b(100, 100, 300, 200));
    }

    #[test]
    fn dedupe_keeps_first_seen_shape() {
        let first = region("Nike", b(400, 150, 500, 250), 60.0);
        let regions = vec![
            first.clone(),
            region("Nike", b(405, 155, 505, 255), 95.0),
            region("Nike", b(700, 700, 800, 800), 80.0),
        ];
        let deduped = dedupe_by_iou(regions, DEFAULT_DEDUPE_IOU);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], first);
        assert_eq!(deduped[1].bounding_box(), b(700, 700, 800, 800));
    }

    #[test]
    fn sanitize_drops_degenerate_and_clamps_confidence() {
        let regions = vec![
            region("ok", b(0, 0, 10, 10), 250.0),
            region("empty", b(0, 0, 0, 10), 50.0),
            region("nan", b(0, 0, 10, 10), f32::NAN),
        ];
        let clean = sanitize_regions(regions);
        assert_eq!(clean.len(), 1);
        assert_relative_eq!(clean[0].confidence, 100.0);
    }
}

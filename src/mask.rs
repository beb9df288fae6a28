//! Region rasterization into binary masks.
//!
//! Boxes are filled directly in pixel space. Polygons are drawn on a scratch
//! canvas, dilated with a Chebyshev (`LInf`) radius equal to their padding and
//! then OR-ed into the mask, so every shape grows by the same amount on every
//! edge. Shapes only ever add coverage; a later region never erases an earlier one.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::morphology;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::geometry::PixelBox;
use crate::types::{Region, Shape};

/// Fraction of the image above which a mask is treated as a detection error.
pub const DEFAULT_COVERAGE_CEILING: f32 = 0.5;

const MARKED: Luma<u8> = Luma([255]);

/// How far each region grows before rasterization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// A fixed number of pixels on every edge.
    Pixels(u32),
    /// A percentage of the region's width (horizontally) and height (vertically).
    Percent(f32),
}

impl Default for Padding {
    fn default() -> Self {
        Self::Pixels(8)
    }
}

impl Padding {
    /// Horizontal and vertical padding in pixels for a region of the given size.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn resolve(self, region_width: u32, region_height: u32) -> (u32, u32) {
        match self {
            Self::Pixels(px) => (px, px),
            Self::Percent(pct) => {
                let pct = if pct.is_finite() { pct.max(0.0) } else { 0.0 };
                let frac = f64::from(pct) / 100.0;
                (
                    (f64::from(region_width) * frac).ceil() as u32,
                    (f64::from(region_height) * frac).ceil() as u32,
                )
            }
        }
    }
}

/// A binary raster the size of its source image. Marked pixels hold 255.
#[derive(Clone, PartialEq, Eq)]
pub struct Mask {
    bitmap: GrayImage,
}

impl std::fmt::Debug for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Mask({}x{}, {:.1}% marked)",
            self.width(),
            self.height(),
            self.coverage_ratio() * 100.0
        )
    }
}

impl Mask {
    /// An unmarked mask.
    #[must_use]
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            bitmap: GrayImage::new(width, height),
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }

    /// Whether the pixel at `(x, y)` is marked. Out-of-range pixels are not.
    #[must_use]
    pub fn is_marked(&self, x: u32, y: u32) -> bool {
        x < self.width() && y < self.height() && self.bitmap.get_pixel(x, y)[0] > 0
    }

    /// Number of marked pixels.
    #[must_use]
    pub fn marked_pixels(&self) -> u64 {
        self.bitmap.as_raw().iter().map(|&v| u64::from(v > 0)).sum()
    }

    /// Whether no pixel is marked.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.bitmap.as_raw().iter().all(|&v| v == 0)
    }

    /// Fraction of pixels marked, in `[0, 1]`. An empty raster has coverage 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn coverage_ratio(&self) -> f32 {
        let total = u64::from(self.width()) * u64::from(self.height());
        if total == 0 {
            return 0.0;
        }
        (self.marked_pixels() as f64 / total as f64) as f32
    }

    /// The raw 0/255 bitmap, e.g. for inpainting providers.
    #[must_use]
    pub fn as_gray(&self) -> &GrayImage {
        &self.bitmap
    }

    /// Tightest pixel box around the marked pixels, if any.
    #[must_use]
    pub fn marked_bounds(&self) -> Option<PixelBox> {
        let mut bounds: Option<PixelBox> = None;
        for (x, y, px) in self.bitmap.enumerate_pixels() {
            if px[0] == 0 {
                continue;
            }
            let b = bounds.get_or_insert(PixelBox {
                min_x: x,
                min_y: y,
                max_x: x + 1,
                max_y: y + 1,
            });
            b.min_x = b.min_x.min(x);
            b.min_y = b.min_y.min(y);
            b.max_x = b.max_x.max(x + 1);
            b.max_y = b.max_y.max(y + 1);
        }
        bounds
    }

    fn fill(&mut self, b: PixelBox) {
        for y in b.min_y..b.max_y {
            for x in b.min_x..b.max_x {
                self.bitmap.put_pixel(x, y, MARKED);
            }
        }
    }
}

/// Fraction of pixels marked in `mask`.
#[must_use]
pub fn coverage_ratio(mask: &Mask) -> f32 {
    mask.coverage_ratio()
}

/// Reject masks whose coverage exceeds `ceiling`.
///
/// # Errors
///
/// Returns [`Error::MaskRejected`] when the mask is implausibly large.
pub fn check_coverage(mask: &Mask, ceiling: f32) -> Result<()> {
    let coverage = mask.coverage_ratio();
    if coverage > ceiling {
        return Err(Error::MaskRejected { coverage, ceiling });
    }
    Ok(())
}

/// Rasterize `regions` onto a `width` x `height` mask, growing each by `padding`.
///
/// Degenerate regions are skipped. The result depends only on the arguments.
#[must_use]
pub fn rasterize(regions: &[Region], width: u32, height: u32, padding: Padding) -> Mask {
    let mut mask = Mask::empty(width, height);
    if width == 0 || height == 0 {
        return mask;
    }

    for region in regions {
        if let Err(e) = region.validate() {
            debug!(brand = %region.brand, "skipping region in mask: {e}");
            continue;
        }
        let bounds = match region.to_pixel_box(width, height) {
            Ok(b) => b,
            Err(e) => {
                debug!(brand = %region.brand, "skipping region in mask: {e}");
                continue;
            }
        };
        let (dx, dy) = padding.resolve(bounds.width(), bounds.height());

        match &region.shape {
            Shape::Box2d(_) => mask.fill(bounds.expand(dx, dy, width, height)),
            Shape::Polygon(points) => {
                let vertices: Vec<(f64, f64)> = points
                    .iter()
                    .map(|p| {
                        (
                            f64::from(p.x) * f64::from(width),
                            f64::from(p.y) * f64::from(height),
                        )
                    })
                    .collect();
                draw_padded_polygon(&mut mask, &vertices, bounds, dx.max(dy));
            }
        }
    }

    mask
}

/// Draw a pixel-space polygon on a scratch canvas around `bounds`, dilate it by
/// `pad` and merge it into `mask`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn draw_padded_polygon(mask: &mut Mask, vertices: &[(f64, f64)], bounds: PixelBox, pad: u32) {
    // Dilation radius is a u8 in imageproc.
    let pad = pad.min(u32::from(u8::MAX));
    let origin_x = i64::from(bounds.min_x) - i64::from(pad);
    let origin_y = i64::from(bounds.min_y) - i64::from(pad);
    // One extra column/row so vertices on the max edge stay on the canvas.
    let canvas_w = bounds.width() + 2 * pad + 1;
    let canvas_h = bounds.height() + 2 * pad + 1;

    let mut points: Vec<Point<i32>> = Vec::with_capacity(vertices.len());
    for &(x, y) in vertices {
        let p = Point::new(
            (x.round() as i64 - origin_x) as i32,
            (y.round() as i64 - origin_y) as i32,
        );
        if points.last() != Some(&p) {
            points.push(p);
        }
    }
    // imageproc expects an open polygon.
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    let mut canvas = GrayImage::new(canvas_w, canvas_h);
    if points.len() >= 3 {
        draw_polygon_mut(&mut canvas, &points, MARKED);
    } else {
        // Polygon collapsed to a line or point at this resolution: cover its box.
        for y in pad..pad + bounds.height() {
            for x in pad..pad + bounds.width() {
                canvas.put_pixel(x, y, MARKED);
            }
        }
    }
    if pad > 0 {
        canvas = morphology::dilate(&canvas, Norm::LInf, pad as u8);
    }

    for (cx, cy, px) in canvas.enumerate_pixels() {
        if px[0] == 0 {
            continue;
        }
        let x = i64::from(cx) + origin_x;
        let y = i64::from(cy) + origin_y;
        if x >= 0 && y >= 0 && x < i64::from(mask.width()) && y < i64::from(mask.height()) {
            mask.bitmap.put_pixel(x as u32, y as u32, MARKED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Box2d, UnitPoint};
    use approx::assert_relative_eq;

    fn boxed(ymin: i32, xmin: i32, ymax: i32, xmax: i32) -> Region {
        Region::with_box(
            "Nike",
            Box2d {
                ymin,
                xmin,
                ymax,
                xmax,
            },
            90.0,
        )
    }

    #[test]
    fn box_rasterizes_to_exact_pixels_without_padding() {
        let mask = rasterize(&[boxed(100, 200, 300, 400)], 100, 100, Padding::Pixels(0));
        assert_eq!(mask.marked_pixels(), 20 * 20);
        assert!(mask.is_marked(20, 10));
        assert!(mask.is_marked(39, 29));
        assert!(!mask.is_marked(40, 29));
        assert!(!mask.is_marked(19, 10));
    }

    #[test]
    fn padding_grows_every_edge_and_clamps() {
        let mask = rasterize(&[boxed(0, 0, 100, 100)], 100, 100, Padding::Pixels(5));
        // 10x10 box at the corner grows only right and down.
        assert_eq!(mask.marked_pixels(), 15 * 15);

        let mask = rasterize(&[boxed(400, 400, 600, 600)], 100, 100, Padding::Percent(50.0));
        // 20x20 box grows by 10 on each edge.
        assert_eq!(mask.marked_pixels(), 40 * 40);
    }

    #[test]
    fn rasterization_is_deterministic() {
        let regions = vec![
            boxed(100, 100, 200, 300),
            Region::with_polygon(
                "Puma",
                vec![
                    UnitPoint::new(0.5, 0.5),
                    UnitPoint::new(0.8, 0.55),
                    UnitPoint::new(0.6, 0.9),
                ],
                70.0,
            ),
        ];
        let a = rasterize(&regions, 64, 48, Padding::Pixels(3));
        let b = rasterize(&regions, 64, 48, Padding::Pixels(3));
        assert_eq!(a.as_gray().as_raw(), b.as_gray().as_raw());
    }

    #[test]
    fn adding_regions_never_decreases_coverage() {
        let candidates = vec![
            boxed(0, 0, 100, 100),
            boxed(50, 50, 150, 150),
            boxed(900, 900, 1000, 1000),
            boxed(10, 10, 10, 10),
            Region::with_polygon(
                "Puma",
                vec![
                    UnitPoint::new(0.2, 0.2),
                    UnitPoint::new(0.4, 0.2),
                    UnitPoint::new(0.3, 0.45),
                ],
                70.0,
            ),
        ];
        let mut regions = Vec::new();
        let mut previous = 0.0;
        for r in candidates {
            regions.push(r);
            let coverage = rasterize(&regions, 80, 60, Padding::Pixels(2)).coverage_ratio();
            assert!(coverage >= previous, "{coverage} < {previous}");
            previous = coverage;
        }
    }

    #[test]
    fn polygon_fills_interior_and_respects_padding() {
        let square = Region::with_polygon(
            "Puma",
            vec![
                UnitPoint::new(0.2, 0.2),
                UnitPoint::new(0.6, 0.2),
                UnitPoint::new(0.6, 0.6),
                UnitPoint::new(0.2, 0.6),
            ],
            70.0,
        );
        let plain = rasterize(std::slice::from_ref(&square), 100, 100, Padding::Pixels(0));
        assert!(plain.is_marked(40, 40));
        assert!(!plain.is_marked(10, 10));

        let padded = rasterize(std::slice::from_ref(&square), 100, 100, Padding::Pixels(4));
        assert!(padded.is_marked(17, 17));
        assert!(!padded.is_marked(10, 10));
        assert!(padded.marked_pixels() > plain.marked_pixels());
    }

    #[test]
    fn degenerate_regions_are_skipped() {
        let mask = rasterize(&[boxed(500, 500, 500, 600)], 50, 50, Padding::Pixels(3));
        assert!(mask.is_blank());
        assert_eq!(mask.marked_bounds(), None);
    }

    #[test]
    fn coverage_ceiling_rejects_oversized_masks() {
        let small = rasterize(&[boxed(0, 0, 100, 100)], 100, 100, Padding::Pixels(0));
        assert!(check_coverage(&small, DEFAULT_COVERAGE_CEILING).is_ok());

        let huge = rasterize(&[boxed(0, 0, 1000, 800)], 100, 100, Padding::Pixels(0));
        assert_relative_eq!(coverage_ratio(&huge), 0.8);
        assert!(matches!(
            check_coverage(&huge, DEFAULT_COVERAGE_CEILING),
            Err(Error::MaskRejected { .. })
        ));
    }

    #[test]
    fn marked_bounds_cover_all_shapes() {
        let mask = rasterize(
            &[boxed(100, 100, 200, 200), boxed(700, 600, 800, 900)],
            100,
            100,
            Padding::Pixels(0),
        );
        assert_eq!(
            mask.marked_bounds(),
            Some(PixelBox {
                min_x: 10,
                min_y: 10,
                max_x: 90,
                max_y: 80
            })
        );
    }

    #[test]
    fn empty_image_has_zero_coverage() {
        let mask = rasterize(&[boxed(0, 0, 1000, 1000)], 0, 0, Padding::Pixels(0));
        assert_relative_eq!(mask.coverage_ratio(), 0.0);
    }
}

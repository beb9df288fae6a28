//! Single- and multi-angle detection on top of a [`Detector`].
//!
//! Multi-angle detection runs the detector on the image and on a 180°-rotated
//! copy, maps the second pass back to the original orientation and collapses
//! duplicates:
//! 1. **Upright pass**: must succeed, otherwise detection fails
//! 2. **Rotated pass**: optional; a failure leaves the upright result with `passes = 1`
//! 3. **Combination**: regions deduplicated by IoU, brands unioned, risk is a conservative max

use tracing::{debug, warn};

use crate::capability::Detector;
use crate::error::ProviderError;
use crate::geometry::{dedupe_by_iou, sanitize_regions};
use crate::retry::{CancelToken, RetryPolicy};
use crate::types::{DetectionResult, Image};

/// Run the detector once (with retries) and clean up what it returned.
///
/// Degenerate regions are dropped and the risk score is clamped to 0–100.
///
/// # Errors
///
/// Returns the detector's last error after retries, or
/// [`ProviderError::Cancelled`].
pub fn detect_once<D: Detector + ?Sized>(
    detector: &D,
    image: &Image,
    retry: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<DetectionResult, ProviderError> {
    let raw = retry.run("detect", cancel, || detector.detect(image))?;
    Ok(normalize(raw))
}

fn normalize(raw: DetectionResult) -> DetectionResult {
    let risk_score = if raw.risk_score.is_finite() {
        raw.risk_score.clamp(0.0, 100.0)
    } else {
        100.0
    };
    DetectionResult {
        risk_score,
        regions: sanitize_regions(raw.regions),
        passes: 1,
        ..raw
    }
}

/// Detect on the image and on its 180° rotation, then combine.
///
/// The two passes are independent and run concurrently with the `parallel`
/// feature. Only the upright pass is required.
///
/// # Errors
///
/// Returns the upright pass's error, or [`ProviderError::Cancelled`] if the run
/// was cancelled during either pass.
pub fn detect_multi_angle<D: Detector + ?Sized>(
    detector: &D,
    image: &Image,
    retry: &RetryPolicy,
    cancel: &CancelToken,
    dedupe_iou: f32,
) -> Result<DetectionResult, ProviderError> {
    let rotated = image.rotated_180();
    let (upright, flipped) = join(
        || detect_once(detector, image, retry, cancel),
        || detect_once(detector, &rotated, retry, cancel),
    );

    let upright = upright?;
    match flipped {
        Ok(flipped) => Ok(combine_passes(upright, flipped, dedupe_iou)),
        Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
        Err(e) => {
            warn!("rotated detection pass failed, using upright pass only: {e}");
            Ok(DetectionResult {
                passes: 1,
                ..upright
            })
        }
    }
}

/// Combine an upright pass with a pass over the 180°-rotated image.
///
/// `rotated` regions are still in rotated coordinates; they are mapped back,
/// appended after the upright ones and deduplicated so the upright shape wins.
#[must_use]
pub fn combine_passes(
    upright: DetectionResult,
    rotated: DetectionResult,
    dedupe_iou: f32,
) -> DetectionResult {
    let rotated_risk = if rotated.risk_score > 0.0 {
        rotated.risk_score.floor()
    } else {
        0.0
    };
    let risk_score = upright.risk_score.max(rotated_risk);

    let mut brands = upright.brands;
    brands.extend(rotated.brands);

    let mut regions = upright.regions;
    regions.extend(rotated.regions.iter().map(crate::types::Region::rotated_180));
    let total = regions.len();
    let regions = dedupe_by_iou(regions, dedupe_iou);
    debug!(
        kept = regions.len(),
        dropped = total - regions.len(),
        risk_score,
        "combined detection passes"
    );

    DetectionResult {
        brands,
        risk_score,
        regions,
        passes: 2,
        degraded: upright.degraded || rotated.degraded,
    }
}

#[cfg(feature = "parallel")]
fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    rayon::join(a, b)
}

#[cfg(not(feature = "parallel"))]
fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA,
    B: FnOnce() -> RB,
{
    (a(), b())
}

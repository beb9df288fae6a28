//! A [`Detector`] backed by a precomputed detection file.
//!
//! The file is either a full detection result:
//!
//! ```json
//! {"brands": ["Nike"], "risk_score": 80, "regions": [{"brand": "Nike", "box_2d": [400, 150, 500, 250]}]}
//! ```
//!
//! or a bare array of regions, in which case the brands are the region brands
//! and the risk is the highest region confidence.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::capability::Detector;
use crate::error::{ProviderError, Result};
use crate::types::{DetectionResult, Image, Region};

#[derive(Deserialize)]
#[serde(untagged)]
enum SidecarFile {
    Full(DetectionResult),
    Regions(Vec<Region>),
}

impl From<SidecarFile> for DetectionResult {
    fn from(file: SidecarFile) -> Self {
        match file {
            SidecarFile::Full(result) => result,
            SidecarFile::Regions(regions) => Self {
                brands: regions.iter().map(|r| r.brand.clone()).collect(),
                risk_score: regions
                    .iter()
                    .map(|r| r.confidence)
                    .fold(0.0, f32::max),
                regions,
                passes: 1,
                degraded: false,
            },
        }
    }
}

/// Replays a stored detection for every image it is asked about.
///
/// Coordinates are in the orientation of the stored image, so this detector is
/// meant for single-angle runs.
#[derive(Debug, Clone)]
pub struct SidecarDetector {
    result: DetectionResult,
}

impl SidecarDetector {
    /// Replay `result`.
    #[must_use]
    pub fn new(result: DetectionResult) -> Self {
        Self { result }
    }

    /// Read a detection file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a detection document.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a detection document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if the text is not a detection document.
    pub fn from_json(content: &str) -> Result<Self> {
        let file: SidecarFile = serde_json::from_str(content)?;
        Ok(Self::new(file.into()))
    }

    /// The stored detection.
    #[must_use]
    pub fn result(&self) -> &DetectionResult {
        &self.result
    }
}

impl Detector for SidecarDetector {
    fn detect(&self, _image: &Image) -> std::result::Result<DetectionResult, ProviderError> {
        Ok(self.result.clone())
    }
}

/// Where the detection file for `image_path` is expected by default.
///
/// Example: `"shoes/photo.jpg"` becomes `"shoes/photo.detections.json"`.
#[must_use]
pub fn default_sidecar_path(image_path: &Path) -> PathBuf {
    let stem = image_path.file_stem().unwrap_or_default().to_string_lossy();
    let parent = image_path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}.detections.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Box2d;
    use crate::types::{RegionKind, Shape};
    use approx::assert_relative_eq;
    use image::RgbImage;

    #[test]
    fn full_document_is_replayed() {
        let detector = SidecarDetector::from_json(
            r#"{"brands": ["Nike"], "risk_score": 80,
                "regions": [{"brand": "Nike", "kind": "text", "confidence": 91,
                             "box_2d": [400, 150, 500, 250]}]}"#,
        )
        .unwrap();
        let result = detector.detect(&Image::new(RgbImage::new(4, 4))).unwrap();
        assert_relative_eq!(result.risk_score, 80.0);
        assert_eq!(result.passes, 1);
        assert_eq!(result.regions[0].kind, RegionKind::Text);
        assert_eq!(
            result.regions[0].shape,
            Shape::Box2d(Box2d::new(400, 150, 500, 250).unwrap())
        );
    }

    #[test]
    fn bare_region_list_is_accepted() {
        let detector = SidecarDetector::from_json(
            r#"[{"brand": "Acme", "confidence": 64, "polygon": [[0.1, 0.1], [0.3, 0.1], [0.2, 0.4]]},
                {"brand": "Zed", "confidence": 12, "box_2d": [0, 0, 10, 10]}]"#,
        )
        .unwrap();
        let result = detector.result();
        assert_eq!(result.brands.len(), 2);
        assert_relative_eq!(result.risk_score, 64.0);
        assert!(matches!(result.regions[0].shape, Shape::Polygon(_)));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(SidecarDetector::from_json("{\"regions\": 3}").is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(SidecarDetector::from_file(&dir.path().join("none.json")).is_err());
    }

    #[test]
    fn sidecar_path_sits_next_to_the_image() {
        assert_eq!(
            default_sidecar_path(Path::new("shoes/photo.jpg")),
            PathBuf::from("shoes/photo.detections.json")
        );
    }
}

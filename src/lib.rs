//! Remove or mask brand logos and lettering in product photos.
//!
//! A run detects brand regions (optionally on the image and its 180° rotation),
//! edits them away with the best available strategy, checks the edit did not
//! damage the product, re-verifies the result and, if brand signal remains,
//! occludes exactly the residual regions. Every run ends as `clean`, `masked`
//! or `failed`, with an audit trail of every strategy attempted.
//!
//! Detection, generative editing, verification and persistence are external
//! capabilities behind the traits in [`capability`]. Occlusion and pixelation
//! run locally, so a run can always fall back to a guaranteed edit.
//!
//! # Quick Start
//!
//! ```no_run
//! use brand_scrub::{
//!     CancelToken, ContrastVerifier, PipelineConfig, RemediationEngine, RemediationRequest,
//!     SidecarDetector,
//! };
//! use std::path::Path;
//!
//! let detector = SidecarDetector::from_file(Path::new("photo.detections.json"))?;
//! let verifier = ContrastVerifier::new(detector.clone(), 30.0);
//! let engine = RemediationEngine::new(PipelineConfig::default(), detector, verifier)?;
//!
//! let image = brand_scrub::load_image(Path::new("photo.jpg"))?;
//! let result = engine.run(&RemediationRequest::new("sku-1", image), &CancelToken::new());
//! println!("{} (risk {:.0})", result.status, result.risk_score);
//! if let Some(img) = &result.final_image {
//!     brand_scrub::save_image(img, Path::new("photo_clean.jpg"))?;
//! }
//! # Ok::<(), brand_scrub::Error>(())
//! ```
//!
//! # Geometry
//!
//! Regions carry their coordinate space in their type: boxes are integers in
//! 0–1000, polygons are floats in 0–1. Conversion to pixels floors minimums and
//! ceils maximums so a converted box never under-covers its detection.
//!
//! ```
//! use brand_scrub::geometry::{invert_rotation_180, iou, Box2d};
//!
//! let logo = Box2d::new(400, 150, 500, 250)?;
//! assert_eq!(invert_rotation_180(invert_rotation_180(logo)), logo);
//! assert_eq!(iou(&logo, &logo), 1.0);
//! # Ok::<(), brand_scrub::Error>(())
//! ```

#![deny(missing_docs)]

pub mod capability;
pub mod config;
pub mod detection;
pub mod editing;
mod engine;
pub mod error;
pub mod geometry;
pub mod limit;
pub mod mask;
pub mod report;
pub mod result;
pub mod retry;
pub mod sidecar;
pub mod structural;
pub mod types;
pub mod verification;

pub use capability::{Detector, EditHint, Editor, Persistence, Verifier};
pub use config::{EditMode, PipelineConfig};
pub use editing::{OcclusionEditor, PixelationEditor, Strategy};
pub use engine::{
    default_output_path, is_supported_image, load_image, process_directory, save_image,
    ProcessResult, RemediationEngine, RemediationRequest,
};
pub use error::{Error, ProviderError, Result};
pub use limit::{ConcurrencyLimit, Throttled};
pub use mask::{Mask, Padding};
pub use report::JsonReportStore;
pub use result::{PipelineResult, Stage, Status};
pub use retry::{CancelToken, RetryPolicy};
pub use sidecar::{default_sidecar_path, SidecarDetector};
pub use structural::{StructuralValidator, StructuralVerdict};
pub use types::{DetectionResult, Image, Region, RegionKind, Verification};
pub use verification::ContrastVerifier;

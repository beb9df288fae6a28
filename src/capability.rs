//! Narrow interfaces to the external collaborators the pipeline drives.
//!
//! Implementations own all provider wire formats and image encoding; the
//! pipeline only sees the in-memory data model. Calls are blocking and may run
//! on several worker threads at once, hence the `Send + Sync` bounds.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::ProviderError;
use crate::mask::Mask;
use crate::result::PipelineResult;
use crate::types::{DetectionResult, Image, Region, Verification};

/// Finds brand marks in an image.
pub trait Detector: Send + Sync {
    /// Detect brands, an overall risk score and their regions.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`]; transient ones are retried by the caller.
    fn detect(&self, image: &Image) -> Result<DetectionResult, ProviderError>;
}

/// Where an editor should act.
#[derive(Debug, Clone, Default)]
pub struct EditHint {
    /// Regions to remove or obscure, in detection order.
    pub regions: Vec<Region>,
    /// Rasterized target area, when the strategy works from a mask.
    pub mask: Option<Mask>,
}

/// Produces a new image with brand content removed or obscured.
pub trait Editor: Send + Sync {
    /// Edit `image`, guided by `hint` and the brand names to remove.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when no image could be produced.
    fn edit(
        &self,
        image: &Image,
        hint: &EditHint,
        brands: &BTreeSet<String>,
    ) -> Result<Image, ProviderError>;
}

/// Re-checks an edited image for remaining brand signal.
pub trait Verifier: Send + Sync {
    /// Score what is left of `brands` in `image`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`]; transient ones are retried by the caller.
    fn verify(
        &self,
        image: &Image,
        brands: &BTreeSet<String>,
    ) -> Result<Verification, ProviderError>;
}

/// Stores the outcome of a run.
pub trait Persistence: Send + Sync {
    /// Persist `result` for `product_id`. Called once per run.
    ///
    /// # Errors
    ///
    /// Failures are logged by the caller and never alter the result.
    fn save(&self, product_id: &str, result: &PipelineResult) -> Result<(), ProviderError>;
}

impl<T: Detector + ?Sized> Detector for Arc<T> {
    fn detect(&self, image: &Image) -> Result<DetectionResult, ProviderError> {
        (**self).detect(image)
    }
}

impl<T: Editor + ?Sized> Editor for Arc<T> {
    fn edit(
        &self,
        image: &Image,
        hint: &EditHint,
        brands: &BTreeSet<String>,
    ) -> Result<Image, ProviderError> {
        (**self).edit(image, hint, brands)
    }
}

impl<T: Verifier + ?Sized> Verifier for Arc<T> {
    fn verify(
        &self,
        image: &Image,
        brands: &BTreeSet<String>,
    ) -> Result<Verification, ProviderError> {
        (**self).verify(image, brands)
    }
}

impl<T: Persistence + ?Sized> Persistence for Arc<T> {
    fn save(&self, product_id: &str, result: &PipelineResult) -> Result<(), ProviderError> {
        (**self).save(product_id, result)
    }
}

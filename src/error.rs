//! Error types for the brand-scrub crate.

/// Errors raised by the leaf components, configuration loading and file helpers.
///
/// Capability calls (detector, editor, verifier, persistence) report failures
/// through [`ProviderError`] instead, because only those may steer the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A region failed its geometric invariants (zero or negative size, out of bounds).
    #[error("degenerate region: {0}")]
    DegenerateRegion(String),

    /// A rasterized mask covers more of the image than the sanity ceiling allows.
    #[error("mask rejected: coverage {coverage:.3} exceeds ceiling {ceiling:.3}")]
    MaskRejected {
        /// Fraction of marked pixels.
        coverage: f32,
        /// Configured ceiling.
        ceiling: f32,
    },

    /// An edited image diverges too much from its original.
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred during image processing (load, save, encode).
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// A JSON document could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an external capability (detector, editor, verifier, store).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network, timeout or 5xx-style failure; worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider answered but cannot fulfil the request; retrying will not help.
    #[error("provider error: {0}")]
    Permanent(String),

    /// The run was cancelled or its deadline passed.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the error may succeed on a later attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<Error> for ProviderError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => Self::Transient(e.to_string()),
            other => Self::Permanent(other.to_string()),
        }
    }
}

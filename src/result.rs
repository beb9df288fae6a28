//! Terminal output of a remediation run and its audit trail.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::editing::Strategy;
use crate::mask::Mask;
use crate::structural::StructuralVerdict;
use crate::types::Image;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Brand content was removed without a masking pass, or none was found.
    Clean,
    /// Occlusion or distortion was applied. Still a success.
    Masked,
    /// No strategy produced an image, the input was unusable or the run was cancelled.
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clean => "clean",
            Self::Masked => "masked",
            Self::Failed => "failed",
        })
    }
}

/// Pipeline state, used to report where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Input normalization and pre-checks.
    Init,
    /// Running the detector.
    Detecting,
    /// Running editors, including structural checks.
    Editing,
    /// Running the verifier.
    Verifying,
    /// Masking residual regions.
    Remediating,
    /// Finished.
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Detecting => "detecting",
            Self::Editing => "editing",
            Self::Verifying => "verifying",
            Self::Remediating => "remediating",
            Self::Done => "done",
        })
    }
}

/// Which part of the run an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptPhase {
    /// The main edit chain.
    Edit,
    /// The post-verification masking pass.
    Remediation,
}

/// One strategy invocation in the audit trail.
#[derive(Debug, Clone)]
pub struct RemediationAttempt {
    /// Edit chain or remediation pass.
    pub phase: AttemptPhase,
    /// Strategy that was tried.
    pub strategy: Strategy,
    /// Image handed to the strategy.
    pub input: Image,
    /// Image it produced, if any.
    pub output: Option<Image>,
    /// Risk score attributed to the output, once known.
    pub risk_score: Option<f32>,
    /// Structural verdict on the output, when one was computed.
    pub structural: Option<StructuralVerdict>,
    /// Why the attempt was abandoned, if it was.
    pub error: Option<String>,
}

impl RemediationAttempt {
    /// Whether the attempt produced an image that was kept.
    #[must_use]
    pub fn accepted(&self) -> bool {
        self.output.is_some() && self.error.is_none()
    }
}

/// Category of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The cancel token tripped or the deadline passed.
    Cancelled,
    /// Every strategy errored.
    Unrecoverable,
    /// The input image could not be used at all.
    InvalidInput,
}

/// Why a run ended in [`Status::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    /// Failure category.
    pub kind: FailureKind,
    /// Stage the run was in.
    pub stage: Stage,
    /// Last strategy attempted, if any.
    pub strategy: Option<Strategy>,
    /// Human-readable reason.
    pub reason: String,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}", self.reason, self.stage)?;
        if let Some(strategy) = self.strategy {
            write!(f, " (last strategy: {strategy})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {}

/// Terminal output of one run. Built once and never changed afterwards.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Final status.
    pub status: Status,
    /// Final image; `None` only when the run failed.
    pub final_image: Option<Image>,
    /// Brands detected, merged across passes.
    pub brands_detected: BTreeSet<String>,
    /// Final risk score, 0–100.
    pub risk_score: f32,
    /// Remediation mask, when one was rasterized.
    pub mask: Option<Mask>,
    /// Failure details when `status` is [`Status::Failed`].
    pub error: Option<PipelineError>,
    /// Degrade-and-continue events that did not change the status.
    pub warnings: Vec<String>,
    /// Every strategy invocation, in order.
    pub attempts: Vec<RemediationAttempt>,
    /// Detection angles that contributed (0 when detection was skipped or degraded).
    pub detection_passes: u8,
}

impl PipelineResult {
    pub(crate) fn failed(
        error: PipelineError,
        brands_detected: BTreeSet<String>,
        risk_score: f32,
        attempts: Vec<RemediationAttempt>,
        warnings: Vec<String>,
        detection_passes: u8,
    ) -> Self {
        Self {
            status: Status::Failed,
            final_image: None,
            brands_detected,
            risk_score,
            mask: None,
            error: Some(error),
            warnings,
            attempts,
            detection_passes,
        }
    }

    /// Whether the run produced a usable image.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status != Status::Failed
    }

    /// Serializable summary for persistence and logs.
    #[must_use]
    pub fn report(&self, product_id: &str) -> ResultReport {
        ResultReport {
            product_id: product_id.to_string(),
            status: self.status,
            stage: self.error.as_ref().map_or(Stage::Done, |e| e.stage),
            risk_score: self.risk_score,
            brands_detected: self.brands_detected.iter().cloned().collect(),
            detection_passes: self.detection_passes,
            mask_coverage: self.mask.as_ref().map(Mask::coverage_ratio),
            final_size: self.final_image.as_ref().map(Image::dimensions),
            error: self.error.clone(),
            warnings: self.warnings.clone(),
            attempts: self
                .attempts
                .iter()
                .map(|a| AttemptReport {
                    phase: a.phase,
                    strategy: a.strategy,
                    produced_image: a.output.is_some(),
                    risk_score: a.risk_score,
                    structurally_valid: a.structural.as_ref().map(|v| v.is_valid),
                    structural_reason: a.structural.as_ref().and_then(|v| v.reason.clone()),
                    error: a.error.clone(),
                })
                .collect(),
        }
    }
}

/// Audit-trail entry as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptReport {
    /// Edit chain or remediation pass.
    pub phase: AttemptPhase,
    /// Strategy that was tried.
    pub strategy: Strategy,
    /// Whether the strategy returned an image.
    pub produced_image: bool,
    /// Risk attributed to the output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f32>,
    /// Structural verdict, if computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structurally_valid: Option<bool>,
    /// Structural rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural_reason: Option<String>,
    /// Why the attempt was abandoned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Image-free view of a [`PipelineResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    /// Product the run belonged to.
    pub product_id: String,
    /// Final status.
    pub status: Status,
    /// `done`, or the stage a failed run stopped in.
    pub stage: Stage,
    /// Final risk score.
    pub risk_score: f32,
    /// Brands detected, sorted.
    pub brands_detected: Vec<String>,
    /// Detection angles that contributed.
    pub detection_passes: u8,
    /// Coverage of the remediation mask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_coverage: Option<f32>,
    /// Width and height of the final image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_size: Option<(u32, u32)>,
    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    /// Degrade events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Audit trail.
    pub attempts: Vec<AttemptReport>,
}

//! Remediation orchestrator.
//!
//! One run walks `Init → Detecting → Editing → Verifying → (Remediating) → Done`
//! and always ends in exactly one of clean, masked or failed. Capability failures
//! degrade the stage they hit; only an edit chain that produces no image at all,
//! an unusable input or cancellation yields a failed result.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat};
use tracing::{debug, info, info_span, warn};

use crate::capability::{Detector, EditHint, Editor, Persistence, Verifier};
use crate::config::{EditMode, PipelineConfig};
use crate::detection::{detect_multi_angle, detect_once};
use crate::editing::{OcclusionEditor, PixelationEditor, Strategy};
use crate::error::{Error, ProviderError, Result};
use crate::geometry::{merge_overlapping, sanitize_regions};
use crate::mask::{check_coverage, rasterize, Mask};
use crate::result::{
    AttemptPhase, FailureKind, PipelineError, PipelineResult, RemediationAttempt, Stage, Status,
};
use crate::retry::CancelToken;
use crate::types::{DetectionResult, Image, Region, Verification};

/// Input of one run.
#[derive(Debug, Clone)]
pub struct RemediationRequest {
    /// Identifier handed to persistence.
    pub product_id: String,
    /// Product photo.
    pub image: Image,
    /// Brands the caller already suspects.
    pub suspected_brands: BTreeSet<String>,
    /// Risk from an earlier detection; below the clean threshold the run is skipped.
    pub prior_risk_score: Option<f32>,
}

impl RemediationRequest {
    /// Request with no suspected brands and no prior score.
    pub fn new(product_id: impl Into<String>, image: Image) -> Self {
        Self {
            product_id: product_id.into(),
            image,
            suspected_brands: BTreeSet::new(),
            prior_risk_score: None,
        }
    }

    /// Add suspected brands.
    #[must_use]
    pub fn with_brands<I, S>(mut self, brands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suspected_brands
            .extend(brands.into_iter().map(Into::into));
        self
    }

    /// Set the risk score of an earlier detection.
    #[must_use]
    pub fn with_prior_risk(mut self, risk_score: f32) -> Self {
        self.prior_risk_score = Some(risk_score);
        self
    }
}

/// The remediation pipeline.
///
/// Build once per set of capabilities with [`RemediationEngine::new()`] and reuse
/// it for any number of runs, from any number of threads.
pub struct RemediationEngine {
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    verifier: Arc<dyn Verifier>,
    content_aware: Option<Arc<dyn Editor>>,
    inpaint: Option<Arc<dyn Editor>>,
    persistence: Option<Arc<dyn Persistence>>,
    occlusion: OcclusionEditor,
    pixelation: PixelationEditor,
}

impl RemediationEngine {
    /// Create an engine with a detector and a verifier. Generative editors and
    /// persistence are optional and added with the `with_*` methods.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is out of range.
    pub fn new(
        config: PipelineConfig,
        detector: impl Detector + 'static,
        verifier: impl Verifier + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            occlusion: OcclusionEditor::new(config.occlusion_color, config.padding),
            pixelation: PixelationEditor::new(config.pixelation_block, config.padding),
            config,
            detector: Arc::new(detector),
            verifier: Arc::new(verifier),
            content_aware: None,
            inpaint: None,
            persistence: None,
        })
    }

    /// Use `editor` for prompt-driven content-aware removal.
    #[must_use]
    pub fn with_content_aware(mut self, editor: impl Editor + 'static) -> Self {
        self.content_aware = Some(Arc::new(editor));
        self
    }

    /// Use `editor` for mask-guided inpainting.
    #[must_use]
    pub fn with_inpaint(mut self, editor: impl Editor + 'static) -> Self {
        self.inpaint = Some(Arc::new(editor));
        self
    }

    /// Hand every result to `store`.
    #[must_use]
    pub fn with_persistence(mut self, store: impl Persistence + 'static) -> Self {
        self.persistence = Some(Arc::new(store));
        self
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline on one request and persist the result.
    ///
    /// Never panics on capability failures and always returns a result;
    /// persistence failures are logged and do not change it.
    #[must_use]
    pub fn run(&self, request: &RemediationRequest, cancel: &CancelToken) -> PipelineResult {
        let span = info_span!("remediate", product = %request.product_id);
        let _enter = span.enter();

        let result = self.execute(request, cancel);
        match &result.error {
            Some(err) => warn!(status = %result.status, "run failed: {err}"),
            None => info!(
                status = %result.status,
                risk_score = result.risk_score,
                attempts = result.attempts.len(),
                "run finished"
            ),
        }

        if let Some(store) = &self.persistence {
            if let Err(e) = store.save(&request.product_id, &result) {
                warn!("failed to persist result: {e}");
            }
        }
        result
    }

    /// Run many requests on a worker pool of `config.concurrency` threads.
    ///
    /// Results are in request order.
    #[must_use]
    pub fn process_batch(
        &self,
        requests: &[RemediationRequest],
        cancel: &CancelToken,
    ) -> Vec<PipelineResult> {
        run_bounded(requests, self.config.concurrency, |request| {
            self.run(request, cancel)
        })
    }

    /// Process a single image file: load, remediate, save.
    ///
    /// The product id is the file stem. Nothing is written for a failed run.
    #[must_use]
    pub fn process_file(
        &self,
        input: &Path,
        output: &Path,
        suspected_brands: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> ProcessResult {
        let mut outcome = ProcessResult {
            path: input.to_path_buf(),
            output: None,
            status: Status::Failed,
            risk_score: 0.0,
            message: String::new(),
        };

        let image = match load_image(input) {
            Ok(img) => img,
            Err(e) => {
                outcome.message = format!("Failed to load: {e}");
                return outcome;
            }
        };

        let product_id = input
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        let request = RemediationRequest::new(product_id, image)
            .with_brands(suspected_brands.iter().cloned());
        let result = self.run(&request, cancel);
        outcome.status = result.status;
        outcome.risk_score = result.risk_score;

        let Some(final_image) = &result.final_image else {
            outcome.message = result
                .error
                .map_or_else(|| "No image produced".to_string(), |e| e.to_string());
            return outcome;
        };

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    outcome.status = Status::Failed;
                    outcome.message = format!("Failed to create output directory: {e}");
                    return outcome;
                }
            }
        }

        match save_image(final_image, output) {
            Ok(()) => {
                outcome.output = Some(output.to_path_buf());
                outcome.message = match result.status {
                    Status::Clean => "Brand content removed".to_string(),
                    _ => "Brand content masked".to_string(),
                };
                if !result.warnings.is_empty() {
                    outcome.message = format!("{} ({})", outcome.message, result.warnings.join("; "));
                }
            }
            Err(e) => {
                outcome.status = Status::Failed;
                outcome.message = format!("Failed to save: {e}");
            }
        }
        outcome
    }

    fn execute(&self, request: &RemediationRequest, cancel: &CancelToken) -> PipelineResult {
        let mut run = Run::new(self, cancel, &request.suspected_brands);
        match run.drive(request) {
            Ok(_) if cancel.is_cancelled() => run.fail(Halt::Cancelled),
            Ok(outcome) => run.finish(outcome),
            Err(halt) => run.fail(halt),
        }
    }

    /// Strategies to try, in order, given what this run has to work with.
    fn strategy_chain(&self, has_mask: bool, has_regions: bool) -> VecDeque<Strategy> {
        let mut chain = VecDeque::new();
        match self.config.mode {
            EditMode::Generative => {
                if has_mask && self.inpaint.is_some() {
                    chain.push_back(Strategy::MaskInpaint);
                }
                if self.content_aware.is_some() {
                    chain.push_back(Strategy::ContentAware);
                }
                if chain.is_empty() && has_regions {
                    chain.push_back(Strategy::Pixelate);
                }
            }
            EditMode::Distort => chain.push_back(Strategy::Pixelate),
            EditMode::Occlude => {}
        }
        chain.push_back(Strategy::Occlude);
        chain
    }

    fn invoke(
        &self,
        strategy: Strategy,
        image: &Image,
        hint: &EditHint,
        brands: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> std::result::Result<Image, ProviderError> {
        let external = match strategy {
            Strategy::ContentAware => self.content_aware.as_deref(),
            Strategy::MaskInpaint => self.inpaint.as_deref(),
            Strategy::Pixelate => return self.pixelation.edit(image, hint, brands),
            Strategy::Occlude => return self.occlusion.edit(image, hint, brands),
        };
        let editor = external
            .ok_or_else(|| ProviderError::Permanent(format!("no {strategy} editor configured")))?;
        let edited = self
            .config
            .retry
            .run("edit", cancel, || editor.edit(image, hint, brands))?;
        if edited.is_empty() {
            return Err(ProviderError::Permanent("editor returned an empty image".into()));
        }
        Ok(edited)
    }

    /// Downscale oversized inputs so the longest side fits `max_dimension`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn normalize(&self, image: &Image) -> std::result::Result<Image, Halt> {
        if image.is_empty() {
            return Err(Halt::InvalidInput("input image is empty".into()));
        }
        let (w, h) = image.dimensions();
        let max = self.config.max_dimension;
        let longest = w.max(h);
        if longest <= max {
            return Ok(image.clone());
        }

        let scale = f64::from(max) / f64::from(longest);
        let nw = ((f64::from(w) * scale).round() as u32).clamp(1, max);
        let nh = ((f64::from(h) * scale).round() as u32).clamp(1, max);
        debug!(from = ?(w, h), to = ?(nw, nh), "downscaling input");
        Ok(Image::new(imageops::resize(
            image.pixels(),
            nw,
            nh,
            FilterType::Lanczos3,
        )))
    }
}

/// Why a run stopped early.
enum Halt {
    Cancelled,
    Unrecoverable(String),
    InvalidInput(String),
}

/// What a finished run hands back.
struct Outcome {
    status: Status,
    image: Image,
    risk_score: f32,
    mask: Option<Mask>,
}

impl Outcome {
    fn unmasked(status: Status, image: Image, risk_score: f32) -> Self {
        Self {
            status,
            image,
            risk_score,
            mask: None,
        }
    }
}

/// Per-run state. Lives for one call to [`RemediationEngine::run`].
struct Run<'a> {
    engine: &'a RemediationEngine,
    cancel: &'a CancelToken,
    stage: Stage,
    brands: BTreeSet<String>,
    risk_score: f32,
    passes: u8,
    degraded: bool,
    attempts: Vec<RemediationAttempt>,
    warnings: Vec<String>,
    last_strategy: Option<Strategy>,
}

impl<'a> Run<'a> {
    fn new(
        engine: &'a RemediationEngine,
        cancel: &'a CancelToken,
        suspected: &BTreeSet<String>,
    ) -> Self {
        Self {
            engine,
            cancel,
            stage: Stage::Init,
            brands: suspected.clone(),
            risk_score: 0.0,
            passes: 0,
            degraded: false,
            attempts: Vec::new(),
            warnings: Vec::new(),
            last_strategy: None,
        }
    }

    fn enter(&mut self, stage: Stage) -> std::result::Result<(), Halt> {
        self.stage = stage;
        debug!(%stage, "entering stage");
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        Ok(())
    }

    fn degrade(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    fn drive(&mut self, request: &RemediationRequest) -> std::result::Result<Outcome, Halt> {
        let engine = self.engine;
        let config = &engine.config;

        self.enter(Stage::Init)?;
        let original = engine.normalize(&request.image)?;
        if let Some(prior) = request.prior_risk_score {
            if prior.is_finite() && prior < config.clean_threshold {
                info!(prior, "prior risk below clean threshold");
                self.risk_score = prior;
                return Ok(Outcome::unmasked(Status::Clean, original, prior));
            }
        }

        self.enter(Stage::Detecting)?;
        let detection = self.detect(&original)?;
        if !detection.degraded && detection.risk_score < config.clean_threshold {
            info!(risk_score = detection.risk_score, "already clean");
            return Ok(Outcome::unmasked(
                Status::Clean,
                original,
                detection.risk_score,
            ));
        }
        let regions = detection.regions;

        self.enter(Stage::Editing)?;
        let edit_mask = self.edit_mask(&original, &regions);
        let (edited, strategy) = self.edit_chain(&original, &regions, edit_mask.as_ref())?;
        // A degraded detection never supports a clean verdict.
        let edit_status = if strategy.is_local() || self.degraded {
            Status::Masked
        } else {
            Status::Clean
        };

        self.enter(Stage::Verifying)?;
        let targets = match self.verify(&edited) {
            Ok(verification) => {
                self.record_verified_risk(verification.risk_score);
                if !needs_remediation(&verification, config.acceptable_risk) {
                    return Ok(Outcome::unmasked(
                        edit_status,
                        edited,
                        verification.risk_score,
                    ));
                }
                let residual = sanitize_regions(verification.residual_regions);
                let targets = if residual.is_empty() {
                    regions
                } else {
                    residual
                };
                if targets.is_empty() {
                    // Verified dirty but nothing to occlude: never report clean.
                    self.degrade(format!(
                        "residual risk {:.0} reported without regions, keeping edit",
                        verification.risk_score
                    ));
                    return Ok(Outcome::unmasked(
                        Status::Masked,
                        edited,
                        verification.risk_score,
                    ));
                }
                self.risk_score = verification.risk_score;
                targets
            }
            Err(ProviderError::Cancelled) => return Err(Halt::Cancelled),
            Err(e) => {
                self.degrade(format!("verifier unavailable: {e}"));
                if strategy.is_local() {
                    return Ok(Outcome::unmasked(
                        Status::Masked,
                        edited,
                        config.masked_risk_score,
                    ));
                }
                if regions.is_empty() {
                    // An unverified edit is never clean.
                    return Ok(Outcome::unmasked(Status::Masked, edited, self.risk_score));
                }
                regions
            }
        };

        self.enter(Stage::Remediating)?;
        match self.remediate(&edited, &targets) {
            Some(outcome) => Ok(outcome),
            None => {
                self.degrade("remediation regions were degenerate, keeping edit".into());
                Ok(Outcome::unmasked(edit_status, edited, self.risk_score))
            }
        }
    }

    fn detect(&mut self, image: &Image) -> std::result::Result<DetectionResult, Halt> {
        let engine = self.engine;
        let config = &engine.config;
        let attempt = if config.multi_angle {
            detect_multi_angle(
                &*engine.detector,
                image,
                &config.retry,
                self.cancel,
                config.dedupe_iou,
            )
        } else {
            detect_once(&*engine.detector, image, &config.retry, self.cancel)
        };

        let detection = match attempt {
            Ok(detection) => detection,
            Err(ProviderError::Cancelled) => return Err(Halt::Cancelled),
            Err(e) => {
                self.degrade(format!("detector unavailable, assuming high risk: {e}"));
                let brands = if self.brands.is_empty() {
                    config.generic_brands.iter().cloned().collect()
                } else {
                    self.brands.clone()
                };
                DetectionResult::degraded(brands, config.degraded_risk_score)
            }
        };

        self.brands.extend(detection.brands.iter().cloned());
        self.risk_score = detection.risk_score;
        self.passes = detection.passes;
        self.degraded = detection.degraded;
        info!(
            risk_score = detection.risk_score,
            regions = detection.regions.len(),
            passes = detection.passes,
            degraded = detection.degraded,
            "detection complete"
        );
        Ok(detection)
    }

    /// Mask for mask-guided editing, if the regions give a plausible one.
    fn edit_mask(&mut self, image: &Image, regions: &[Region]) -> Option<Mask> {
        if regions.is_empty() {
            return None;
        }
        let config = &self.engine.config;
        let (w, h) = image.dimensions();
        let mask = rasterize(regions, w, h, config.padding);
        if mask.is_blank() {
            return None;
        }
        match check_coverage(&mask, config.coverage_ceiling) {
            Ok(()) => Some(mask),
            Err(e) => {
                self.degrade(format!("{e}, skipping mask-guided editing"));
                None
            }
        }
    }

    fn edit_chain(
        &mut self,
        original: &Image,
        regions: &[Region],
        mask: Option<&Mask>,
    ) -> std::result::Result<(Image, Strategy), Halt> {
        let engine = self.engine;
        let mut queue = engine.strategy_chain(mask.is_some(), !regions.is_empty());
        debug!(?queue, "edit chain");
        let mut failures = Vec::new();

        while let Some(strategy) = queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            self.last_strategy = Some(strategy);

            let hint = EditHint {
                regions: regions.to_vec(),
                mask: if strategy.needs_mask() {
                    mask.cloned()
                } else {
                    None
                },
            };
            let mut attempt = RemediationAttempt {
                phase: AttemptPhase::Edit,
                strategy,
                input: original.clone(),
                output: None,
                risk_score: None,
                structural: None,
                error: None,
            };

            let edited = match engine.invoke(strategy, original, &hint, &self.brands, self.cancel)
            {
                Ok(edited) => edited,
                Err(ProviderError::Cancelled) => {
                    attempt.error = Some(ProviderError::Cancelled.to_string());
                    self.attempts.push(attempt);
                    return Err(Halt::Cancelled);
                }
                Err(e) => {
                    let failure = format!("{strategy} edit failed: {e}");
                    self.degrade(failure.clone());
                    failures.push(failure);
                    attempt.error = Some(e.to_string());
                    self.attempts.push(attempt);
                    continue;
                }
            };

            let verdict = engine.config.structural.validate(original, &edited);
            let accepted = verdict.is_valid || strategy == Strategy::Occlude;
            let reason = verdict.reason.clone().unwrap_or_default();
            attempt.output = Some(edited.clone());
            attempt.structural = Some(verdict);

            if accepted {
                self.attempts.push(attempt);
                info!(%strategy, "edit accepted");
                return Ok((edited, strategy));
            }

            let violation = Error::StructuralViolation(reason);
            let failure = format!("{strategy} edit rejected: {violation}");
            self.degrade(failure.clone());
            failures.push(failure);
            attempt.error = Some(violation.to_string());
            self.attempts.push(attempt);

            // Inpaint always precedes content-aware removal in the chain.
            queue.clear();
            queue.push_back(Strategy::Occlude);
        }

        Err(Halt::Unrecoverable(format!(
            "no acceptable edit: {}",
            failures.join("; ")
        )))
    }

    fn verify(&self, edited: &Image) -> std::result::Result<Verification, ProviderError> {
        let engine = self.engine;
        engine
            .config
            .retry
            .run("verify", self.cancel, || engine.verifier.verify(edited, &self.brands))
    }

    fn record_verified_risk(&mut self, risk_score: f32) {
        if let Some(attempt) = self
            .attempts
            .iter_mut()
            .rev()
            .find(|a| a.phase == AttemptPhase::Edit && a.accepted())
        {
            attempt.risk_score = Some(risk_score);
        }
    }

    /// Occlude `targets` on `edited`; `None` if they rasterize to nothing.
    fn remediate(&mut self, edited: &Image, targets: &[Region]) -> Option<Outcome> {
        let engine = self.engine;
        let config = &engine.config;
        let merged = merge_overlapping(targets, config.merge_iou);
        let (w, h) = edited.dimensions();
        let mask = rasterize(&merged, w, h, config.padding);
        if mask.is_blank() {
            return None;
        }

        let remediated = engine.occlusion.apply(edited, &mask);
        self.last_strategy = Some(Strategy::Occlude);
        info!(
            regions = merged.len(),
            coverage = mask.coverage_ratio(),
            "occluded residual regions"
        );
        self.attempts.push(RemediationAttempt {
            phase: AttemptPhase::Remediation,
            strategy: Strategy::Occlude,
            input: edited.clone(),
            output: Some(remediated.clone()),
            risk_score: Some(config.masked_risk_score),
            structural: None,
            error: None,
        });

        Some(Outcome {
            status: Status::Masked,
            image: remediated,
            risk_score: config.masked_risk_score,
            mask: Some(mask),
        })
    }

    fn finish(self, outcome: Outcome) -> PipelineResult {
        PipelineResult {
            status: outcome.status,
            final_image: Some(outcome.image),
            brands_detected: self.brands,
            risk_score: outcome.risk_score,
            mask: outcome.mask,
            error: None,
            warnings: self.warnings,
            attempts: self.attempts,
            detection_passes: self.passes,
        }
    }

    fn fail(self, halt: Halt) -> PipelineResult {
        let (kind, reason) = match halt {
            Halt::Cancelled => (FailureKind::Cancelled, "run cancelled".to_string()),
            Halt::Unrecoverable(reason) => (FailureKind::Unrecoverable, reason),
            Halt::InvalidInput(reason) => (FailureKind::InvalidInput, reason),
        };
        PipelineResult::failed(
            PipelineError {
                kind,
                stage: self.stage,
                strategy: self.last_strategy,
                reason,
            },
            self.brands,
            self.risk_score,
            self.attempts,
            self.warnings,
            self.passes,
        )
    }
}

fn needs_remediation(verification: &Verification, acceptable_risk: f32) -> bool {
    !verification.is_clean || verification.risk_score > acceptable_risk
}

/// Map `f` over `items` on at most `workers` threads, keeping order.
fn run_bounded<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
        {
            Ok(pool) => return pool.install(|| items.par_iter().map(&f).collect()),
            Err(e) => warn!("worker pool unavailable, running sequentially: {e}"),
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = workers;

    items.iter().map(f).collect()
}

/// Outcome of processing one image file.
#[derive(Debug)]
pub struct ProcessResult {
    /// Path of the processed file.
    pub path: PathBuf,
    /// Where the final image was written, if it was.
    pub output: Option<PathBuf>,
    /// Run status; `Failed` also covers load and save errors.
    pub status: Status,
    /// Final risk score.
    pub risk_score: f32,
    /// Human-readable status message.
    pub message: String,
}

/// Process all supported images in a directory.
///
/// `make_engine` builds the engine for each input file, so per-file capabilities
/// (such as a detection sidecar) can be wired in. Files run on a pool of
/// `concurrency` workers; results are sorted by input path.
#[must_use]
pub fn process_directory<F>(
    input_dir: &Path,
    output_dir: &Path,
    concurrency: usize,
    suspected_brands: &BTreeSet<String>,
    cancel: &CancelToken,
    make_engine: F,
) -> Vec<ProcessResult>
where
    F: Fn(&Path) -> Result<RemediationEngine> + Sync + Send,
{
    let failed = |path: &Path, message: String| ProcessResult {
        path: path.to_path_buf(),
        output: None,
        status: Status::Failed,
        risk_score: 0.0,
        message,
    };

    let mut entries: Vec<PathBuf> = match std::fs::read_dir(input_dir) {
        Ok(rd) => rd
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| is_supported_image(p))
            .collect(),
        Err(e) => {
            return vec![failed(
                input_dir,
                format!("Failed to read directory: {e}"),
            )];
        }
    };
    entries.sort();

    if !output_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(output_dir) {
            return vec![failed(
                output_dir,
                format!("Failed to create output directory: {e}"),
            )];
        }
    }

    run_bounded(&entries, concurrency, |input_path| {
        let Some(filename) = input_path.file_name() else {
            return failed(input_path, "Not a file".to_string());
        };
        let output_path = output_dir.join(filename);
        match make_engine(input_path) {
            Ok(engine) => engine.process_file(input_path, &output_path, suspected_brands, cancel),
            Err(e) => failed(input_path, format!("Failed to set up: {e}")),
        }
    })
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// Decode an image file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn load_image(path: &Path) -> Result<Image> {
    Ok(image::open(path)?.into())
}

/// Save an image with format-specific quality settings.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &Image, path: &Path) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    let dyn_img = DynamicImage::ImageRgb8(img.to_rgb8());

    match format {
        ImageFormat::Jpeg => {
            let file = std::fs::File::create(path)?;
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, 100);
            encoder.encode_image(&dyn_img)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            dyn_img.save(path)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}

/// Generate a default output path from an input path.
///
/// Example: `"photo.jpg"` becomes `"photo_clean.jpg"`.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let ext = input.extension().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}_clean.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct NoDetector;

    impl Detector for NoDetector {
        fn detect(&self, _image: &Image) -> std::result::Result<DetectionResult, ProviderError> {
            Ok(DetectionResult::default())
        }
    }

    struct CleanVerifier;

    impl Verifier for CleanVerifier {
        fn verify(
            &self,
            _image: &Image,
            _brands: &BTreeSet<String>,
        ) -> std::result::Result<Verification, ProviderError> {
            Ok(Verification {
                risk_score: 0.0,
                residual_regions: Vec::new(),
                is_clean: true,
            })
        }
    }

    struct Identity;

    impl Editor for Identity {
        fn edit(
            &self,
            image: &Image,
            _hint: &EditHint,
            _brands: &BTreeSet<String>,
        ) -> std::result::Result<Image, ProviderError> {
            Ok(image.clone())
        }
    }

    fn engine(mode: EditMode) -> RemediationEngine {
        let config = PipelineConfig {
            mode,
            ..PipelineConfig::default()
        };
        RemediationEngine::new(config, NoDetector, CleanVerifier).unwrap()
    }

    #[test]
    fn generative_chain_prefers_inpaint_then_content_aware() {
        let e = engine(EditMode::Generative)
            .with_inpaint(Identity)
            .with_content_aware(Identity);
        assert_eq!(
            Vec::from(e.strategy_chain(true, true)),
            vec![Strategy::MaskInpaint, Strategy::ContentAware, Strategy::Occlude]
        );
        assert_eq!(
            Vec::from(e.strategy_chain(false, true)),
            vec![Strategy::ContentAware, Strategy::Occlude]
        );
    }

    #[test]
    fn generative_chain_without_editors_pixelates() {
        let e = engine(EditMode::Generative);
        assert_eq!(
            Vec::from(e.strategy_chain(true, true)),
            vec![Strategy::Pixelate, Strategy::Occlude]
        );
        assert_eq!(Vec::from(e.strategy_chain(false, false)), vec![Strategy::Occlude]);
    }

    #[test]
    fn other_modes_skip_generative_editors() {
        let distort = engine(EditMode::Distort).with_content_aware(Identity);
        assert_eq!(
            Vec::from(distort.strategy_chain(true, true)),
            vec![Strategy::Pixelate, Strategy::Occlude]
        );
        let occlude = engine(EditMode::Occlude).with_inpaint(Identity);
        assert_eq!(Vec::from(occlude.strategy_chain(true, true)), vec![Strategy::Occlude]);
    }

    #[test]
    fn oversized_input_is_downscaled() {
        let e = RemediationEngine::new(
            PipelineConfig {
                max_dimension: 100,
                ..PipelineConfig::default()
            },
            NoDetector,
            CleanVerifier,
        )
        .unwrap();
        let big = Image::new(RgbImage::from_pixel(400, 200, Rgb([10, 20, 30])));
        let Ok(small) = e.normalize(&big) else {
            panic!("normalize failed");
        };
        assert_eq!(small.dimensions(), (100, 50));

        let fits = Image::new(RgbImage::new(100, 10));
        let Ok(same) = e.normalize(&fits) else {
            panic!("normalize failed");
        };
        assert!(same.same_buffer(&fits));
        assert!(e.normalize(&Image::new(RgbImage::new(0, 0))).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PipelineConfig {
            concurrency: 0,
            ..PipelineConfig::default()
        };
        assert!(RemediationEngine::new(config, NoDetector, CleanVerifier).is_err());
    }

    #[test]
    fn request_builder_collects_brands() {
        let req = RemediationRequest::new("sku", Image::new(RgbImage::new(1, 1)))
            .with_brands(["Nike", "Adidas"])
            .with_prior_risk(5.0);
        assert_eq!(req.suspected_brands.len(), 2);
        assert_eq!(req.prior_risk_score, Some(5.0));
    }

    #[test]
    fn verifier_disagreement_triggers_remediation() {
        let dirty = Verification {
            risk_score: 10.0,
            residual_regions: Vec::new(),
            is_clean: false,
        };
        assert!(needs_remediation(&dirty, 30.0));
        let risky = Verification {
            risk_score: 55.0,
            residual_regions: Vec::new(),
            is_clean: true,
        };
        assert!(needs_remediation(&risky, 30.0));
        let clean = Verification {
            risk_score: 15.0,
            residual_regions: Vec::new(),
            is_clean: true,
        };
        assert!(!needs_remediation(&clean, 30.0));
    }

    #[test]
    fn batch_preserves_request_order() {
        let e = engine(EditMode::Generative);
        let requests: Vec<_> = (0..5)
            .map(|i| RemediationRequest::new(format!("sku-{i}"), Image::new(RgbImage::new(i + 1, 1))))
            .collect();
        let results = e.process_batch(&requests, &CancelToken::new());
        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.status, Status::Clean);
            let width = result.final_image.as_ref().map(Image::width);
            assert_eq!(width, Some(u32::try_from(i).unwrap() + 1));
        }
    }

    #[test]
    fn default_output_path_appends_clean_suffix() {
        let p = default_output_path(Path::new("/tmp/photo.jpg"));
        assert_eq!(p, PathBuf::from("/tmp/photo_clean.jpg"));

        let p = default_output_path(Path::new("image.png"));
        assert_eq!(p.file_name().unwrap().to_str().unwrap(), "image_clean.png");
    }

    #[test]
    fn is_supported_image_accepts_common_formats() {
        assert!(is_supported_image(Path::new("photo.jpg")));
        assert!(is_supported_image(Path::new("photo.JPEG")));
        assert!(is_supported_image(Path::new("photo.png")));
        assert!(is_supported_image(Path::new("photo.webp")));
        assert!(is_supported_image(Path::new("photo.bmp")));
    }

    #[test]
    fn is_supported_image_rejects_unsupported_formats() {
        assert!(!is_supported_image(Path::new("photo.gif")));
        assert!(!is_supported_image(Path::new("photo.txt")));
        assert!(!is_supported_image(Path::new("photo")));
    }

    #[test]
    fn saved_png_loads_back_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let img = Image::new(RgbImage::from_fn(6, 4, |x, y| Rgb([x as u8 * 40, y as u8 * 60, 7])));
        save_image(&img, &path).unwrap();
        let back = load_image(&path).unwrap();
        assert_eq!(back.pixels(), img.pixels());
        assert!(save_image(&img, &dir.path().join("out.gif")).is_err());
    }
}

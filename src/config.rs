//! Configuration types for bundle ingestion and ID matching.
//!
//! Ingestion behaviour is controlled through [`IngestConfig`], built via
//! its [`IngestConfigBuilder`]. Everything a stage needs (magic code, ID
//! page, anchor geometry) is passed in here explicitly, never read from
//! globals, so concurrent bundle runs do not share hidden state.
//!
//! Matching has its own small [`MatchConfig`] since it runs as a separate
//! batch step over everything the ingestion runs have accumulated.

use crate::error::IngestError;
use crate::pipeline::idbox::AnchorSet;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Shared flag that aborts a bundle run between pages when set.
pub type CancelFlag = Arc<AtomicBool>;

/// Configuration for ingesting scanned bundles.
///
/// # Example
/// ```rust
/// use exam_ingest::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .workspace_dir("/tmp/exam-workspace")
///     .magic_code("midterm-2026")
///     .concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.id_page, 1);
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Root of the on-disk workspace (staging, archive, registry, ledger).
    pub workspace_dir: PathBuf,

    /// Magic string identifying the active assessment. Required.
    ///
    /// A page whose QR payloads parse as a TPV code but carry a different
    /// magic string is routed as WrongTest.
    pub magic_code: String,

    /// Page number (within a paper) that carries the handwritten ID box. Default: 1.
    pub id_page: u32,

    /// Number of digits in a student id. Default: 8.
    pub id_length: usize,

    /// Longest rendered edge in pixels. Default: 2000.
    ///
    /// QR modules and ID digits stay legible at this size for A4/Letter
    /// scans, and the anchor geometry is scaled to whatever size results.
    pub max_rendered_pixels: u32,

    /// Pages decoded and classified concurrently. Default: 4.
    pub concurrency: usize,

    /// Push retries per page before the page is left routed-but-unpushed. Default: 3.
    pub max_retries: u32,

    /// Initial push retry delay in milliseconds, doubled per attempt. Default: 250.
    pub retry_backoff_ms: u64,

    /// Per-version ID-box geometry.
    pub anchors: AnchorSet,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Optional cancellation flag checked between stages.
    pub cancel: Option<CancelFlag>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            magic_code: String::new(),
            id_page: 1,
            id_length: 8,
            max_rendered_pixels: 2000,
            concurrency: 4,
            max_retries: 3,
            retry_backoff_ms: 250,
            anchors: AnchorSet::default(),
            progress_callback: None,
            cancel: None,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("workspace_dir", &self.workspace_dir)
            .field("magic_code", &self.magic_code)
            .field("id_page", &self.id_page)
            .field("id_length", &self.id_length)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("anchors", &self.anchors.versions())
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn IngestProgressCallback>"),
            )
            .finish()
    }
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(std::sync::atomic::Ordering::SeqCst))
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.workspace_dir = dir.into();
        self
    }

    pub fn magic_code(mut self, magic: impl Into<String>) -> Self {
        self.config.magic_code = magic.into();
        self
    }

    pub fn id_page(mut self, page: u32) -> Self {
        self.config.id_page = page;
        self
    }

    pub fn id_length(mut self, len: usize) -> Self {
        self.config.id_length = len;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(200);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn anchors(mut self, anchors: AnchorSet) -> Self {
        self.config.anchors = anchors;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.config.cancel = Some(flag);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.magic_code.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "magic code must be set for the active assessment".into(),
            ));
        }
        if c.id_page == 0 {
            return Err(IngestError::InvalidConfig("ID page is 1-indexed".into()));
        }
        if c.id_length == 0 {
            return Err(IngestError::InvalidConfig("ID length must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

// ── Matching ─────────────────────────────────────────────────────────────

/// What to do when several assignments reach the same minimum total cost.
///
/// The exact solver is deterministic, so both policies return the same
/// assignment for the same input; they differ in whether a non-unique
/// assignment is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Accept whichever optimal assignment the solver reaches first.
    SolverOrder,
    /// Keep the solver's assignment, but mark every paper whose student
    /// could be swapped without raising the total cost for review.
    #[default]
    FlagForReview,
}

/// Configuration for a batch ID-matching run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Predictions whose cost exceeds this are marked for review. Default: 5.0.
    ///
    /// Cost is a sum of negative log-likelihoods over the digits, so 5.0 on
    /// an 8-digit id is roughly a mean per-digit probability of 0.53.
    pub review_cost_threshold: f64,

    /// Tie handling for the exact solver. Default: [`TieBreak::FlagForReview`].
    pub tie_break: TieBreak,

    /// Also emit secondary greedy predictions. Default: true.
    pub run_greedy: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            review_cost_threshold: 5.0,
            tie_break: TieBreak::default(),
            run_greedy: true,
        }
    }
}

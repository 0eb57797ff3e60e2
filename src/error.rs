//! Error types for the exam-ingest library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`IngestError`] — **Fatal** for one bundle run: the bundle cannot be
//!   accepted or split at all (corrupt PDF, name collision, unreadable
//!   workspace). Returned as `Err(IngestError)` from [`crate::ingest`].
//!
//! * [`PageError`] — **Non-fatal**: a single page or digit failed (bad QR
//!   copies, missing ID-box geometry, classifier or push failure) while the
//!   rest of the bundle proceeds. Collected inside
//!   [`crate::ingest::BundleReport`] so operators see every offending page.
//!
//! Matching has its own per-paper [`MatchError`], and roster loading its own
//! [`RosterError`], since neither belongs to a bundle run.

use crate::model::{ContentDigest, TpvCode};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by a bundle ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Bundle file was not found at the given path.
    #[error("Bundle file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("Bundle '{path}' is not a PDF\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// The bundle name derived from the file stem is unusable.
    #[error("Invalid bundle name '{name}': {reason}")]
    InvalidBundleName { name: String, reason: String },

    // ── Bundle acceptance ─────────────────────────────────────────────────
    /// The source cannot be rasterised. Needs a corrected source file.
    #[error("Bundle '{bundle}' is corrupt: {detail}")]
    CorruptBundle { bundle: String, detail: String },

    /// Identical content was already archived. Benign no-op.
    #[error("Bundle '{bundle}' has the same content as archived bundle '{existing}' ({digest})")]
    DuplicateBundle {
        bundle: String,
        existing: String,
        digest: ContentDigest,
    },

    /// Same name as a known bundle but different content. Needs an operator rename.
    #[error(
        "Bundle name '{bundle}' is already used by different content\n\
         known: {known}\nincoming: {incoming}\nRename the file and try again."
    )]
    BundleNameCollision {
        bundle: String,
        known: ContentDigest,
        incoming: ContentDigest,
    },

    /// No page with this number in the bundle's last report.
    #[error("Bundle '{bundle}' has no page {page}")]
    PageNotFound { bundle: String, page: u32 },

    /// An operator action is not allowed from the page's current state.
    #[error("Bundle '{bundle}' page {page}: {source}")]
    InvalidTransition {
        bundle: String,
        page: u32,
        #[source]
        source: crate::pipeline::route::TransitionError,
    },

    /// The run was cancelled before every page reached a terminal state.
    #[error("Ingestion of bundle '{bundle}' was cancelled; re-run to resume")]
    Cancelled { bundle: String },

    // ── Workspace errors ──────────────────────────────────────────────────
    /// Could not read or write a workspace file.
    #[error("Workspace I/O failed for '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A workspace JSON file exists but cannot be parsed.
    #[error("Workspace file '{path}' is malformed: {detail}")]
    WorkspaceFormat { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
         Set PDFIUM_LIB_PATH=/path/to/libpdfium or place the library next to the binary."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// True when the error means "nothing to do" rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, IngestError::DuplicateBundle { .. })
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Workspace {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single page, digit or push.
///
/// Stored in [`crate::ingest::BundleReport::errors`]. The bundle run
/// continues, but pages with errors may keep the bundle from archiving.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page image could not be loaded back from staging.
    #[error("{bundle} page {page}: image unreadable: {detail}")]
    ImageUnreadable {
        bundle: String,
        page: u32,
        detail: String,
    },

    /// Redundant QR copies on one page disagree. Needs human triage.
    #[error("{bundle} page {page}: QR copies disagree: {}", format_codes(.codes))]
    QrInconsistent {
        bundle: String,
        page: u32,
        codes: Vec<TpvCode>,
    },

    /// Two different scans claim the same paper/page/version.
    #[error("{bundle} page {page}: {tpv} already claimed by a different scan ({existing})")]
    ReportableDuplicate {
        bundle: String,
        page: u32,
        tpv: TpvCode,
        existing: ContentDigest,
    },

    /// No ID-box geometry for this version. Blocks matching for the version only.
    #[error("paper {paper}: no ID-box anchors configured for version {version}")]
    AnchorNotConfigured { paper: u32, version: u32 },

    /// The configured ID-box rectangle does not fit the page.
    #[error("paper {paper}: ID box crop failed: {detail}")]
    IdBoxCrop { paper: u32, detail: String },

    /// A single digit cell could not be classified; cost degraded to infinite.
    #[error("paper {paper} digit {position}: classifier failed: {detail}")]
    ClassifierFailed {
        paper: u32,
        position: usize,
        detail: String,
    },

    /// Pushing failed after all retries; the page stays routed-but-unpushed.
    #[error("{bundle} page {page}: push failed after {retries} retries: {detail}")]
    PushFailed {
        bundle: String,
        page: u32,
        retries: u32,
        detail: String,
    },

    /// A file move between workspace directories failed.
    #[error("{bundle} page {page}: could not move page file: {detail}")]
    FileMove {
        bundle: String,
        page: u32,
        detail: String,
    },
}

fn format_codes(codes: &[TpvCode]) -> String {
    codes
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while loading a classlist.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("Failed to read classlist '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// A row's student id is empty or not all ASCII digits.
    #[error("Classlist row {row}: invalid student id '{id}'")]
    InvalidId { row: usize, id: String },

    /// Duplicate ids are a configuration error; all of them are listed.
    #[error("Classlist contains duplicate student ids: {}", .ids.join(", "))]
    DuplicateIds { ids: Vec<String> },
}

/// Per-paper matching failures. Never abort the batch.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MatchError {
    /// No length-compatible roster entry is available for this paper.
    #[error("paper {paper}: no length-compatible classlist entry available")]
    AssignmentInfeasible { paper: u32 },

    /// Compatible roster entries exist, but all went to better-fitting papers.
    #[error("paper {paper}: every compatible classlist entry is already assigned")]
    RosterExhausted { paper: u32 },

    /// An already-identified paper names a student missing from the classlist.
    #[error("paper {paper}: prenamed student '{student_id}' is not in the classlist")]
    UnknownPrenamedStudent { paper: u32, student_id: String },
}

/// Errors returned by a [`crate::gateway::PushGateway`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("gateway request failed: {0}")]
    Http(String),

    #[error("gateway rejected page: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The gateway itself failed, not the transport.
    #[error("gateway internal error: {0}")]
    Internal(String),
}

/// Errors returned by a [`crate::pipeline::classify::DigitClassifier`].
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier returned {got} scores, expected 10")]
    WrongArity { got: usize },

    #[error("classifier failed: {0}")]
    Failed(String),
}

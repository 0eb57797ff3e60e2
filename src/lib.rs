//! # exam-ingest
//!
//! Ingest scanned exam bundles: split each PDF into page images, read the
//! QR codes printed on every page, route pages by what they carry, push
//! them to a downstream store exactly once, and propose which student
//! wrote each paper by matching handwritten ID digits against a classlist.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bundle.pdf
//!  │
//!  ├─ 1. Hash    SHA-256 of the bundle; duplicate and collision checks
//!  ├─ 2. Split   rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Decode  QR payloads → TPV code + magic string (rqrr)
//!  ├─ 4. Route   Valid / Unknown / WrongTest / Duplicate, serialized per bundle
//!  ├─ 5. ID      crop the ID box, classify each digit cell
//!  ├─ 6. Push    gateway with retry + backoff, recorded in the push ledger
//!  └─ 7. Match   min-cost assignment of papers to students (batch)
//! ```
//!
//! Steps 1–6 run per bundle through [`Ingestor`]. Step 7 runs once over
//! everything accumulated, through [`match_papers`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam_ingest::{ArchiveGateway, IngestConfig, Ingestor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = IngestConfig::builder()
//!         .workspace_dir("workspace")
//!         .magic_code("midterm-2026")
//!         .build()?;
//!     let gateway = Arc::new(ArchiveGateway::open("workspace/archive")?);
//!     let ingestor = Ingestor::new(config, gateway)?;
//!
//!     let report = ingestor.ingest_bundle("scans/scan_001.pdf".as_ref()).await?;
//!     eprintln!("{:?} archived={}", report.category_counts(), report.archived);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `exam-ingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! exam-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod matching;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod roster;
pub mod workspace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{CancelFlag, IngestConfig, IngestConfigBuilder, MatchConfig, TieBreak};
pub use error::{
    ClassifierError, GatewayError, IngestError, MatchError, PageError, RosterError,
};
pub use gateway::{ArchiveGateway, HttpGateway, MemoryGateway, PushAck, PushGateway};
pub use ingest::{
    ingest_bundle, ingest_bundle_sync, BundleReport, IdAccumulator, Ingestor, PageRecord,
};
pub use matching::{match_papers, MatchReport, MatchRequest};
pub use model::{
    Bundle, BundleState, ClasslistEntry, ContentDigest, Method, PageImage, Prediction,
    RouteCategory, TpvCode, TpvKey,
};
pub use pipeline::classify::{DigitClassifier, PaperDigits};
pub use pipeline::idbox::{AnchorSet, IdBoxTemplate};
pub use pipeline::qr::DecodeResult;
pub use pipeline::route::PageState;
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use roster::load_classlist;

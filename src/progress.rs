//! Progress-callback trait for per-page ingestion events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::config::IngestConfigBuilder::progress_callback`] to receive
//! events as the pipeline routes and pushes each page of a bundle.
//!
//! # Example
//!
//! ```rust
//! use exam_ingest::{IngestConfig, IngestProgressCallback, RouteCategory};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountValid {
//!     valid: AtomicUsize,
//! }
//!
//! impl IngestProgressCallback for CountValid {
//!     fn on_page_routed(&self, _bundle: &str, _page: u32, category: RouteCategory) {
//!         if category == RouteCategory::Valid {
//!             self.valid.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = IngestConfig::builder()
//!     .magic_code("final-exam")
//!     .progress_callback(Arc::new(CountValid { valid: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::RouteCategory;
use std::sync::Arc;

/// Called by the ingestion pipeline as it processes a bundle.
///
/// Decode and extraction run concurrently, so implementations must be
/// `Send + Sync` and protect shared state themselves. All methods default
/// to no-ops.
pub trait IngestProgressCallback: Send + Sync {
    /// Called once the bundle has been split.
    fn on_bundle_start(&self, bundle: &str, total_pages: usize) {
        let _ = (bundle, total_pages);
    }

    /// Called when a page is assigned its routing category.
    fn on_page_routed(&self, bundle: &str, page: u32, category: RouteCategory) {
        let _ = (bundle, page, category);
    }

    /// Called for every non-fatal page error.
    fn on_page_error(&self, bundle: &str, page: u32, error: &str) {
        let _ = (bundle, page, error);
    }

    /// Called once after every page has been attempted.
    ///
    /// `archived` is false when some page is still routed-but-unpushed.
    fn on_bundle_complete(&self, bundle: &str, total_pages: usize, archived: bool) {
        let _ = (bundle, total_pages, archived);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::IngestConfig`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;

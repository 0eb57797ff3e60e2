//! Bundle ingestion: one PDF in, every page routed, pushed or held.
//!
//! ```text
//! check ─▶ hash ─▶ admit ─▶ split ─▶ decode ∥ ─▶ route (serial) ─▶ ID ∥ ─▶ push ∥ ─▶ file ─▶ archive?
//! ```
//!
//! Decoding, ID extraction and pushing run concurrently across pages
//! (`buffer_unordered`). Routing is serialized per bundle: the push ledger
//! stays locked while every page of the bundle is routed, so two pages
//! can never race for the same TPV code.
//!
//! A run never advances a page past routed-but-unpushed unless the gateway
//! acknowledged it, and every acknowledgement is in the ledger before the
//! next page is considered. Re-running an interrupted bundle therefore
//! picks up exactly where it stopped.

use crate::config::IngestConfig;
use crate::error::{IngestError, PageError};
use crate::gateway::{ArchiveGateway, PushAck, PushGateway};
use crate::model::{Bundle, ContentDigest, PageImage, RouteCategory, TpvCode};
use crate::pipeline::classify::{classify_id_box, DigitClassifier, PaperDigits};
use crate::pipeline::idbox::{extract_id_box, AnchorSet};
use crate::pipeline::qr::{self, DecodeResult};
use crate::pipeline::route::{PageRouter, PageState};
use crate::pipeline::split;
use crate::workspace::{
    move_into, read_json_or_default, write_json_atomic, Admission, BundleRegistry, LedgerEntry,
    PushLedger, Workspace,
};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

// ── Report types ─────────────────────────────────────────────────────────

/// Final state of one page after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// 1-based position in the bundle.
    pub page: u32,
    pub digest: ContentDigest,
    pub state: PageState,
}

/// Outcome of one bundle run, also persisted as `reports/{bundle}.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleReport {
    pub bundle: String,
    pub pages: Vec<PageRecord>,
    /// Non-fatal page, paper and push failures.
    pub errors: Vec<PageError>,
    /// TPV page numbers that go backwards within one paper.
    pub order_warnings: Vec<String>,
    /// True once every page reached a terminal state.
    pub archived: bool,
}

impl BundleReport {
    /// Pages per routing category. Unprocessed pages are not counted.
    pub fn category_counts(&self) -> BTreeMap<RouteCategory, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.pages {
            if let Some(category) = record.state.category() {
                *counts.entry(category).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Pages that could not be routed this run (unreadable images).
    pub fn unprocessed(&self) -> usize {
        self.pages
            .iter()
            .filter(|r| r.state == PageState::Unprocessed)
            .count()
    }

    /// Routed but not yet acknowledged by the gateway.
    pub fn unpushed(&self) -> usize {
        self.pages.iter().filter(|r| r.state.is_pushable()).count()
    }

    pub fn page(&self, page: u32) -> Option<&PageRecord> {
        self.pages.iter().find(|r| r.page == page)
    }

    fn all_terminal(&self) -> bool {
        self.pages.iter().all(|r| r.state.is_terminal())
    }
}

// ── ID accumulator ───────────────────────────────────────────────────────

/// Classifier output for every ID page seen so far, keyed by paper number.
///
/// Shared by concurrent extraction tasks. Matching reads a [`snapshot`]
/// once every bundle of the batch has been ingested.
///
/// [`snapshot`]: IdAccumulator::snapshot
#[derive(Debug, Default)]
pub struct IdAccumulator {
    papers: std::sync::Mutex<BTreeMap<u32, PaperDigits>>,
}

impl IdAccumulator {
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let list: Vec<PaperDigits> = read_json_or_default(path)?;
        Ok(Self {
            papers: std::sync::Mutex::new(
                list.into_iter().map(|p| (p.paper_number, p)).collect(),
            ),
        })
    }

    /// Write every paper to `path`. The paper lock is held for the write so
    /// concurrent saves land one after another.
    pub fn save(&self, path: &Path) -> Result<(), IngestError> {
        let papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        write_json_atomic(path, &papers.values().collect::<Vec<_>>())
    }

    /// Insert or replace a paper's digits.
    pub fn insert(&self, digits: PaperDigits) {
        let mut papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        papers.insert(digits.paper_number, digits);
    }

    /// Every paper, ordered by paper number.
    pub fn snapshot(&self) -> Vec<PaperDigits> {
        let papers = self.papers.lock().unwrap_or_else(|e| e.into_inner());
        papers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.papers.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Ingestor ─────────────────────────────────────────────────────────────

/// Long-lived ingestion service over one workspace.
///
/// Share it behind an `Arc` to ingest several bundles concurrently; the
/// registry and ledger are locked internally.
pub struct Ingestor {
    config: IngestConfig,
    workspace: Workspace,
    gateway: Arc<dyn PushGateway>,
    classifier: Option<Arc<dyn DigitClassifier>>,
    registry: Mutex<BundleRegistry>,
    ledger: Mutex<PushLedger>,
    ids: IdAccumulator,
}

impl Ingestor {
    /// Open the workspace named in `config` and load its registry, ledger
    /// and accumulated ID likelihoods.
    pub fn new(config: IngestConfig, gateway: Arc<dyn PushGateway>) -> Result<Self, IngestError> {
        let workspace = Workspace::open(&config.workspace_dir)?;
        let registry = BundleRegistry::load(&workspace.registry_file())?;
        let ledger = PushLedger::load(&workspace.ledger_file())?;
        let ids = IdAccumulator::load(&workspace.likelihoods_file())?;
        info!(
            workspace = %workspace.root().display(),
            gateway = gateway.name(),
            pushed = ledger.len(),
            papers = ids.len(),
            "Ingestor ready"
        );
        Ok(Self {
            config,
            workspace,
            gateway,
            classifier: None,
            registry: Mutex::new(registry),
            ledger: Mutex::new(ledger),
            ids,
        })
    }

    /// Classify ID boxes with `classifier`. Without one, ID boxes are still
    /// cropped and saved, but no likelihoods are accumulated.
    pub fn with_classifier(mut self, classifier: Arc<dyn DigitClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn id_likelihoods(&self) -> &IdAccumulator {
        &self.ids
    }

    /// Every known bundle, ordered by name.
    pub async fn bundles(&self) -> Vec<Bundle> {
        self.registry.lock().await.iter().cloned().collect()
    }

    /// The last persisted report of a bundle, if it has been processed.
    pub fn load_report(&self, bundle: &str) -> Result<Option<BundleReport>, IngestError> {
        let report: BundleReport = read_json_or_default(&self.workspace.report_file(bundle))?;
        Ok((!report.bundle.is_empty()).then_some(report))
    }

    /// Ingest one scanned PDF bundle.
    ///
    /// # Errors
    /// Returns `Err(IngestError)` only when the bundle as a whole cannot be
    /// accepted: not a PDF, corrupt, already archived (benign), a name
    /// collision, cancellation, or workspace I/O. Per-page failures land in
    /// [`BundleReport::errors`].
    pub async fn ingest_bundle(&self, pdf_path: &Path) -> Result<BundleReport, IngestError> {
        info!("Starting ingestion: {}", pdf_path.display());

        // ── Step 1: Validate input ───────────────────────────────────────
        split::check_pdf(pdf_path)?;
        let name = bundle_name(pdf_path)?;

        // ── Step 2: Hash + admit ─────────────────────────────────────────
        let digest = ContentDigest::of_file(pdf_path)
            .await
            .map_err(|e| IngestError::workspace(pdf_path, e))?;
        let admission = self.admit(&name, &digest).await?;
        debug!(bundle = %name, ?admission, "Bundle admitted");

        // ── Step 3: Split ────────────────────────────────────────────────
        let pages = match split::split_bundle(
            pdf_path,
            &name,
            &self.workspace.staging_dir(),
            self.config.max_rendered_pixels,
        )
        .await
        {
            Ok(pages) => pages,
            Err(e) => {
                if matches!(e, IngestError::CorruptBundle { .. }) {
                    let mut registry = self.registry.lock().await;
                    registry.forget(&name);
                    registry.save(&self.workspace.registry_file())?;
                }
                return Err(e);
            }
        };
        info!(bundle = %name, pages = pages.len(), "Bundle split");

        self.process_pages(&name, pages).await
    }

    /// Ingest pages that were already rasterised and staged.
    ///
    /// `bundle_digest` identifies the source for duplicate-bundle and
    /// name-collision checks, exactly as in [`Ingestor::ingest_bundle`].
    pub async fn ingest_pages(
        &self,
        bundle: &str,
        bundle_digest: &ContentDigest,
        pages: Vec<PageImage>,
    ) -> Result<BundleReport, IngestError> {
        validate_bundle_name(bundle)?;
        self.admit(bundle, bundle_digest).await?;
        self.process_pages(bundle, pages).await
    }

    /// Operator-confirmed discard of a wrong-test or unknown page.
    ///
    /// Moves the page file to `discard/`, and archives the bundle when this
    /// was the last non-terminal page.
    pub async fn confirm_discard(&self, bundle: &str, page: u32) -> Result<PageState, IngestError> {
        let mut report = self.load_report(bundle)?.ok_or(IngestError::PageNotFound {
            bundle: bundle.to_string(),
            page,
        })?;
        let record = report
            .pages
            .iter_mut()
            .find(|r| r.page == page)
            .ok_or(IngestError::PageNotFound {
                bundle: bundle.to_string(),
                page,
            })?;

        let discarded =
            record
                .state
                .clone()
                .discard()
                .map_err(|source| IngestError::InvalidTransition {
                    bundle: bundle.to_string(),
                    page,
                    source,
                })?;

        let staged = self
            .workspace
            .staging_dir()
            .join(PageImage::file_name(bundle, page));
        if staged.exists() {
            move_into(&staged, &self.workspace.discard_dir())
                .map_err(|e| IngestError::workspace(&staged, e))?;
        }
        record.state = discarded.clone();
        info!(bundle, page, "Page discarded by operator");

        if report.all_terminal() && !report.archived {
            report.archived = true;
            let mut registry = self.registry.lock().await;
            registry.mark_archived(bundle);
            registry.save(&self.workspace.registry_file())?;
        }
        write_json_atomic(&self.workspace.report_file(bundle), &report)?;
        Ok(discarded)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    async fn admit(&self, name: &str, digest: &ContentDigest) -> Result<Admission, IngestError> {
        let mut registry = self.registry.lock().await;
        let admission = registry.admit(name, digest)?;
        registry.save(&self.workspace.registry_file())?;
        Ok(admission)
    }

    /// Route, identify and push every page, then release any claims the
    /// run still holds, on success and failure alike.
    async fn process_pages(
        &self,
        bundle: &str,
        pages: Vec<PageImage>,
    ) -> Result<BundleReport, IngestError> {
        let result = self.process_inner(bundle, pages).await;

        let mut ledger = self.ledger.lock().await;
        ledger.release_claims(bundle);
        ledger.save(&self.workspace.ledger_file())?;
        drop(ledger);

        if let Err(e) = &result {
            warn!(bundle, "Bundle run stopped: {}", e);
        }
        result
    }

    async fn process_inner(
        &self,
        bundle: &str,
        mut pages: Vec<PageImage>,
    ) -> Result<BundleReport, IngestError> {
        pages.sort_by_key(|p| p.index);
        let total_pages = pages.len();

        {
            let mut registry = self.registry.lock().await;
            registry.set_pages(bundle, pages.iter().map(|p| p.digest.clone()).collect());
            registry.save(&self.workspace.registry_file())?;
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_bundle_start(bundle, total_pages);
        }

        let previous = self.load_report(bundle)?.unwrap_or_default();
        let mut errors: Vec<PageError> = Vec::new();
        self.check_cancelled(bundle)?;

        // ── Step 4: Decode QR codes ──────────────────────────────────────
        // Pages already pushed by an earlier run skip decoding; routing
        // restores them from the ledger.
        let resumed: HashSet<u32> = {
            let ledger = self.ledger.lock().await;
            pages
                .iter()
                .filter(|p| {
                    ledger
                        .entry(&p.digest)
                        .is_some_and(|e| e.bundle == bundle && e.page == p.index)
                })
                .map(|p| p.index)
                .collect()
        };
        let mut decoded = self.decode_all(&pages, &resumed).await;

        // ── Step 5: Route (serial, ledger locked) ────────────────────────
        let mut records = Vec::with_capacity(total_pages);
        {
            let mut ledger = self.ledger.lock().await;
            let mut router = PageRouter::new(bundle, &mut ledger);
            for page in &pages {
                let state = match previous.page(page.index) {
                    Some(prev)
                        if prev.digest == page.digest
                            && matches!(prev.state, PageState::Discarded { .. }) =>
                    {
                        prev.state.clone()
                    }
                    _ => match decoded.remove(&page.index) {
                        Some(Ok(result)) => router.route(page, result),
                        Some(Err(e)) => {
                            self.report_error(bundle, &mut errors, page.index, e);
                            PageState::Unprocessed
                        }
                        None => PageState::Unprocessed,
                    },
                };

                match &state {
                    PageState::PendingReview { codes } => self.report_error(
                        bundle,
                        &mut errors,
                        page.index,
                        PageError::QrInconsistent {
                            bundle: bundle.to_string(),
                            page: page.index,
                            codes: codes.clone(),
                        },
                    ),
                    PageState::DuplicateRejected {
                        tpv: Some(tpv),
                        reportable: true,
                        existing,
                    } => self.report_error(
                        bundle,
                        &mut errors,
                        page.index,
                        PageError::ReportableDuplicate {
                            bundle: bundle.to_string(),
                            page: page.index,
                            tpv: tpv.clone(),
                            existing: existing.clone(),
                        },
                    ),
                    _ => {}
                }

                if let (Some(ref cb), Some(category)) =
                    (&self.config.progress_callback, state.category())
                {
                    cb.on_page_routed(bundle, page.index, category);
                }
                records.push(PageRecord {
                    page: page.index,
                    digest: page.digest.clone(),
                    state,
                });
            }
        }
        let order_warnings = check_page_order(&records);
        for w in &order_warnings {
            warn!(bundle, "{}", w);
        }
        self.check_cancelled(bundle)?;

        // ── Step 6: Extract + classify ID boxes ──────────────────────────
        let id_errors = self.identify(&pages, &records).await;
        for (page, e) in id_errors {
            self.report_error(bundle, &mut errors, page, e);
        }
        self.ids.save(&self.workspace.likelihoods_file())?;

        // ── Step 7: Push ─────────────────────────────────────────────────
        self.push_all(bundle, &pages, &mut records, &mut errors).await?;

        // ── Step 8: File pages by final state ────────────────────────────
        for (page, record) in pages.iter().zip(records.iter()) {
            if let Err(e) = self.file_page(page, &record.state) {
                self.report_error(bundle, &mut errors, page.index, e);
            }
        }

        // ── Step 9: Archive + report ─────────────────────────────────────
        let mut report = BundleReport {
            bundle: bundle.to_string(),
            pages: records,
            errors,
            order_warnings,
            archived: false,
        };
        if report.all_terminal() {
            report.archived = true;
            let mut registry = self.registry.lock().await;
            registry.mark_archived(bundle);
            registry.save(&self.workspace.registry_file())?;
        }
        write_json_atomic(&self.workspace.report_file(bundle), &report)?;

        let counts = report.category_counts();
        info!(
            bundle,
            pages = total_pages,
            valid = counts.get(&RouteCategory::Valid).copied().unwrap_or(0),
            unknown = counts.get(&RouteCategory::Unknown).copied().unwrap_or(0),
            wrong_test = counts.get(&RouteCategory::WrongTest).copied().unwrap_or(0),
            duplicate = counts.get(&RouteCategory::Duplicate).copied().unwrap_or(0),
            errors = report.errors.len(),
            archived = report.archived,
            "Bundle ingestion complete"
        );
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_bundle_complete(bundle, total_pages, report.archived);
        }
        Ok(report)
    }

    fn check_cancelled(&self, bundle: &str) -> Result<(), IngestError> {
        if self.config.is_cancelled() {
            return Err(IngestError::Cancelled {
                bundle: bundle.to_string(),
            });
        }
        Ok(())
    }

    fn report_error(&self, bundle: &str, errors: &mut Vec<PageError>, page: u32, error: PageError) {
        warn!("{}", error);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_page_error(bundle, page, &error.to_string());
        }
        errors.push(error);
    }

    /// Decode every non-resumed page concurrently on the blocking pool.
    async fn decode_all(
        &self,
        pages: &[PageImage],
        resumed: &HashSet<u32>,
    ) -> BTreeMap<u32, Result<DecodeResult, PageError>> {
        stream::iter(pages.iter().cloned().map(|page| {
            let magic = self.config.magic_code.clone();
            let skip = resumed.contains(&page.index);
            async move {
                let index = page.index;
                if skip {
                    return (index, Ok(DecodeResult::Unknown));
                }
                let bundle = page.bundle.clone();
                let result = tokio::task::spawn_blocking(move || decode_staged(&page, &magic))
                    .await
                    .unwrap_or_else(|e| {
                        Err(PageError::ImageUnreadable {
                            bundle,
                            page: index,
                            detail: format!("decode task panicked: {e}"),
                        })
                    });
                (index, result)
            }
        }))
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await
    }

    /// Crop, save and classify the ID box of every valid ID page.
    async fn identify(&self, pages: &[PageImage], records: &[PageRecord]) -> Vec<(u32, PageError)> {
        let id_pages: Vec<(PageImage, TpvCode)> = pages
            .iter()
            .zip(records)
            .filter(|(_, r)| r.state.category() == Some(RouteCategory::Valid))
            .filter_map(|(p, r)| r.state.tpv().map(|t| (p.clone(), t.clone())))
            .filter(|(_, tpv)| tpv.page == self.config.id_page)
            .collect();
        if id_pages.is_empty() {
            return Vec::new();
        }
        debug!(count = id_pages.len(), "Extracting ID boxes");

        let results: Vec<(u32, Option<PaperDigits>, Vec<PageError>)> =
            stream::iter(id_pages.into_iter().map(|(page, tpv)| {
                let anchors = self.config.anchors.clone();
                let classifier = self.classifier.clone();
                let id_length = self.config.id_length;
                let out = self
                    .workspace
                    .idbox_dir()
                    .join(format!("{:04}.png", tpv.paper));
                async move {
                    let index = page.index;
                    let paper = tpv.paper;
                    tokio::task::spawn_blocking(move || {
                        let (digits, errors) = identify_page(
                            &page,
                            &tpv,
                            &anchors,
                            classifier.as_deref(),
                            id_length,
                            &out,
                        );
                        (index, digits, errors)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        (
                            index,
                            None,
                            vec![PageError::IdBoxCrop {
                                paper,
                                detail: format!("extraction task panicked: {e}"),
                            }],
                        )
                    })
                }
            }))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut errors = Vec::new();
        for (index, digits, errs) in results {
            if let Some(d) = digits {
                self.ids.insert(d);
            }
            errors.extend(errs.into_iter().map(|e| (index, e)));
        }
        errors
    }

    /// Push every pushable page. Each acknowledgement is written to the
    /// ledger before the run moves on.
    async fn push_all(
        &self,
        bundle: &str,
        pages: &[PageImage],
        records: &mut [PageRecord],
        errors: &mut Vec<PageError>,
    ) -> Result<(), IngestError> {
        let pushable: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state.is_pushable())
            .map(|(i, _)| i)
            .collect();
        if pushable.is_empty() {
            return Ok(());
        }
        info!(bundle, pages = pushable.len(), gateway = self.gateway.name(), "Pushing pages");

        let mut outcomes = stream::iter(pushable.into_iter().map(move |i| {
            let page = &pages[i];
            async move {
                if self.config.is_cancelled() {
                    return (i, None);
                }
                (i, Some(self.push_with_retry(page).await))
            }
        }))
        .buffer_unordered(self.config.concurrency);

        let mut cancelled = false;
        while let Some((i, outcome)) = outcomes.next().await {
            let page = &pages[i];
            match outcome {
                None => cancelled = true,
                Some(Ok(ack)) => {
                    let pushed = records[i].state.clone().acknowledge().map_err(|e| {
                        IngestError::Internal(format!("{} page {}: {}", bundle, page.index, e))
                    })?;
                    let mut ledger = self.ledger.lock().await;
                    ledger.record(
                        page.digest.clone(),
                        LedgerEntry {
                            bundle: bundle.to_string(),
                            page: page.index,
                            category: pushed.category().unwrap_or(RouteCategory::Unknown),
                            tpv: pushed.tpv().cloned(),
                        },
                    );
                    ledger.save(&self.workspace.ledger_file())?;
                    debug!(bundle, page = page.index, ?ack, "Page pushed");
                    records[i].state = pushed;
                }
                Some(Err(e)) => self.report_error(bundle, errors, page.index, e),
            }
        }

        if cancelled {
            return Err(IngestError::Cancelled {
                bundle: bundle.to_string(),
            });
        }
        Ok(())
    }

    async fn push_with_retry(&self, page: &PageImage) -> Result<PushAck, PageError> {
        let png = tokio::fs::read(&page.path)
            .await
            .map_err(|e| PageError::ImageUnreadable {
                bundle: page.bundle.clone(),
                page: page.index,
                detail: e.to_string(),
            })?;

        let max_retries = self.config.max_retries;
        let mut last_err: Option<String> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = self
                    .config
                    .retry_backoff_ms
                    .saturating_mul(2u64.saturating_pow(attempt - 1));
                warn!(
                    "{} page {}: push retry {}/{} after {}ms",
                    page.bundle, page.index, attempt, max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.gateway.push(page, &png).await {
                Ok(ack) => return Ok(ack),
                Err(e) => {
                    warn!(
                        "{} page {}: push attempt {} failed: {}",
                        page.bundle,
                        page.index,
                        attempt + 1,
                        e
                    );
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(PageError::PushFailed {
            bundle: page.bundle.clone(),
            page: page.index,
            retries: max_retries,
            detail: last_err.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Move a staged page to the directory matching its final state.
    fn file_page(&self, page: &PageImage, state: &PageState) -> Result<(), PageError> {
        if !page.path.exists() {
            return Ok(());
        }
        let target_dir = match state {
            PageState::Pushed { .. } => {
                let archived = self
                    .workspace
                    .archive_dir()
                    .join(PageImage::file_name(&page.bundle, page.index));
                if archived.exists() && archived != page.path {
                    return std::fs::remove_file(&page.path).map_err(|e| file_move(page, e));
                }
                self.workspace.archive_dir()
            }
            PageState::PendingReview { .. }
            | PageState::DuplicateRejected {
                reportable: true, ..
            } => self.workspace.review_dir(),
            PageState::DuplicateRejected { .. } => self.workspace.duplicates_dir(),
            PageState::Discarded { .. } => self.workspace.discard_dir(),
            // Routed but unpushed, wrong-test awaiting an operator, or unreadable.
            _ => return Ok(()),
        };
        if page.path.parent() == Some(target_dir.as_path()) {
            return Ok(());
        }
        move_into(&page.path, &target_dir)
            .map(|_| ())
            .map_err(|e| file_move(page, e))
    }
}

// ── Free functions ───────────────────────────────────────────────────────

/// Ingest one bundle into the workspace archive, without a classifier.
///
/// Convenience wrapper for one-shot use; long-running callers should keep
/// an [`Ingestor`] so the registry and ledger are loaded once.
pub async fn ingest_bundle(pdf_path: &Path, config: &IngestConfig) -> Result<BundleReport, IngestError> {
    let archive = config.workspace_dir.join("archive");
    let gateway = ArchiveGateway::open(&archive)
        .map_err(|e| IngestError::Internal(format!("archive gateway: {e}")))?;
    Ingestor::new(config.clone(), Arc::new(gateway))?
        .ingest_bundle(pdf_path)
        .await
}

/// Synchronous wrapper around [`ingest_bundle`].
///
/// Creates a temporary tokio runtime internally.
pub fn ingest_bundle_sync(pdf_path: &Path, config: &IngestConfig) -> Result<BundleReport, IngestError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| IngestError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(ingest_bundle(pdf_path, config))
}

/// Bundle name from a PDF path: the file stem.
pub fn bundle_name(pdf_path: &Path) -> Result<String, IngestError> {
    let name = pdf_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| IngestError::InvalidBundleName {
            name: pdf_path.display().to_string(),
            reason: "file name is not valid UTF-8".into(),
        })?;
    validate_bundle_name(name)?;
    Ok(name.to_string())
}

fn validate_bundle_name(name: &str) -> Result<(), IngestError> {
    let reason = if name.trim().is_empty() {
        Some("name is empty")
    } else if name.contains(['/', '\\']) {
        Some("name contains a path separator")
    } else if name.starts_with('.') {
        Some("name starts with '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(IngestError::InvalidBundleName {
            name: name.to_string(),
            reason: reason.into(),
        }),
        None => Ok(()),
    }
}

/// Warn when TPV page numbers go backwards within one paper.
///
/// Only valid pages are considered, in split order. A paper's pages are
/// expected to appear with increasing page numbers; anything else usually
/// means a dropped or re-fed sheet.
pub fn check_page_order(records: &[PageRecord]) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut prev: Option<(u32, &TpvCode)> = None;
    for record in records {
        if record.state.category() != Some(RouteCategory::Valid) {
            continue;
        }
        let Some(tpv) = record.state.tpv() else {
            continue;
        };
        if let Some((prev_page, prev_tpv)) = prev {
            if prev_tpv.paper == tpv.paper && tpv.page <= prev_tpv.page {
                warnings.push(format!(
                    "page {}: {} follows {} (page {}) out of order",
                    record.page, tpv, prev_tpv, prev_page
                ));
            }
        }
        prev = Some((record.page, tpv));
    }
    warnings
}

fn decode_staged(page: &PageImage, magic: &str) -> Result<DecodeResult, PageError> {
    let img = image::open(&page.path)
        .map_err(|e| PageError::ImageUnreadable {
            bundle: page.bundle.clone(),
            page: page.index,
            detail: e.to_string(),
        })?
        .to_luma8();
    Ok(qr::decode_page(&img, magic))
}

/// Blocking body of ID extraction for one page.
fn identify_page(
    page: &PageImage,
    tpv: &TpvCode,
    anchors: &AnchorSet,
    classifier: Option<&dyn DigitClassifier>,
    id_length: usize,
    out: &Path,
) -> (Option<PaperDigits>, Vec<PageError>) {
    let img = match image::open(&page.path) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            return (
                None,
                vec![PageError::ImageUnreadable {
                    bundle: page.bundle.clone(),
                    page: page.index,
                    detail: e.to_string(),
                }],
            )
        }
    };
    let id_box = match extract_id_box(&img, tpv.paper, tpv.version, anchors) {
        Ok(b) => b,
        Err(e) => return (None, vec![e]),
    };

    match split::encode_png(&DynamicImage::ImageLuma8(id_box.clone())) {
        Ok(png) => {
            if let Err(e) = std::fs::write(out, png) {
                warn!(paper = tpv.paper, "Could not save ID box: {}", e);
            }
        }
        Err(e) => warn!(paper = tpv.paper, "Could not encode ID box: {}", e),
    }

    match classifier {
        Some(c) => {
            let (digits, errors) = classify_id_box(&id_box, tpv.paper, id_length, c);
            (Some(digits), errors)
        }
        None => (None, Vec::new()),
    }
}

fn file_move(page: &PageImage, e: std::io::Error) -> PageError {
    PageError::FileMove {
        bundle: page.bundle.clone(),
        page: page.index,
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifierError;
    use crate::gateway::MemoryGateway;
    use crate::pipeline::idbox::IdBoxTemplate;
    use crate::pipeline::qr::tests::page_with;
    use image::{GrayImage, Luma};
    use std::sync::atomic::AtomicBool;

    const MAGIC: &str = "midterm-2026";

    fn config(dir: &Path) -> IngestConfig {
        IngestConfig::builder()
            .workspace_dir(dir)
            .magic_code(MAGIC)
            .retry_backoff_ms(1)
            .build()
            .unwrap()
    }

    fn stage(ws: &Path, bundle: &str, index: u32, img: &GrayImage) -> PageImage {
        let png = split::encode_png(&DynamicImage::ImageLuma8(img.clone())).unwrap();
        let staging = ws.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let path = staging.join(PageImage::file_name(bundle, index));
        std::fs::write(&path, &png).unwrap();
        PageImage {
            bundle: bundle.into(),
            index,
            digest: ContentDigest::of(&png),
            path,
            width: img.width(),
            height: img.height(),
        }
    }

    fn blank() -> GrayImage {
        GrayImage::from_pixel(300, 400, Luma([255]))
    }

    struct Uniform;

    impl DigitClassifier for Uniform {
        fn classify(&self, _cell: &GrayImage) -> Result<Vec<f64>, ClassifierError> {
            Ok(vec![-(10f64.ln()); 10])
        }
    }

    #[test]
    fn bundle_names_come_from_file_stem() {
        assert_eq!(bundle_name(Path::new("/scans/scan_042.pdf")).unwrap(), "scan_042");
        assert!(bundle_name(Path::new("/scans/.pdf")).is_err());
        assert!(validate_bundle_name("a/b").is_err());
        assert!(validate_bundle_name("  ").is_err());
    }

    #[test]
    fn page_order_warns_on_backwards_pages() {
        let rec = |page, tpv: TpvCode| PageRecord {
            page,
            digest: ContentDigest::of(&page.to_le_bytes()),
            state: PageState::ValidRouted { tpv },
        };
        let records = vec![
            rec(1, TpvCode::new(1, 1, 1, MAGIC)),
            rec(2, TpvCode::new(1, 3, 1, MAGIC)),
            rec(3, TpvCode::new(1, 2, 1, MAGIC)),
            rec(4, TpvCode::new(2, 1, 1, MAGIC)),
        ];
        let warnings = check_page_order(&records);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("t0001p02v1"), "got {warnings:?}");
    }

    #[test]
    fn accumulator_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");
        let acc = IdAccumulator::default();
        acc.insert(PaperDigits {
            paper_number: 4,
            digits: vec![Some([0.0; 10]), None],
        });
        acc.save(&path).unwrap();
        let loaded = IdAccumulator::load(&path).unwrap();
        assert_eq!(loaded.snapshot(), acc.snapshot());
    }

    #[test]
    fn accumulator_saves_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");
        let acc = IdAccumulator::default();
        std::thread::scope(|s| {
            for t in 0..8u32 {
                let (acc, path) = (&acc, &path);
                s.spawn(move || {
                    for i in 0..50u32 {
                        acc.insert(PaperDigits {
                            paper_number: t * 100 + i,
                            digits: vec![None],
                        });
                        acc.save(path).unwrap();
                    }
                });
            }
        });
        let loaded = IdAccumulator::load(&path).unwrap();
        assert_eq!(loaded.len(), 400);
    }

    #[tokio::test]
    async fn routes_pushes_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let ingestor = Ingestor::new(config(dir.path()), gateway.clone()).unwrap();

        let pages = vec![
            stage(dir.path(), "scan", 1, &page_with(&["t0001p01v1", MAGIC])),
            stage(dir.path(), "scan", 2, &page_with(&["t0001p02v1", MAGIC])),
            stage(dir.path(), "scan", 3, &page_with(&["t0009p01v1", "other-exam"])),
            stage(dir.path(), "scan", 4, &blank()),
        ];
        let report = ingestor
            .ingest_pages("scan", &ContentDigest::of(b"scan"), pages)
            .await
            .unwrap();

        let counts = report.category_counts();
        assert_eq!(counts.get(&RouteCategory::Valid), Some(&2));
        assert_eq!(counts.get(&RouteCategory::Unknown), Some(&1));
        assert_eq!(counts.get(&RouteCategory::WrongTest), Some(&1));
        assert_eq!(counts.values().sum::<usize>(), 4);
        assert_eq!(gateway.len(), 3);
        // wrong-test page still waits for an operator
        assert!(!report.archived);
        assert!(dir.path().join("archive/scan-1.png").is_file());
        assert!(dir.path().join("staging/scan-3.png").is_file());

        let state = ingestor.confirm_discard("scan", 3).await.unwrap();
        assert_eq!(
            state,
            PageState::Discarded {
                category: RouteCategory::WrongTest
            }
        );
        assert!(dir.path().join("discard/scan-3.png").is_file());
        assert!(ingestor.load_report("scan").unwrap().unwrap().archived);

        // the bundle is archived now: a re-run is a benign no-op
        let again = ingestor
            .ingest_pages("scan", &ContentDigest::of(b"scan"), Vec::new())
            .await
            .unwrap_err();
        assert!(again.is_benign());
    }

    #[tokio::test]
    async fn discard_rejects_valid_page() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(config(dir.path()), Arc::new(MemoryGateway::new())).unwrap();
        let pages = vec![stage(dir.path(), "scan", 1, &page_with(&["t0001p01v1", MAGIC]))];
        ingestor
            .ingest_pages("scan", &ContentDigest::of(b"scan"), pages)
            .await
            .unwrap();
        let err = ingestor.confirm_discard("scan", 1).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidTransition { page: 1, .. }));
        let err = ingestor.confirm_discard("scan", 7).await.unwrap_err();
        assert!(matches!(err, IngestError::PageNotFound { page: 7, .. }));
    }

    #[tokio::test]
    async fn transient_push_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::with_failures(2));
        let ingestor = Ingestor::new(config(dir.path()), gateway.clone()).unwrap();
        let pages = vec![stage(dir.path(), "scan", 1, &page_with(&["t0001p02v1", MAGIC]))];
        let report = ingestor
            .ingest_pages("scan", &ContentDigest::of(b"scan"), pages)
            .await
            .unwrap();
        assert!(report.archived);
        assert!(report.errors.is_empty());
        assert_eq!(gateway.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_bundle_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = IngestConfig::builder()
            .workspace_dir(dir.path())
            .magic_code(MAGIC)
            .max_retries(1)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        let bundle_digest = ContentDigest::of(b"scan");
        let page = page_with(&["t0001p02v1", MAGIC]);

        {
            let failing = Arc::new(MemoryGateway::with_failures(100));
            let ingestor = Ingestor::new(cfg.clone(), failing).unwrap();
            let report = ingestor
                .ingest_pages("scan", &bundle_digest, vec![stage(dir.path(), "scan", 1, &page)])
                .await
                .unwrap();
            assert!(!report.archived);
            assert_eq!(report.unpushed(), 1);
            assert!(matches!(
                report.errors.as_slice(),
                [PageError::PushFailed { retries: 1, .. }]
            ));
        }

        let gateway = Arc::new(MemoryGateway::new());
        let ingestor = Ingestor::new(cfg, gateway.clone()).unwrap();
        let report = ingestor
            .ingest_pages("scan", &bundle_digest, vec![stage(dir.path(), "scan", 1, &page)])
            .await
            .unwrap();
        assert!(report.archived);
        assert_eq!(gateway.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_releases_claims() {
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let cfg = IngestConfig::builder()
            .workspace_dir(dir.path())
            .magic_code(MAGIC)
            .cancel_flag(flag.clone())
            .build()
            .unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let ingestor = Ingestor::new(cfg, gateway.clone()).unwrap();
        let page = page_with(&["t0001p02v1", MAGIC]);

        let err = ingestor
            .ingest_pages("a", &ContentDigest::of(b"a"), vec![stage(dir.path(), "a", 1, &page)])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Cancelled { .. }));
        assert!(gateway.is_empty());

        flag.store(false, std::sync::atomic::Ordering::SeqCst);
        let report = ingestor
            .ingest_pages("a", &ContentDigest::of(b"a"), vec![stage(dir.path(), "a", 1, &page)])
            .await
            .unwrap();
        assert!(report.archived);
        assert_eq!(gateway.len(), 1);
    }

    #[tokio::test]
    async fn id_page_is_cropped_and_classified() {
        let dir = tempfile::tempdir().unwrap();
        let page = page_with(&["t0005p01v2", MAGIC]);
        let (w, h) = page.dimensions();
        let mut anchors = AnchorSet::default();
        anchors.insert(
            2,
            IdBoxTemplate {
                template_width: w,
                template_height: h,
                top_left: [0, 0],
                bottom_right: [w / 2, h / 2],
            },
        );
        let cfg = IngestConfig::builder()
            .workspace_dir(dir.path())
            .magic_code(MAGIC)
            .anchors(anchors)
            .build()
            .unwrap();
        let ingestor = Ingestor::new(cfg, Arc::new(MemoryGateway::new()))
            .unwrap()
            .with_classifier(Arc::new(Uniform));

        let report = ingestor
            .ingest_pages("scan", &ContentDigest::of(b"scan"), vec![stage(dir.path(), "scan", 1, &page)])
            .await
            .unwrap();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert!(dir.path().join("idboxes/0005.png").is_file());
        let papers = ingestor.id_likelihoods().snapshot();
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].paper_number, 5);
        assert_eq!(papers[0].digits.len(), 8);
    }

    #[tokio::test]
    async fn missing_anchor_blocks_only_identification() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = Ingestor::new(config(dir.path()), Arc::new(MemoryGateway::new()))
            .unwrap()
            .with_classifier(Arc::new(Uniform));
        let page = page_with(&["t0005p01v3", MAGIC]);
        let report = ingestor
            .ingest_pages("scan", &ContentDigest::of(b"scan"), vec![stage(dir.path(), "scan", 1, &page)])
            .await
            .unwrap();
        assert!(report.archived);
        assert!(matches!(
            report.errors.as_slice(),
            [PageError::AnchorNotConfigured { paper: 5, version: 3 }]
        ));
    }
}

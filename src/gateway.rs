//! Push gateways: where routed pages go once ingestion is done with them.
//!
//! The ingestion core depends only on [`PushGateway`]. Three
//! implementations ship with the crate:
//!
//! | Gateway | Use |
//! |---------|-----|
//! | [`ArchiveGateway`] | filesystem archive directory (the CLI default) |
//! | [`HttpGateway`]    | JSON `POST` to a remote marking server |
//! | [`MemoryGateway`]  | in-process store for tests and dry runs |
//!
//! Every gateway must tolerate the same content being pushed more than
//! once: a repeat answers [`PushAck::DuplicateAck`] and changes nothing.

use crate::error::GatewayError;
use crate::model::{ContentDigest, PageImage};
use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Gateway acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAck {
    /// Content accepted for the first time.
    Ack,
    /// Identical content was already held; nothing changed.
    DuplicateAck,
}

/// Consumer of routed pages.
pub trait PushGateway: Send + Sync {
    /// Push one page's PNG bytes. Must be idempotent on `page.digest`.
    fn push<'a>(
        &'a self,
        page: &'a PageImage,
        png: &'a [u8],
    ) -> BoxFuture<'a, Result<PushAck, GatewayError>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// ── Filesystem archive ───────────────────────────────────────────────────

/// Writes pages into a directory as `{bundle}-{page}.png`.
///
/// Digests of files already present are indexed on open, so pushes stay
/// idempotent across process restarts.
pub struct ArchiveGateway {
    dir: PathBuf,
    held: Mutex<HashMap<ContentDigest, PathBuf>>,
}

impl ArchiveGateway {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut held = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "png") {
                let digest = ContentDigest::of(&std::fs::read(&path)?);
                held.insert(digest, path);
            }
        }
        info!(dir = %dir.display(), pages = held.len(), "Archive gateway opened");
        Ok(Self {
            dir,
            held: Mutex::new(held),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index(&self) -> MutexGuard<'_, HashMap<ContentDigest, PathBuf>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn store(&self, page: &PageImage, png: &[u8]) -> Result<PushAck, GatewayError> {
        let existing = self.index().get(&page.digest).cloned();
        if let Some(existing) = existing {
            debug!(page = page.index, existing = %existing.display(), "Already archived");
            return Ok(PushAck::DuplicateAck);
        }
        let target = self.dir.join(PageImage::file_name(&page.bundle, page.index));

        let (dir, dest, bytes) = (self.dir.clone(), target.clone(), png.to_vec());
        tokio::task::spawn_blocking(move || write_png(&dir, &dest, &bytes))
            .await
            .map_err(|e| GatewayError::Internal(format!("archive write task failed: {e}")))??;

        let mut held = self.index();
        if let Some(existing) = held.get(&page.digest) {
            // a concurrent push of the same content won the race
            if *existing != target {
                let _ = std::fs::remove_file(&target);
            }
            return Ok(PushAck::DuplicateAck);
        }
        held.insert(page.digest.clone(), target);
        Ok(PushAck::Ack)
    }
}

/// Write `png` to `dest` through a temp file in `dir`.
fn write_png(dir: &Path, dest: &Path, png: &[u8]) -> Result<(), GatewayError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(png)?;
    tmp.persist(dest).map_err(|e| GatewayError::Io(e.error))?;
    Ok(())
}

impl PushGateway for ArchiveGateway {
    fn push<'a>(
        &'a self,
        page: &'a PageImage,
        png: &'a [u8],
    ) -> BoxFuture<'a, Result<PushAck, GatewayError>> {
        self.store(page, png).boxed()
    }

    fn name(&self) -> &'static str {
        "archive"
    }
}

// ── Remote HTTP ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PushRequest<'a> {
    bundle: &'a str,
    page: u32,
    digest: &'a str,
    image_png_base64: String,
}

/// POSTs each page as JSON to a remote endpoint.
///
/// `200`/`201` answer [`PushAck::Ack`], `409 Conflict` answers
/// [`PushAck::DuplicateAck`]; anything else is an error and is retried by
/// the caller.
pub struct HttpGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGateway {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn send(&self, page: &PageImage, png: &[u8]) -> Result<PushAck, GatewayError> {
        let body = request_body(page, png)?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200 | 201 => Ok(PushAck::Ack),
            409 => Ok(PushAck::DuplicateAck),
            code => Err(GatewayError::Rejected {
                status: code,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

fn request_body(page: &PageImage, png: &[u8]) -> Result<Vec<u8>, GatewayError> {
    let req = PushRequest {
        bundle: &page.bundle,
        page: page.index,
        digest: page.digest.as_str(),
        image_png_base64: base64::engine::general_purpose::STANDARD.encode(png),
    };
    serde_json::to_vec(&req).map_err(|e| GatewayError::Http(e.to_string()))
}

impl PushGateway for HttpGateway {
    fn push<'a>(
        &'a self,
        page: &'a PageImage,
        png: &'a [u8],
    ) -> BoxFuture<'a, Result<PushAck, GatewayError>> {
        self.send(page, png).boxed()
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

/// Keeps pushed pages in memory. Can be told to fail the next few pushes.
#[derive(Default)]
pub struct MemoryGateway {
    held: Mutex<HashMap<ContentDigest, (String, u32)>>,
    calls: AtomicUsize,
    fail_next: AtomicU32,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` push calls with a transient error.
    pub fn with_failures(n: u32) -> Self {
        let gw = Self::default();
        gw.fail_next.store(n, Ordering::SeqCst);
        gw
    }

    /// Distinct pages held.
    pub fn len(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total push calls, including failed and duplicate ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn holds(&self, digest: &ContentDigest) -> bool {
        self.held.lock().is_ok_and(|h| h.contains_key(digest))
    }

    fn store(&self, page: &PageImage) -> Result<PushAck, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GatewayError::Http("injected failure".into()));
        }
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.contains_key(&page.digest) {
            return Ok(PushAck::DuplicateAck);
        }
        held.insert(page.digest.clone(), (page.bundle.clone(), page.index));
        Ok(PushAck::Ack)
    }
}

impl PushGateway for MemoryGateway {
    fn push<'a>(
        &'a self,
        page: &'a PageImage,
        _png: &'a [u8],
    ) -> BoxFuture<'a, Result<PushAck, GatewayError>> {
        async move { self.store(page) }.boxed()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

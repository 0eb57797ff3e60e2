//! On-disk workspace: directory layout, bundle registry and push ledger.
//!
//! ```text
//! workspace/
//! ├── bundles.json          bundle registry (name → digest → state)
//! ├── ledger.json           every acknowledged push, keyed by page digest
//! ├── id_likelihoods.json   accumulated classifier output per paper
//! ├── reports/{bundle}.json last run report per bundle
//! ├── staging/              split pages awaiting a terminal state
//! ├── archive/              pages acknowledged by the archive gateway
//! ├── review/               inconsistent and reportable-duplicate pages
//! ├── duplicates/           content-identical duplicates
//! ├── discard/              operator-discarded pages
//! └── idboxes/              cropped ID boxes, {paper:04}.png
//! ```
//!
//! JSON files are replaced atomically (write temp, rename) so a crash
//! never leaves a half-written registry or ledger behind.

use crate::error::IngestError;
use crate::model::{Bundle, BundleState, ContentDigest, RouteCategory, TpvCode, TpvKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolved workspace directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) a workspace rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let ws = Self { root: root.into() };
        for dir in [
            ws.staging_dir(),
            ws.archive_dir(),
            ws.review_dir(),
            ws.duplicates_dir(),
            ws.discard_dir(),
            ws.idbox_dir(),
            ws.reports_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| IngestError::workspace(&dir, e))?;
        }
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn review_dir(&self) -> PathBuf {
        self.root.join("review")
    }

    pub fn duplicates_dir(&self) -> PathBuf {
        self.root.join("duplicates")
    }

    pub fn discard_dir(&self) -> PathBuf {
        self.root.join("discard")
    }

    pub fn idbox_dir(&self) -> PathBuf {
        self.root.join("idboxes")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("bundles.json")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.root.join("ledger.json")
    }

    pub fn likelihoods_file(&self) -> PathBuf {
        self.root.join("id_likelihoods.json")
    }

    pub fn report_file(&self, bundle: &str) -> PathBuf {
        self.reports_dir().join(format!("{bundle}.json"))
    }
}

/// Write `value` as pretty JSON via temp file + rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), IngestError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| IngestError::Internal(format!("serialise {}: {}", path.display(), e)))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| IngestError::workspace(dir, e))?;
    if let Err(e) = tmp.write_all(&json) {
        return Err(IngestError::workspace(tmp.path(), e));
    }
    tmp.persist(path)
        .map(|_| ())
        .map_err(|e| IngestError::workspace(path, e.error))
}

/// Read a JSON file, or `T::default()` when it does not exist yet.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, IngestError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| IngestError::WorkspaceFormat {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(IngestError::workspace(path, e)),
    }
}

/// Move a file into `dir`, keeping its name. Falls back to copy + remove
/// when a rename crosses filesystems.
pub fn move_into(file: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    let name = file.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    let target = dir.join(name);
    if std::fs::rename(file, &target).is_err() {
        std::fs::copy(file, &target)?;
        std::fs::remove_file(file)?;
    }
    Ok(target)
}

// ── Bundle registry ──────────────────────────────────────────────────────

/// What the registry decided about an incoming bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Never seen: process from scratch.
    New,
    /// Same name and digest, not yet archived: resume.
    Resume,
}

/// Known bundles, keyed by name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BundleRegistry {
    bundles: BTreeMap<String, Bundle>,
}

impl BundleRegistry {
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        read_json_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), IngestError> {
        write_json_atomic(path, self)
    }

    pub fn get(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }

    /// Decide whether an incoming bundle may be processed, and register it.
    ///
    /// Identical content already archived (under any name) is a benign
    /// [`IngestError::DuplicateBundle`]; the same name with different
    /// content is an [`IngestError::BundleNameCollision`].
    pub fn admit(&mut self, name: &str, digest: &ContentDigest) -> Result<Admission, IngestError> {
        if let Some(existing) = self.bundles.get(name) {
            if &existing.digest != digest {
                return Err(IngestError::BundleNameCollision {
                    bundle: name.to_string(),
                    known: existing.digest.clone(),
                    incoming: digest.clone(),
                });
            }
            return match existing.state {
                BundleState::Archived => Err(IngestError::DuplicateBundle {
                    bundle: name.to_string(),
                    existing: existing.name.clone(),
                    digest: digest.clone(),
                }),
                BundleState::Ingesting => Ok(Admission::Resume),
            };
        }

        if let Some(other) = self.bundles.values().find(|b| &b.digest == digest) {
            return Err(IngestError::DuplicateBundle {
                bundle: name.to_string(),
                existing: other.name.clone(),
                digest: digest.clone(),
            });
        }

        self.bundles.insert(
            name.to_string(),
            Bundle {
                name: name.to_string(),
                digest: digest.clone(),
                pages: Vec::new(),
                state: BundleState::Ingesting,
            },
        );
        info!(bundle = name, digest = digest.short(), "Bundle registered");
        Ok(Admission::New)
    }

    /// Drop a bundle that never got past splitting, so a corrected source
    /// can be submitted under the same name.
    pub fn forget(&mut self, name: &str) {
        if self.bundles.remove(name).is_some() {
            debug!(bundle = name, "Bundle removed from registry");
        }
    }

    /// Record the split page digests of a bundle.
    pub fn set_pages(&mut self, name: &str, pages: Vec<ContentDigest>) {
        if let Some(b) = self.bundles.get_mut(name) {
            b.pages = pages;
        }
    }

    pub fn mark_archived(&mut self, name: &str) {
        if let Some(b) = self.bundles.get_mut(name) {
            b.state = BundleState::Archived;
            info!(bundle = name, "Bundle archived");
        }
    }
}

// ── Push ledger ──────────────────────────────────────────────────────────

/// Provenance of one acknowledged push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub bundle: String,
    pub page: u32,
    pub category: RouteCategory,
    pub tpv: Option<TpvCode>,
}

/// Every acknowledged push, plus in-memory claims held by running bundles.
///
/// Only `entries` is persisted. Claims mark pages that are routed but not
/// yet pushed; they make a TPV code or digest unavailable to other bundles
/// until released, and vanish if the process dies.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PushLedger {
    entries: BTreeMap<ContentDigest, LedgerEntry>,
    #[serde(skip)]
    tpv_index: HashMap<TpvKey, ContentDigest>,
    #[serde(skip)]
    digest_claims: HashMap<ContentDigest, (String, u32)>,
    #[serde(skip)]
    tpv_claims: HashMap<TpvKey, ContentDigest>,
}

impl PushLedger {
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let mut ledger: PushLedger = read_json_or_default(path)?;
        ledger.tpv_index = ledger
            .entries
            .iter()
            .filter_map(|(d, e)| e.tpv.as_ref().map(|t| (t.key(), d.clone())))
            .collect();
        debug!(entries = ledger.entries.len(), "Push ledger loaded");
        Ok(ledger)
    }

    pub fn save(&self, path: &Path) -> Result<(), IngestError> {
        write_json_atomic(path, self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, digest: &ContentDigest) -> Option<&LedgerEntry> {
        self.entries.get(digest)
    }

    /// Record an acknowledged push. Supersedes any claim on the digest.
    pub fn record(&mut self, digest: ContentDigest, entry: LedgerEntry) {
        if let Some(tpv) = &entry.tpv {
            if entry.category == RouteCategory::Valid {
                self.tpv_index.insert(tpv.key(), digest.clone());
                self.tpv_claims.remove(&tpv.key());
            }
        }
        self.digest_claims.remove(&digest);
        self.entries.insert(digest, entry);
    }

    /// The digest that holds a TPV code, pushed or claimed.
    pub fn tpv_holder(&self, key: &TpvKey) -> Option<ContentDigest> {
        self.tpv_index
            .get(key)
            .or_else(|| self.tpv_claims.get(key))
            .cloned()
    }

    pub fn digest_claimed_by_other(&self, digest: &ContentDigest, bundle: &str, page: u32) -> bool {
        self.digest_claims
            .get(digest)
            .is_some_and(|(b, p)| b != bundle || *p != page)
    }

    pub fn claim_digest(&mut self, digest: &ContentDigest, bundle: &str, page: u32) {
        self.digest_claims
            .insert(digest.clone(), (bundle.to_string(), page));
    }

    pub fn claim_tpv(&mut self, key: TpvKey, digest: &ContentDigest) {
        self.tpv_claims.insert(key, digest.clone());
    }

    /// Drop every claim a bundle run still holds.
    pub fn release_claims(&mut self, bundle: &str) {
        let released: HashSet<ContentDigest> = self
            .digest_claims
            .iter()
            .filter(|(_, (b, _))| b == bundle)
            .map(|(d, _)| d.clone())
            .collect();
        self.digest_claims.retain(|d, _| !released.contains(d));
        self.tpv_claims.retain(|_, d| !released.contains(d));
    }
}

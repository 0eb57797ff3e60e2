//! Value types shared across the pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub use crate::pipeline::hash::ContentDigest;

/// A decoded test-paper/page/version code plus the magic string found
/// alongside it on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TpvCode {
    pub paper: u32,
    pub page: u32,
    pub version: u32,
    /// Assessment magic string read from the co-located payload. Empty when
    /// no such payload was found.
    pub magic: String,
}

impl TpvCode {
    pub fn new(paper: u32, page: u32, version: u32, magic: impl Into<String>) -> Self {
        Self {
            paper,
            page,
            version,
            magic: magic.into(),
        }
    }

    /// The identity used for duplicate detection; the magic string is not
    /// part of it.
    pub fn key(&self) -> TpvKey {
        TpvKey {
            paper: self.paper,
            page: self.page,
            version: self.version,
        }
    }
}

/// Formats the fixed-width grammar, e.g. `t0007p03v2`.
impl fmt::Display for TpvCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}

/// Paper/page/version triple without the magic string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TpvKey {
    pub paper: u32,
    pub page: u32,
    pub version: u32,
}

impl fmt::Display for TpvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{:04}p{:02}v{}", self.paper, self.page, self.version)
    }
}

/// One rasterised page of a bundle, staged on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageImage {
    /// Owning bundle name.
    pub bundle: String,
    /// 1-based position in the source PDF.
    pub index: u32,
    /// Digest of the staged PNG bytes.
    pub digest: ContentDigest,
    /// `staging/{bundle}-{index}.png`
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl PageImage {
    /// Archived filename convention: `{bundle-name}-{page-number}.png`.
    pub fn file_name(bundle: &str, index: u32) -> String {
        format!("{bundle}-{index}.png")
    }
}

/// Bundle lifecycle as recorded in the workspace registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    /// Accepted and (possibly partially) processed; safe to re-run.
    Ingesting,
    /// Every page reached a terminal routing state. Immutable from here on.
    Archived,
}

/// A named, hashed, ordered collection of page images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub digest: ContentDigest,
    /// Page digests in split order. Empty until the bundle has been split.
    #[serde(default)]
    pub pages: Vec<ContentDigest>,
    pub state: BundleState,
}

/// The four categories every routed page falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCategory {
    Valid,
    Unknown,
    WrongTest,
    Duplicate,
}

impl fmt::Display for RouteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteCategory::Valid => "valid",
            RouteCategory::Unknown => "unknown",
            RouteCategory::WrongTest => "wrong-test",
            RouteCategory::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

/// One row of the classlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasslistEntry {
    #[serde(rename = "id")]
    pub student_id: String,
    #[serde(rename = "name")]
    pub student_name: String,
}

/// Which matching method produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Exact minimum-cost assignment. The primary result.
    #[serde(rename = "MLLAP")]
    Lap,
    /// Greedy lowest-cost-first. Secondary, lower confidence.
    #[serde(rename = "MLGreedy")]
    Greedy,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Lap => f.write_str("MLLAP"),
            Method::Greedy => f.write_str("MLGreedy"),
        }
    }
}

/// A proposed identification. Never final; review happens downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub paper_number: u32,
    pub method: Method,
    pub predicted_student_id: String,
    pub student_name: String,
    /// Assignment cost of this pair; lower means more confident.
    pub confidence_cost: f64,
    /// Above the review threshold, or not unique among optimal assignments.
    pub needs_review: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tpv_display_is_fixed_width() {
        assert_eq!(TpvCode::new(7, 3, 2, "m").to_string(), "t0007p03v2");
        assert_eq!(TpvCode::new(1234, 12, 9, "").to_string(), "t1234p12v9");
    }

    #[test]
    fn tpv_key_ignores_magic() {
        let a = TpvCode::new(1, 2, 3, "exam-a");
        let b = TpvCode::new(1, 2, 3, "exam-b");
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn page_file_name_convention() {
        assert_eq!(PageImage::file_name("scan_042", 7), "scan_042-7.png");
    }

    #[test]
    fn method_serialises_with_wire_names() {
        assert_eq!(serde_json::to_string(&Method::Lap).unwrap(), "\"MLLAP\"");
        assert_eq!(serde_json::to_string(&Method::Greedy).unwrap(), "\"MLGreedy\"");
    }
}

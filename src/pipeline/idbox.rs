//! ID-box extraction under a fixed per-version template.
//!
//! Each version of the ID page has the handwritten student-number box at a
//! known place. An operator records that place once, as two anchor points
//! (top-left, bottom-right) measured on a reference render of the version.
//! Scans are rendered at whatever size the splitter produced, so the
//! anchors are scaled from the reference size to the scan size before
//! cropping.
//!
//! A version without anchors is never guessed at: extraction fails with
//! [`PageError::AnchorNotConfigured`] and only that version is blocked.

use crate::error::{IngestError, PageError};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Anchor geometry for one version, in reference-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdBoxTemplate {
    pub template_width: u32,
    pub template_height: u32,
    pub top_left: [u32; 2],
    pub bottom_right: [u32; 2],
}

/// A crop rectangle in scan pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl IdBoxTemplate {
    /// Scale the anchors to an image of `width` × `height`.
    pub fn rect_for(&self, width: u32, height: u32) -> Result<Rect, String> {
        let [x0, y0] = self.top_left;
        let [x1, y1] = self.bottom_right;
        if self.template_width == 0 || self.template_height == 0 {
            return Err("reference size is zero".into());
        }
        if x1 <= x0 || y1 <= y0 {
            return Err(format!(
                "bottom-right ({x1},{y1}) is not below-right of top-left ({x0},{y0})"
            ));
        }
        if x1 > self.template_width || y1 > self.template_height {
            return Err(format!(
                "anchor ({x1},{y1}) lies outside the {}x{} reference",
                self.template_width, self.template_height
            ));
        }

        let sx = |v: u32| (v as u64 * width as u64 / self.template_width as u64) as u32;
        let sy = |v: u32| (v as u64 * height as u64 / self.template_height as u64) as u32;

        let (left, top) = (sx(x0), sy(y0));
        let (right, bottom) = (sx(x1).min(width), sy(y1).min(height));
        if right <= left || bottom <= top {
            return Err(format!("ID box collapses at {width}x{height}"));
        }
        Ok(Rect {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        })
    }
}

/// Anchor geometry for every configured version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorSet {
    by_version: BTreeMap<u32, IdBoxTemplate>,
}

impl AnchorSet {
    /// Load anchors from a JSON object keyed by version number:
    ///
    /// ```json
    /// { "1": { "template_width": 1240, "template_height": 1754,
    ///          "top_left": [180, 420], "bottom_right": [1060, 560] } }
    /// ```
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let bytes = std::fs::read(path).map_err(|e| IngestError::workspace(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| IngestError::WorkspaceFormat {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    pub fn insert(&mut self, version: u32, template: IdBoxTemplate) {
        self.by_version.insert(version, template);
    }

    pub fn get(&self, version: u32) -> Option<&IdBoxTemplate> {
        self.by_version.get(&version)
    }

    pub fn versions(&self) -> Vec<u32> {
        self.by_version.keys().copied().collect()
    }
}

/// Crop the ID box of `paper` (an ID page of `version`) out of the scan.
pub fn extract_id_box(
    page: &GrayImage,
    paper: u32,
    version: u32,
    anchors: &AnchorSet,
) -> Result<GrayImage, PageError> {
    let template = anchors
        .get(version)
        .ok_or(PageError::AnchorNotConfigured { paper, version })?;

    let rect = template
        .rect_for(page.width(), page.height())
        .map_err(|detail| PageError::IdBoxCrop { paper, detail })?;

    Ok(image::imageops::crop_imm(page, rect.x, rect.y, rect.width, rect.height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn template() -> IdBoxTemplate {
        IdBoxTemplate {
            template_width: 100,
            template_height: 200,
            top_left: [10, 20],
            bottom_right: [60, 40],
        }
    }

    #[test]
    fn rect_scales_with_render_size() {
        let t = template();
        assert_eq!(
            t.rect_for(100, 200).unwrap(),
            Rect { x: 10, y: 20, width: 50, height: 20 }
        );
        assert_eq!(
            t.rect_for(200, 400).unwrap(),
            Rect { x: 20, y: 40, width: 100, height: 40 }
        );
    }

    #[test]
    fn inverted_anchors_rejected() {
        let mut t = template();
        t.bottom_right = [5, 5];
        assert!(t.rect_for(100, 200).is_err());
    }

    #[test]
    fn missing_version_is_anchor_not_configured() {
        let img = GrayImage::from_pixel(100, 200, Luma([255]));
        let err = extract_id_box(&img, 12, 3, &AnchorSet::default()).unwrap_err();
        assert!(matches!(
            err,
            PageError::AnchorNotConfigured { paper: 12, version: 3 }
        ));
    }

    #[test]
    fn crop_is_deterministic_and_positioned() {
        let mut anchors = AnchorSet::default();
        anchors.insert(1, template());
        // dark marker exactly at the box's top-left corner
        let mut img = GrayImage::from_pixel(100, 200, Luma([255]));
        img.put_pixel(10, 20, Luma([0]));

        let a = extract_id_box(&img, 1, 1, &anchors).unwrap();
        let b = extract_id_box(&img, 1, 1, &anchors).unwrap();
        assert_eq!(a.dimensions(), (50, 20));
        assert_eq!(a.get_pixel(0, 0).0[0], 0);
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn anchors_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anchors.json");
        std::fs::write(
            &path,
            r#"{"2": {"template_width": 100, "template_height": 200,
                      "top_left": [10, 20], "bottom_right": [60, 40]}}"#,
        )
        .unwrap();
        let anchors = AnchorSet::load(&path).unwrap();
        assert_eq!(anchors.versions(), vec![2]);
        assert_eq!(anchors.get(2), Some(&template()));
    }
}

//! Bundle splitting: rasterise every page of a PDF bundle into a staged PNG.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async contexts. The whole split runs
//! on the blocking pool so Tokio workers never stall during rendering.
//!
//! ## Order is load-bearing
//!
//! Pages are produced strictly in source order and numbered from 1. Staged
//! filenames follow `{bundle}-{page}.png`, and TPV page numbers are later
//! checked against this order.

use crate::error::IngestError;
use crate::model::{ContentDigest, PageImage};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Check that `path` exists and starts with the `%PDF` magic bytes.
pub fn check_pdf(path: &Path) -> Result<(), IngestError> {
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IngestError::FileNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(IngestError::workspace(path, e)),
    };
    let mut magic = [0u8; 4];
    if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
        return Err(IngestError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

/// Rasterise every page of `pdf_path` into `staging_dir`.
///
/// Returns one [`PageImage`] per source page, in source order. Any page
/// that pdfium cannot render fails the whole bundle with
/// [`IngestError::CorruptBundle`]; a partial split would silently shift
/// page numbers.
pub async fn split_bundle(
    pdf_path: &Path,
    bundle: &str,
    staging_dir: &Path,
    max_pixels: u32,
) -> Result<Vec<PageImage>, IngestError> {
    let path = pdf_path.to_path_buf();
    let bundle = bundle.to_string();
    let staging = staging_dir.to_path_buf();

    tokio::task::spawn_blocking(move || split_blocking(&path, &bundle, &staging, max_pixels))
        .await
        .map_err(|e| IngestError::Internal(format!("Split task panicked: {}", e)))?
}

/// Blocking implementation of bundle splitting.
fn split_blocking(
    pdf_path: &Path,
    bundle: &str,
    staging_dir: &Path,
    max_pixels: u32,
) -> Result<Vec<PageImage>, IngestError> {
    let pdfium = bind_pdfium()?;

    let corrupt = |detail: String| IngestError::CorruptBundle {
        bundle: bundle.to_string(),
        detail,
    };

    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| corrupt(format!("{:?}", e)))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if total_pages == 0 {
        return Err(corrupt("bundle has no pages".into()));
    }
    info!(bundle, total_pages, "Bundle loaded");

    std::fs::create_dir_all(staging_dir)
        .map_err(|e| IngestError::workspace(staging_dir, e))?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(total_pages);

    for (idx, page) in pages.iter().enumerate() {
        let index = idx as u32 + 1;

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| corrupt(format!("page {}: {:?}", index, e)))?;

        let image = DynamicImage::ImageLuma8(bitmap.as_image().to_luma8());
        let png = encode_png(&image).map_err(|e| corrupt(format!("page {}: {}", index, e)))?;
        let digest = ContentDigest::of(&png);

        let path: PathBuf = staging_dir.join(PageImage::file_name(bundle, index));
        std::fs::write(&path, &png).map_err(|e| IngestError::workspace(&path, e))?;

        debug!(
            bundle,
            page = index,
            digest = digest.short(),
            "Rendered page → {}x{} px",
            image.width(),
            image.height()
        );

        results.push(PageImage {
            bundle: bundle.to_string(),
            index,
            digest,
            path,
            width: image.width(),
            height: image.height(),
        });
    }

    Ok(results)
}

/// Encode an image as lossless PNG bytes.
///
/// PNG keeps QR module edges and pen strokes intact; the digest of these
/// bytes is the page's identity, so the encoding must be deterministic.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` first, then the working directory,
/// then the system library search path.
fn bind_pdfium() -> Result<Pdfium, IngestError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| IngestError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

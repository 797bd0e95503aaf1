//! Page-image generation: one JPEG per PDF page, plus the page → filename
//! map the TSV assembler uses to build `<img>` tags.
//!
//! Filenames are `{base}_page_{n}.jpg` with `n` 1-based and zero-padded to
//! at least three digits, so a media folder shared by many decks sorts and
//! never collides as long as base names differ.

use crate::error::Pdf2AnkiError;
use crate::record::PageImageMap;
use crate::services::pdf::PdfEngine;
use image::{DynamicImage, ImageFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Filename of page `page` (1-based) in a document of `total` pages.
pub fn page_image_name(base: &str, page: usize, total: usize) -> String {
    let width = total.to_string().len().max(3);
    format!("{base}_page_{page:0width$}.jpg")
}

fn save_jpeg(image: &DynamicImage, path: &Path) -> Result<(), Pdf2AnkiError> {
    image
        .to_rgb8()
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|e| Pdf2AnkiError::ImageSaveFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

/// Render every page of `pdf_path` into `dest_dir` and map page → filename.
///
/// An existing image is kept and mapped as-is unless `overwrite` is set.
/// A page that fails to render or save is logged and left unmapped; only
/// failing to open the document (or create `dest_dir`) is an error.
pub async fn generate_page_images(
    engine: Arc<dyn PdfEngine>,
    pdf_path: &Path,
    dest_dir: &Path,
    base_name: &str,
    zoom: f32,
    overwrite: bool,
) -> Result<PageImageMap, Pdf2AnkiError> {
    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|e| Pdf2AnkiError::OutputWriteFailed {
            path: dest_dir.to_path_buf(),
            source: e,
        })?;

    let pdf = pdf_path.to_path_buf();
    let dir = dest_dir.to_path_buf();
    let base = base_name.to_string();

    let map = tokio::task::spawn_blocking(move || {
        render_blocking(engine.as_ref(), &pdf, &dir, &base, zoom, overwrite)
    })
    .await
    .map_err(|e| Pdf2AnkiError::Internal(format!("Render task panicked: {}", e)))??;

    info!(
        "Page images ready: {} mapped in {}",
        map.len(),
        dest_dir.display()
    );
    Ok(map)
}

fn render_blocking(
    engine: &dyn PdfEngine,
    pdf: &Path,
    dir: &Path,
    base: &str,
    zoom: f32,
    overwrite: bool,
) -> Result<PageImageMap, Pdf2AnkiError> {
    let total = engine.page_count(pdf)?;
    let targets: Vec<(String, PathBuf)> = (1..=total)
        .map(|page| {
            let name = page_image_name(base, page, total);
            let path = dir.join(&name);
            (name, path)
        })
        .collect();

    let mut map = PageImageMap::new();

    if !overwrite && targets.iter().all(|(_, p)| p.exists()) {
        debug!("All {} page images already exist; reusing them", total);
        for (idx, (name, _)) in targets.into_iter().enumerate() {
            map.insert(idx + 1, name);
        }
        return Ok(map);
    }

    engine.render_pages(pdf, zoom, &mut |idx, rendered| {
        let page = idx + 1;
        let Some((name, path)) = targets.get(idx) else {
            warn!("Engine reported page {} beyond page count {}", page, total);
            return;
        };
        if !overwrite && path.exists() {
            debug!("Keeping existing image {}", name);
            map.insert(page, name.clone());
            return;
        }
        match rendered.and_then(|image| save_jpeg(&image, path)) {
            Ok(()) => {
                map.insert(page, name.clone());
                if page % 10 == 0 || page == total {
                    debug!("Generated image for page {}/{}", page, total);
                }
            }
            Err(e) => warn!("Page {} has no image: {}", page, e),
        }
    })?;

    Ok(map)
}

//! PDF engine collaborator: page count, page rasterisation, page text.
//!
//! [`PdfEngine`] methods are blocking. The pipeline calls them inside
//! `tokio::task::spawn_blocking` because pdfium is CPU-bound and not
//! async-safe.
//!
//! [`PdfiumEngine`] binds the pdfium shared library on every call, looking in
//! this order:
//!
//! 1. the engine's explicit `library_path`, then `PDFIUM_LIB_PATH`
//!    (a file, or a directory holding the platform library)
//! 2. the platform library in the working directory
//! 3. the system library search path

use crate::error::Pdf2AnkiError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Callback receiving each rendered page: `(0-based index, image or error)`.
pub type PageVisitor<'a> = dyn FnMut(usize, Result<DynamicImage, Pdf2AnkiError>) + 'a;

/// What the pipeline needs from a PDF library.
pub trait PdfEngine: Send + Sync {
    fn page_count(&self, path: &Path) -> Result<usize, Pdf2AnkiError>;

    /// Render every page at `zoom` (1.0 = 72 dpi) and hand each result to
    /// `on_page` in page order. A page that fails to render is reported to
    /// the visitor and does not stop the others. Returns the page count.
    fn render_pages(
        &self,
        path: &Path,
        zoom: f32,
        on_page: &mut PageVisitor<'_>,
    ) -> Result<usize, Pdf2AnkiError>;

    /// Plain text of every page, in page order.
    fn extract_text(&self, path: &Path) -> Result<Vec<String>, Pdf2AnkiError>;
}

/// [`PdfEngine`] backed by `pdfium-render`.
#[derive(Debug, Clone, Default)]
pub struct PdfiumEngine {
    library_path: Option<PathBuf>,
}

impl PdfiumEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this pdfium library (file or directory) instead of searching.
    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, Pdf2AnkiError> {
        let explicit = self
            .library_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

        let bindings = match explicit {
            Some(path) => {
                let lib = if path.is_dir() {
                    Pdfium::pdfium_platform_library_name_at_path(&path)
                } else {
                    path
                };
                debug!("Binding pdfium from {}", lib.display());
                Pdfium::bind_to_library(&lib)
            }
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| Pdf2AnkiError::PdfiumBindingFailed(format!("{:?}", e)))?;

        Ok(Pdfium::new(bindings))
    }
}

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, Pdf2AnkiError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| Pdf2AnkiError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

impl PdfEngine for PdfiumEngine {
    fn page_count(&self, path: &Path) -> Result<usize, Pdf2AnkiError> {
        let pdfium = self.bind()?;
        let document = open(&pdfium, path)?;
        Ok(document.pages().len() as usize)
    }

    fn render_pages(
        &self,
        path: &Path,
        zoom: f32,
        on_page: &mut PageVisitor<'_>,
    ) -> Result<usize, Pdf2AnkiError> {
        let pdfium = self.bind()?;
        let document = open(&pdfium, path)?;
        let pages = document.pages();
        let total = pages.len() as usize;
        info!("PDF loaded: {} pages", total);

        let render_config = PdfRenderConfig::new().scale_page_by_factor(zoom);

        for (idx, page) in pages.iter().enumerate() {
            let rendered = page
                .render_with_config(&render_config)
                .map(|bitmap| bitmap.as_image())
                .map_err(|e| Pdf2AnkiError::RasterisationFailed {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                });
            if let Ok(image) = &rendered {
                debug!(
                    "Rendered page {} → {}x{} px",
                    idx + 1,
                    image.width(),
                    image.height()
                );
            }
            on_page(idx, rendered);
        }
        Ok(total)
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<String>, Pdf2AnkiError> {
        let pdfium = self.bind()?;
        let document = open(&pdfium, path)?;
        let texts = document
            .pages()
            .iter()
            .enumerate()
            .map(|(idx, page)| match page.text() {
                Ok(text) => text.all(),
                Err(e) => {
                    warn!("No text layer on page {}: {:?}", idx + 1, e);
                    String::new()
                }
            })
            .collect::<Vec<_>>();
        debug!("Extracted text from {} pages", texts.len());
        Ok(texts)
    }
}

/// Read a document's text: every page joined by a blank line, trimmed.
pub async fn read_pdf_text(
    engine: std::sync::Arc<dyn PdfEngine>,
    path: &Path,
) -> Result<String, Pdf2AnkiError> {
    let path = path.to_path_buf();
    let pages = tokio::task::spawn_blocking(move || engine.extract_text(&path))
        .await
        .map_err(|e| Pdf2AnkiError::Internal(format!("Text extraction task panicked: {}", e)))??;
    Ok(pages.join("\n\n").trim().to_string())
}

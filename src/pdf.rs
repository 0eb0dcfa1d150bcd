//! PDF inspection and rasterisation.
//!
//! pdfium is not safe to drive from async code, so every call runs on the blocking thread pool
//! through [actix_web::web::block].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rendering resolution for pages sent to the model.
pub const RENDER_DPI: f32 = 300.0;

const POINTS_PER_INCH: f32 = 72.0;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Failed to bind to the pdfium library: {0}")]
    Binding(String),
    #[error("{0}")]
    Unreadable(String),
    #[error("Failed to convert page {page} to an image: {detail}")]
    Page { page: usize, detail: String },
    #[error("Rasterisation task failed: {0}")]
    Task(String),
}

/// What can be learned from a PDF without rendering it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PdfInfo {
    pub page_count: usize,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// One rendered page, ready to embed in a model request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PageImage {
    /// 1-based page number.
    pub page: usize,
    pub png_base64: String,
}

impl PageImage {
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.png_base64)
    }
}

#[async_trait(?Send)]
pub trait PageRasterizer: Send + Sync {
    /// Opens the document just far enough to count its pages.
    async fn inspect(&self, pdf: Bytes) -> Result<PdfInfo, RasterError>;

    /// Renders every page, in order.
    async fn rasterize(&self, pdf: Bytes) -> Result<Vec<PageImage>, RasterError>;
}

/// [PageRasterizer] backed by pdfium-render.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    library_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    /// Binds to the system pdfium library, or to the library at `library_path` when given.
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self { library_path }
    }

    fn pdfium(library_path: Option<&Path>) -> Result<Pdfium, RasterError> {
        let bindings = match library_path {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| RasterError::Binding(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }
}

#[async_trait(?Send)]
impl PageRasterizer for PdfiumRasterizer {
    async fn inspect(&self, pdf: Bytes) -> Result<PdfInfo, RasterError> {
        let library_path = self.library_path.clone();
        actix_web::web::block(move || inspect_blocking(library_path.as_deref(), &pdf))
            .await
            .map_err(|e| RasterError::Task(e.to_string()))?
    }

    async fn rasterize(&self, pdf: Bytes) -> Result<Vec<PageImage>, RasterError> {
        let library_path = self.library_path.clone();
        actix_web::web::block(move || rasterize_blocking(library_path.as_deref(), &pdf))
            .await
            .map_err(|e| RasterError::Task(e.to_string()))?
    }
}

fn inspect_blocking(library_path: Option<&Path>, pdf: &[u8]) -> Result<PdfInfo, RasterError> {
    let pdfium = PdfiumRasterizer::pdfium(library_path)?;
    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| RasterError::Unreadable(format!("{e:?}")))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata
            .get(tag)
            .map(|t| t.value().trim().to_string())
            .filter(|v| !v.is_empty())
    };

    Ok(PdfInfo {
        page_count: document.pages().len() as usize,
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
    })
}

fn rasterize_blocking(
    library_path: Option<&Path>,
    pdf: &[u8],
) -> Result<Vec<PageImage>, RasterError> {
    let pdfium = PdfiumRasterizer::pdfium(library_path)?;
    let document = pdfium
        .load_pdf_from_byte_slice(pdf, None)
        .map_err(|e| RasterError::Unreadable(format!("{e:?}")))?;

    let render_config =
        PdfRenderConfig::new().scale_page_by_factor(RENDER_DPI / POINTS_PER_INCH);

    let mut images = Vec::new();
    for (index, page) in document.pages().iter().enumerate() {
        let number = index + 1;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RasterError::Page {
                page: number,
                detail: format!("{e:?}"),
            })?;
        let png_base64 = encode_png(&bitmap.as_image()).map_err(|e| RasterError::Page {
            page: number,
            detail: e.to_string(),
        })?;
        log::debug!("Rendered page {number} ({} bytes base64)", png_base64.len());
        images.push(PageImage {
            page: number,
            png_base64,
        });
    }
    Ok(images)
}

/// Encodes an image as base64 PNG.
///
/// PNG is lossless, which keeps rendered text crisp for the model.
pub fn encode_png(image: &DynamicImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(STANDARD.encode(&buf))
}

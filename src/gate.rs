//! Ordered validation in front of the expensive conversion work.
//!
//! Cheap checks run first, quota is consumed next, and only then is the document opened. Nothing
//! is rasterised or sent to the model unless every earlier step passed.

use crate::error::AppError;
use crate::identity::ClientIdentity;
use crate::markup::MarkupGenerator;
use crate::pdf::{PageRasterizer, PdfInfo, RasterError};
use crate::quota::{Decision, QuotaPolicy, QuotaStatus, Tier};
use crate::store::QuotaStore;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_PAGES_PER_CONVERSION: usize = 20;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("{0}")]
    NoFile(&'static str),
    #[error("Please upload a PDF file")]
    WrongFileType,
    #[error("File too large. Maximum size is {:.1}MB", megabytes(.max_bytes))]
    FileTooLarge { max_bytes: u64 },
    #[error("Could not validate PDF: {0}")]
    UnreadablePdf(String),
    #[error("PDF has no pages")]
    EmptyDocument,
    #[error(
        "PDF has {pages} pages, but maximum allowed is {max_pages} pages per conversion. \
         Please split your document into smaller files."
    )]
    TooManyPages { pages: usize, max_pages: usize },
    #[error("Malformed upload: {0}")]
    Malformed(String),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Limits {
    /// Largest accepted upload; exactly this many bytes is still accepted.
    pub max_file_bytes: u64,
    pub max_pages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_pages: MAX_PAGES_PER_CONVERSION,
        }
    }
}

impl Limits {
    pub fn max_file_mb(&self) -> f64 {
        megabytes(&self.max_file_bytes)
    }
}

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / BYTES_PER_MB
}

/// The `pdf_file` part of an upload.
///
/// `bytes` may have been cut short once the size limit was passed, so its length is only
/// meaningful as "within the limit" or "over it".
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub latex: String,
    pub quota: Option<QuotaStatus>,
}

#[derive(Debug, Clone)]
pub struct Validated {
    pub info: PdfInfo,
    pub quota: Option<QuotaStatus>,
}

pub fn check_file_present(upload: Option<Upload>) -> Result<Upload, ValidationError> {
    let upload = upload.ok_or(ValidationError::NoFile("No file uploaded"))?;
    if upload.filename.is_empty() {
        return Err(ValidationError::NoFile("No file selected"));
    }
    Ok(upload)
}

pub fn check_extension(filename: &str) -> Result<(), ValidationError> {
    if filename.to_ascii_lowercase().ends_with(".pdf") {
        Ok(())
    } else {
        Err(ValidationError::WrongFileType)
    }
}

pub fn check_size(size: u64, limits: &Limits) -> Result<(), ValidationError> {
    if size > limits.max_file_bytes {
        Err(ValidationError::FileTooLarge {
            max_bytes: limits.max_file_bytes,
        })
    } else {
        Ok(())
    }
}

pub fn check_page_count(pages: usize, limits: &Limits) -> Result<(), ValidationError> {
    if pages == 0 {
        Err(ValidationError::EmptyDocument)
    } else if pages > limits.max_pages {
        Err(ValidationError::TooManyPages {
            pages,
            max_pages: limits.max_pages,
        })
    } else {
        Ok(())
    }
}

/// Runs uploads through validation, quota and conversion.
pub struct RequestGate<S> {
    policy: Arc<QuotaPolicy<S>>,
    rasterizer: Arc<dyn PageRasterizer>,
    generator: Arc<dyn MarkupGenerator>,
    limits: Limits,
}

impl<S: QuotaStore> RequestGate<S> {
    pub fn new(
        policy: Arc<QuotaPolicy<S>>,
        rasterizer: Arc<dyn PageRasterizer>,
        generator: Arc<dyn MarkupGenerator>,
        limits: Limits,
    ) -> Self {
        Self {
            policy,
            rasterizer,
            generator,
            limits,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn policy(&self) -> &Arc<QuotaPolicy<S>> {
        &self.policy
    }

    /// Converts an uploaded PDF into a LaTeX document, charging the `convert` tier.
    ///
    /// Quota is charged before the page count is known, so a document rejected for its page
    /// count still counts towards the client's conversions.
    pub async fn convert(
        &self,
        identity: &ClientIdentity,
        upload: Option<Upload>,
    ) -> Result<Conversion, AppError> {
        let upload = self.check_upload(upload)?;
        let quota = self.admit(identity, Tier::Convert).await?;
        self.inspect(&upload).await?;

        let pages = self
            .rasterizer
            .rasterize(upload.bytes)
            .await
            .map_err(AppError::Raster)?;
        let latex = self
            .generator
            .generate(&pages)
            .await
            .map_err(AppError::Generation)?;
        log::info!("Converted {} ({} pages) for {identity}", upload.filename, pages.len());
        Ok(Conversion { latex, quota })
    }

    /// Checks that an upload would be accepted for conversion, charging the
    /// `upload_validation` tier instead of `convert`. Nothing is rendered.
    pub async fn validate(
        &self,
        identity: &ClientIdentity,
        upload: Option<Upload>,
    ) -> Result<Validated, AppError> {
        let upload = self.check_upload(upload)?;
        let quota = self.admit(identity, Tier::UploadValidation).await?;
        let info = self.inspect(&upload).await?;
        Ok(Validated { info, quota })
    }

    fn check_upload(&self, upload: Option<Upload>) -> Result<Upload, ValidationError> {
        let upload = check_file_present(upload)?;
        check_extension(&upload.filename)?;
        check_size(upload.bytes.len() as u64, &self.limits)?;
        Ok(upload)
    }

    async fn admit(
        &self,
        identity: &ClientIdentity,
        tier: Tier,
    ) -> Result<Option<QuotaStatus>, AppError> {
        match self.policy.check_and_consume(identity.as_str(), tier).await {
            Ok(Decision::Allowed(status)) => Ok(status),
            Ok(Decision::Denied(denial)) => {
                log::info!(
                    "Quota {} exceeded for {identity} ({})",
                    denial.tier,
                    denial.rule
                );
                Err(AppError::QuotaExceeded(denial))
            }
            Err(e) => Err(AppError::QuotaUnavailable(e.to_string())),
        }
    }

    async fn inspect(&self, upload: &Upload) -> Result<PdfInfo, AppError> {
        let info = match self.rasterizer.inspect(upload.bytes.clone()).await {
            Ok(info) => info,
            Err(RasterError::Unreadable(detail)) => {
                return Err(ValidationError::UnreadablePdf(detail).into())
            }
            Err(e) => return Err(AppError::Raster(e)),
        };
        check_page_count(info.page_count, &self.limits)?;
        Ok(info)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::markup::GenerationError;
    use crate::pdf::PageImage;
    use crate::quota::{ManualClock, MIDNIGHT};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports a fixed page count, or fails if the document starts with `broken`.
    #[derive(Default)]
    pub(crate) struct FakeRasterizer {
        pub(crate) pages: usize,
        pub(crate) rasterized: AtomicUsize,
    }

    impl FakeRasterizer {
        pub(crate) fn with_pages(pages: usize) -> Arc<Self> {
            Arc::new(Self {
                pages,
                rasterized: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait(?Send)]
    impl PageRasterizer for FakeRasterizer {
        async fn inspect(&self, pdf: Bytes) -> Result<PdfInfo, RasterError> {
            if pdf.starts_with(b"broken") {
                return Err(RasterError::Unreadable("invalid header".to_string()));
            }
            Ok(PdfInfo {
                page_count: self.pages,
                title: Some("Notes".to_string()),
                author: None,
            })
        }

        async fn rasterize(&self, _pdf: Bytes) -> Result<Vec<PageImage>, RasterError> {
            self.rasterized.fetch_add(1, Ordering::Relaxed);
            Ok((1..=self.pages)
                .map(|page| PageImage {
                    page,
                    png_base64: "AAAA".to_string(),
                })
                .collect())
        }
    }

    pub(crate) struct FakeGenerator {
        pub(crate) fail: bool,
    }

    #[async_trait(?Send)]
    impl MarkupGenerator for FakeGenerator {
        async fn generate(&self, pages: &[PageImage]) -> Result<String, GenerationError> {
            if self.fail {
                return Err(GenerationError::EmptyResponse);
            }
            Ok(format!("\\documentclass{{article}}\n% {} pages", pages.len()))
        }
    }

    pub(crate) fn pdf_upload(len: usize) -> Upload {
        Upload {
            filename: "paper.PDF".to_string(),
            bytes: Bytes::from(vec![b'%'; len]),
        }
    }

    fn gate(rasterizer: Arc<FakeRasterizer>) -> RequestGate<InMemoryStore> {
        let policy = QuotaPolicy::new(InMemoryStore::builder().with_gc_interval(None).build())
            .with_clock(ManualClock::at(MIDNIGHT));
        RequestGate::new(
            Arc::new(policy),
            rasterizer,
            Arc::new(FakeGenerator { fail: false }),
            Limits::default(),
        )
    }

    fn identity() -> ClientIdentity {
        ClientIdentity::new("10.0.0.1", "test")
    }

    #[test]
    fn test_file_present() {
        assert_eq!(
            check_file_present(None).unwrap_err().to_string(),
            "No file uploaded"
        );
        let unnamed = Upload {
            filename: String::new(),
            bytes: Bytes::new(),
        };
        assert_eq!(
            check_file_present(Some(unnamed)).unwrap_err().to_string(),
            "No file selected"
        );
    }

    #[test]
    fn test_extension() {
        assert!(check_extension("paper.pdf").is_ok());
        assert!(check_extension("PAPER.Pdf").is_ok());
        assert_eq!(
            check_extension("paper.docx").unwrap_err().to_string(),
            "Please upload a PDF file"
        );
        assert!(check_extension("pdf").is_err());
    }

    #[test]
    fn test_size_boundary() {
        let limits = Limits::default();
        assert!(check_size(10_485_760, &limits).is_ok());
        assert_eq!(
            check_size(10_485_761, &limits).unwrap_err().to_string(),
            "File too large. Maximum size is 10.0MB"
        );
        let limits = Limits {
            max_file_bytes: 5 * 1024 * 1024 + 512 * 1024,
            ..Limits::default()
        };
        assert_eq!(
            check_size(u64::MAX, &limits).unwrap_err().to_string(),
            "File too large. Maximum size is 5.5MB"
        );
    }

    #[test]
    fn test_page_count_boundary() {
        let limits = Limits::default();
        assert_eq!(
            check_page_count(0, &limits),
            Err(ValidationError::EmptyDocument)
        );
        assert!(check_page_count(1, &limits).is_ok());
        assert!(check_page_count(20, &limits).is_ok());
        let message = check_page_count(21, &limits).unwrap_err().to_string();
        assert_eq!(
            message,
            "PDF has 21 pages, but maximum allowed is 20 pages per conversion. \
             Please split your document into smaller files."
        );
    }

    #[actix_web::test]
    async fn test_convert() {
        let rasterizer = FakeRasterizer::with_pages(3);
        let gate = gate(rasterizer.clone());
        let conversion = gate.convert(&identity(), Some(pdf_upload(100))).await.unwrap();
        assert!(conversion.latex.contains("% 3 pages"));
        assert_eq!(conversion.quota.unwrap().remaining, 1);
        assert_eq!(rasterizer.rasterized.load(Ordering::Relaxed), 1);
    }

    #[actix_web::test]
    async fn test_validation_failures_are_not_charged() {
        let gate = gate(FakeRasterizer::with_pages(1));
        for _ in 0..5 {
            let err = gate
                .convert(&identity(), Some(pdf_upload(10_485_761)))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AppError::Validation(ValidationError::FileTooLarge { .. })
            ));
        }
        let keys = gate.policy().counter_keys(identity().as_str(), Tier::Convert);
        assert_eq!(gate.policy().store().peek(&keys[0]).await.unwrap(), 0);
    }

    #[actix_web::test]
    async fn test_page_count_rejection_is_charged() {
        let rasterizer = FakeRasterizer::with_pages(21);
        let gate = gate(rasterizer.clone());
        let err = gate
            .convert(&identity(), Some(pdf_upload(100)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::TooManyPages {
                pages: 21,
                max_pages: 20
            })
        ));
        let keys = gate.policy().counter_keys(identity().as_str(), Tier::Convert);
        assert_eq!(gate.policy().store().peek(&keys[1]).await.unwrap(), 1);
        // Never rendered
        assert_eq!(rasterizer.rasterized.load(Ordering::Relaxed), 0);
    }

    #[actix_web::test]
    async fn test_quota_checked_before_document_is_opened() {
        let rasterizer = FakeRasterizer::with_pages(1);
        let gate = gate(rasterizer.clone());
        let broken = Upload {
            filename: "broken.pdf".to_string(),
            bytes: Bytes::from_static(b"broken"),
        };
        for _ in 0..2 {
            let err = gate
                .convert(&identity(), Some(broken.clone()))
                .await
                .unwrap_err();
            assert!(err.to_string().starts_with("Could not validate PDF: "));
        }
        let err = gate
            .convert(&identity(), Some(broken))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
    }

    #[actix_web::test]
    async fn test_generation_failure() {
        let policy = QuotaPolicy::new(InMemoryStore::builder().with_gc_interval(None).build());
        let gate = RequestGate::new(
            Arc::new(policy),
            FakeRasterizer::with_pages(2),
            Arc::new(FakeGenerator { fail: true }),
            Limits::default(),
        );
        let err = gate
            .convert(&identity(), Some(pdf_upload(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Generation(_)));
    }

    #[actix_web::test]
    async fn test_validate_uses_its_own_tier() {
        let gate = gate(FakeRasterizer::with_pages(4));
        for _ in 0..3 {
            let validated = gate.validate(&identity(), Some(pdf_upload(10))).await.unwrap();
            assert_eq!(validated.info.page_count, 4);
            assert_eq!(validated.info.title.as_deref(), Some("Notes"));
        }
        // Validation does not use up conversions
        let keys = gate.policy().counter_keys(identity().as_str(), Tier::Convert);
        assert_eq!(gate.policy().store().peek(&keys[0]).await.unwrap(), 0);
        assert!(gate.convert(&identity(), Some(pdf_upload(10))).await.is_ok());
    }
}

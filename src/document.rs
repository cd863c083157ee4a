//! Document-level OCR pipeline.
//!
//! Drives one document end to end: validate the input, walk its pages in
//! ascending order (rasterizing PDFs chunk by chunk), run the verification
//! passes for each page, and aggregate the page results into an immutable
//! [`DocumentResult`]. Pages are processed strictly sequentially; the only
//! concurrency is the cooperative yield between passes and pages.

use std::time::Instant;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    engines::OcrEngine,
    language::detect_language,
    page_iter::{PageIter, RasterizeOptions},
    prelude::*,
    progress::{ProgressEvent, ProgressSender},
    verify::{self, VerificationLevel},
};

/// Default maximum input file size: 10 MB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// The result of verifying one page. Immutable once built.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PageResult {
    /// The page number within the document, starting from 1.
    pub page_number: usize,

    /// The consensus text for this page.
    pub text: String,

    /// Agreement between this page's OCR passes, 0–100.
    pub confidence: f64,

    /// How many OCR passes were scheduled.
    pub pass_count: usize,

    /// How many passes produced text and contributed to the consensus.
    pub variant_count: usize,
}

impl PageResult {
    /// Did every pass for this page fail?
    pub fn is_failed(&self) -> bool {
        self.variant_count == 0
    }
}

/// The result of processing one document. Immutable once built; owned by
/// the result store after completion.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DocumentResult {
    /// The input filename.
    pub filename: String,

    /// Per-page results, in ascending page order.
    pub pages: Vec<PageResult>,

    /// Arithmetic mean of the per-page confidence scores, 0–100, rounded to
    /// one decimal. 0 for a document with no pages.
    pub average_confidence: f64,

    /// The verification level the document was processed with.
    pub verification_level: VerificationLevel,

    /// Heuristically detected language of the extracted text.
    pub detected_language: String,

    /// Wall-clock processing time in seconds, rounded to one decimal.
    pub total_seconds: f64,

    /// When processing completed. Drives store eviction order.
    pub timestamp: DateTime<Utc>,

    /// Character count of the flattened text.
    pub character_count: usize,
}

impl DocumentResult {
    /// The flattened full text: pages in order, tagged with `[Page N]`
    /// headers when the document has more than one page. Pages with no text
    /// are skipped.
    pub fn full_text(&self) -> String {
        if self.pages.len() == 1 {
            return self.pages[0].text.clone();
        }
        self.pages
            .iter()
            .filter(|page| !page.text.trim().is_empty())
            .map(|page| format!("[Page {}]\n{}", page.page_number, page.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// How many pages produced no text at all.
    pub fn failed_page_count(&self) -> usize {
        self.pages.iter().filter(|page| page.is_failed()).count()
    }
}

/// Options for processing one document.
#[derive(Clone, Debug)]
pub struct ProcessOptions {
    /// The verification level to run.
    pub level: VerificationLevel,

    /// Explicit pass-count override, clamped to `1..=MAX_PASSES`.
    pub pass_count_override: Option<usize>,

    /// PDF rasterization options.
    pub raster: RasterizeOptions,

    /// Maximum input file size in bytes.
    pub max_file_size: u64,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            level: VerificationLevel::default(),
            pass_count_override: None,
            raster: RasterizeOptions::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl ProcessOptions {
    /// The number of passes to run per page.
    pub fn pass_count(&self) -> usize {
        self.pass_count_override
            .unwrap_or_else(|| self.level.pass_count())
            .clamp(1, verify::MAX_PASSES)
    }
}

/// Arithmetic mean of the per-page confidence scores. A document with no
/// pages has confidence 0, not a division error.
pub fn average_confidence(pages: &[PageResult]) -> f64 {
    if pages.is_empty() {
        return 0.0;
    }
    pages.iter().map(|page| page.confidence).sum::<f64>() / pages.len() as f64
}

/// Round to the one decimal place we consider meaningful.
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Process one document, emitting progress events along the way.
///
/// On failure, the terminal `error` event is emitted and any partial
/// results are discarded. Nothing reaches the result store unless the
/// whole document completed.
#[instrument(level = "debug", skip_all, fields(file_id = %file_id, path = %path.display()))]
pub async fn process_document(
    engine: &dyn OcrEngine,
    path: &Path,
    file_id: &str,
    options: &ProcessOptions,
    progress: &ProgressSender,
) -> Result<DocumentResult> {
    let result = process_document_inner(engine, path, file_id, options, progress).await;
    if let Err(err) = &result {
        progress.emit(ProgressEvent::Error {
            file_id: file_id.to_owned(),
            error: format!("{:#}", err),
        });
    }
    result
}

/// Perform actual work for [`process_document`].
async fn process_document_inner(
    engine: &dyn OcrEngine,
    path: &Path,
    file_id: &str,
    options: &ProcessOptions,
    progress: &ProgressSender,
) -> Result<DocumentResult> {
    let started = Instant::now();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    progress.emit(ProgressEvent::Start {
        file_id: file_id.to_owned(),
        filename: filename.clone(),
        verification_level: options.level,
        message: format!("Starting processing with {} verification", options.level),
    });

    // Validate before any OCR work begins: no partial result may exist for
    // an invalid input.
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to read input file {:?}", path.display()))?;
    if metadata.len() > options.max_file_size {
        return Err(anyhow!(
            "file too large: {} bytes (maximum is {} bytes)",
            metadata.len(),
            options.max_file_size
        ));
    }

    let mut page_iter = PageIter::from_path(path, &options.raster).await?;
    let check_complete_result = page_iter.check_complete();
    let total_pages = page_iter.page_count();
    if page_iter.is_pdf() {
        progress.emit(ProgressEvent::Info {
            file_id: file_id.to_owned(),
            total_pages,
            message: format!("PDF loaded: {} pages", total_pages),
        });
    }

    let pass_count = options.pass_count();
    let mut pages = vec![];
    while let Some(page) = page_iter.next_page().await {
        // A page-stream failure is a document-level failure: rasterization
        // is broken, so partial results are discarded.
        let page = page?;

        if progress.is_cancelled() {
            return Err(anyhow!(
                "progress consumer disconnected; abandoning {:?}",
                path.display()
            ));
        }

        let page_started = Instant::now();
        progress.emit(ProgressEvent::Progress {
            file_id: file_id.to_owned(),
            current_page: page.page_number,
            total_pages,
            progress: ((page.page_number - 1) * 100 / total_pages.max(1)) as u8,
            message: format!(
                "Processing page {}/{} with {} verification",
                page.page_number, total_pages, options.level
            ),
            elapsed_seconds: round1(started.elapsed().as_secs_f64()),
        });

        let verification =
            verify::verify_page(engine, &page.image, pass_count, progress).await;
        for warning in &verification.warnings {
            debug!(page = page.page_number, "{}", warning);
        }

        progress.emit(ProgressEvent::PageComplete {
            file_id: file_id.to_owned(),
            page: page.page_number,
            confidence: verification.confidence,
            passes: verification.pass_count,
            variations: verification.variant_count,
            text_preview: ProgressEvent::preview_of(&verification.text),
            page_seconds: round1(page_started.elapsed().as_secs_f64()),
        });

        pages.push(PageResult {
            page_number: page.page_number,
            text: verification.text,
            confidence: verification.confidence,
            pass_count: verification.pass_count,
            variant_count: verification.variant_count,
        });

        // Suspension point between pages: the decoded page image dropped
        // above can be reclaimed before the next page is rasterized.
        tokio::task::yield_now().await;
    }
    if let Err(err) = check_complete_result {
        warn!(path = %path.display(), "{:#}", err);
    }

    let average_confidence = round1(average_confidence(&pages));
    let result = DocumentResult {
        filename,
        pages,
        average_confidence,
        verification_level: options.level,
        detected_language: String::new(),
        total_seconds: round1(started.elapsed().as_secs_f64()),
        timestamp: Utc::now(),
        character_count: 0,
    };
    let full_text = result.full_text();
    let result = DocumentResult {
        detected_language: detect_language(&full_text),
        character_count: full_text.chars().count(),
        ..result
    };

    progress.emit(ProgressEvent::Complete {
        file_id: file_id.to_owned(),
        total_chars: result.character_count,
        average_confidence: result.average_confidence,
        verification_level: result.verification_level,
        detected_language: result.detected_language.clone(),
        message: format!(
            "Processing complete! Average confidence: {:.1}%",
            result.average_confidence
        ),
        total_seconds: result.total_seconds,
        text: full_text,
    });

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat};
    use tokio::sync::mpsc;

    use super::*;
    use crate::engines::fake::FakeEngine;

    fn page(page_number: usize, confidence: f64, variant_count: usize) -> PageResult {
        PageResult {
            page_number,
            text: if variant_count > 0 {
                format!("page {} text", page_number)
            } else {
                String::new()
            },
            confidence,
            pass_count: 3,
            variant_count,
        }
    }

    #[test]
    fn average_confidence_of_no_pages_is_zero() {
        assert_eq!(average_confidence(&[]), 0.0);
    }

    #[test]
    fn average_confidence_is_unweighted_by_text_length() {
        let pages = [page(1, 100.0, 3), page(2, 50.0, 3), page(3, 0.0, 0)];
        assert_eq!(average_confidence(&pages), 50.0);
    }

    #[test]
    fn full_text_tags_pages_and_skips_blank_ones() {
        let result = DocumentResult {
            filename: "scan.pdf".to_owned(),
            pages: vec![page(1, 100.0, 3), page(2, 0.0, 0), page(3, 90.0, 3)],
            average_confidence: 63.3,
            verification_level: VerificationLevel::High,
            detected_language: "unknown".to_owned(),
            total_seconds: 1.0,
            timestamp: Utc::now(),
            character_count: 0,
        };
        let text = result.full_text();
        assert_eq!(text, "[Page 1]\npage 1 text\n\n[Page 3]\npage 3 text");
        assert_eq!(result.failed_page_count(), 1);
    }

    #[test]
    fn single_page_full_text_is_untagged() {
        let result = DocumentResult {
            filename: "photo.png".to_owned(),
            pages: vec![page(1, 100.0, 3)],
            average_confidence: 100.0,
            verification_level: VerificationLevel::Low,
            detected_language: "unknown".to_owned(),
            total_seconds: 0.5,
            timestamp: Utc::now(),
            character_count: 0,
        };
        assert_eq!(result.full_text(), "page 1 text");
    }

    #[test]
    fn explicit_pass_override_beats_the_level_and_is_clamped() {
        let mut options = ProcessOptions {
            level: VerificationLevel::Ultra,
            ..ProcessOptions::default()
        };
        assert_eq!(options.pass_count(), 4);
        options.pass_count_override = Some(5);
        assert_eq!(options.pass_count(), 5);
        options.pass_count_override = Some(99);
        assert_eq!(options.pass_count(), 5);
        options.pass_count_override = Some(0);
        assert_eq!(options.pass_count(), 1);
    }

    /// Write a small PNG we can process as a one-page document.
    fn write_test_png(dir: &Path) -> PathBuf {
        let path = dir.join("photo.png");
        let image = image::RgbImage::from_pixel(16, 16, image::Rgb([200, 200, 200]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn single_image_pipeline_emits_ordered_events_and_aggregates() {
        let dir = tempfile::TempDir::with_prefix("document-test").unwrap();
        let path = write_test_png(dir.path());
        let engine = FakeEngine::constant("The lease for the tenant is binding.");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = ProgressSender::new(tx);

        let options = ProcessOptions {
            level: VerificationLevel::High,
            ..ProcessOptions::default()
        };
        let result = process_document(&engine, &path, "doc-1", &options, &progress)
            .await
            .unwrap();

        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.pages[0].page_number, 1);
        assert_eq!(result.pages[0].pass_count, 3);
        assert_eq!(result.average_confidence, 100.0);
        assert_eq!(result.detected_language, "english");
        assert_eq!(result.character_count, result.full_text().chars().count());

        // One start, one progress/page_complete pair, one terminal complete.
        // Plain images produce no info event.
        drop(progress);
        let mut kinds = vec![];
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                ProgressEvent::Start { .. } => "start",
                ProgressEvent::Info { .. } => "info",
                ProgressEvent::Progress { .. } => "progress",
                ProgressEvent::PageComplete { .. } => "page_complete",
                ProgressEvent::Complete { .. } => "complete",
                ProgressEvent::Error { .. } => "error",
            });
        }
        assert_eq!(kinds, vec!["start", "progress", "page_complete", "complete"]);
    }

    #[tokio::test]
    async fn oversized_files_are_rejected_before_any_ocr() {
        let dir = tempfile::TempDir::with_prefix("document-test").unwrap();
        let path = write_test_png(dir.path());
        let engine = FakeEngine::constant("never used");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = ProgressSender::new(tx);

        let options = ProcessOptions {
            max_file_size: 10,
            ..ProcessOptions::default()
        };
        let err = process_document(&engine, &path, "doc-1", &options, &progress)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("file too large"));

        // The terminal event is an error, and nothing follows it.
        drop(progress);
        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(ProgressEvent::Error { .. })));
    }

    #[tokio::test]
    async fn missing_files_fail_cleanly() {
        let engine = FakeEngine::constant("never used");
        let err = process_document(
            &engine,
            Path::new("/no/such/file.pdf"),
            "doc-1",
            &ProcessOptions::default(),
            &ProgressSender::disabled(),
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("failed to read input file"));
    }

    #[tokio::test]
    async fn disconnected_consumer_stops_the_pipeline() {
        let dir = tempfile::TempDir::with_prefix("document-test").unwrap();
        let path = write_test_png(dir.path());
        let engine = FakeEngine::constant("never used");
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let progress = ProgressSender::new(tx);

        let err = process_document(
            &engine,
            &path,
            "doc-1",
            &ProcessOptions::default(),
            &progress,
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("disconnected"));
    }
}

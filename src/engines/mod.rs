//! OCR engine interface.
//!
//! The OCR engine is a black box to the rest of the pipeline: given a page
//! image, produce a text string. It may be slow (hundreds of milliseconds to
//! seconds per call) and it may fail, and the verification loop is expected
//! to survive individual failures.

use std::sync::Arc;

use image::DynamicImage;

use crate::prelude::*;

pub mod fake;
pub mod tesseract;

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Extract text from a single page image.
    ///
    /// Must not mutate its input. A failure here aborts one pass, not the
    /// page or the document.
    async fn extract(&self, image: &DynamicImage) -> Result<String>;
}

/// Get the OCR engine with the specified name.
pub fn engine_for_name(name: &str) -> Result<Arc<dyn OcrEngine>> {
    match name {
        "tesseract" => Ok(Arc::new(tesseract::TesseractEngine::new())),
        "fake" => Ok(Arc::new(fake::FakeEngine::default())),
        other => Err(anyhow!(
            "unknown OCR engine {:?} (supported: tesseract, fake)",
            other
        )),
    }
}

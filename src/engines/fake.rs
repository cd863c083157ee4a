//! Fake OCR engine for testing.
//!
//! This engine never looks at the image. It plays back a scripted sequence
//! of per-pass results, then repeats a fixed default text. Scripted failures
//! let tests exercise the per-pass recovery paths without a real OCR tool
//! installed.

use std::{collections::VecDeque, sync::Mutex};

use image::DynamicImage;

use crate::prelude::*;

use super::OcrEngine;

/// Default text returned once the script is exhausted.
const DEFAULT_TEXT: &str = "The quick brown fox jumps over the lazy dog.";

/// A single scripted response.
#[derive(Clone, Debug)]
pub enum FakeResponse {
    /// Return this text as the extraction result.
    Text(String),
    /// Fail this pass with the given message.
    Failure(String),
}

/// Fake OCR engine for testing and offline smoke runs.
pub struct FakeEngine {
    /// Scripted responses, consumed front to back.
    script: Mutex<VecDeque<FakeResponse>>,

    /// Returned for every call once the script is exhausted.
    default_text: String,
}

impl FakeEngine {
    /// Create an engine that always returns `text`.
    pub fn constant(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_text: text.into(),
        }
    }

    /// Create an engine that plays back `script`, then returns
    /// `default_text` forever.
    pub fn scripted(script: Vec<FakeResponse>, default_text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_text: default_text.into(),
        }
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::constant(DEFAULT_TEXT)
    }
}

#[async_trait]
impl OcrEngine for FakeEngine {
    async fn extract(&self, _image: &DynamicImage) -> Result<String> {
        let next = self.script.lock().expect("lock poisoned").pop_front();
        match next {
            Some(FakeResponse::Text(text)) => Ok(text),
            Some(FakeResponse::Failure(message)) => Err(anyhow!("{}", message)),
            None => Ok(self.default_text.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::new(4, 4))
    }

    #[tokio::test]
    async fn scripted_responses_play_back_in_order() {
        let engine = FakeEngine::scripted(
            vec![
                FakeResponse::Text("first".to_owned()),
                FakeResponse::Failure("boom".to_owned()),
            ],
            "later",
        );
        let image = test_image();
        assert_eq!(engine.extract(&image).await.unwrap(), "first");
        assert!(engine.extract(&image).await.is_err());
        assert_eq!(engine.extract(&image).await.unwrap(), "later");
        assert_eq!(engine.extract(&image).await.unwrap(), "later");
    }
}

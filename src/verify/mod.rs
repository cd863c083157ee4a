//! Multi-pass OCR verification.
//!
//! A page is OCRed once per pass, each pass on a differently-preprocessed
//! copy of the page image, and the raw outputs are reconciled into one
//! consensus text with an agreement score. Passes run strictly
//! sequentially (at most one OCR invocation is in flight per document),
//! with a yield point after every pass so progress reporting stays live
//! and buffers can be reclaimed.

use std::fmt;

use image::DynamicImage;
use schemars::JsonSchema;

use crate::{engines::OcrEngine, prelude::*, progress::ProgressSender};

use self::{consensus::reconcile, preprocess::PassSequence};

pub mod consensus;
pub mod preprocess;

/// Hard cap on passes per page. Pairwise agreement scoring is quadratic in
/// the pass count, and every extra pass costs a full OCR invocation.
pub const MAX_PASSES: usize = 5;

/// How many OCR passes to run per page.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VerificationLevel {
    /// A single pass, no cross-checking.
    #[default]
    Low,
    /// Two passes.
    Medium,
    /// Three passes.
    High,
    /// Four passes.
    Ultra,
}

impl VerificationLevel {
    /// Parse a level name. The match is case-sensitive, and unrecognized
    /// names silently fall back to `low`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "medium" => Self::Medium,
            "high" => Self::High,
            "ultra" => Self::Ultra,
            _ => Self::Low,
        }
    }

    /// The number of OCR passes this level runs per page.
    pub fn pass_count(self) -> usize {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Ultra => 4,
        }
    }

    /// The lowercase level name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }
}

impl fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of running all OCR passes for one page.
#[derive(Clone, Debug)]
pub struct PageVerification {
    /// The consensus text.
    pub text: String,

    /// Agreement between passes, 0–100.
    pub confidence: f64,

    /// How many passes were scheduled.
    pub pass_count: usize,

    /// How many passes produced text and contributed to the consensus.
    pub variant_count: usize,

    /// One warning per failed pass.
    pub warnings: Vec<String>,
}

/// Run `pass_count` OCR passes over a page image and reconcile the results.
///
/// A failed pass is recorded as a warning and excluded from the consensus;
/// it never aborts the page. If every pass fails, the result is empty text
/// with confidence 0. If the progress consumer has hung up, remaining
/// passes are not started.
#[instrument(level = "debug", skip_all, fields(pass_count))]
pub async fn verify_page(
    engine: &dyn OcrEngine,
    image: &DynamicImage,
    pass_count: usize,
    progress: &ProgressSender,
) -> PageVerification {
    let pass_count = pass_count.clamp(1, MAX_PASSES);

    let mut extracted = vec![];
    let mut warnings = vec![];
    for (index, (variant, processed)) in PassSequence::new(image, pass_count).enumerate()
    {
        if progress.is_cancelled() {
            debug!(pass = index, "consumer hung up, skipping remaining passes");
            break;
        }

        match engine.extract(&processed).await {
            Ok(text) => extracted.push(text),
            Err(err) => {
                let warning =
                    format!("OCR pass {} ({}) failed: {:#}", index, variant.label(), err);
                warn!("{}", warning);
                warnings.push(warning);
            }
        }

        // Suspension point between passes: lets progress flow and the pass
        // buffer above drop before the next one is built.
        tokio::task::yield_now().await;
    }

    let variant_count = extracted.len();
    let consensus = reconcile(&extracted);
    PageVerification {
        text: consensus.text,
        confidence: consensus.confidence,
        pass_count,
        variant_count,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::fake::{FakeEngine, FakeResponse};

    fn test_image() -> DynamicImage {
        DynamicImage::ImageRgb8(image::RgbImage::new(8, 8))
    }

    #[test]
    fn levels_map_to_canonical_pass_counts() {
        assert_eq!(VerificationLevel::Low.pass_count(), 1);
        assert_eq!(VerificationLevel::Medium.pass_count(), 2);
        assert_eq!(VerificationLevel::High.pass_count(), 3);
        assert_eq!(VerificationLevel::Ultra.pass_count(), 4);
    }

    #[test]
    fn unknown_level_names_fall_back_to_low() {
        assert_eq!(VerificationLevel::from_name("ultra"), VerificationLevel::Ultra);
        assert_eq!(VerificationLevel::from_name("ULTRA"), VerificationLevel::Low);
        assert_eq!(VerificationLevel::from_name("bogus"), VerificationLevel::Low);
        assert_eq!(VerificationLevel::from_name(""), VerificationLevel::Low);
    }

    #[tokio::test]
    async fn agreeing_passes_produce_full_confidence() {
        let engine = FakeEngine::constant("lease agreement");
        let result = verify_page(
            &engine,
            &test_image(),
            VerificationLevel::High.pass_count(),
            &ProgressSender::disabled(),
        )
        .await;
        assert_eq!(result.text, "lease agreement");
        assert_eq!(result.confidence, 100.0);
        assert_eq!(result.pass_count, 3);
        assert_eq!(result.variant_count, 3);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn failed_pass_is_excluded_but_page_still_succeeds() {
        // Ultra runs 4 passes; the second fails, leaving 3 usable outputs.
        let engine = FakeEngine::scripted(
            vec![
                FakeResponse::Text("cat".to_owned()),
                FakeResponse::Failure("engine crashed".to_owned()),
                FakeResponse::Text("cot".to_owned()),
            ],
            "cat",
        );
        let result = verify_page(
            &engine,
            &test_image(),
            VerificationLevel::Ultra.pass_count(),
            &ProgressSender::disabled(),
        )
        .await;
        assert_eq!(result.text, "cat");
        assert!(!result.text.is_empty());
        assert_eq!(result.pass_count, 4);
        assert_eq!(result.variant_count, 3);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("engine crashed"));
    }

    #[tokio::test]
    async fn all_passes_failing_yields_empty_text_and_zero_confidence() {
        let failures = (0..4)
            .map(|_| FakeResponse::Failure("no text".to_owned()))
            .collect();
        let engine = FakeEngine::scripted(failures, "unused");
        let result = verify_page(
            &engine,
            &test_image(),
            VerificationLevel::Ultra.pass_count(),
            &ProgressSender::disabled(),
        )
        .await;
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.variant_count, 0);
        assert_eq!(result.warnings.len(), 4);
    }

    #[tokio::test]
    async fn pass_count_is_clamped_to_the_cap() {
        let engine = FakeEngine::constant("text");
        let result =
            verify_page(&engine, &test_image(), 99, &ProgressSender::disabled()).await;
        assert_eq!(result.pass_count, MAX_PASSES);
        assert_eq!(result.variant_count, MAX_PASSES);
    }
}

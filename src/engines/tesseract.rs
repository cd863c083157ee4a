//! OCR engine wrapping the `tesseract` CLI tool.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat};
use tokio::{fs, process::Command};

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::OcrEngine;

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct TesseractEngine {}

impl TesseractEngine {
    /// Create a new `tesseract` engine.
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    #[instrument(level = "debug", skip_all)]
    async fn extract(&self, image: &DynamicImage) -> Result<String> {
        // Write our input to a temporary file. Tesseract only reads from
        // disk, so every pass spools through a short-lived tempdir.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("cannot encode tesseract input image")?;
        fs::write(&input_path, png)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file.
        let output = Command::new("tesseract")
            .arg(&input_path)
            .arg(output_path.with_extension(""))
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, None)?;

        // Read the output file.
        fs::read_to_string(&output_path)
            .await
            .context("cannot read tesseract output file")
    }
}

//! Iterate over the page images of a document.
//!
//! PDFs are rasterized with Poppler's `pdftocairo` CLI tool, in bounded-size
//! chunks: at most `chunk_size` rasterized pages exist on disk at any moment,
//! and only the page currently being OCRed is decoded in memory. Each page
//! file is deleted as soon as it has been read, and each chunk's temporary
//! directory is deleted before the next chunk is rasterized. This bounded
//! footprint is a design contract: the pipeline targets
//! constrained-memory deployment.
//!
//! Plain images are returned as single-page documents.

use std::{collections::BTreeMap, fs, sync::LazyLock, vec};

use clap::Args;
use image::DynamicImage;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    prelude::*,
};

/// Image types supported as-is.
const SUPPORTED_IMAGE_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Options controlling PDF rasterization.
#[derive(Args, Clone, Debug)]
pub struct RasterizeOptions {
    /// The DPI to use when rasterizing PDF pages.
    #[clap(long, default_value = "150")]
    pub dpi: u32,

    /// The maximum number of rasterized pages held on disk at once.
    #[clap(long, default_value = "5")]
    pub chunk_size: usize,

    /// The maximum number of pages to process. If this is set, we will
    /// stop processing after this many pages and record an error.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for RasterizeOptions {
    fn default() -> Self {
        Self {
            dpi: 150,
            chunk_size: 5,
            max_pages: None,
        }
    }
}

/// One decoded page image, 1-indexed.
pub struct PageImage {
    /// The page number within the document, starting from 1.
    pub page_number: usize,

    /// The decoded page.
    pub image: DynamicImage,
}

/// An iterator-like source of page images, PDF or plain image.
pub struct PageIter {
    kind: Kind,
    total_pages: usize,
    max_pages: Option<usize>,
}

enum Kind {
    /// A plain image file: a one-page document.
    SingleImage { path: PathBuf, done: bool },

    /// A PDF, rasterized chunk by chunk.
    Pdf {
        path: PathBuf,
        options: RasterizeOptions,
        /// The next page to yield, 1-indexed.
        next_page: usize,
        /// The chunk currently on disk, if any.
        chunk: Option<Chunk>,
    },
}

/// A rasterized chunk of pages, held in a temporary directory that is
/// deleted when the chunk is dropped.
struct Chunk {
    tmpdir: Option<tempfile::TempDir>,
    files: vec::IntoIter<PathBuf>,
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Delete our temporary directory. Cleanup failures are logged, never
        // escalated.
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                warn!(
                    directory = %tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

impl PageIter {
    /// Create a new [`PageIter`] from a path, based on the detected MIME
    /// type.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path, options: &RasterizeOptions) -> Result<Self> {
        let mime_type = get_mime_type(path)?;

        if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            // A supported image type: a single-page document.
            Ok(Self {
                kind: Kind::SingleImage {
                    path: path.to_owned(),
                    done: false,
                },
                total_pages: 1,
                max_pages: options.max_pages,
            })
        } else if mime_type == "application/pdf" {
            let total_pages = get_pdf_page_count(path).await?;
            Ok(Self {
                kind: Kind::Pdf {
                    path: path.to_owned(),
                    options: options.to_owned(),
                    next_page: 1,
                    chunk: None,
                },
                total_pages,
                max_pages: options.max_pages,
            })
        } else {
            Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PNG, JPEG, WebP, GIF, PDF)",
                mime_type,
                path.display()
            ))
        }
    }

    /// Is this a PDF source (as opposed to a single image)?
    pub fn is_pdf(&self) -> bool {
        matches!(self.kind, Kind::Pdf { .. })
    }

    /// The number of pages this iterator will actually yield.
    pub fn page_count(&self) -> usize {
        match self.max_pages {
            Some(max_pages) => self.total_pages.min(max_pages),
            None => self.total_pages,
        }
    }

    /// Will this iterator return only an incomplete set of pages?
    pub fn is_incomplete(&self) -> bool {
        if let Some(max_pages) = self.max_pages {
            self.total_pages > max_pages
        } else {
            false
        }
    }

    /// If this iterator will return only an incomplete set of pages, return
    /// an error describing the truncation.
    pub fn check_complete(&self) -> Result<()> {
        if self.is_incomplete() {
            Err(anyhow!(
                "Only {}/{} pages processed (because of --max-pages)",
                self.page_count(),
                self.total_pages
            ))
        } else {
            Ok(())
        }
    }

    /// Get the next page image, in ascending page order.
    ///
    /// Page decoding runs on the blocking thread pool, and each rasterized
    /// page file is deleted as soon as it has been decoded.
    pub async fn next_page(&mut self) -> Option<Result<PageImage>> {
        let last_page = self.page_count();
        match &mut self.kind {
            Kind::SingleImage { path, done } => {
                if *done || last_page == 0 {
                    return None;
                }
                *done = true;
                let image = decode_page_file(path.to_owned(), false).await;
                Some(image.map(|image| PageImage {
                    page_number: 1,
                    image,
                }))
            }
            Kind::Pdf {
                path,
                options,
                next_page,
                chunk,
            } => {
                loop {
                    if *next_page > last_page {
                        *chunk = None;
                        return None;
                    }

                    // Pull the next page from the current chunk, if any.
                    if let Some(current) = chunk {
                        match current.files.next() {
                            Some(file) => {
                                let page_number = *next_page;
                                *next_page += 1;
                                let image = decode_page_file(file, true).await;
                                return Some(image.map(|image| PageImage {
                                    page_number,
                                    image,
                                }));
                            }
                            None => {
                                // Chunk exhausted. Drop its tempdir before
                                // rasterizing the next one.
                                *chunk = None;
                            }
                        }
                    }

                    // Rasterize the next chunk.
                    let first = *next_page;
                    let last = (first + options.chunk_size - 1).min(last_page);
                    match rasterize_chunk(path, options, first, last).await {
                        Ok(new_chunk) => *chunk = Some(new_chunk),
                        Err(err) => return Some(Err(err)),
                    }
                }
            }
        }
    }
}

/// Rasterize pages `first..=last` (1-indexed, inclusive) of a PDF into a
/// fresh temporary directory.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), first, last))]
async fn rasterize_chunk(
    path: &Path,
    options: &RasterizeOptions,
    first: usize,
    last: usize,
) -> Result<Chunk> {
    // Create a temporary directory to hold the PNG files.
    let tmpdir = tempfile::TempDir::with_prefix("pages")?;
    let out_prefix = tmpdir.path().join("page");

    // Run pdftocairo to convert this page range to PNG files.
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png")
        .arg("-r")
        .arg(options.dpi.to_string())
        .arg("-f")
        .arg(first.to_string())
        .arg("-l")
        .arg(last.to_string());
    let output = cmd
        .arg(path)
        .arg(&out_prefix)
        .output()
        .await
        .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

    // Collect the rasterized page files. pdftocairo zero-pads the page
    // numbers it appends, so a lexical sort puts them in page order.
    let mut files = tmpdir
        .path()
        .read_dir()
        .with_context(|| {
            format!(
                "failed to read temporary directory {:?}",
                tmpdir.path().display()
            )
        })?
        .map(|entry| {
            let entry = entry.with_context(|| {
                format!(
                    "failed to read entry in temporary directory {:?}",
                    tmpdir.path().display()
                )
            })?;
            Ok(entry.path())
        })
        .collect::<Result<Vec<_>>>()?;
    files.sort();

    let expected = last - first + 1;
    if files.len() != expected {
        return Err(anyhow!(
            "pdftocairo produced {} pages for range {}-{} of {:?}, expected {}",
            files.len(),
            first,
            last,
            path.display(),
            expected
        ));
    }

    Ok(Chunk {
        tmpdir: Some(tmpdir),
        files: files.into_iter(),
    })
}

/// Read and decode one page image on the blocking thread pool, optionally
/// deleting the file afterwards to recover disk space a bit early.
async fn decode_page_file(path: PathBuf, delete_after: bool) -> Result<DynamicImage> {
    spawn_blocking_propagating_panics(move || {
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read file {:?}", path.display()))?;
        if delete_after
            && let Err(err) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), "failed to delete page file: {}", err);
        }
        image::load_from_memory(&bytes)
            .with_context(|| format!("failed to decode image {:?}", path.display()))
    })
    .await
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    // Run pdfinfo to get the number of pages.
    let mut cmd = Command::new("pdfinfo");
    let output = cmd
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }

    // Get the number of pages from the properties.
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Get the MIME type of a file.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::ImageFormat;

    use super::*;

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    /// Write a small PNG we can use as a single-page document.
    fn write_test_png(dir: &Path) -> PathBuf {
        let path = dir.join("page.png");
        let image = image::RgbImage::from_pixel(16, 16, image::Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn plain_image_is_a_single_page_document() {
        let dir = tempfile::TempDir::with_prefix("page-iter-test").unwrap();
        let path = write_test_png(dir.path());

        let mut pages = PageIter::from_path(&path, &RasterizeOptions::default())
            .await
            .unwrap();
        assert!(!pages.is_pdf());
        assert_eq!(pages.page_count(), 1);

        let page = pages.next_page().await.unwrap().unwrap();
        assert_eq!(page.page_number, 1);
        assert_eq!(page.image.width(), 16);
        assert!(pages.next_page().await.is_none());
    }

    #[tokio::test]
    async fn unsupported_file_types_are_rejected() {
        let dir = tempfile::TempDir::with_prefix("page-iter-test").unwrap();
        let path = dir.path().join("notes.zip");
        // A ZIP magic number, so `infer` sees a real (but unsupported) type.
        fs::write(&path, b"PK\x03\x04rest-of-file").unwrap();

        let result = PageIter::from_path(&path, &RasterizeOptions::default()).await;
        let err = format!("{:#}", result.err().unwrap());
        assert!(err.contains("unsupported MIME type"), "got: {}", err);
    }

    /// Write a minimal PDF with `page_count` blank pages. Poppler
    /// reconstructs the missing xref table on load.
    fn write_test_pdf(dir: &Path, page_count: usize) -> PathBuf {
        let path = dir.join("test.pdf");
        let mut body = String::from("%PDF-1.4\n");
        body.push_str("1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        let kids = (0..page_count)
            .map(|i| format!("{} 0 R", i + 3))
            .collect::<Vec<_>>()
            .join(" ");
        body.push_str(&format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids, page_count
        ));
        for i in 0..page_count {
            body.push_str(&format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >> endobj\n",
                i + 3
            ));
        }
        body.push_str("trailer << /Root 1 0 R >>\n%%EOF\n");
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn page_count_returns_correct_number_of_pages() {
        let dir = tempfile::TempDir::with_prefix("page-iter-test").unwrap();
        let path = write_test_pdf(dir.path(), 2);
        let page_count = get_pdf_page_count(&path).await.unwrap();
        assert_eq!(page_count, 2);
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn pdf_pages_arrive_in_order_across_chunk_boundaries() {
        let dir = tempfile::TempDir::with_prefix("page-iter-test").unwrap();
        let path = write_test_pdf(dir.path(), 12);

        // Chunk size 5 over 12 pages: chunks of 5, 5, and 2.
        let mut pages = PageIter::from_path(&path, &RasterizeOptions::default())
            .await
            .unwrap();
        assert!(pages.is_pdf());
        assert_eq!(pages.page_count(), 12);

        let mut seen = vec![];
        while let Some(page) = pages.next_page().await {
            seen.push(page.unwrap().page_number);
        }
        assert_eq!(seen, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn page_iter_obeys_max_pages() {
        let dir = tempfile::TempDir::with_prefix("page-iter-test").unwrap();
        let path = write_test_pdf(dir.path(), 3);

        let options = RasterizeOptions {
            max_pages: Some(1),
            ..RasterizeOptions::default()
        };
        let mut pages = PageIter::from_path(&path, &options).await.unwrap();
        assert!(pages.is_incomplete());
        assert!(pages.check_complete().is_err());

        let mut count = 0;
        while let Some(page) = pages.next_page().await {
            page.unwrap();
            count += 1;
        }
        assert_eq!(count, 1);
    }
}

//! The `extract` subcommand.
//!
//! Reads `{id, path}` records, processes each document sequentially with
//! multi-pass verification, and writes one flat JSONL output record per
//! document. Documents are never processed in parallel: each OCR pass is
//! expensive, and the pipeline targets constrained-memory deployment.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::Args;
use futures::{Stream as _, StreamExt as _};
use schemars::JsonSchema;
use tokio::{
    io::{AsyncWriteExt as _, BufWriter},
    sync::mpsc,
};
use uuid::Uuid;

use crate::{
    async_utils::{JoinWorker, io::create_writer, io::read_jsonl_or_csv},
    document::{DEFAULT_MAX_FILE_SIZE, DocumentResult, ProcessOptions, process_document},
    engines::engine_for_name,
    page_iter::RasterizeOptions,
    prelude::*,
    progress::{ProgressEvent, ProgressSender},
    store::{DEFAULT_CAPACITY, ResultStore, SWEEP_PERIOD, Sweeper},
    ui::{ProgressConfig, Ui},
    verify::VerificationLevel,
};

use super::StreamOpts;

/// A input record describing a file to OCR.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ExtractInput {
    /// The unique ID of this document. Generated if omitted.
    #[serde(default)]
    pub id: Option<String>,

    /// The path to the PDF or image file.
    pub path: PathBuf,
}

impl ExtractInput {
    /// Convert from a JSON value to the input type.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("failed to deserialize input")
    }
}

/// Output status of a processed document.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractStatus {
    /// Every page produced text.
    Ok,

    /// Some pages produced text, some failed completely.
    Incomplete,

    /// The document failed.
    Failed,
}

/// One page of extracted text, for `--split-pages` output.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PageText {
    /// The page number, starting from 1.
    pub page: usize,

    /// The consensus text for this page.
    pub text: String,

    /// Agreement between this page's OCR passes, 0–100.
    pub confidence: f64,
}

/// An output record describing one processed document.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractOutput {
    /// The ID of the input record.
    pub id: String,

    /// The status of the output record.
    pub status: ExtractStatus,

    /// The path to the input file.
    pub path: PathBuf,

    /// Any errors that occurred during processing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,

    /// The flattened extracted text. Absent with `--split-pages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Per-page extracted text. Present with `--split-pages`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<PageText>>,

    /// Mean per-page confidence, 0–100.
    pub average_confidence: f64,

    /// The verification level the document was processed with.
    pub verification_level: VerificationLevel,

    /// Heuristically detected language of the extracted text.
    pub detected_language: String,

    /// Wall-clock processing time in seconds.
    pub total_seconds: f64,

    /// Character count of the flattened text.
    pub character_count: usize,
}

impl ExtractOutput {
    /// Build an output record from a completed document result.
    fn from_result(
        id: String,
        path: PathBuf,
        result: &DocumentResult,
        split_pages: bool,
    ) -> Self {
        let status = if result.failed_page_count() == 0 {
            ExtractStatus::Ok
        } else if result.failed_page_count() < result.pages.len() {
            ExtractStatus::Incomplete
        } else {
            ExtractStatus::Failed
        };
        let (text, pages) = if split_pages {
            let pages = result
                .pages
                .iter()
                .map(|page| PageText {
                    page: page.page_number,
                    text: page.text.clone(),
                    confidence: page.confidence,
                })
                .collect();
            (None, Some(pages))
        } else {
            (Some(result.full_text()), None)
        };
        Self {
            id,
            status,
            path,
            errors: None,
            text,
            pages,
            average_confidence: result.average_confidence,
            verification_level: result.verification_level,
            detected_language: result.detected_language.clone(),
            total_seconds: result.total_seconds,
            character_count: result.character_count,
        }
    }

    /// Build a failed output record.
    fn from_error(
        id: String,
        path: PathBuf,
        level: VerificationLevel,
        err: &anyhow::Error,
    ) -> Self {
        Self {
            id,
            status: ExtractStatus::Failed,
            path,
            errors: Some(format!("{:?}", err)),
            text: None,
            pages: None,
            average_confidence: 0.0,
            verification_level: level,
            detected_language: "unknown".to_owned(),
            total_seconds: 0.0,
            character_count: 0,
        }
    }

    /// Convert from the output type to a JSON value.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value::<Self>((*self).to_owned())
            .context("failed to serialize output")
    }
}

/// The `extract` subcommand options.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// Input records as JSONL or CSV, with `id` and `path` fields. Defaults
    /// to standard input.
    pub input_path: Option<PathBuf>,

    /// The output path to write JSONL records to. Defaults to standard
    /// output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Verification level: low, medium, high or ultra (1 to 4 OCR passes
    /// per page). Unrecognized values fall back to low.
    #[clap(long, default_value = "low")]
    pub level: String,

    /// Override the number of OCR passes per page (1 to 5). Five passes add
    /// a memory-intensive 2x upscale pass.
    #[clap(long)]
    pub passes: Option<usize>,

    /// The OCR engine to use (tesseract or fake).
    #[clap(long, default_value = "tesseract")]
    pub engine: String,

    /// Emit per-page records instead of one flattened text field.
    #[clap(long)]
    pub split_pages: bool,

    /// Write the typed progress event stream to this file as JSONL.
    #[clap(long)]
    pub progress_events: Option<PathBuf>,

    /// Maximum input file size in bytes.
    #[clap(long, default_value_t = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: u64,

    /// How many completed document results to retain in memory.
    #[clap(long, default_value_t = DEFAULT_CAPACITY)]
    pub store_capacity: usize,

    #[clap(flatten)]
    pub raster: RasterizeOptions,

    #[clap(flatten)]
    pub stream: StreamOpts,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let engine = engine_for_name(&opts.engine)?;
    let level = VerificationLevel::from_name(&opts.level);
    let process_options = ProcessOptions {
        level,
        pass_count_override: opts.passes,
        raster: opts.raster.clone(),
        max_file_size: opts.max_file_size,
    };

    // The result store, and its periodic eviction sweeper.
    let store = Arc::new(ResultStore::new(opts.store_capacity));
    let sweeper = Sweeper::spawn(store.clone(), SWEEP_PERIOD);

    // Set up the progress event stream, if requested.
    let (progress, event_worker) = match &opts.progress_events {
        Some(path) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = spawn_event_writer(path.to_owned(), rx);
            (ProgressSender::new(tx), worker)
        }
        None => (ProgressSender::disabled(), JoinWorker::noop()),
    };

    // Open up our input stream and parse into records.
    let input = read_jsonl_or_csv(ui.clone(), opts.input_path.as_deref())
        .await?
        .map(|value| ExtractInput::from_json(value?))
        .boxed();
    let input = opts.stream.apply_stream_input_opts(input);

    // Configure our progress bar.
    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing documents",
            done_msg: "OCRed documents",
        },
        input.size_hint(),
    );

    // Process each document in turn. `then` polls one future at a time, so
    // documents run strictly sequentially.
    let failure_count = Arc::new(AtomicUsize::new(0));
    let output = {
        let failure_count = failure_count.clone();
        let split_pages = opts.split_pages;
        input
            .then(move |record| {
                let engine = engine.clone();
                let store = store.clone();
                let process_options = process_options.clone();
                let progress = progress.clone();
                let failure_count = failure_count.clone();
                async move {
                    let record = record?;
                    let id = record
                        .id
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    let output = match process_document(
                        engine.as_ref(),
                        &record.path,
                        &id,
                        &process_options,
                        &progress,
                    )
                    .await
                    {
                        Ok(result) => {
                            store.record(&id, result.clone());
                            ExtractOutput::from_result(
                                id,
                                record.path,
                                &result,
                                split_pages,
                            )
                        }
                        // Convert the error to a failed output record, so one
                        // corrupt document doesn't abort the whole batch.
                        Err(err) => {
                            ExtractOutput::from_error(id, record.path, level, &err)
                        }
                    };
                    if output.status == ExtractStatus::Failed {
                        failure_count.fetch_add(1, Ordering::Relaxed);
                    }
                    output.to_json()
                }
            })
            .boxed()
    };
    let output = pb.wrap_stream(output).boxed();

    crate::async_utils::io::write_output(opts.output_path.as_deref(), output).await?;

    // All senders are gone once the stream is drained, so the event writer
    // can finish.
    event_worker.join().await?;
    sweeper.shutdown().await?;

    let failures = failure_count.load(Ordering::Relaxed);
    if failures > 0 {
        ui.display_message("❌", &format!("{} documents could not be processed", failures));
    }
    Ok(())
}

/// Spawn a task writing progress events to a JSONL file as they arrive.
fn spawn_event_writer(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) -> JoinWorker {
    let handle = tokio::spawn(async move {
        let mut writer = BufWriter::new(create_writer(Some(&path)).await?);
        while let Some(event) = rx.recv().await {
            let json =
                serde_json::to_string(&event).context("failed to serialize event")?;
            writer
                .write_all(json.as_bytes())
                .await
                .context("failed to write event")?;
            writer
                .write_all(b"\n")
                .await
                .context("failed to write event")?;
            // Flush per event: this is a live progress feed, not bulk data.
            writer.flush().await.context("failed to flush events")?;
        }
        Ok(())
    });
    JoinWorker::from_handle(handle)
}

//! Typed progress events for streaming consumers.
//!
//! Each document produces exactly one `start`, an optional `info` once the
//! page count is known (PDFs only), one `progress`/`page_complete` pair per
//! page in page order, and exactly one terminal `complete` or `error`.
//! Nothing is emitted after the terminal event.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use schemars::JsonSchema;
use tokio::sync::mpsc;

use crate::{prelude::*, verify::VerificationLevel};

/// A progress event for one document.
#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Processing has begun.
    Start {
        file_id: String,
        filename: String,
        verification_level: VerificationLevel,
        message: String,
    },

    /// The total page count is known. Only emitted for PDFs.
    Info {
        file_id: String,
        total_pages: usize,
        message: String,
    },

    /// A page is about to be processed.
    Progress {
        file_id: String,
        current_page: usize,
        total_pages: usize,
        /// Percentage of pages already completed, 0–100.
        progress: u8,
        message: String,
        elapsed_seconds: f64,
    },

    /// A page finished its verification passes.
    PageComplete {
        file_id: String,
        page: usize,
        confidence: f64,
        passes: usize,
        variations: usize,
        text_preview: String,
        page_seconds: f64,
    },

    /// Terminal: the document completed.
    Complete {
        file_id: String,
        text: String,
        total_chars: usize,
        average_confidence: f64,
        verification_level: VerificationLevel,
        detected_language: String,
        message: String,
        total_seconds: f64,
    },

    /// Terminal: the document failed.
    Error { file_id: String, error: String },
}

impl ProgressEvent {
    /// The preview length used in `page_complete` events.
    pub const PREVIEW_CHARS: usize = 200;

    /// Truncate `text` to a short preview for a `page_complete` event.
    pub fn preview_of(text: &str) -> String {
        if text.chars().count() > Self::PREVIEW_CHARS {
            let prefix: String = text.chars().take(Self::PREVIEW_CHARS).collect();
            format!("{}...", prefix)
        } else {
            text.to_owned()
        }
    }
}

/// Sends progress events to an optional consumer.
///
/// When the consumer hangs up, the sender flips into a cancelled state. The
/// pipeline polls [`ProgressSender::is_cancelled`] at its suspension points
/// and stops scheduling further passes and pages; work already dispatched to
/// the OCR engine runs to completion.
#[derive(Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    disconnected: Arc<AtomicBool>,
}

impl ProgressSender {
    /// Create a sender feeding the given channel.
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            tx: Some(tx),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a sender that discards all events.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send an event. A hung-up consumer is recorded, not an error.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            self.disconnected.store(true, Ordering::Relaxed);
        }
    }

    /// Has the consumer hung up?
    pub fn is_cancelled(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tags() {
        let event = ProgressEvent::Start {
            file_id: "doc-1".to_owned(),
            filename: "scan.pdf".to_owned(),
            verification_level: VerificationLevel::High,
            message: "Starting".to_owned(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["verification_level"], "high");

        let event = ProgressEvent::PageComplete {
            file_id: "doc-1".to_owned(),
            page: 3,
            confidence: 91.7,
            passes: 4,
            variations: 4,
            text_preview: "preview".to_owned(),
            page_seconds: 1.2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "page_complete");
        assert_eq!(json["page"], 3);
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "x".repeat(500);
        let preview = ProgressEvent::preview_of(&long);
        assert_eq!(
            preview.chars().count(),
            ProgressEvent::PREVIEW_CHARS + "...".len()
        );
        assert!(preview.ends_with("..."));
        assert_eq!(ProgressEvent::preview_of("short"), "short");
    }

    #[test]
    fn dropped_consumer_marks_sender_cancelled() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = ProgressSender::new(tx);
        assert!(!sender.is_cancelled());
        drop(rx);
        sender.emit(ProgressEvent::Error {
            file_id: "doc-1".to_owned(),
            error: "nope".to_owned(),
        });
        assert!(sender.is_cancelled());
    }

    #[test]
    fn disabled_sender_never_cancels() {
        let sender = ProgressSender::disabled();
        sender.emit(ProgressEvent::Error {
            file_id: "doc-1".to_owned(),
            error: "nope".to_owned(),
        });
        assert!(!sender.is_cancelled());
    }
}

//! Stage notifications and the counters they are snapshotted from.
//!
//! The original engine's multicast event handlers become a channel model
//! here: stages push [`StageEvent`]s into an unbounded sender owned by the
//! pipeline, and telemetry fans the aggregate back out to subscribers.

use crate::error::ErrorNotification;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Progress payload for the extract stage.
#[derive(Debug, Clone, Default)]
pub struct ExtractNotification {
    pub line_number: u64,
    pub total_lines: u64,
    pub bytes_read: u64,
    pub source_size: u64,
    pub percent_read: f64,
}

/// Progress payload for the transform stage.
#[derive(Debug, Clone, Default)]
pub struct TransformNotification {
    pub ingested_lines: u64,
    pub transformed_lines: u64,
    pub excluded_by_filter: u64,
    pub total_lines: u64,
    pub percent_done: f64,
}

/// Progress payload for the load stage.
#[derive(Debug, Clone, Default)]
pub struct LoadNotification {
    pub current_line: u64,
    pub total_lines: u64,
    pub percent_written: f64,
}

/// Everything a stage can report while running.
#[derive(Debug, Clone)]
pub enum StageEvent {
    ExtractProgress(ExtractNotification),
    ExtractFinished(ExtractNotification),
    TransformProgress(TransformNotification),
    TransformFinished(TransformNotification),
    /// A sink committed a write (for batched sinks, one batch).
    Write(LoadNotification),
    LoadFinished(LoadNotification),
    Error(ErrorNotification),
}

pub type EventTx = mpsc::UnboundedSender<StageEvent>;
pub type EventRx = mpsc::UnboundedReceiver<StageEvent>;

/// Lifetime counters of an extractor. Updated by the source thread,
/// read by the pipeline when emitting progress events.
#[derive(Debug, Default)]
pub struct ExtractCounters {
    pub line_number: AtomicU64,
    pub total_lines: AtomicU64,
    pub bytes_read: AtomicU64,
    pub source_size: AtomicU64,
}

impl ExtractCounters {
    pub fn snapshot(&self) -> ExtractNotification {
        let line_number = self.line_number.load(Ordering::Relaxed);
        let total_lines = self.total_lines.load(Ordering::Relaxed);
        let bytes_read = self.bytes_read.load(Ordering::Relaxed);
        let source_size = self.source_size.load(Ordering::Relaxed);
        let percent_read = if source_size > 0 {
            (bytes_read as f64 / source_size as f64 * 100.0).min(100.0)
        } else {
            percent(line_number, total_lines)
        };
        ExtractNotification {
            line_number,
            total_lines,
            bytes_read,
            source_size,
            percent_read,
        }
    }
}

/// Lifetime counters of a transformer.
#[derive(Debug, Default)]
pub struct TransformCounters {
    pub ingested_lines: AtomicU64,
    pub transformed_lines: AtomicU64,
    pub excluded_by_filter: AtomicU64,
    pub total_lines: AtomicU64,
}

impl TransformCounters {
    pub fn snapshot(&self) -> TransformNotification {
        let ingested_lines = self.ingested_lines.load(Ordering::Relaxed);
        let total_lines = self.total_lines.load(Ordering::Relaxed);
        TransformNotification {
            ingested_lines,
            transformed_lines: self.transformed_lines.load(Ordering::Relaxed),
            excluded_by_filter: self.excluded_by_filter.load(Ordering::Relaxed),
            total_lines,
            percent_done: percent(ingested_lines, total_lines),
        }
    }
}

/// Lifetime counters of a sink.
#[derive(Debug, Default)]
pub struct LoadCounters {
    pub current_line: AtomicU64,
    pub total_lines: AtomicU64,
}

impl LoadCounters {
    pub fn snapshot(&self) -> LoadNotification {
        let current_line = self.current_line.load(Ordering::Relaxed);
        let total_lines = self.total_lines.load(Ordering::Relaxed);
        LoadNotification {
            current_line,
            total_lines,
            percent_written: percent(current_line, total_lines),
        }
    }
}

fn percent(current: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (current as f64 / total as f64 * 100.0).min(100.0)
    }
}

//! Telemetry: aggregates per-stage progress into one observable snapshot.
//!
//! Stage events flow into [`Telemetry::run`]; every update republishes the
//! whole [`PipelineProgress`] through a watch channel, and error
//! notifications are re-emitted unchanged on a broadcast channel.

use crate::error::{ErrorNotification, Stage};
use crate::events::{EventRx, StageEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// Progress of one stage (or of the synthetic Global aggregate).
#[derive(Debug, Clone, Default)]
pub struct StageProgress {
    pub current_line: u64,
    pub total_lines: u64,
    pub percent_complete: f64,
    pub status: StageStatus,
    /// Rows per second since telemetry was constructed.
    pub speed: f64,
    pub estimated_remaining: Duration,
}

/// Snapshot of all four stage records.
#[derive(Debug, Clone, Default)]
pub struct PipelineProgress {
    pub extract: StageProgress,
    pub transform: StageProgress,
    pub load: StageProgress,
    pub global: StageProgress,
}

impl PipelineProgress {
    pub fn stage(&self, stage: Stage) -> &StageProgress {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Transform => &self.transform,
            Stage::Load => &self.load,
            Stage::Global => &self.global,
        }
    }

    fn stage_mut(&mut self, stage: Stage) -> &mut StageProgress {
        match stage {
            Stage::Extract => &mut self.extract,
            Stage::Transform => &mut self.transform,
            Stage::Load => &mut self.load,
            Stage::Global => &mut self.global,
        }
    }
}

/// Aggregator handle. Subscribe for snapshots and re-emitted errors; the
/// pipeline drives [`run`] while executing.
///
/// [`run`]: Telemetry::run
pub struct Telemetry {
    progress_tx: watch::Sender<PipelineProgress>,
    errors_tx: broadcast::Sender<ErrorNotification>,
    started: Instant,
}

impl Telemetry {
    pub fn new() -> Self {
        let (progress_tx, _) = watch::channel(PipelineProgress::default());
        let (errors_tx, _) = broadcast::channel(64);
        Self {
            progress_tx,
            errors_tx,
            started: Instant::now(),
        }
    }

    /// Observe every change to any stage's progress.
    pub fn subscribe(&self) -> watch::Receiver<PipelineProgress> {
        self.progress_tx.subscribe()
    }

    /// Observe per-stage errors, re-emitted unchanged.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorNotification> {
        self.errors_tx.subscribe()
    }

    /// Elapsed time since construction.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Consume stage events until every sender is gone. Returns the first
    /// error notification observed, which becomes the pipeline's reported
    /// cause.
    pub async fn run(self: Arc<Self>, mut events: EventRx) -> Option<ErrorNotification> {
        let mut progress = PipelineProgress::default();
        let mut first_error: Option<ErrorNotification> = None;

        while let Some(event) = events.recv().await {
            let elapsed = self.started.elapsed().as_secs_f64();
            match event {
                StageEvent::ExtractProgress(n) => {
                    update(
                        progress.stage_mut(Stage::Extract),
                        StageStatus::Running,
                        n.line_number,
                        n.total_lines,
                        n.percent_read,
                        elapsed,
                    );
                }
                StageEvent::ExtractFinished(n) => {
                    update(
                        progress.stage_mut(Stage::Extract),
                        StageStatus::Completed,
                        n.line_number,
                        n.total_lines,
                        100.0,
                        elapsed,
                    );
                }
                StageEvent::TransformProgress(n) => {
                    update(
                        progress.stage_mut(Stage::Transform),
                        StageStatus::Running,
                        n.ingested_lines,
                        n.total_lines,
                        n.percent_done,
                        elapsed,
                    );
                }
                StageEvent::TransformFinished(n) => {
                    update(
                        progress.stage_mut(Stage::Transform),
                        StageStatus::Completed,
                        n.ingested_lines,
                        n.total_lines,
                        100.0,
                        elapsed,
                    );
                }
                StageEvent::Write(n) => {
                    update(
                        progress.stage_mut(Stage::Load),
                        StageStatus::Running,
                        n.current_line,
                        n.total_lines,
                        n.percent_written,
                        elapsed,
                    );
                }
                StageEvent::LoadFinished(n) => {
                    update(
                        progress.stage_mut(Stage::Load),
                        StageStatus::Completed,
                        n.current_line,
                        n.total_lines,
                        100.0,
                        elapsed,
                    );
                }
                StageEvent::Error(n) => {
                    progress.stage_mut(n.stage).status = StageStatus::Failed;
                    if first_error.is_none() {
                        first_error = Some(n.clone());
                    }
                    let _ = self.errors_tx.send(n);
                }
            }

            refresh_global(&mut progress, elapsed);
            self.progress_tx.send_replace(progress.clone());
        }

        first_error
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

fn update(
    stage: &mut StageProgress,
    status: StageStatus,
    current: u64,
    total: u64,
    percent: f64,
    elapsed: f64,
) {
    // A failed stage stays failed.
    if stage.status != StageStatus::Failed {
        stage.status = status;
    }
    stage.current_line = current;
    stage.total_lines = total;
    stage.percent_complete = percent;
    stage.speed = if elapsed > 0.0 {
        current as f64 / elapsed
    } else {
        0.0
    };
    stage.estimated_remaining = if stage.speed > 0.0 && total > current {
        Duration::from_secs_f64((total - current) as f64 / stage.speed)
    } else {
        Duration::ZERO
    };
}

/// Global mirrors the load stage's counters; its status is failed as soon
/// as any stage fails, and completed only when every stage completed.
fn refresh_global(progress: &mut PipelineProgress, elapsed: f64) {
    let stages = [
        &progress.extract.status,
        &progress.transform.status,
        &progress.load.status,
    ];
    let status = if stages.iter().any(|s| **s == StageStatus::Failed) {
        StageStatus::Failed
    } else if stages.iter().all(|s| **s == StageStatus::Completed) {
        StageStatus::Completed
    } else if stages.iter().any(|s| **s == StageStatus::Running) {
        StageStatus::Running
    } else {
        StageStatus::Idle
    };

    let load = progress.load.clone();
    let global = progress.stage_mut(Stage::Global);
    global.status = status;
    global.current_line = load.current_line;
    global.total_lines = load.total_lines;
    global.percent_complete = load.percent_complete;
    global.speed = if elapsed > 0.0 {
        load.current_line as f64 / elapsed
    } else {
        0.0
    };
    global.estimated_remaining = load.estimated_remaining;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ExtractNotification, LoadNotification, TransformNotification};
    use tokio::sync::mpsc;

    fn extract_n(line: u64) -> ExtractNotification {
        ExtractNotification {
            line_number: line,
            total_lines: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn global_completes_when_all_stages_complete() {
        let telemetry = Arc::new(Telemetry::new());
        let mut snapshots = telemetry.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(telemetry.clone().run(rx));

        tx.send(StageEvent::ExtractFinished(extract_n(100))).unwrap();
        tx.send(StageEvent::TransformFinished(TransformNotification {
            ingested_lines: 100,
            transformed_lines: 100,
            ..Default::default()
        }))
        .unwrap();
        tx.send(StageEvent::LoadFinished(LoadNotification {
            current_line: 100,
            total_lines: 100,
            ..Default::default()
        }))
        .unwrap();
        drop(tx);

        assert!(handle.await.unwrap().is_none());
        let progress = snapshots.borrow_and_update().clone();
        assert_eq!(progress.global.status, StageStatus::Completed);
        assert_eq!(progress.global.current_line, 100);
        assert_eq!(progress.load.percent_complete, 100.0);
    }

    #[tokio::test]
    async fn first_error_wins_and_fails_global() {
        let telemetry = Arc::new(Telemetry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(telemetry.clone().run(rx));

        tx.send(StageEvent::ExtractProgress(extract_n(10))).unwrap();
        tx.send(StageEvent::Error(ErrorNotification {
            stage: Stage::Transform,
            cause: "boom".into(),
            current_line: 10,
            partial_row: None,
        }))
        .unwrap();
        tx.send(StageEvent::Error(ErrorNotification {
            stage: Stage::Load,
            cause: "later".into(),
            current_line: 11,
            partial_row: None,
        }))
        .unwrap();
        drop(tx);

        let first = handle.await.unwrap().expect("error expected");
        assert_eq!(first.stage, Stage::Transform);
        assert_eq!(first.cause, "boom");

        let progress = telemetry.subscribe().borrow().clone();
        assert_eq!(progress.transform.status, StageStatus::Failed);
        assert_eq!(progress.global.status, StageStatus::Failed);
    }
}

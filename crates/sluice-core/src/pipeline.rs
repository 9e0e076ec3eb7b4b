//! Pipeline orchestrator: wires Source -> Transform -> Sink over bounded
//! channels, runs the stages concurrently, and propagates cancellation.

use crate::error::{is_abort, ErrorNotification, PartialRow, PipelineError, Stage};
use crate::events::StageEvent;
use crate::pool::BufferPool;
use crate::schema::Schema;
use crate::telemetry::Telemetry;
use crate::{Message, RowEnvelope, Sink, Source, StageContext, Transform};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Completed,
    Failed,
    Cancelled,
}

/// What `execute` hands back. Stage errors are never raised out of
/// `execute`; the first error event becomes `first_error`.
#[derive(Debug)]
pub struct ExecutionSummary {
    pub status: PipelineStatus,
    pub first_error: Option<ErrorNotification>,
    pub extracted_lines: u64,
    pub transformed_lines: u64,
    pub loaded_lines: u64,
    pub elapsed: Duration,
}

impl ExecutionSummary {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }
}

/// A fully wired, not-yet-running pipeline.
pub struct Pipeline {
    source: Box<dyn Source>,
    transform: Box<dyn Transform>,
    sink: Box<dyn Sink>,
    pool: Arc<BufferPool>,
    telemetry: Arc<Telemetry>,
    cancel: CancellationToken,
    channel_capacity: usize,
}

impl Pipeline {
    /// Wire the three stages, verifying schema compatibility up front:
    /// the transform's input must match the source's layout positionally
    /// (type/offset/length; names may differ), and its output must match
    /// the sink's. No data flows on mismatch.
    pub fn new(
        source: Box<dyn Source>,
        transform: Box<dyn Transform>,
        sink: Box<dyn Sink>,
    ) -> Result<Self, PipelineError> {
        check_layout(
            &source.schema(),
            &transform.input_schema(),
            Stage::Extract,
            Stage::Transform,
        )?;
        check_layout(
            &transform.output_schema(),
            &sink.schema(),
            Stage::Transform,
            Stage::Load,
        )?;

        Ok(Self {
            source,
            transform,
            sink,
            pool: BufferPool::new(),
            telemetry: Arc::new(Telemetry::new()),
            cancel: CancellationToken::new(),
            channel_capacity: 64,
        })
    }

    /// Capacity of the two inter-stage channels. Bounded channels are the
    /// backpressure mechanism; a capacity of one row is valid.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Token that cancels the whole run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    /// Run the three stages to completion. Resolves when every stage has
    /// returned; never returns a stage error as `Err`. Inspect the
    /// summary.
    pub async fn execute(self) -> ExecutionSummary {
        let started = Instant::now();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let telemetry_task = tokio::spawn(Arc::clone(&self.telemetry).run(event_rx));

        let (extract_tx, transform_rx) = mpsc::channel(self.channel_capacity);
        let (transform_tx, load_rx) = mpsc::channel(self.channel_capacity);

        let source_counters = self.source.counters();
        let transform_counters = self.transform.counters();
        let load_counters = self.sink.counters();

        // Extract: synchronous, so it gets a blocking task. The callback
        // copies the source's reused row buffer into a freshly rented one
        // and hands ownership down the channel.
        let extract_task = {
            let pool = Arc::clone(&self.pool);
            let schema = self.source.schema();
            let counters = Arc::clone(&source_counters);
            let raise_every = self.source.raise_change_every();
            let events = event_tx.clone();
            let cancel = self.cancel.clone();
            let mut source = self.source;

            tokio::task::spawn_blocking(move || {
                let _ = events.send(StageEvent::ExtractProgress(counters.snapshot()));
                let row_size = schema.row_size();
                let mut rows: u64 = 0;

                let result = {
                    let mut on_record = |record: &mut crate::Record<'_>| -> anyhow::Result<()> {
                        if cancel.is_cancelled() {
                            return Err(PipelineError::Cancelled.into());
                        }
                        let mut buf = pool.rent(row_size);
                        buf.copy_from_slice(record.bytes());
                        let envelope = RowEnvelope {
                            buf,
                            schema: Arc::clone(&schema),
                            line: record.line(),
                        };
                        extract_tx
                            .blocking_send(Message::Row(envelope))
                            .map_err(|_| PipelineError::ChannelClosed("extract->transform"))?;
                        rows += 1;
                        if raise_every > 0 && rows % raise_every == 0 {
                            let _ =
                                events.send(StageEvent::ExtractProgress(counters.snapshot()));
                        }
                        Ok(())
                    };
                    source.extract(&mut on_record)
                };

                match result {
                    Ok(()) => {
                        let lines = counters.line_number.load(Ordering::Relaxed);
                        if counters.total_lines.load(Ordering::Relaxed) < lines {
                            counters.total_lines.store(lines, Ordering::Relaxed);
                        }
                        let _ = events.send(StageEvent::ExtractFinished(counters.snapshot()));
                        let _ = extract_tx.blocking_send(Message::Eos);
                        debug!(rows, "extract finished");
                    }
                    Err(err) if is_abort(&err) || cancel.is_cancelled() => {
                        debug!("extract aborted");
                    }
                    Err(err) => {
                        let partial_row = err.downcast_ref::<PartialRow>().map(|p| p.0.clone());
                        let _ = events.send(StageEvent::Error(ErrorNotification {
                            stage: Stage::Extract,
                            cause: format!("{err:#}"),
                            current_line: counters.line_number.load(Ordering::Relaxed),
                            partial_row,
                        }));
                        cancel.cancel();
                    }
                }
            })
        };

        // Transform.
        let transform_task = {
            let ctx = StageContext {
                pool: Arc::clone(&self.pool),
                events: event_tx.clone(),
                cancel: self.cancel.child_token(),
            };
            let counters = Arc::clone(&transform_counters);
            let events = event_tx.clone();
            let cancel = self.cancel.clone();
            let mut transform = self.transform;

            tokio::spawn(async move {
                let _ = events.send(StageEvent::TransformProgress(counters.snapshot()));
                match transform.run(transform_rx, transform_tx, ctx).await {
                    Ok(()) if !cancel.is_cancelled() => {
                        let _ = events.send(StageEvent::TransformFinished(counters.snapshot()));
                    }
                    Ok(()) => debug!("transform aborted"),
                    Err(err) if is_abort(&err) || cancel.is_cancelled() => {
                        debug!("transform aborted");
                    }
                    Err(err) => {
                        let partial_row = err.downcast_ref::<PartialRow>().map(|p| p.0.clone());
                        let _ = events.send(StageEvent::Error(ErrorNotification {
                            stage: Stage::Transform,
                            cause: format!("{err:#}"),
                            current_line: counters.ingested_lines.load(Ordering::Relaxed),
                            partial_row,
                        }));
                        cancel.cancel();
                    }
                }
            })
        };

        // Load.
        let load_task = {
            let ctx = StageContext {
                pool: Arc::clone(&self.pool),
                events: event_tx.clone(),
                cancel: self.cancel.child_token(),
            };
            let counters = Arc::clone(&load_counters);
            let events = event_tx.clone();
            let cancel = self.cancel.clone();
            let mut sink = self.sink;

            tokio::spawn(async move {
                match sink.load(load_rx, ctx).await {
                    Ok(()) if !cancel.is_cancelled() => {
                        let _ = events.send(StageEvent::LoadFinished(counters.snapshot()));
                    }
                    Ok(()) => debug!("load aborted"),
                    Err(err) if is_abort(&err) || cancel.is_cancelled() => {
                        debug!("load aborted");
                    }
                    Err(err) => {
                        let partial_row = err.downcast_ref::<PartialRow>().map(|p| p.0.clone());
                        let _ = events.send(StageEvent::Error(ErrorNotification {
                            stage: Stage::Load,
                            cause: format!("{err:#}"),
                            current_line: counters.current_line.load(Ordering::Relaxed),
                            partial_row,
                        }));
                        cancel.cancel();
                    }
                }
            })
        };

        for (stage, task) in [
            (Stage::Extract, extract_task),
            (Stage::Transform, transform_task),
            (Stage::Load, load_task),
        ] {
            if task.await.is_err() {
                // A panicked stage is a failure like any other.
                let _ = event_tx.send(StageEvent::Error(ErrorNotification {
                    stage,
                    cause: format!("{stage} stage panicked"),
                    current_line: 0,
                    partial_row: None,
                }));
                self.cancel.cancel();
            }
        }

        // All stage-held event senders are gone once the tasks are joined;
        // dropping ours ends the telemetry task.
        drop(event_tx);
        let first_error = telemetry_task.await.ok().flatten();

        let loaded_lines = load_counters.current_line.load(Ordering::Relaxed);
        let status = if first_error.is_some() {
            PipelineStatus::Failed
        } else if self.cancel.is_cancelled() {
            PipelineStatus::Cancelled
        } else {
            PipelineStatus::Completed
        };
        let first_error = first_error.or_else(|| {
            (status == PipelineStatus::Cancelled).then(|| ErrorNotification {
                stage: Stage::Global,
                cause: PipelineError::Cancelled.to_string(),
                current_line: loaded_lines,
                partial_row: None,
            })
        });

        let summary = ExecutionSummary {
            status,
            first_error,
            extracted_lines: source_counters.line_number.load(Ordering::Relaxed),
            transformed_lines: transform_counters.transformed_lines.load(Ordering::Relaxed),
            loaded_lines,
            elapsed: started.elapsed(),
        };
        info!(
            status = ?summary.status,
            extracted = summary.extracted_lines,
            transformed = summary.transformed_lines,
            loaded = summary.loaded_lines,
            "pipeline run finished"
        );
        summary
    }
}

fn check_layout(
    producer_schema: &Schema,
    consumer_schema: &Schema,
    producer: Stage,
    consumer: Stage,
) -> Result<(), PipelineError> {
    if producer_schema.layout_matches(consumer_schema) {
        Ok(())
    } else {
        Err(PipelineError::SchemaMismatch {
            producer,
            consumer,
            detail: format!(
                "{} produces {}, {} expects {}",
                producer,
                layout_summary(producer_schema),
                consumer,
                layout_summary(consumer_schema)
            ),
        })
    }
}

fn layout_summary(schema: &Schema) -> String {
    let fields: Vec<String> = schema
        .fields()
        .iter()
        .map(|d| format!("{}@{}+{}", d.ftype, d.offset, d.len))
        .collect();
    format!("[{}] ({} bytes)", fields.join(", "), schema.row_size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ExtractCounters, LoadCounters, TransformCounters};
    use crate::schema::SchemaRef;
    use crate::types::{FieldType, FieldValue};
    use crate::{Record, RowRx, RowTx};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn test_schema() -> SchemaRef {
        Schema::builder()
            .field("id", FieldType::Int32)
            .string_field("name", 16)
            .build()
            .unwrap()
    }

    struct VecSource {
        schema: SchemaRef,
        rows: Vec<(i32, String)>,
        fail_at: Option<u64>,
        counters: Arc<ExtractCounters>,
    }

    impl VecSource {
        fn new(rows: Vec<(i32, String)>) -> Self {
            Self {
                schema: test_schema(),
                rows,
                fail_at: None,
                counters: Arc::default(),
            }
        }
    }

    impl Source for VecSource {
        fn name(&self) -> &str {
            "vec"
        }

        fn schema(&self) -> SchemaRef {
            Arc::clone(&self.schema)
        }

        fn counters(&self) -> Arc<ExtractCounters> {
            Arc::clone(&self.counters)
        }

        fn extract(
            &mut self,
            on_record: &mut dyn FnMut(&mut Record<'_>) -> anyhow::Result<()>,
        ) -> anyhow::Result<()> {
            let mut buf = vec![0u8; self.schema.row_size()];
            for (i, (id, name)) in self.rows.iter().enumerate() {
                let line = i as u64 + 1;
                self.counters.line_number.store(line, Ordering::Relaxed);
                if self.fail_at == Some(line) {
                    anyhow::bail!("synthetic read failure");
                }
                let mut record = Record::new(&mut buf, &self.schema).with_line(line);
                record.clear();
                record.set(0, FieldValue::Int32(*id))?;
                record.set(1, FieldValue::Str(name))?;
                on_record(&mut record)?;
            }
            Ok(())
        }
    }

    struct PassThrough {
        schema: SchemaRef,
        counters: Arc<TransformCounters>,
    }

    impl PassThrough {
        fn new(schema: SchemaRef) -> Self {
            Self {
                schema,
                counters: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Transform for PassThrough {
        fn name(&self) -> &str {
            "passthrough"
        }

        fn input_schema(&self) -> SchemaRef {
            Arc::clone(&self.schema)
        }

        fn output_schema(&self) -> SchemaRef {
            Arc::clone(&self.schema)
        }

        fn counters(&self) -> Arc<TransformCounters> {
            Arc::clone(&self.counters)
        }

        async fn run(
            &mut self,
            mut rx: RowRx,
            tx: RowTx,
            ctx: StageContext,
        ) -> anyhow::Result<()> {
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Ok(()),
                    msg = rx.recv() => match msg {
                        Some(Message::Row(envelope)) => {
                            self.counters.ingested_lines.fetch_add(1, Ordering::Relaxed);
                            self.counters.transformed_lines.fetch_add(1, Ordering::Relaxed);
                            if tx.send(Message::Row(envelope)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Message::Eos) => {
                            let _ = tx.send(Message::Eos).await;
                            return Ok(());
                        }
                        None => return Ok(()),
                    },
                }
            }
        }
    }

    struct VecSink {
        schema: SchemaRef,
        rows: Arc<Mutex<Vec<(i32, String)>>>,
        counters: Arc<LoadCounters>,
    }

    impl VecSink {
        fn new() -> (Self, Arc<Mutex<Vec<(i32, String)>>>) {
            let rows = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    schema: test_schema(),
                    rows: Arc::clone(&rows),
                    counters: Arc::default(),
                },
                rows,
            )
        }
    }

    #[async_trait]
    impl Sink for VecSink {
        fn name(&self) -> &str {
            "vec"
        }

        fn schema(&self) -> SchemaRef {
            Arc::clone(&self.schema)
        }

        fn counters(&self) -> Arc<LoadCounters> {
            Arc::clone(&self.counters)
        }

        async fn load(&mut self, mut rx: RowRx, ctx: StageContext) -> anyhow::Result<()> {
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Ok(()),
                    msg = rx.recv() => match msg {
                        Some(Message::Row(mut envelope)) => {
                            let record = envelope.record();
                            let FieldValue::Int32(id) = record.get(0)? else {
                                anyhow::bail!("unexpected tag");
                            };
                            let FieldValue::Str(name) = record.get(1)? else {
                                anyhow::bail!("unexpected tag");
                            };
                            self.rows.lock().unwrap().push((id, name.to_string()));
                            self.counters.current_line.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Message::Eos) => return Ok(()),
                        None => return Ok(()),
                    },
                }
            }
        }
    }

    fn rows(n: usize) -> Vec<(i32, String)> {
        (0..n).map(|i| (i as i32, format!("row{i}"))).collect()
    }

    #[tokio::test]
    async fn moves_every_row_in_order() {
        let source = VecSource::new(rows(100));
        let transform = PassThrough::new(test_schema());
        let (sink, collected) = VecSink::new();

        let pipeline = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink))
            .unwrap()
            .with_channel_capacity(4);
        let summary = pipeline.execute().await;

        assert!(summary.is_success());
        assert_eq!(summary.extracted_lines, 100);
        assert_eq!(summary.transformed_lines, 100);
        assert_eq!(summary.loaded_lines, 100);
        assert_eq!(*collected.lock().unwrap(), rows(100));
    }

    #[tokio::test]
    async fn schema_mismatch_fails_before_any_data_flows() {
        let source = VecSource::new(rows(1));
        let other = Schema::builder()
            .field("id", FieldType::Int64)
            .string_field("name", 16)
            .build()
            .unwrap();
        let transform = PassThrough::new(other);
        let (sink, _) = VecSink::new();

        let err = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink))
            .err()
            .expect("construction must fail");
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch {
                producer: Stage::Extract,
                consumer: Stage::Transform,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn extract_failure_cancels_and_reports_the_stage() {
        let mut source = VecSource::new(rows(5));
        source.fail_at = Some(3);
        let transform = PassThrough::new(test_schema());
        let (sink, collected) = VecSink::new();

        let pipeline =
            Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink)).unwrap();
        let summary = pipeline.execute().await;

        assert_eq!(summary.status, PipelineStatus::Failed);
        let err = summary.first_error.expect("error notification expected");
        assert_eq!(err.stage, Stage::Extract);
        assert_eq!(err.current_line, 3);
        assert!(err.cause.contains("synthetic read failure"));
        assert!(collected.lock().unwrap().len() <= 2);
    }

    #[tokio::test]
    async fn cancellation_before_first_row_yields_cancelled() {
        let source = VecSource::new(rows(1000));
        let transform = PassThrough::new(test_schema());
        let (sink, collected) = VecSink::new();

        let pipeline =
            Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink)).unwrap();
        pipeline.cancellation_token().cancel();
        let summary = pipeline.execute().await;

        assert_eq!(summary.status, PipelineStatus::Cancelled);
        let err = summary.first_error.expect("cancellation cause expected");
        assert!(err.cause.contains("cancelled"));
        assert!(collected.lock().unwrap().is_empty());
    }
}

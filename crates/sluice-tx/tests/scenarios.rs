//! End-to-end pipeline scenarios: real files and databases on disk, full
//! Source -> Transform -> Sink runs, counter and ordering assertions.

use rusqlite::Connection;
use sluice_core::config::{
    ActionSpec, ColumnSpec, DelimitedSourceSpec, RuleSpec, RuleTransformSpec, TransformSpec,
    ValueSpec,
};
use sluice_core::error::Stage;
use sluice_core::events::LoadCounters;
use sluice_core::pipeline::{Pipeline, PipelineStatus};
use sluice_core::schema::{Schema, SchemaRef};
use sluice_core::telemetry::StageStatus;
use sluice_core::types::FieldType;
use sluice_core::{Message, RowRx, Sink, Source, StageContext};
use sluice_expr::ExprCache;
use sluice_io::{Culture, DelimitedTextSink, DelimitedTextSource, SqliteSink};
use sluice_tx::{create_transform, Bypass};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn column(name: &str, ftype: FieldType, position: usize) -> ColumnSpec {
    ColumnSpec {
        name: name.to_string(),
        field_type: ftype,
        position: Some(position),
        is_header: false,
        output_name: None,
        capacity: None,
    }
}

fn people_source_spec(path: &Path) -> DelimitedSourceSpec {
    DelimitedSourceSpec {
        file_path: Some(path.to_path_buf()),
        directory: None,
        mask: None,
        delimiter: ',',
        has_header: false,
        columns: vec![
            column("id", FieldType::Int32, 0),
            column("name", FieldType::String, 1),
            column("age", FieldType::Int32, 2),
        ],
        raise_change_every: 1000,
    }
}

fn literal(value: &str) -> ValueSpec {
    ValueSpec {
        value: serde_yaml::Value::String(value.to_string()),
        is_dynamic: false,
    }
}

/// Scenario: delimited text -> rule transform -> delimited text. Minors are
/// filtered out, survivors gain a literal status column, order is
/// preserved.
#[tokio::test]
async fn delimited_rules_delimited_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let output = dir.path().join("out.csv");
    std::fs::write(&input, "1,Alice,17\n2,Bob,30\n3,Carol,22\n").unwrap();

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();

    let rules = TransformSpec::Rules(RuleTransformSpec {
        columns: vec![
            column("id", FieldType::Int32, 0),
            column("name", FieldType::String, 1),
            column("age", FieldType::Int32, 2),
            column("status", FieldType::String, 3),
        ],
        transformations: vec![RuleSpec {
            condition: r#"row["age"] >= 18"#.to_string(),
            actions: vec![ActionSpec {
                field_mappings: BTreeMap::from([("status".to_string(), literal("adult"))]),
            }],
        }],
        raise_change_every: 1000,
    });
    let cache = ExprCache::new();
    let transform = create_transform(&rules, source.schema(), &cache).unwrap();
    let transform_counters = transform.counters();

    let sink = DelimitedTextSink::new(
        output.clone(),
        ',',
        false,
        transform.output_schema(),
    )
    .unwrap();

    let pipeline = Pipeline::new(Box::new(source), transform, Box::new(sink)).unwrap();
    let summary = pipeline.execute().await;

    assert!(summary.is_success(), "{:?}", summary.first_error);
    assert_eq!(summary.extracted_lines, 3);
    assert_eq!(summary.transformed_lines, 2);
    assert_eq!(summary.loaded_lines, 2);
    assert_eq!(
        transform_counters.excluded_by_filter.load(Ordering::Relaxed),
        1
    );

    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(written, "2,Bob,30,adult\n3,Carol,22,adult\n");
}

/// Scenario: a parse failure on line 3 stops the run; the error event
/// carries the line and a row snapshot, and at most the rows before it
/// reach the sink.
#[tokio::test]
async fn extraction_error_reports_line_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let output = dir.path().join("out.csv");
    std::fs::write(
        &input,
        "1,Alice,17\n2,Bob,30\n3,Carol,not-a-number\n4,Dan,40\n5,Eve,50\n",
    )
    .unwrap();

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();
    let schema = source.schema();
    let transform = Bypass::new(Arc::clone(&schema));
    let sink = DelimitedTextSink::new(output.clone(), ',', false, schema).unwrap();

    let pipeline = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink)).unwrap();
    let telemetry = pipeline.telemetry();
    let summary = pipeline.execute().await;

    assert_eq!(summary.status, PipelineStatus::Failed);
    let error = summary.first_error.expect("error notification");
    assert_eq!(error.stage, Stage::Extract);
    assert_eq!(error.current_line, 3);
    assert!(error.partial_row.expect("row snapshot").contains("Carol"));
    assert!(summary.loaded_lines <= 2);

    let progress = telemetry.subscribe().borrow().clone();
    assert_eq!(progress.extract.status, StageStatus::Failed);
    assert_eq!(progress.global.status, StageStatus::Failed);
}

/// A sink that cancels the shared token after a fixed number of rows, then
/// stops consuming.
struct CancellingSink {
    schema: SchemaRef,
    counters: Arc<LoadCounters>,
    cancel_after: u64,
    trigger: CancellationToken,
}

#[async_trait::async_trait]
impl Sink for CancellingSink {
    fn name(&self) -> &str {
        "cancelling-sink"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn counters(&self) -> Arc<LoadCounters> {
        Arc::clone(&self.counters)
    }

    async fn load(&mut self, mut rx: RowRx, ctx: StageContext) -> anyhow::Result<()> {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Row(_) => {
                    let seen = self.counters.current_line.fetch_add(1, Ordering::Relaxed) + 1;
                    if seen >= self.cancel_after {
                        self.trigger.cancel();
                        // Hold until the pipeline token trips so the stage
                        // observably ends under cancellation.
                        ctx.cancel.cancelled().await;
                        return Ok(());
                    }
                }
                Message::Eos => return Ok(()),
            }
        }
        Ok(())
    }
}

/// Scenario: cancellation at a known checkpoint. Nothing is written past
/// the checkpoint, the sink never reports finish, and the run resolves as
/// cancelled.
#[tokio::test]
async fn cancellation_at_checkpoint_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let mut rows = String::new();
    for i in 0..500 {
        rows.push_str(&format!("{i},name{i},{}\n", i % 90));
    }
    std::fs::write(&input, rows).unwrap();

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();
    let schema = source.schema();
    let transform = Bypass::new(Arc::clone(&schema));

    let counters = Arc::new(LoadCounters::default());
    let trigger = CancellationToken::new();
    let sink = CancellingSink {
        schema,
        counters: Arc::clone(&counters),
        cancel_after: 10,
        trigger: trigger.clone(),
    };
    let pipeline = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink))
        .unwrap()
        .with_channel_capacity(4);
    let telemetry = pipeline.telemetry();

    // Bridge the sink's trigger to the pipeline's token.
    let bridge = pipeline.cancellation_token();
    tokio::spawn(async move {
        trigger.cancelled().await;
        bridge.cancel();
    });

    let summary = pipeline.execute().await;

    assert_eq!(summary.status, PipelineStatus::Cancelled);
    assert!(summary
        .first_error
        .as_ref()
        .expect("cancellation cause")
        .cause
        .contains("cancelled"));
    // The checkpoint held: the sink consumed exactly its quota.
    assert_eq!(counters.current_line.load(Ordering::Relaxed), 10);
    // No finish event fired for the sink.
    let progress = telemetry.subscribe().borrow().clone();
    assert_ne!(progress.load.status, StageStatus::Completed);
}

fn big_csv(path: &Path, rows: usize) {
    let mut text = String::new();
    for i in 1..=rows {
        text.push_str(&format!("{i},p{i},{}\n", i % 80));
    }
    std::fs::write(path, text).unwrap();
}

/// Scenario: 250 rows into a batched SQLite sink commit as two full
/// transactions plus one 50-row tail.
#[tokio::test]
async fn sqlite_sink_commits_full_and_partial_batches() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let db = dir.path().join("out.db");
    big_csv(&input, 250);

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();
    let schema = source.schema();
    let transform = Bypass::new(Arc::clone(&schema));
    let sink = SqliteSink::new(db.clone(), "people".to_string(), 100, 1, schema).unwrap();
    let batches = sink.batches_committed();

    let pipeline = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink)).unwrap();
    let summary = pipeline.execute().await;

    assert!(summary.is_success(), "{:?}", summary.first_error);
    assert_eq!(summary.loaded_lines, 250);
    assert_eq!(batches.load(Ordering::Relaxed), 3);

    let conn = Connection::open(&db).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 250);
    // Single writer preserves source order.
    let first: i64 = conn
        .query_row("SELECT id FROM people LIMIT 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(first, 1);
}

/// Scenario: a failure inside the second batch rolls the whole batch back;
/// the first batch's rows survive, nothing from the second remains.
#[tokio::test]
async fn sqlite_sink_rolls_back_the_failing_batch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let db = dir.path().join("out.db");
    big_csv(&input, 250);

    // Pre-create the table with a constraint row 150 violates; the sink's
    // CREATE TABLE IF NOT EXISTS keeps it.
    let conn = Connection::open(&db).unwrap();
    conn.execute_batch(
        "CREATE TABLE \"people\" (\"id\" INTEGER CHECK (\"id\" <> 150), \"name\" TEXT, \"age\" INTEGER);",
    )
    .unwrap();
    drop(conn);

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();
    let schema = source.schema();
    let transform = Bypass::new(Arc::clone(&schema));
    let sink = SqliteSink::new(db.clone(), "people".to_string(), 100, 1, schema).unwrap();

    let pipeline = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink)).unwrap();
    let summary = pipeline.execute().await;

    assert_eq!(summary.status, PipelineStatus::Failed);
    let error = summary.first_error.expect("error notification");
    assert_eq!(error.stage, Stage::Load);

    let conn = Connection::open(&db).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 100);
    let in_second_batch: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM people WHERE id BETWEEN 101 AND 200",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(in_second_batch, 0);
}

/// Steady state keeps the pool warm: thousands of rows reuse a bounded set
/// of buffers instead of allocating per row.
#[tokio::test]
async fn bypass_pipeline_reuses_pooled_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    let output = dir.path().join("out.csv");
    big_csv(&input, 5000);

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();
    let schema = source.schema();
    let transform = Bypass::new(Arc::clone(&schema));
    let sink = DelimitedTextSink::new(output.clone(), ',', false, schema).unwrap();

    let pipeline = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink))
        .unwrap()
        .with_channel_capacity(16);
    let pool = pipeline.pool();
    let summary = pipeline.execute().await;

    assert!(summary.is_success());
    assert_eq!(summary.loaded_lines, 5000);
    assert_eq!(pool.rents(), 5000);
    // In-flight buffers are bounded by the channels, not the row count.
    assert!(
        pool.allocations() <= 64,
        "allocated {} buffers for 5000 rows",
        pool.allocations()
    );
    assert_eq!(pool.rents(), pool.allocations() + pool.reuses());
}

/// Schema wiring is validated before any data flows.
#[test]
fn incompatible_schemas_fail_construction() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.csv");
    std::fs::write(&input, "1,A,2\n").unwrap();

    let source =
        DelimitedTextSource::from_spec(&people_source_spec(&input), Culture::INVARIANT).unwrap();
    let other_schema = Schema::builder()
        .field("id", FieldType::Int64)
        .build()
        .unwrap();
    let transform = Bypass::new(other_schema);
    let sink = {
        let schema = Schema::builder().field("id", FieldType::Int64).build().unwrap();
        DelimitedTextSink::new(dir.path().join("out.csv"), ',', false, schema).unwrap()
    };

    let result = Pipeline::new(Box::new(source), Box::new(transform), Box::new(sink));
    assert!(matches!(
        result.err(),
        Some(sluice_core::error::PipelineError::SchemaMismatch { .. })
    ));
}

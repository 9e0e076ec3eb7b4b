//! SQLite sink: batched, transactional loading with optional writer
//! fan-out.
//!
//! One batch per transaction; a failed batch rolls back whole. With
//! `write_threads > 1`, full batches are dispatched round-robin to workers
//! that each own their own connection. Ordering across workers is not
//! guaranteed, ordering within a batch is.

use anyhow::Context;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use sluice_core::error::PipelineError;
use sluice_core::events::{LoadCounters, StageEvent};
use sluice_core::record::Record;
use sluice_core::schema::{Schema, SchemaRef};
use sluice_core::types::{FieldType, FieldValue};
use sluice_core::{Message, RowRx, Sink, StageContext};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

type SqlRow = Vec<SqlValue>;

pub struct SqliteSink {
    name: String,
    path: PathBuf,
    table: String,
    batch_size: usize,
    write_threads: usize,
    schema: SchemaRef,
    counters: Arc<LoadCounters>,
    batches_committed: Arc<AtomicU64>,
}

impl SqliteSink {
    pub fn new(
        path: PathBuf,
        table: String,
        batch_size: usize,
        write_threads: usize,
        schema: SchemaRef,
    ) -> Result<Self, PipelineError> {
        if batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".into()));
        }
        if write_threads == 0 {
            return Err(PipelineError::Config(
                "write_threads must be at least 1".into(),
            ));
        }
        Ok(Self {
            name: "sqlite-sink".to_string(),
            path,
            table,
            batch_size,
            write_threads,
            schema,
            counters: Arc::default(),
            batches_committed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Transactions committed so far.
    pub fn batches_committed(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.batches_committed)
    }

    async fn load_single(&mut self, mut rx: RowRx, ctx: StageContext) -> anyhow::Result<()> {
        let insert = insert_sql(&self.table, &self.schema);
        let mut conn = open_target(self.path.clone(), self.table.clone(), Arc::clone(&self.schema))
            .await?;
        let mut batch: SqlRow2d = Vec::with_capacity(self.batch_size);
        let mut clean_finish = false;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!("sqlite sink cancelled; dropping open batch");
                    return Ok(());
                }
                msg = rx.recv() => match msg {
                    Some(Message::Row(mut envelope)) => {
                        batch.push(row_values(&envelope.record())?);
                        if batch.len() >= self.batch_size {
                            let full = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(self.batch_size),
                            );
                            conn = self.commit(conn, &insert, full, &ctx).await?;
                        }
                    }
                    Some(Message::Eos) => {
                        clean_finish = true;
                        break;
                    }
                    None => return Ok(()),
                },
            }
        }

        if clean_finish && !batch.is_empty() {
            conn = self.commit(conn, &insert, batch, &ctx).await?;
        }
        drop(conn);
        info!(
            rows = self.counters.current_line.load(Ordering::Relaxed),
            batches = self.batches_committed.load(Ordering::Relaxed),
            "sqlite load done"
        );
        Ok(())
    }

    async fn commit(
        &self,
        conn: Connection,
        insert: &str,
        batch: SqlRow2d,
        ctx: &StageContext,
    ) -> anyhow::Result<Connection> {
        let insert = insert.to_string();
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let result = write_batch(&mut conn, &insert, &batch);
            (conn, result)
        })
        .await
        .context("sqlite writer task")?;
        let written = result?;
        self.counters
            .current_line
            .fetch_add(written as u64, Ordering::Relaxed);
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        ctx.emit(StageEvent::Write(self.counters.snapshot()));
        Ok(conn)
    }

    async fn load_fanout(&mut self, mut rx: RowRx, ctx: StageContext) -> anyhow::Result<()> {
        let insert = insert_sql(&self.table, &self.schema);
        let mut senders = Vec::with_capacity(self.write_threads);
        let mut workers = Vec::with_capacity(self.write_threads);
        for worker in 0..self.write_threads {
            let (batch_tx, batch_rx) = mpsc::channel::<SqlRow2d>(1);
            senders.push(batch_tx);
            workers.push(tokio::spawn(worker_loop(
                worker,
                batch_rx,
                self.path.clone(),
                self.table.clone(),
                Arc::clone(&self.schema),
                insert.clone(),
                Arc::clone(&self.counters),
                Arc::clone(&self.batches_committed),
                ctx.clone(),
            )));
        }

        let mut batch: SqlRow2d = Vec::with_capacity(self.batch_size);
        let mut next_worker = 0usize;
        let mut clean_finish = false;

        'pump: loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break 'pump,
                msg = rx.recv() => match msg {
                    Some(Message::Row(mut envelope)) => {
                        batch.push(row_values(&envelope.record())?);
                        if batch.len() >= self.batch_size {
                            let full = std::mem::replace(
                                &mut batch,
                                Vec::with_capacity(self.batch_size),
                            );
                            if senders[next_worker % senders.len()].send(full).await.is_err() {
                                // Worker died; its join result carries why.
                                break 'pump;
                            }
                            next_worker += 1;
                        }
                    }
                    Some(Message::Eos) => {
                        clean_finish = true;
                        if !batch.is_empty() {
                            let _ = senders[next_worker % senders.len()]
                                .send(std::mem::take(&mut batch))
                                .await;
                        }
                        break 'pump;
                    }
                    None => break 'pump,
                },
            }
        }

        drop(senders);
        let mut first_failure = None;
        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    first_failure.get_or_insert(anyhow::Error::new(e));
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None if clean_finish => {
                info!(
                    rows = self.counters.current_line.load(Ordering::Relaxed),
                    workers = self.write_threads,
                    "sqlite load done"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

type SqlRow2d = Vec<SqlRow>;

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker: usize,
    mut batches: mpsc::Receiver<SqlRow2d>,
    path: PathBuf,
    table: String,
    schema: SchemaRef,
    insert: String,
    counters: Arc<LoadCounters>,
    committed: Arc<AtomicU64>,
    ctx: StageContext,
) -> anyhow::Result<()> {
    let mut conn = open_target(path, table, schema).await?;
    while let Some(batch) = batches.recv().await {
        debug!(worker, rows = batch.len(), "writing batch");
        let insert = insert.clone();
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let result = write_batch(&mut conn, &insert, &batch);
            (conn, result)
        })
        .await
        .context("sqlite writer task")?;
        conn = returned;
        let written = result?;
        counters.current_line.fetch_add(written as u64, Ordering::Relaxed);
        committed.fetch_add(1, Ordering::Relaxed);
        ctx.emit(StageEvent::Write(counters.snapshot()));
    }
    Ok(())
}

#[async_trait]
impl Sink for SqliteSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn counters(&self) -> Arc<LoadCounters> {
        Arc::clone(&self.counters)
    }

    async fn load(&mut self, rx: RowRx, ctx: StageContext) -> anyhow::Result<()> {
        if self.write_threads <= 1 {
            self.load_single(rx, ctx).await
        } else {
            self.load_fanout(rx, ctx).await
        }
    }
}

async fn open_target(
    path: PathBuf,
    table: String,
    schema: SchemaRef,
) -> anyhow::Result<Connection> {
    tokio::task::spawn_blocking(move || {
        let conn = Connection::open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(&create_table_sql(&table, &schema))
            .context("create target table")?;
        Ok(conn)
    })
    .await
    .context("sqlite open task")?
}

fn write_batch(conn: &mut Connection, insert: &str, batch: &[SqlRow]) -> anyhow::Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(insert)?;
        for row in batch {
            stmt.execute(rusqlite::params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

fn row_values(record: &Record<'_>) -> anyhow::Result<SqlRow> {
    let mut row = Vec::with_capacity(record.schema().len());
    for i in 0..record.schema().len() {
        row.push(match record.get(i)? {
            FieldValue::Null => SqlValue::Null,
            FieldValue::Int16(n) => SqlValue::Integer(n.into()),
            FieldValue::Int32(n) => SqlValue::Integer(n.into()),
            FieldValue::Int64(n) => SqlValue::Integer(n),
            FieldValue::Byte(n) => SqlValue::Integer(n.into()),
            FieldValue::Boolean(b) => SqlValue::Integer(b.into()),
            FieldValue::DateTime(t) => SqlValue::Integer(t),
            FieldValue::Float32(f) => SqlValue::Real(f.into()),
            FieldValue::Float64(f) => SqlValue::Real(f),
            FieldValue::Decimal(d) => SqlValue::Text(d.to_string()),
            FieldValue::Guid(g) => SqlValue::Text(g.to_string()),
            FieldValue::Str(s) => SqlValue::Text(s.to_string()),
        });
    }
    Ok(row)
}

fn sqlite_type(ftype: FieldType) -> &'static str {
    match ftype {
        FieldType::Int16
        | FieldType::Int32
        | FieldType::Int64
        | FieldType::Byte
        | FieldType::Boolean
        | FieldType::DateTime => "INTEGER",
        FieldType::Float32 | FieldType::Float64 => "REAL",
        FieldType::Null | FieldType::Decimal | FieldType::Guid | FieldType::String => "TEXT",
    }
}

fn create_table_sql(table: &str, schema: &Schema) -> String {
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|d| format!("\"{}\" {}", d.name, sqlite_type(d.ftype)))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" ({});",
        columns.join(", ")
    )
}

fn insert_sql(table: &str, schema: &Schema) -> String {
    let names: Vec<String> = schema
        .fields()
        .iter()
        .map(|d| format!("\"{}\"", d.name))
        .collect();
    let params: Vec<String> = (1..=schema.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO \"{table}\" ({}) VALUES ({})",
        names.join(", "),
        params.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_sql_quotes_identifiers() {
        let schema = Schema::builder()
            .field("id", FieldType::Int64)
            .string_field("name", 16)
            .field("price", FieldType::Decimal)
            .build()
            .unwrap();
        assert_eq!(
            create_table_sql("out", &schema),
            "CREATE TABLE IF NOT EXISTS \"out\" (\"id\" INTEGER, \"name\" TEXT, \"price\" TEXT);"
        );
        assert_eq!(
            insert_sql("out", &schema),
            "INSERT INTO \"out\" (\"id\", \"name\", \"price\") VALUES (?1, ?2, ?3)"
        );
    }

    #[test]
    fn batches_commit_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.db");
        let schema = Schema::builder().field("id", FieldType::Int64).build().unwrap();
        let mut conn = Connection::open(&path).unwrap();
        conn.execute_batch(&create_table_sql("t", &schema)).unwrap();
        let insert = insert_sql("t", &schema);

        let good: Vec<SqlRow> = (0..3).map(|i| vec![SqlValue::Integer(i)]).collect();
        assert_eq!(write_batch(&mut conn, &insert, &good).unwrap(), 3);

        // A failing batch must leave nothing behind.
        let bad: Vec<SqlRow> = vec![
            vec![SqlValue::Integer(10)],
            vec![SqlValue::Integer(11), SqlValue::Integer(12)],
        ];
        assert!(write_batch(&mut conn, &insert, &bad).is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }
}

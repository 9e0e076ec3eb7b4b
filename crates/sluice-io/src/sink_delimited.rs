//! Delimited text sink: one output file, buffered writes, flush on
//! end-of-stream.

use crate::convert::render_field;
use anyhow::Context;
use async_trait::async_trait;
use sluice_core::error::PipelineError;
use sluice_core::events::{LoadCounters, StageEvent};
use sluice_core::schema::SchemaRef;
use sluice_core::{Message, RowRx, Sink, StageContext, DEFAULT_RAISE_CHANGE_EVERY};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub struct DelimitedTextSink {
    name: String,
    path: PathBuf,
    delimiter: u8,
    write_header: bool,
    schema: SchemaRef,
    counters: Arc<LoadCounters>,
    raise_change_every: u64,
}

impl DelimitedTextSink {
    pub fn new(
        path: PathBuf,
        delimiter: char,
        write_header: bool,
        schema: SchemaRef,
    ) -> Result<Self, PipelineError> {
        if !delimiter.is_ascii() {
            return Err(PipelineError::Config(format!(
                "delimiter `{delimiter}` is not a single byte"
            )));
        }
        Ok(Self {
            name: "delimited-sink".to_string(),
            path,
            delimiter: delimiter as u8,
            write_header,
            schema,
            counters: Arc::default(),
            raise_change_every: DEFAULT_RAISE_CHANGE_EVERY,
        })
    }
}

#[async_trait]
impl Sink for DelimitedTextSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn counters(&self) -> Arc<LoadCounters> {
        Arc::clone(&self.counters)
    }

    async fn load(&mut self, mut rx: RowRx, ctx: StageContext) -> anyhow::Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("create {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(BufWriter::new(file));

        if self.write_header {
            writer
                .write_record(self.schema.fields().iter().map(|d| d.name.as_bytes()))
                .context("write header")?;
        }

        let mut scratch = String::new();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(Message::Row(mut envelope)) => {
                        let record = envelope.record();
                        for i in 0..record.schema().len() {
                            render_field(&record.get(i)?, &mut scratch);
                            writer.write_field(&scratch)?;
                        }
                        // Terminate the record.
                        writer.write_record(None::<&[u8]>)?;
                        let written =
                            self.counters.current_line.fetch_add(1, Ordering::Relaxed) + 1;
                        if self.raise_change_every > 0 && written % self.raise_change_every == 0 {
                            ctx.emit(StageEvent::Write(self.counters.snapshot()));
                        }
                    }
                    Some(Message::Eos) => {
                        writer.flush().context("flush output")?;
                        ctx.emit(StageEvent::Write(self.counters.snapshot()));
                        info!(
                            rows = self.counters.current_line.load(Ordering::Relaxed),
                            path = %self.path.display(),
                            "delimited load done"
                        );
                        return Ok(());
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::pool::BufferPool;
    use sluice_core::record::Record;
    use sluice_core::schema::Schema;
    use sluice_core::types::{FieldType, FieldValue};
    use sluice_core::RowEnvelope;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn writes_rows_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let schema = Schema::builder()
            .field("id", FieldType::Int32)
            .string_field("name", 16)
            .build()
            .unwrap();

        let mut sink =
            DelimitedTextSink::new(path.clone(), ',', true, Arc::clone(&schema)).unwrap();
        let pool = BufferPool::new();
        let (events, _keep) = mpsc::unbounded_channel();
        let ctx = StageContext {
            pool: Arc::clone(&pool),
            events,
            cancel: CancellationToken::new(),
        };

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(async move { sink.load(rx, ctx).await });
        for (id, name) in [(1, "Ann"), (2, "Ben")] {
            let mut buf = pool.rent_for(&schema);
            let mut record = Record::new(&mut buf, &schema);
            record.set(0, FieldValue::Int32(id)).unwrap();
            record.set(1, FieldValue::Str(name)).unwrap();
            drop(record);
            tx.send(Message::Row(RowEnvelope {
                buf,
                schema: Arc::clone(&schema),
                line: id as u64,
            }))
            .await
            .unwrap();
        }
        tx.send(Message::Eos).await.unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "id,name\n1,Ann\n2,Ben\n");
    }
}

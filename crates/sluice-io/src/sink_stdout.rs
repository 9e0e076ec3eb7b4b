//! Stdout sink, for demos and debugging.

use crate::convert::render_field;
use async_trait::async_trait;
use sluice_core::events::LoadCounters;
use sluice_core::schema::SchemaRef;
use sluice_core::{Message, RowRx, Sink, StageContext};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct StdoutSink {
    name: String,
    delimiter: char,
    schema: SchemaRef,
    counters: Arc<LoadCounters>,
}

impl StdoutSink {
    pub fn new(delimiter: char, schema: SchemaRef) -> Self {
        Self {
            name: "stdout-sink".to_string(),
            delimiter,
            schema,
            counters: Arc::default(),
        }
    }
}

#[async_trait]
impl Sink for StdoutSink {
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
        let mut line = String::new();
        let mut scratch = String::new();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(Message::Row(mut envelope)) => {
                        let record = envelope.record();
                        line.clear();
                        for i in 0..record.schema().len() {
                            if i > 0 {
                                line.push(self.delimiter);
                            }
                            render_field(&record.get(i)?, &mut scratch);
                            line.push_str(&scratch);
                        }
                        println!("{line}");
                        self.counters.current_line.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(Message::Eos) | None => return Ok(()),
                },
            }
        }
    }
}

//! # Sluice Core
//!
//! Foundational types and abstractions for the Sluice streaming ETL engine:
//! the typed record model over pooled byte buffers, the operator traits
//! (Source, Transform, Sink), the message channel glue between stages, the
//! pipeline orchestrator, and telemetry aggregation.
//!
//! ## Key components
//!
//! - **Record model**: fixed-layout rows over reusable buffers ([`record`],
//!   [`schema`], [`types`])
//! - **Buffer pool**: rent/return of zeroed row buffers ([`pool`])
//! - **Operator traits**: [`Source`], [`Transform`], [`Sink`]
//! - **Orchestrator**: [`pipeline::Pipeline`] wires the three stages over
//!   bounded channels with shared cancellation
//! - **Telemetry**: [`telemetry::Telemetry`] aggregates per-stage progress
//!
//! ## Example
//!
//! ```no_run
//! use sluice_core::pipeline::Pipeline;
//! # async fn example(source: Box<dyn sluice_core::Source>,
//! #                  transform: Box<dyn sluice_core::Transform>,
//! #                  sink: Box<dyn sluice_core::Sink>) -> anyhow::Result<()> {
//! let pipeline = Pipeline::new(source, transform, sink)?;
//! let summary = pipeline.execute().await;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod pool;
pub mod record;
pub mod schema;
pub mod telemetry;
pub mod types;

pub use error::{ErrorNotification, FieldError, PipelineError, Stage};
pub use events::{
    EventRx, EventTx, ExtractCounters, ExtractNotification, LoadCounters, LoadNotification,
    StageEvent, TransformCounters, TransformNotification,
};
pub use pool::{BufferPool, PooledBuf};
pub use record::Record;
pub use schema::{FieldDescriptor, Schema, SchemaBuilder, SchemaRef};
pub use types::{FieldType, FieldValue};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Progress events fire every this many rows unless configured otherwise.
pub const DEFAULT_RAISE_CHANGE_EVERY: u64 = 1000;

/// One record crossing a stage boundary: an owned pooled buffer, the schema
/// that interprets it, and the 1-based source line it descends from.
///
/// Stages never share a live buffer; the producer copies its reused row
/// buffer into a freshly rented one before sending, and ownership moves
/// through the channel.
#[derive(Debug)]
pub struct RowEnvelope {
    pub buf: PooledBuf,
    pub schema: SchemaRef,
    pub line: u64,
}

impl RowEnvelope {
    /// View the payload as a record.
    pub fn record(&mut self) -> Record<'_> {
        let line = self.line;
        Record::new(&mut self.buf, &self.schema).with_line(line)
    }
}

/// Messages passed between pipeline stages.
///
/// A producer that completes cleanly sends `Eos` and then drops its sender;
/// a producer that fails (or observes cancellation) drops its sender
/// without `Eos`, so the consumer can tell a clean end-of-stream from an
/// aborted one.
#[derive(Debug)]
pub enum Message {
    /// One record, buffer ownership included.
    Row(RowEnvelope),
    /// End-of-stream marker.
    Eos,
}

/// Sender side of an inter-stage channel.
pub type RowTx = mpsc::Sender<Message>;
/// Receiver side of an inter-stage channel.
pub type RowRx = mpsc::Receiver<Message>;

/// Shared services handed to a running stage: the buffer pool, the stage
/// event sender, and the cancellation token every loop must observe.
#[derive(Clone)]
pub struct StageContext {
    pub pool: Arc<BufferPool>,
    pub events: EventTx,
    pub cancel: CancellationToken,
}

impl StageContext {
    /// Push a stage event; telemetry may already be gone during teardown,
    /// which is fine.
    pub fn emit(&self, event: StageEvent) {
        let _ = self.events.send(event);
    }
}

/// A data source: produces records by invoking a callback once per input
/// row.
///
/// `extract` is synchronous and runs on a blocking task; sources are free
/// to do blocking file or database I/O. The contract: rent one row buffer,
/// reuse it for every row, overwrite in place, and invoke the callback;
/// no per-row allocation once steady state is reached. A callback error
/// means "stop now" (cancellation or a closed channel) and must be
/// propagated, not swallowed.
pub trait Source: Send {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Schema of the records this source produces.
    fn schema(&self) -> SchemaRef;

    /// Lifetime counters, shared with the pipeline for progress events.
    fn counters(&self) -> Arc<ExtractCounters>;

    /// Progress event frequency, in rows.
    fn raise_change_every(&self) -> u64 {
        DEFAULT_RAISE_CHANGE_EVERY
    }

    /// Run until the input is exhausted, invoking `on_record` once per row.
    fn extract(
        &mut self,
        on_record: &mut dyn FnMut(&mut Record<'_>) -> anyhow::Result<()>,
    ) -> anyhow::Result<()>;
}

/// A transformer: consumes an upstream record stream and produces a
/// downstream one.
#[async_trait]
pub trait Transform: Send {
    fn name(&self) -> &str;

    fn input_schema(&self) -> SchemaRef;

    fn output_schema(&self) -> SchemaRef;

    fn counters(&self) -> Arc<TransformCounters>;

    /// Progress event frequency, in rows.
    fn raise_change_every(&self) -> u64 {
        DEFAULT_RAISE_CHANGE_EVERY
    }

    /// Process messages from `rx` into `tx` until end-of-stream or
    /// cancellation. Forward `Eos` on clean completion; return early
    /// without it otherwise.
    async fn run(&mut self, rx: RowRx, tx: RowTx, ctx: StageContext) -> anyhow::Result<()>;
}

/// A sink: drains the record stream and writes it to an external target.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Schema of the records this sink accepts.
    fn schema(&self) -> SchemaRef;

    fn counters(&self) -> Arc<LoadCounters>;

    /// Drain `rx`, committing any final partial batch before returning.
    async fn load(&mut self, rx: RowRx, ctx: StageContext) -> anyhow::Result<()>;
}

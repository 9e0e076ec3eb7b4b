//! # Sluice Transforms
//!
//! Transform operators for the pipeline's middle stage:
//!
//! - [`Bypass`]: forwards every record unchanged, so a pipeline always has
//!   a transform stage even when none is configured.
//! - [`RuleTransform`]: the declarative rule engine: ordered rules of
//!   `(condition, actions)` that filter, mutate, or multiply records.
//!
//! [`create_transform`] builds either from a [`TransformSpec`].

pub mod rules;

pub use rules::RuleTransform;

use async_trait::async_trait;
use sluice_core::config::TransformSpec;
use sluice_core::error::PipelineError;
use sluice_core::events::{StageEvent, TransformCounters};
use sluice_core::schema::SchemaRef;
use sluice_core::{Message, RowRx, RowTx, StageContext, Transform, DEFAULT_RAISE_CHANGE_EVERY};
use sluice_expr::ExprCache;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Forwards every input to the output unchanged. Counters and events
/// mirror the input exactly.
pub struct Bypass {
    name: String,
    schema: SchemaRef,
    counters: Arc<TransformCounters>,
    raise_change_every: u64,
}

impl Bypass {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            name: "bypass".to_string(),
            schema,
            counters: Arc::default(),
            raise_change_every: DEFAULT_RAISE_CHANGE_EVERY,
        }
    }
}

#[async_trait]
impl Transform for Bypass {
    fn name(&self) -> &str {
        &self.name
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

    fn raise_change_every(&self) -> u64 {
        self.raise_change_every
    }

    async fn run(&mut self, mut rx: RowRx, tx: RowTx, ctx: StageContext) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    debug!("bypass cancelled");
                    return Ok(());
                }
                msg = rx.recv() => match msg {
                    Some(Message::Row(envelope)) => {
                        let ingested =
                            self.counters.ingested_lines.fetch_add(1, Ordering::Relaxed) + 1;
                        self.counters.transformed_lines.fetch_add(1, Ordering::Relaxed);
                        if tx.send(Message::Row(envelope)).await.is_err() {
                            return Ok(());
                        }
                        if self.raise_change_every > 0 && ingested % self.raise_change_every == 0 {
                            ctx.emit(StageEvent::TransformProgress(self.counters.snapshot()));
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

/// Build the configured transform over `input_schema`. Rule conditions and
/// dynamic mappings are compiled here, so a bad expression fails the
/// pipeline before any data flows.
pub fn create_transform(
    spec: &TransformSpec,
    input_schema: SchemaRef,
    cache: &ExprCache,
) -> Result<Box<dyn Transform>, PipelineError> {
    Ok(match spec {
        TransformSpec::Bypass => Box::new(Bypass::new(input_schema)),
        TransformSpec::Rules(rules) => {
            Box::new(RuleTransform::from_spec(rules, input_schema, cache)?)
        }
    })
}

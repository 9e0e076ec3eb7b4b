//! Error types for record operations and pipeline construction.

use crate::types::FieldType;
use std::fmt;
use thiserror::Error;

/// The three pipeline stages, plus the synthetic aggregate used by
/// telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    Transform,
    Load,
    Global,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
            Stage::Global => "global",
        };
        f.write_str(name)
    }
}

/// Payload delivered on a stage's error event.
#[derive(Debug, Clone)]
pub struct ErrorNotification {
    pub stage: Stage,
    pub cause: String,
    pub current_line: u64,
    /// Rendered snapshot of the row being processed when the failure
    /// occurred, when one was available.
    pub partial_row: Option<String>,
}

/// Attached by adapters to a row-level failure so the error event can carry
/// a snapshot of the offending row. Travels inside an `anyhow` context
/// chain and is recovered by downcast in the stage wrapper.
#[derive(Debug, Clone)]
pub struct PartialRow(pub String);

impl fmt::Display for PartialRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row: {}", self.0)
    }
}

/// Errors raised by record field access.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("type mismatch on field `{field}`: expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        actual: FieldType,
    },
    #[error("value for field `{field}` is {len} bytes encoded, capacity is {capacity}")]
    FieldTooLong {
        field: String,
        len: usize,
        capacity: usize,
    },
    #[error("no field named `{0}`")]
    UnknownField(String),
    #[error("field index {index} out of range for schema with {count} fields")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("field `{field}` holds invalid {ty} data: {detail}")]
    Corrupt {
        field: String,
        ty: FieldType,
        detail: String,
    },
}

/// Errors raised while building a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("duplicate field name `{0}`")]
    DuplicateField(String),
    #[error("field at index {0} has an empty name")]
    EmptyFieldName(usize),
    #[error("string field `{0}` has zero capacity")]
    ZeroCapacity(String),
}

/// Pipeline-level errors. Construction-time kinds are returned from
/// `Pipeline::new` and the component factories; `Cancelled` and
/// `ChannelClosed` are the cooperative-termination sentinels stages return
/// so the wrappers can tell an abort from a genuine failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("schema mismatch between {producer} and {consumer}: {detail}")]
    SchemaMismatch {
        producer: Stage,
        consumer: Stage,
        detail: String,
    },

    #[error("failed to compile expression `{expr}`: {message}")]
    Compile { expr: String, message: String },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// True for the sentinels that mean "stop quietly": cooperative
    /// cancellation and a peer stage having already torn the channel down.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::ChannelClosed(_)
        )
    }
}

/// True when an adapter-level error chain bottoms out in an abort sentinel.
pub fn is_abort(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::is_abort)
        .unwrap_or(false)
}

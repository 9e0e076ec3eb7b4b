//! # Sluice I/O
//!
//! Source and sink implementations for the pipeline's edges:
//!
//! - [`DelimitedTextSource`] / [`DelimitedTextSink`]: CSV/TSV files, with
//!   directory + glob-mask traversal on the source side
//! - [`SqliteSource`] / [`SqliteSink`]: paged reads and batched,
//!   transactional writes against SQLite
//! - [`StdoutSink`]: debug output
//!
//! [`create_source`] and [`create_sink`] build them from configuration.

pub mod convert;
pub mod sink_delimited;
pub mod sink_sqlite;
pub mod sink_stdout;
pub mod source_delimited;
pub mod source_sqlite;

pub use convert::Culture;
pub use sink_delimited::DelimitedTextSink;
pub use sink_sqlite::SqliteSink;
pub use sink_stdout::StdoutSink;
pub use source_delimited::DelimitedTextSource;
pub use source_sqlite::SqliteSource;

use sluice_core::config::{schema_from_columns, SinkSpec, SourceSpec};
use sluice_core::error::PipelineError;
use sluice_core::schema::SchemaRef;
use sluice_core::{Sink, Source};

/// Build the configured source.
pub fn create_source(
    spec: &SourceSpec,
    culture: Culture,
) -> Result<Box<dyn Source>, PipelineError> {
    Ok(match spec {
        SourceSpec::Delimited(delimited) => {
            Box::new(DelimitedTextSource::from_spec(delimited, culture)?)
        }
        SourceSpec::Sqlite(sqlite) => Box::new(SqliteSource::from_spec(sqlite, culture)?),
    })
}

/// Build the configured sink. Sinks declared without columns accept
/// `fallback_schema`, normally the transform's output schema.
pub fn create_sink(
    spec: &SinkSpec,
    fallback_schema: SchemaRef,
) -> Result<Box<dyn Sink>, PipelineError> {
    let resolve = |columns: &[sluice_core::config::ColumnSpec]| -> Result<SchemaRef, PipelineError> {
        if columns.is_empty() {
            Ok(SchemaRef::clone(&fallback_schema))
        } else {
            schema_from_columns(columns)
        }
    };

    Ok(match spec {
        SinkSpec::Delimited(delimited) => Box::new(DelimitedTextSink::new(
            delimited.file_path.clone(),
            delimited.delimiter,
            delimited.has_header,
            resolve(&delimited.columns)?,
        )?),
        SinkSpec::Sqlite(sqlite) => Box::new(SqliteSink::new(
            sqlite.file_path.clone(),
            sqlite.table_name.clone(),
            sqlite.batch_size,
            sqlite.write_threads,
            resolve(&sqlite.columns)?,
        )?),
        SinkSpec::Stdout(stdout) => Box::new(StdoutSink::new(
            stdout.delimiter,
            resolve(&stdout.columns)?,
        )),
    })
}

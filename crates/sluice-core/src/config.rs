//! Declarative pipeline configuration, deserialized from YAML.
//!
//! # Example
//!
//! ```yaml
//! name: "people"
//! culture: "en-US"
//! source:
//!   type: delimited
//!   file_path: people.csv
//!   has_header: true
//!   columns:
//!     - { name: id, type: int32, position: 0 }
//!     - { name: name, type: string, position: 1 }
//!     - { name: age, type: int32, position: 2 }
//! transform:
//!   type: rules
//!   columns:
//!     - { name: id, type: int32 }
//!     - { name: name, type: string }
//!     - { name: age, type: int32 }
//!     - { name: status, type: string }
//!   transformations:
//!     - condition: 'row["age"] >= 18'
//!       actions:
//!         - field_mappings:
//!             status: { value: adult }
//! sink:
//!   type: sqlite
//!   file_path: people.db
//!   table_name: adults
//!   batch_size: 100
//! ```

use crate::error::PipelineError;
use crate::schema::{Schema, SchemaRef};
use crate::types::FieldType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn default_delimiter() -> char {
    ','
}

fn default_raise_change_every() -> u64 {
    crate::DEFAULT_RAISE_CHANGE_EVERY
}

fn default_batch_size() -> usize {
    100
}

fn default_write_threads() -> usize {
    1
}

fn default_page_size() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    64
}

/// Complete pipeline specification: one source, one transform, one sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline.
    pub name: String,

    /// Capacity of the two inter-stage channels; bounds how far a fast
    /// producer can run ahead of a slow consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Locale for numeric/date parsing when reading text (`"en-US"`,
    /// `"de-DE"`, ...). Invariant when absent.
    #[serde(default)]
    pub culture: Option<String>,

    pub source: SourceSpec,

    #[serde(default)]
    pub transform: TransformSpec,

    pub sink: SinkSpec,
}

/// Per-column schema and mapping from input column position to output
/// field name/type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Input column position, for sources whose input order differs from
    /// the declared order. Defaults to the declaration index.
    #[serde(default)]
    pub position: Option<usize>,

    /// Whether this column's name comes from the input's header row.
    #[serde(default)]
    pub is_header: bool,

    /// Field name in the produced schema, when it differs from the input
    /// column name.
    #[serde(default)]
    pub output_name: Option<String>,

    /// Inline capacity override for string columns, in bytes.
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl ColumnSpec {
    /// The field name this column gets in the schema.
    pub fn field_name(&self) -> &str {
        self.output_name.as_deref().unwrap_or(&self.name)
    }
}

/// Build a schema from column specs, in declaration order. `position` maps
/// a source's input column to the field and never reorders the schema.
pub fn schema_from_columns(columns: &[ColumnSpec]) -> Result<SchemaRef, PipelineError> {
    if columns.is_empty() {
        return Err(PipelineError::Config("no columns configured".into()));
    }
    let mut builder = Schema::builder();
    for col in columns {
        builder = match (col.field_type, col.capacity) {
            (FieldType::String, Some(cap)) => builder.string_field(col.field_name(), cap),
            _ => builder.field(col.field_name(), col.field_type),
        };
    }
    Ok(builder.build()?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "delimited")]
    Delimited(DelimitedSourceSpec),
    #[serde(rename = "sqlite")]
    Sqlite(SqliteSourceSpec),
}

/// Delimited text files: a single file, or a directory traversed with a
/// glob mask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelimitedSourceSpec {
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Traversal root, combined with `mask`.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Glob filter within `directory`, e.g. `*.csv`.
    #[serde(default)]
    pub mask: Option<String>,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Whether to consume a header row per file.
    #[serde(default)]
    pub has_header: bool,

    pub columns: Vec<ColumnSpec>,

    #[serde(default = "default_raise_change_every")]
    pub raise_change_every: u64,
}

/// Paged reads from a SQLite database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSourceSpec {
    pub file_path: PathBuf,

    pub table_name: String,

    /// Page query template. `{0}` = table, `{1}` = limit, `{2}` = offset.
    #[serde(default)]
    pub query_select: Option<String>,

    /// Count query template. `{0}` = table.
    #[serde(default)]
    pub query_count: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: u64,

    pub columns: Vec<ColumnSpec>,

    #[serde(default = "default_raise_change_every")]
    pub raise_change_every: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransformSpec {
    /// Forward every record unchanged.
    #[default]
    #[serde(rename = "bypass")]
    Bypass,
    #[serde(rename = "rules")]
    Rules(RuleTransformSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTransformSpec {
    /// Output schema, when the rules add or retype fields. Empty means the
    /// output schema equals the input schema.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,

    pub transformations: Vec<RuleSpec>,

    #[serde(default = "default_raise_change_every")]
    pub raise_change_every: u64,
}

/// One rule: a condition and an ordered list of actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Boolean expression evaluated against the input record. Empty means
    /// "true".
    #[serde(default)]
    pub condition: String,

    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// One action: field-name -> value-spec mappings applied together to
/// produce one output record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub field_mappings: BTreeMap<String, ValueSpec>,
}

/// Either a literal constant or an expression over the current record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueSpec {
    pub value: serde_yaml::Value,

    /// When true, `value` is an expression evaluated per record; otherwise
    /// it is a constant coerced to the field's type once.
    #[serde(default)]
    pub is_dynamic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    #[serde(rename = "delimited")]
    Delimited(DelimitedSinkSpec),
    #[serde(rename = "sqlite")]
    Sqlite(SqliteSinkSpec),
    #[serde(rename = "stdout")]
    Stdout(StdoutSinkSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelimitedSinkSpec {
    pub file_path: PathBuf,

    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Write a header row with the field names.
    #[serde(default)]
    pub has_header: bool,

    /// Schema this sink accepts. Empty means "same as the transform
    /// output", resolved by the factory.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSinkSpec {
    pub file_path: PathBuf,

    pub table_name: String,

    /// Rows per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of writer workers. Order across workers is not guaranteed.
    #[serde(default = "default_write_threads")]
    pub write_threads: usize,

    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdoutSinkSpec {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_spec_round_trips_through_yaml() {
        let yaml = r#"
name: people
culture: en-US
source:
  type: delimited
  file_path: people.csv
  has_header: true
  columns:
    - { name: id, type: int32, position: 0 }
    - { name: full_name, type: string, position: 1, output_name: name }
    - { name: age, type: int32, position: 2 }
transform:
  type: rules
  columns:
    - { name: id, type: int32 }
    - { name: name, type: string }
    - { name: age, type: int32 }
    - { name: status, type: string }
  transformations:
    - condition: 'row["age"] >= 18'
      actions:
        - field_mappings:
            status: { value: adult }
sink:
  type: sqlite
  file_path: people.db
  table_name: adults
  batch_size: 250
  write_threads: 2
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.name, "people");
        assert_eq!(spec.channel_capacity, 64);

        let SourceSpec::Delimited(src) = &spec.source else {
            panic!("expected delimited source");
        };
        assert!(src.has_header);
        assert_eq!(src.delimiter, ',');
        assert_eq!(src.raise_change_every, 1000);
        assert_eq!(src.columns[1].field_name(), "name");

        let TransformSpec::Rules(rules) = &spec.transform else {
            panic!("expected rules transform");
        };
        assert_eq!(rules.transformations.len(), 1);
        assert!(!rules.transformations[0].actions[0].field_mappings["status"].is_dynamic);

        let SinkSpec::Sqlite(sink) = &spec.sink else {
            panic!("expected sqlite sink");
        };
        assert_eq!(sink.batch_size, 250);
        assert_eq!(sink.write_threads, 2);
    }

    #[test]
    fn transform_defaults_to_bypass() {
        let yaml = r#"
name: copy
source:
  type: delimited
  file_path: in.csv
  columns: [{ name: a, type: string }]
sink:
  type: delimited
  file_path: out.csv
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(spec.transform, TransformSpec::Bypass));
    }

    #[test]
    fn schema_keeps_declaration_order_regardless_of_positions() {
        let cols = vec![
            ColumnSpec {
                name: "b".into(),
                field_type: FieldType::Int32,
                position: Some(1),
                is_header: false,
                output_name: None,
                capacity: None,
            },
            ColumnSpec {
                name: "a".into(),
                field_type: FieldType::Int64,
                position: Some(0),
                is_header: false,
                output_name: None,
                capacity: Some(9),
            },
        ];
        let schema = schema_from_columns(&cols).unwrap();
        assert_eq!(schema.fields()[0].name, "b");
        assert_eq!(schema.fields()[1].name, "a");
        // Capacity overrides apply to string fields only.
        assert_eq!(schema.fields()[1].len, 8);
    }
}

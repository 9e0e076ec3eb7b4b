//! Delimited text source: CSV/TSV files, one reused row buffer, no per-row
//! allocation at steady state.

use crate::convert::{write_field, Culture};
use anyhow::{bail, Context};
use csv::ByteRecord;
use glob::glob;
use sluice_core::config::{schema_from_columns, DelimitedSourceSpec};
use sluice_core::error::{PartialRow, PipelineError};
use sluice_core::events::ExtractCounters;
use sluice_core::record::Record;
use sluice_core::schema::SchemaRef;
use sluice_core::Source;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Where a field's input cell comes from: a fixed column position, or a
/// column located by name in each file's header row.
enum ColumnBinding {
    Position(usize),
    Header(String),
}

/// Reads one file, or a directory filtered by a glob mask, into records.
pub struct DelimitedTextSource {
    name: String,
    schema: SchemaRef,
    paths: Vec<PathBuf>,
    delimiter: u8,
    has_header: bool,
    /// One entry per schema field, in schema order.
    bindings: Vec<(ColumnBinding, usize)>,
    culture: Culture,
    raise_change_every: u64,
    counters: Arc<ExtractCounters>,
}

impl DelimitedTextSource {
    pub fn from_spec(spec: &DelimitedSourceSpec, culture: Culture) -> Result<Self, PipelineError> {
        let schema = schema_from_columns(&spec.columns)?;

        let mut bindings = Vec::with_capacity(spec.columns.len());
        for (declared, column) in spec.columns.iter().enumerate() {
            let index = schema
                .index_of(column.field_name())
                .expect("column present in its own schema");
            let binding = if column.is_header {
                if !spec.has_header {
                    return Err(PipelineError::Config(format!(
                        "column `{}` is bound to a header name, but the source has no header row",
                        column.name
                    )));
                }
                ColumnBinding::Header(column.name.clone())
            } else {
                ColumnBinding::Position(column.position.unwrap_or(declared))
            };
            bindings.push((binding, index));
        }

        let paths = resolve_paths(spec)?;
        if !spec.delimiter.is_ascii() {
            return Err(PipelineError::Config(format!(
                "delimiter `{}` is not a single byte",
                spec.delimiter
            )));
        }

        Ok(Self {
            name: "delimited-source".to_string(),
            schema,
            paths,
            delimiter: spec.delimiter as u8,
            has_header: spec.has_header,
            bindings,
            culture,
            raise_change_every: spec.raise_change_every,
            counters: Arc::default(),
        })
    }
}

fn resolve_paths(spec: &DelimitedSourceSpec) -> Result<Vec<PathBuf>, PipelineError> {
    if let Some(path) = &spec.file_path {
        return Ok(vec![path.clone()]);
    }
    let (Some(directory), Some(mask)) = (&spec.directory, &spec.mask) else {
        return Err(PipelineError::Config(
            "delimited source needs file_path, or directory and mask".into(),
        ));
    };
    let pattern = directory.join(mask);
    let pattern = pattern
        .to_str()
        .ok_or_else(|| PipelineError::Config("directory/mask is not valid unicode".into()))?;
    let mut paths: Vec<PathBuf> = glob(pattern)
        .map_err(|e| PipelineError::Config(format!("bad mask `{mask}`: {e}")))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    if paths.is_empty() {
        return Err(PipelineError::Config(format!(
            "no files matched {pattern}"
        )));
    }
    Ok(paths)
}

impl Source for DelimitedTextSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn counters(&self) -> Arc<ExtractCounters> {
        Arc::clone(&self.counters)
    }

    fn raise_change_every(&self) -> u64 {
        self.raise_change_every
    }

    fn extract(
        &mut self,
        on_record: &mut dyn FnMut(&mut Record<'_>) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let source_size: u64 = self
            .paths
            .iter()
            .map(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
            .sum();
        self.counters.source_size.store(source_size, Ordering::Relaxed);

        // One row buffer and one raw record, reused for every row.
        let mut buf = vec![0u8; self.schema.row_size()];
        let mut raw = ByteRecord::new();
        let mut scratch = String::new();
        let mut line: u64 = 0;
        let mut bytes_base: u64 = 0;

        for path in &self.paths {
            debug!(path = %path.display(), "reading delimited file");
            let file =
                File::open(path).with_context(|| format!("open {}", path.display()))?;
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(self.delimiter)
                .has_headers(self.has_header)
                .flexible(true)
                .from_reader(BufReader::new(file));

            // Header-bound columns resolve to a position per file;
            // matching is case-insensitive at this boundary.
            let mut positions = Vec::with_capacity(self.bindings.len());
            for (binding, index) in &self.bindings {
                let position = match binding {
                    ColumnBinding::Position(p) => *p,
                    ColumnBinding::Header(name) => {
                        let headers = reader
                            .byte_headers()
                            .with_context(|| format!("{}: header row", path.display()))?;
                        headers
                            .iter()
                            .position(|cell| {
                                std::str::from_utf8(cell)
                                    .map(|h| h.trim().eq_ignore_ascii_case(name))
                                    .unwrap_or(false)
                            })
                            .ok_or_else(|| {
                                anyhow::anyhow!(
                                    "{}: no header column named `{name}`",
                                    path.display()
                                )
                            })?
                    }
                };
                positions.push((position, *index));
            }

            loop {
                let more = reader
                    .read_byte_record(&mut raw)
                    .with_context(|| format!("{} line {}", path.display(), line + 1))?;
                if !more {
                    break;
                }
                line += 1;
                self.counters.line_number.store(line, Ordering::Relaxed);
                self.counters
                    .bytes_read
                    .store(bytes_base + reader.position().byte(), Ordering::Relaxed);

                let mut record = Record::new(&mut buf, &self.schema).with_line(line);
                record.clear();
                for &(position, index) in &positions {
                    let cell = match raw.get(position) {
                        Some(cell) => cell,
                        None => bail!(
                            "{} line {line}: column {position} missing",
                            path.display()
                        ),
                    };
                    let text = std::str::from_utf8(cell)
                        .with_context(|| format!("{} line {line}: invalid utf-8", path.display()))?;
                    write_field(&mut record, index, text.trim(), &self.culture, &mut scratch)
                        .map_err(|e| e.context(PartialRow(snapshot(&raw, self.delimiter))))
                        .with_context(|| format!("{} line {line}", path.display()))?;
                }
                on_record(&mut record)?;
            }

            bytes_base += std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            self.counters.bytes_read.store(bytes_base, Ordering::Relaxed);
        }

        info!(lines = line, files = self.paths.len(), "delimited extract done");
        Ok(())
    }
}

/// Rebuild the raw row for an error snapshot. Only runs on the failure
/// path.
fn snapshot(raw: &ByteRecord, delimiter: u8) -> String {
    let cells: Vec<String> = raw
        .iter()
        .map(|cell| String::from_utf8_lossy(cell).into_owned())
        .collect();
    cells.join(&(delimiter as char).to_string())
}

//! The rule-based transform.
//!
//! Rules run in declaration order against every input record. A rule whose
//! condition holds applies each of its actions to the working set built by
//! the rules before it (or to the input record when the set is empty), and
//! the results replace the set, so K actions in one matching rule multiply
//! the set by K, and successive rules chain. Conditions always see the
//! original input record; an action's expressions always see the record the
//! action is applied to, never the partially-written target.
//!
//! Rows no rule matches are dropped.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sluice_core::config::{schema_from_columns, RuleTransformSpec, ValueSpec};
use sluice_core::error::{PartialRow, PipelineError};
use sluice_core::events::{StageEvent, TransformCounters};
use sluice_core::pool::PooledBuf;
use sluice_core::record::Record;
use sluice_core::schema::SchemaRef;
use sluice_core::types::{datetime_to_ticks, FieldType, FieldValue};
use sluice_core::{Message, RowEnvelope, RowRx, RowTx, StageContext, Transform};
use sluice_expr::{CompiledExpr, ExprCache, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A rule's value-spec, resolved at construction: either a constant already
/// coerced to the target field's type, or a compiled expression coerced per
/// record.
enum MappingValue {
    Literal(LiteralValue),
    Dynamic(Arc<CompiledExpr>),
}

/// One `field -> value` entry of an action, bound to the output schema.
struct Mapping {
    field_index: usize,
    field_name: String,
    ftype: FieldType,
    value: MappingValue,
}

struct Action {
    mappings: Vec<Mapping>,
}

struct Rule {
    /// `None` matches everything (empty or `"true"` conditions).
    condition: Option<Arc<CompiledExpr>>,
    actions: Vec<Action>,
}

/// Filters, mutates, and multiplies records according to a declarative
/// rule set.
pub struct RuleTransform {
    name: String,
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    rules: Vec<Rule>,
    /// Same-name, same-type fields copied from input to output before an
    /// action's mappings run.
    copy_map: Vec<(usize, usize)>,
    counters: Arc<TransformCounters>,
    raise_change_every: u64,
}

impl RuleTransform {
    pub fn from_spec(
        spec: &RuleTransformSpec,
        input_schema: SchemaRef,
        cache: &ExprCache,
    ) -> Result<Self, PipelineError> {
        let output_schema = if spec.columns.is_empty() {
            Arc::clone(&input_schema)
        } else {
            schema_from_columns(&spec.columns)?
        };

        let mut rules = Vec::with_capacity(spec.transformations.len());
        for rule_spec in &spec.transformations {
            let condition = compile_condition(&rule_spec.condition, cache)?;
            let mut actions = Vec::with_capacity(rule_spec.actions.len());
            for action_spec in &rule_spec.actions {
                let mut mappings = Vec::with_capacity(action_spec.field_mappings.len());
                for (field_name, value_spec) in &action_spec.field_mappings {
                    let descriptor = output_schema.field(field_name).ok_or_else(|| {
                        PipelineError::Config(format!(
                            "rule action maps unknown output field `{field_name}`"
                        ))
                    })?;
                    mappings.push(Mapping {
                        field_index: descriptor.index,
                        field_name: field_name.clone(),
                        ftype: descriptor.ftype,
                        value: compile_value(value_spec, descriptor.ftype, field_name, cache)?,
                    });
                }
                actions.push(Action { mappings });
            }
            rules.push(Rule { condition, actions });
        }

        let copy_map = input_schema
            .fields()
            .iter()
            .filter_map(|input_field| {
                output_schema
                    .field(&input_field.name)
                    .filter(|out| out.ftype == input_field.ftype)
                    .map(|out| (out.index, input_field.index))
            })
            .collect();

        Ok(Self {
            name: "rules".to_string(),
            input_schema,
            output_schema,
            rules,
            copy_map,
            counters: Arc::default(),
            raise_change_every: spec.raise_change_every,
        })
    }

    /// Run the rule set against one input, producing the output buffers in
    /// order.
    fn apply(
        &self,
        input: &mut RowEnvelope,
        ctx: &StageContext,
    ) -> anyhow::Result<Vec<PooledBuf>> {
        let line = input.line;
        let record = input.record();
        let mut working: Vec<PooledBuf> = Vec::new();
        let mut matched_any = false;

        for rule in &self.rules {
            let matches = match &rule.condition {
                None => true,
                Some(expr) => expr
                    .eval_bool(&record, line)
                    .with_context(|| PartialRow(record.render(',')))?,
            };
            if !matches {
                self.counters
                    .excluded_by_filter
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
            matched_any = true;
            // A matching rule with no actions is a pure filter; it keeps
            // the working set as it stands.
            if rule.actions.is_empty() {
                continue;
            }

            let mut next = Vec::with_capacity(rule.actions.len() * working.len().max(1));
            for action in &rule.actions {
                if working.is_empty() {
                    next.push(self.produce_from_input(&record, action, ctx, line)?);
                } else {
                    for member in &mut working {
                        next.push(self.produce_from_member(member, action, ctx, line)?);
                    }
                }
            }
            working = next;
        }

        if working.is_empty() && matched_any {
            debug!(line, "row consumed by filter-only rules");
        }
        Ok(working)
    }

    /// Output = input's same-named fields, then the action's mappings, all
    /// evaluated against the input record.
    fn produce_from_input(
        &self,
        source: &Record<'_>,
        action: &Action,
        ctx: &StageContext,
        line: u64,
    ) -> anyhow::Result<PooledBuf> {
        let mut buf = ctx.pool.rent_for(&self.output_schema);
        let mut target = Record::new(&mut buf, &self.output_schema).with_line(line);
        for &(out_index, in_index) in &self.copy_map {
            let value = source
                .get(in_index)
                .with_context(|| PartialRow(source.render(',')))?;
            target
                .set(out_index, value)
                .with_context(|| PartialRow(source.render(',')))?;
        }
        self.apply_action(source, &mut target, action, line)?;
        drop(target);
        Ok(buf)
    }

    /// Output = a working-set member's bytes, then the action's mappings,
    /// evaluated against that member.
    fn produce_from_member(
        &self,
        member: &mut PooledBuf,
        action: &Action,
        ctx: &StageContext,
        line: u64,
    ) -> anyhow::Result<PooledBuf> {
        let mut buf = ctx.pool.rent_for(&self.output_schema);
        buf.copy_from_slice(member);
        let source = Record::new(member, &self.output_schema).with_line(line);
        let mut target = Record::new(&mut buf, &self.output_schema).with_line(line);
        self.apply_action(&source, &mut target, action, line)?;
        drop(target);
        Ok(buf)
    }

    fn apply_action(
        &self,
        source: &Record<'_>,
        target: &mut Record<'_>,
        action: &Action,
        line: u64,
    ) -> anyhow::Result<()> {
        let mut scratch = String::new();
        for mapping in &action.mappings {
            match &mapping.value {
                MappingValue::Literal(literal) => {
                    target
                        .set(mapping.field_index, literal.as_field_value())
                        .with_context(|| PartialRow(source.render(',')))?;
                }
                MappingValue::Dynamic(expr) => {
                    let value = expr
                        .eval(source, line)
                        .with_context(|| PartialRow(source.render(',')))?;
                    let coerced = coerce(&value, mapping.ftype, &mut scratch).map_err(|msg| {
                        anyhow::anyhow!(
                            "coercion failed for field `{}` on line {line}: {msg}",
                            mapping.field_name
                        )
                    })?;
                    target
                        .set(mapping.field_index, coerced)
                        .with_context(|| PartialRow(source.render(',')))?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transform for RuleTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> SchemaRef {
        Arc::clone(&self.input_schema)
    }

    fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
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
                    debug!("rule transform cancelled");
                    return Ok(());
                }
                msg = rx.recv() => match msg {
                    Some(Message::Row(mut envelope)) => {
                        let line = envelope.line;
                        let ingested =
                            self.counters.ingested_lines.fetch_add(1, Ordering::Relaxed) + 1;
                        let outputs = self.apply(&mut envelope, &ctx)?;
                        drop(envelope);

                        self.counters
                            .transformed_lines
                            .fetch_add(outputs.len() as u64, Ordering::Relaxed);

                        for buf in outputs {
                            let out = RowEnvelope {
                                buf,
                                schema: Arc::clone(&self.output_schema),
                                line,
                            };
                            if tx.send(Message::Row(out)).await.is_err() {
                                return Ok(());
                            }
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

fn compile_condition(
    condition: &str,
    cache: &ExprCache,
) -> Result<Option<Arc<CompiledExpr>>, PipelineError> {
    let trimmed = condition.trim();
    if trimmed.is_empty() || trimmed == "true" {
        return Ok(None);
    }
    cache
        .get_or_compile(trimmed)
        .map(Some)
        .map_err(|e| PipelineError::Compile {
            expr: trimmed.to_string(),
            message: e.to_string(),
        })
}

fn compile_value(
    spec: &ValueSpec,
    ftype: FieldType,
    field_name: &str,
    cache: &ExprCache,
) -> Result<MappingValue, PipelineError> {
    if spec.is_dynamic {
        let serde_yaml::Value::String(src) = &spec.value else {
            return Err(PipelineError::Config(format!(
                "dynamic value for field `{field_name}` must be an expression string"
            )));
        };
        let compiled = cache
            .get_or_compile(src)
            .map_err(|e| PipelineError::Compile {
                expr: src.clone(),
                message: e.to_string(),
            })?;
        Ok(MappingValue::Dynamic(compiled))
    } else {
        let literal = LiteralValue::from_yaml(&spec.value, ftype).map_err(|msg| {
            PipelineError::Config(format!(
                "literal for field `{field_name}` ({ftype}): {msg}"
            ))
        })?;
        Ok(MappingValue::Literal(literal))
    }
}

/// A constant from configuration, stored in the target field's shape.
enum LiteralValue {
    Null,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Byte(u8),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    DateTime(i64),
    Decimal(Decimal),
    Guid(Uuid),
    Str(String),
}

impl LiteralValue {
    fn as_field_value(&self) -> FieldValue<'_> {
        match self {
            LiteralValue::Null => FieldValue::Null,
            LiteralValue::Int16(v) => FieldValue::Int16(*v),
            LiteralValue::Int32(v) => FieldValue::Int32(*v),
            LiteralValue::Int64(v) => FieldValue::Int64(*v),
            LiteralValue::Byte(v) => FieldValue::Byte(*v),
            LiteralValue::Float32(v) => FieldValue::Float32(*v),
            LiteralValue::Float64(v) => FieldValue::Float64(*v),
            LiteralValue::Boolean(v) => FieldValue::Boolean(*v),
            LiteralValue::DateTime(v) => FieldValue::DateTime(*v),
            LiteralValue::Decimal(v) => FieldValue::Decimal(*v),
            LiteralValue::Guid(v) => FieldValue::Guid(*v),
            LiteralValue::Str(v) => FieldValue::Str(v),
        }
    }

    /// Coerce a YAML scalar to the target field type, once, at
    /// construction.
    fn from_yaml(value: &serde_yaml::Value, ftype: FieldType) -> Result<Self, String> {
        use serde_yaml::Value as Y;
        if value.is_null() {
            return Ok(LiteralValue::Null);
        }
        match ftype {
            FieldType::Null => Ok(LiteralValue::Null),
            FieldType::String => match value {
                Y::String(s) => Ok(LiteralValue::Str(s.clone())),
                Y::Number(n) => Ok(LiteralValue::Str(n.to_string())),
                Y::Bool(b) => Ok(LiteralValue::Str(b.to_string())),
                _ => Err("expected a scalar".into()),
            },
            FieldType::Boolean => match value {
                Y::Bool(b) => Ok(LiteralValue::Boolean(*b)),
                Y::String(s) => s
                    .parse()
                    .map(LiteralValue::Boolean)
                    .map_err(|_| format!("`{s}` is not a boolean")),
                _ => Err("expected a boolean".into()),
            },
            FieldType::Int16 | FieldType::Int32 | FieldType::Int64 | FieldType::Byte => {
                let n = yaml_i64(value)?;
                match ftype {
                    FieldType::Int16 => i16::try_from(n)
                        .map(LiteralValue::Int16)
                        .map_err(|_| format!("{n} does not fit int16")),
                    FieldType::Int32 => i32::try_from(n)
                        .map(LiteralValue::Int32)
                        .map_err(|_| format!("{n} does not fit int32")),
                    FieldType::Byte => u8::try_from(n)
                        .map(LiteralValue::Byte)
                        .map_err(|_| format!("{n} does not fit byte")),
                    _ => Ok(LiteralValue::Int64(n)),
                }
            }
            FieldType::Float32 => Ok(LiteralValue::Float32(yaml_f64(value)? as f32)),
            FieldType::Float64 => Ok(LiteralValue::Float64(yaml_f64(value)?)),
            FieldType::Decimal => match value {
                Y::String(s) => s
                    .parse()
                    .map(LiteralValue::Decimal)
                    .map_err(|_| format!("`{s}` is not a decimal")),
                Y::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(LiteralValue::Decimal(Decimal::from(i)))
                    } else {
                        n.as_f64()
                            .and_then(Decimal::from_f64)
                            .map(LiteralValue::Decimal)
                            .ok_or_else(|| format!("{n} is not a decimal"))
                    }
                }
                _ => Err("expected a number or string".into()),
            },
            FieldType::DateTime => match value {
                Y::String(s) => parse_datetime(s)
                    .map(LiteralValue::DateTime)
                    .ok_or_else(|| format!("`{s}` is not a datetime")),
                _ => Err("expected a datetime string".into()),
            },
            FieldType::Guid => match value {
                Y::String(s) => s
                    .parse()
                    .map(LiteralValue::Guid)
                    .map_err(|_| format!("`{s}` is not a guid")),
                _ => Err("expected a guid string".into()),
            },
        }
    }
}

fn yaml_i64(value: &serde_yaml::Value) -> Result<i64, String> {
    match value {
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("{n} is not an integer")),
        serde_yaml::Value::String(s) => {
            s.parse().map_err(|_| format!("`{s}` is not an integer"))
        }
        _ => Err("expected an integer".into()),
    }
}

fn yaml_f64(value: &serde_yaml::Value) -> Result<f64, String> {
    match value {
        serde_yaml::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{n} is not a float")),
        serde_yaml::Value::String(s) => s.parse().map_err(|_| format!("`{s}` is not a float")),
        _ => Err("expected a float".into()),
    }
}

/// Invariant-format datetime parsing for literals and string coercions.
fn parse_datetime(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(datetime_to_ticks(&dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(datetime_to_ticks(&Utc.from_utc_datetime(&naive)));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(datetime_to_ticks(&Utc.from_utc_datetime(&naive)));
    }
    None
}

/// Coerce an expression result to the declared output-field type.
/// `scratch` backs string renderings so the returned value can stay
/// borrowed.
fn coerce<'v>(
    value: &'v Value,
    ftype: FieldType,
    scratch: &'v mut String,
) -> Result<FieldValue<'v>, String> {
    use std::fmt::Write;

    if value.is_null() {
        return Ok(FieldValue::Null);
    }
    let mismatch = |value: &Value| format!("cannot convert {} to {ftype}", value.kind());

    Ok(match ftype {
        FieldType::Null => FieldValue::Null,
        FieldType::String => match value {
            Value::Str(s) => FieldValue::Str(s),
            other => {
                scratch.clear();
                let _ = write!(scratch, "{other}");
                FieldValue::Str(&*scratch)
            }
        },
        FieldType::Boolean => match value {
            Value::Bool(b) => FieldValue::Boolean(*b),
            Value::Str(s) => FieldValue::Boolean(s.parse().map_err(|_| mismatch(value))?),
            _ => return Err(mismatch(value)),
        },
        FieldType::Int16 => FieldValue::Int16(
            i16::try_from(coerce_i64(value)?).map_err(|_| "value does not fit int16".to_string())?,
        ),
        FieldType::Int32 => FieldValue::Int32(
            i32::try_from(coerce_i64(value)?).map_err(|_| "value does not fit int32".to_string())?,
        ),
        FieldType::Int64 => FieldValue::Int64(coerce_i64(value)?),
        FieldType::Byte => FieldValue::Byte(
            u8::try_from(coerce_i64(value)?).map_err(|_| "value does not fit byte".to_string())?,
        ),
        FieldType::Float32 => FieldValue::Float32(coerce_f64(value)? as f32),
        FieldType::Float64 => FieldValue::Float64(coerce_f64(value)?),
        FieldType::Decimal => match value {
            Value::Decimal(d) => FieldValue::Decimal(*d),
            Value::Int(n) => FieldValue::Decimal(Decimal::from(*n)),
            Value::Float(f) => {
                FieldValue::Decimal(Decimal::from_f64(*f).ok_or_else(|| mismatch(value))?)
            }
            Value::Str(s) => FieldValue::Decimal(s.parse().map_err(|_| mismatch(value))?),
            _ => return Err(mismatch(value)),
        },
        FieldType::DateTime => match value {
            Value::DateTime(t) => FieldValue::DateTime(*t),
            Value::Str(s) => {
                FieldValue::DateTime(parse_datetime(s).ok_or_else(|| mismatch(value))?)
            }
            _ => return Err(mismatch(value)),
        },
        FieldType::Guid => match value {
            Value::Guid(g) => FieldValue::Guid(*g),
            Value::Str(s) => FieldValue::Guid(s.parse().map_err(|_| mismatch(value))?),
            _ => return Err(mismatch(value)),
        },
    })
}

fn coerce_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Float(f) => {
            let rounded = f.round();
            if rounded.is_finite() && (i64::MIN as f64..=i64::MAX as f64).contains(&rounded) {
                Ok(rounded as i64)
            } else {
                Err(format!("{f} does not fit an integer"))
            }
        }
        Value::Decimal(d) => d
            .round()
            .to_i64()
            .ok_or_else(|| format!("{d} does not fit an integer")),
        Value::Str(s) => s.trim().parse().map_err(|_| format!("`{s}` is not an integer")),
        other => Err(format!("cannot convert {} to an integer", other.kind())),
    }
}

fn coerce_f64(value: &Value) -> Result<f64, String> {
    match value {
        Value::Int(n) => Ok(*n as f64),
        Value::Float(f) => Ok(*f),
        Value::Decimal(d) => d.to_f64().ok_or_else(|| format!("{d} overflows a float")),
        Value::Str(s) => s.trim().parse().map_err(|_| format!("`{s}` is not a float")),
        other => Err(format!("cannot convert {} to a float", other.kind())),
    }
}

//! Schemas: ordered, immutable field layouts over a record buffer.

use crate::error::SchemaError;
use crate::types::{FieldType, DEFAULT_STRING_CAPACITY};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared handle to an immutable schema.
pub type SchemaRef = Arc<Schema>;

/// One field's layout within a record buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ftype: FieldType,
    /// Byte offset into the record buffer.
    pub offset: usize,
    /// Serialized length in bytes. For `String` fields this is the inline
    /// capacity.
    pub len: usize,
    /// Position within the schema.
    pub index: usize,
}

/// An ordered sequence of field descriptors with dense, non-overlapping
/// offsets. Immutable once built; share it as a [`SchemaRef`].
#[derive(Debug, Default, Clone)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
    by_name: HashMap<String, usize>,
    row_size: usize,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total buffer size required for one record: the last field's offset
    /// plus its length.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn descriptor(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    /// Case-sensitive lookup by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index_of(name).map(|i| &self.fields[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Positional layout compatibility: same field count and, per position,
    /// the same type, offset, and length. Names are allowed to differ, so a
    /// producer and consumer agree on bytes even when they name columns
    /// differently.
    pub fn layout_matches(&self, other: &Schema) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(a, b)| a.ftype == b.ftype && a.offset == b.offset && a.len == b.len)
    }
}

/// Assigns offsets densely in declaration order.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<(String, FieldType, usize)>,
}

impl SchemaBuilder {
    /// Append a field with its type's fixed width (strings get the default
    /// inline capacity).
    pub fn field(self, name: impl Into<String>, ftype: FieldType) -> Self {
        let len = ftype.fixed_len().unwrap_or(DEFAULT_STRING_CAPACITY);
        self.field_with_len(name, ftype, len)
    }

    /// Append a string field with an explicit inline capacity in bytes.
    pub fn string_field(self, name: impl Into<String>, capacity: usize) -> Self {
        self.field_with_len(name, FieldType::String, capacity)
    }

    fn field_with_len(mut self, name: impl Into<String>, ftype: FieldType, len: usize) -> Self {
        self.fields.push((name.into(), ftype, len));
        self
    }

    pub fn build(self) -> Result<SchemaRef, SchemaError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut by_name = HashMap::with_capacity(self.fields.len());
        let mut offset = 0usize;

        for (index, (name, ftype, len)) in self.fields.into_iter().enumerate() {
            if name.is_empty() {
                return Err(SchemaError::EmptyFieldName(index));
            }
            if ftype == FieldType::String && len == 0 {
                return Err(SchemaError::ZeroCapacity(name));
            }
            if by_name.insert(name.clone(), index).is_some() {
                return Err(SchemaError::DuplicateField(name));
            }
            fields.push(FieldDescriptor {
                name,
                ftype,
                offset,
                len,
                index,
            });
            offset += len;
        }

        Ok(Arc::new(Schema {
            fields,
            by_name,
            row_size: offset,
        }))
    }
}

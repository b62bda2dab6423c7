//! Entity layout: which field numbers exist and what type each one has.
//!
//! The schema of an entity is persisted to its meta file so that offline tools
//! (defragmentation, statistics, the CLI) can read the primary-key and data files without
//! the caller's typed mapping.

use std::{collections::BTreeMap, fmt, path::Path};

use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    file_system::{read_file, replace_file, FileSystem},
    value::{FieldType, Value},
};

/// Field values of one record, keyed by field number. Absent fields have no entry.
pub type FieldValues = BTreeMap<u8, Value>;

/// An entity: its primary key and the remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Value,
    pub fields: FieldValues,
}

impl Record {
    pub fn new(key: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            fields: FieldValues::new(),
        }
    }

    pub fn with(mut self, number: u8, value: impl Into<Value>) -> Self {
        self.fields.insert(number, value.into());
        self
    }

    pub fn get(&self, number: u8) -> Option<&Value> {
        self.fields.get(&number)
    }
}

const FIELD_NUMBER_COUNT: usize = u8::MAX as usize + 1;

/// A set of field numbers.
#[derive(Clone, PartialEq, Eq)]
pub struct FieldSet {
    bits: BitVec,
}

impl FieldSet {
    pub fn new() -> Self {
        Self {
            bits: BitVec::from_elem(FIELD_NUMBER_COUNT, false),
        }
    }

    pub fn insert(&mut self, number: u8) {
        self.bits.set(number as usize, true);
    }

    pub fn contains(&self, number: u8) -> bool {
        self.bits.get(number as usize).unwrap_or(false)
    }

    pub fn intersects(&self, other: &FieldSet) -> bool {
        self.iter().any(|number| other.contains(number))
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, set)| *set)
            .map(|(number, _)| number as u8)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.none()
    }
}

impl Default for FieldSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<u8> for FieldSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = FieldSet::new();
        iter.into_iter().for_each(|number| set.insert(number));
        set
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub number: u8,
    pub name: String,
    pub field_type: FieldType,
    /// Payload is stored lz4-compressed. Only valid for compressible types.
    #[serde(default)]
    pub compressed: bool,
}

impl FieldDefinition {
    pub fn new(number: u8, name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            number,
            name: name.into(),
            field_type,
            compressed: false,
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }
}

/// Validated description of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    name: String,
    primary_key: FieldDefinition,
    fields: Vec<FieldDefinition>,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            name: name.into(),
            primary_key: None,
            fields: Vec::new(),
        }
    }

    pub fn new(
        name: impl Into<String>,
        primary_key: FieldDefinition,
        fields: Vec<FieldDefinition>,
    ) -> Result<Self> {
        let schema = Self {
            name: name.into(),
            primary_key,
            fields,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::definition(format!(
                "entity name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                self.name
            )));
        }

        if self.primary_key.field_type.fixed_width().is_none() {
            return Err(Error::definition(format!(
                "primary key of {} must have a fixed-width type, found {:?}",
                self.name, self.primary_key.field_type
            )));
        }

        let mut seen = FieldSet::new();
        for field in std::iter::once(&self.primary_key).chain(&self.fields) {
            if seen.contains(field.number) {
                return Err(Error::definition(format!(
                    "field number {} is used twice in {}",
                    field.number, self.name
                )));
            }
            seen.insert(field.number);

            if field.compressed && !field.field_type.is_compressible() {
                return Err(Error::definition(format!(
                    "field {} ({:?}) of {} cannot be compressed",
                    field.name, field.field_type, self.name
                )));
            }
        }
        if self.primary_key.compressed {
            return Err(Error::definition(format!(
                "primary key of {} cannot be compressed",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &FieldDefinition {
        &self.primary_key
    }

    /// Non-key fields, in declaration order.
    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    /// Looks up a non-key field.
    pub fn field(&self, number: u8) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// Numbers of the non-key fields.
    pub fn field_numbers(&self) -> FieldSet {
        self.fields.iter().map(|f| f.number).collect()
    }

    pub fn write_meta(&self, fs: &dyn FileSystem, path: &Path, sync: bool) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        replace_file(fs, path, &bytes, sync)?;
        Ok(())
    }

    pub fn read_meta(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let bytes = read_file(fs, path)?;
        let schema: EntitySchema = serde_json::from_slice(&bytes)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Checks a caller-supplied record against the schema and coerces every value to its
    /// declared type. `Null` fields are dropped: absence and null are the same on disk.
    pub(crate) fn normalize(&self, record: Record) -> Result<Record> {
        let key = self.normalize_key(&record.key)?;
        let mut fields = FieldValues::new();
        for (number, value) in record.fields {
            let definition = self.field(number).ok_or_else(|| Error::UnknownField {
                entity: self.name.clone(),
                number,
            })?;
            if !value.is_null() {
                fields.insert(number, value.coerce(definition.field_type)?);
            }
        }
        Ok(Record { key, fields })
    }

    pub(crate) fn normalize_key(&self, key: &Value) -> Result<Value> {
        if key.is_null() {
            return Err(Error::TypeMismatch {
                expected: self.primary_key.field_type,
                actual: "null".to_string(),
            });
        }
        key.coerce(self.primary_key.field_type)
    }
}

/// Builder for [`EntitySchema`]; `build` validates.
#[derive(Debug, Clone)]
pub struct EntitySchemaBuilder {
    name: String,
    primary_key: Option<FieldDefinition>,
    fields: Vec<FieldDefinition>,
}

impl EntitySchemaBuilder {
    pub fn key(mut self, number: u8, name: impl Into<String>, field_type: FieldType) -> Self {
        self.primary_key = Some(FieldDefinition::new(number, name, field_type));
        self
    }

    pub fn field(mut self, number: u8, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition::new(number, name, field_type));
        self
    }

    pub fn definition(mut self, definition: FieldDefinition) -> Self {
        self.fields.push(definition);
        self
    }

    pub fn build(self) -> Result<EntitySchema> {
        let primary_key = self.primary_key.ok_or_else(|| {
            Error::definition(format!("entity {} has no primary key", self.name))
        })?;
        EntitySchema::new(self.name, primary_key, self.fields)
    }
}

//! Secondary indexes.
//!
//! An [`Index`] maps the value of one field to the records holding it. Each bucket lists
//! [`IndexItem`]s in the order they were added; an item carries the record's primary key
//! and a copy of the index's included fields, so equality lookups can be answered
//! without reading the data file.
//!
//! Index file layout:
//!
//! ```text
//! +--------+-------------+----------+-------------+
//! | "RIDX" | version: u8 | metadata | tree stream |
//! +--------+-------------+----------+-------------+
//! ```

pub mod initializer;
pub mod updater;

use std::path::Path;

use crate::{
    encoding::{write_string, ByteReader},
    error::{Error, Result},
    file_system::{read_file, replace_file, FileSystem},
    schema::{EntitySchema, FieldSet, FieldValues},
    tree::{
        codec::{self, PayloadCodec},
        RedBlackTree,
    },
    value::{are_equals, FieldType, Value},
};

const MAGIC: &[u8; 4] = b"RIDX";
const FORMAT_VERSION: u8 = 1;

/// One record under an index bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexItem {
    pub primary_key: Value,
    /// Values of the included fields, in [`IndexMetadata::included_fields`] order.
    /// Absent fields are `Null`.
    pub included_fields: Vec<Value>,
}

/// What the caller asks for: an index name, the field to index and the fields to copy
/// into each item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub field_number: u8,
    pub included_fields: Vec<u8>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, field_number: u8) -> Self {
        Self {
            name: name.into(),
            field_number,
            included_fields: Vec::new(),
        }
    }

    pub fn include(mut self, field_number: u8) -> Self {
        self.included_fields.push(field_number);
        self
    }
}

/// An [`IndexDefinition`] checked against a schema, with the types it needs to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    pub entity: String,
    pub name: String,
    pub primary_key_type: FieldType,
    pub field_number: u8,
    pub field_type: FieldType,
    pub included_fields: Vec<u8>,
    pub included_types: Vec<FieldType>,
}

impl IndexMetadata {
    /// Validates `definition` against `schema`.
    ///
    /// Fails with [`Error::Definition`] when the index name is not file-safe, when the
    /// indexed or an included field is unknown or is the primary key, or when an
    /// included field is listed twice.
    pub fn resolve(schema: &EntitySchema, definition: &IndexDefinition) -> Result<Self> {
        let entity = schema.name();
        if definition.name.is_empty()
            || !definition
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::definition(format!(
                "index name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                definition.name
            )));
        }

        let primary_key = schema.primary_key();
        let field_type = |number: u8, role: &str| -> Result<FieldType> {
            if number == primary_key.number {
                return Err(Error::definition(format!(
                    "index {} of {entity} cannot use the primary key {} as {role}",
                    definition.name, primary_key.name
                )));
            }
            schema
                .field(number)
                .map(|field| field.field_type)
                .ok_or_else(|| {
                    Error::definition(format!(
                        "index {} of {entity} uses unknown field {number} as {role}",
                        definition.name
                    ))
                })
        };

        let indexed_type = field_type(definition.field_number, "indexed field")?;
        let mut seen = FieldSet::new();
        let mut included_types = Vec::with_capacity(definition.included_fields.len());
        for &number in &definition.included_fields {
            if seen.contains(number) {
                return Err(Error::definition(format!(
                    "index {} of {entity} includes field {number} twice",
                    definition.name
                )));
            }
            seen.insert(number);
            included_types.push(field_type(number, "included field")?);
        }

        Ok(Self {
            entity: entity.to_string(),
            name: definition.name.clone(),
            primary_key_type: primary_key.field_type,
            field_number: definition.field_number,
            field_type: indexed_type,
            included_fields: definition.included_fields.clone(),
            included_types,
        })
    }

    /// The indexed field and every included field.
    pub fn watched_fields(&self) -> FieldSet {
        std::iter::once(self.field_number)
            .chain(self.included_fields.iter().copied())
            .collect()
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        write_string(out, &self.entity)?;
        write_string(out, &self.name)?;
        out.push(self.primary_key_type.tag());
        out.push(self.field_number);
        out.push(self.field_type.tag());

        let count = u8::try_from(self.included_fields.len()).map_err(|_| {
            Error::definition(format!("index {} includes too many fields", self.name))
        })?;
        out.push(count);
        for (number, field_type) in self.included_fields.iter().zip(&self.included_types) {
            out.push(*number);
            out.push(field_type.tag());
        }
        Ok(())
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let entity = reader.read_string()?;
        let name = reader.read_string()?;
        let primary_key_type = FieldType::from_tag(reader.read_u8()?)?;
        let field_number = reader.read_u8()?;
        let field_type = FieldType::from_tag(reader.read_u8()?)?;

        let count = reader.read_u8()? as usize;
        let mut included_fields = Vec::with_capacity(count);
        let mut included_types = Vec::with_capacity(count);
        for _ in 0..count {
            included_fields.push(reader.read_u8()?);
            included_types.push(FieldType::from_tag(reader.read_u8()?)?);
        }

        Ok(Self {
            entity,
            name,
            primary_key_type,
            field_number,
            field_type,
            included_fields,
            included_types,
        })
    }
}

/// Encodes a bucket: item count, then per item the primary key and the nullable
/// included values.
struct BucketCodec<'a> {
    metadata: &'a IndexMetadata,
}

impl PayloadCodec<Vec<IndexItem>> for BucketCodec<'_> {
    fn write_payload(&self, items: &Vec<IndexItem>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            self.metadata.primary_key_type.write(&item.primary_key, out)?;
            let types = &self.metadata.included_types;
            for (value, field_type) in item.included_fields.iter().zip(types) {
                field_type.write_nullable(value, out)?;
            }
        }
        Ok(())
    }

    fn read_payload(&self, bytes: &[u8]) -> Result<Vec<IndexItem>> {
        let mut reader = ByteReader::new(bytes);
        let count = reader.read_u32()? as usize;
        let mut items = Vec::with_capacity(count.min(bytes.len()));
        for _ in 0..count {
            let primary_key = self.metadata.primary_key_type.read(&mut reader)?;
            let included_fields = self
                .metadata
                .included_types
                .iter()
                .map(|field_type| field_type.read_nullable(&mut reader))
                .collect::<Result<Vec<_>>>()?;
            items.push(IndexItem {
                primary_key,
                included_fields,
            });
        }
        if !reader.is_empty() {
            return Err(Error::corrupted(format!(
                "{} trailing bytes after index bucket",
                reader.remaining()
            )));
        }
        Ok(items)
    }
}

/// Result of [`Index::get_equals`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexLookup<'a> {
    pub indexed_value: &'a Value,
    pub items: &'a [IndexItem],
}

/// A secondary index on one field of one entity.
#[derive(Debug)]
pub struct Index {
    metadata: IndexMetadata,
    tree: RedBlackTree<Value, Vec<IndexItem>>,
}

impl Index {
    pub fn new(metadata: IndexMetadata) -> Self {
        Self {
            metadata,
            tree: RedBlackTree::new(),
        }
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Number of distinct indexed values.
    pub fn bucket_count(&self) -> usize {
        self.tree.len()
    }

    pub fn item_count(&self) -> usize {
        self.tree
            .in_order_ascending()
            .into_iter()
            .map(|(_, items)| items.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// The bucket for `value`, `None` when no record holds it.
    pub fn get_equals(&self, value: &Value) -> Option<IndexLookup<'_>> {
        self.tree
            .get_key_value(value)
            .map(|(indexed_value, items)| IndexLookup {
                indexed_value,
                items,
            })
    }

    /// Buckets in ascending order of indexed value.
    pub fn buckets(&self) -> Vec<(&Value, &[IndexItem])> {
        self.tree
            .in_order_ascending()
            .into_iter()
            .map(|(value, items)| (value, items.as_slice()))
            .collect()
    }

    /// Appends `item` to the bucket of `value`, creating the bucket if needed.
    pub fn add(&mut self, value: Value, item: IndexItem) -> Result<()> {
        let value = value.coerce(self.metadata.field_type)?;
        self.tree.insert_or_get_existing(value, Vec::new()).push(item);
        Ok(())
    }

    /// Builds the item of the record `primary_key` with `fields`, paired with its indexed
    /// value.
    pub fn item_for(&self, primary_key: &Value, fields: &FieldValues) -> (Value, IndexItem) {
        let indexed_value = fields
            .get(&self.metadata.field_number)
            .cloned()
            .unwrap_or(Value::Null);
        let item = IndexItem {
            primary_key: primary_key.clone(),
            included_fields: self.included_values(fields),
        };
        (indexed_value, item)
    }

    pub(crate) fn included_values(&self, fields: &FieldValues) -> Vec<Value> {
        self.metadata
            .included_fields
            .iter()
            .map(|number| fields.get(number).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Removes the item of `primary_key` from the bucket of `value`. An emptied bucket is
    /// removed from the tree.
    pub fn remove_item(&mut self, value: &Value, primary_key: &Value) -> Option<IndexItem> {
        let items = self.tree.get_mut(value)?;
        let position = items
            .iter()
            .position(|item| are_equals(&item.primary_key, primary_key))?;
        let item = items.remove(position);
        if items.is_empty() {
            self.tree.remove(value);
        }
        Some(item)
    }

    /// Replaces the included values of `primary_key`'s item in the bucket of `value`.
    /// Returns `false` when the item is not there.
    pub fn refresh_item(
        &mut self,
        value: &Value,
        primary_key: &Value,
        included: Vec<Value>,
    ) -> bool {
        let item = self.tree.get_mut(value).and_then(|items| {
            items
                .iter_mut()
                .find(|item| are_equals(&item.primary_key, primary_key))
        });
        match item {
            Some(item) => {
                item.included_fields = included;
                true
            }
            None => false,
        }
    }

    /// Indexed value of the bucket holding `primary_key`, found by scanning every bucket.
    pub fn find_bucket_of(&self, primary_key: &Value) -> Option<Value> {
        self.tree
            .in_order_ascending()
            .into_iter()
            .find(|(_, items)| {
                items
                    .iter()
                    .any(|item| are_equals(&item.primary_key, primary_key))
            })
            .map(|(value, _)| value.clone())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        self.metadata.write(&mut out)?;
        codec::serialize(
            &self.tree,
            &self.metadata.field_type,
            &BucketCodec {
                metadata: &self.metadata,
            },
            &mut out,
        )?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        if reader.read_array::<4>()? != *MAGIC {
            return Err(Error::corrupted("not an index file"));
        }
        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(Error::corrupted(format!(
                "unsupported index format version {version}"
            )));
        }

        let metadata = IndexMetadata::read(&mut reader)?;
        let tree = codec::deserialize(
            &mut reader,
            &metadata.field_type,
            &BucketCodec {
                metadata: &metadata,
            },
        )?;
        if !reader.is_empty() {
            return Err(Error::corrupted(format!(
                "{} trailing bytes after index tree",
                reader.remaining()
            )));
        }
        Ok(Self { metadata, tree })
    }

    /// Writes the index to `path`, replacing any previous version.
    pub fn save(&self, fs: &dyn FileSystem, path: &Path, sync: bool) -> Result<()> {
        replace_file(fs, path, &self.to_bytes()?, sync)?;
        Ok(())
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let bytes = read_file(fs, path)?;
        Self::from_bytes(&bytes).map_err(|e| match e {
            Error::Corrupted(reason) => Error::Corrupted(format!("{}: {reason}", path.display())),
            other => other,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::file_system::MemoryFileSystem;

    pub(crate) fn person() -> EntitySchema {
        EntitySchema::builder("Person")
            .key(0, "id", FieldType::I64)
            .field(1, "age", FieldType::I32)
            .field(2, "name", FieldType::String)
            .field(3, "city", FieldType::String)
            .build()
            .unwrap()
    }

    pub(crate) fn by_age() -> IndexDefinition {
        IndexDefinition::new("by_age", 1).include(2).include(3)
    }

    fn item(key: i64, name: &str) -> IndexItem {
        IndexItem {
            primary_key: Value::I64(key),
            included_fields: vec![Value::from(name), Value::Null],
        }
    }

    fn index() -> Index {
        Index::new(IndexMetadata::resolve(&person(), &by_age()).unwrap())
    }

    #[test]
    fn resolve_rejects_bad_definitions() {
        let schema = person();
        let cases = [
            IndexDefinition::new("by_age", 1).include(0),
            IndexDefinition::new("by_id", 0),
            IndexDefinition::new("by_zip", 9),
            IndexDefinition::new("by_age", 1).include(2).include(2),
            IndexDefinition::new("by age", 1),
        ];
        for definition in cases {
            assert!(
                matches!(
                    IndexMetadata::resolve(&schema, &definition),
                    Err(Error::Definition(_))
                ),
                "{definition:?}"
            );
        }
    }

    #[test]
    fn resolve_collects_types() {
        let metadata = IndexMetadata::resolve(&person(), &by_age()).unwrap();
        assert_eq!(metadata.primary_key_type, FieldType::I64);
        assert_eq!(metadata.field_type, FieldType::I32);
        assert_eq!(metadata.included_types, vec![FieldType::String, FieldType::String]);
        assert_eq!(metadata.watched_fields(), FieldSet::from_iter([1, 2, 3]));
    }

    #[test]
    fn buckets_keep_insertion_order() {
        let mut index = index();
        index.add(Value::I32(10), item(1, "a")).unwrap();
        index.add(Value::I64(20), item(2, "b")).unwrap();
        index.add(Value::U8(10), item(3, "c")).unwrap();

        let lookup = index.get_equals(&Value::I64(10)).unwrap();
        assert_eq!(lookup.indexed_value, &Value::I32(10));
        assert_eq!(lookup.items, &[item(1, "a"), item(3, "c")]);
        assert_eq!(index.bucket_count(), 2);
        assert_eq!(index.item_count(), 3);
        assert!(index.get_equals(&Value::I32(30)).is_none());
    }

    #[test]
    fn removing_last_item_drops_bucket() {
        let mut index = index();
        index.add(Value::I32(10), item(1, "a")).unwrap();
        index.add(Value::I32(10), item(2, "b")).unwrap();

        assert_eq!(index.remove_item(&Value::I32(10), &Value::I64(1)), Some(item(1, "a")));
        assert!(index.get_equals(&Value::I32(10)).is_some());
        assert!(index.remove_item(&Value::I32(10), &Value::I64(1)).is_none());
        index.remove_item(&Value::I32(10), &Value::I64(2)).unwrap();
        assert!(index.get_equals(&Value::I32(10)).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn refresh_and_find_bucket() {
        let mut index = index();
        index.add(Value::I32(10), item(1, "a")).unwrap();
        index.add(Value::Null, item(2, "b")).unwrap();

        assert_eq!(index.find_bucket_of(&Value::I64(2)), Some(Value::Null));
        let included = vec![Value::from("z"), Value::from("x")];
        assert!(index.refresh_item(&Value::I32(10), &Value::I64(1), included));
        assert!(!index.refresh_item(&Value::I32(11), &Value::I64(1), Vec::new()));
        assert_eq!(
            index.get_equals(&Value::I32(10)).unwrap().items[0].included_fields,
            vec![Value::from("z"), Value::from("x")]
        );
    }

    #[test]
    fn item_for_fills_missing_fields_with_null() {
        let index = index();
        let fields = FieldValues::from([(1, Value::I32(10)), (3, Value::from("Oslo"))]);
        let (value, item) = index.item_for(&Value::I64(4), &fields);
        assert_eq!(value, Value::I32(10));
        assert_eq!(item.included_fields, vec![Value::Null, Value::from("Oslo")]);
    }

    #[test]
    fn file_round_trip() {
        let fs = MemoryFileSystem::new();
        let path = Path::new("/store/Person.by_age.idx");
        let mut index = index();
        for key in 0..40 {
            index
                .add(Value::I32((key % 7) as i32), item(key, &format!("p{key}")))
                .unwrap();
        }
        index.add(Value::Null, item(99, "nobody")).unwrap();
        index.save(&fs, path, false).unwrap();

        let loaded = Index::load(&fs, path).unwrap();
        assert_eq!(loaded.metadata(), index.metadata());
        assert_eq!(loaded.buckets(), index.buckets());
        assert_eq!(loaded.tree.pre_order(), index.tree.pre_order());
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(Index::from_bytes(b"NOPE\x01"), Err(Error::Corrupted(_))));

        let mut bytes = index().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(Index::from_bytes(&bytes), Err(Error::Corrupted(_))));

        let mut bytes = index().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(Index::from_bytes(&bytes), Err(Error::Corrupted(_))));
    }
}

//! Read/write session over one entity.
//!
//! A [`Collection`] owns the entity's primary-key and data files for as long as it is
//! open, keeps the live primary keys in memory (read once from the primary-key file) and
//! keeps every registered index in step with each write.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use log::{debug, info, warn};

use crate::{
    config::INDEX_EXTENSION,
    data_file::DataFile,
    defrag,
    error::{Error, Result},
    file_system::{Access, FileSystem},
    helper::{stems_with_ext, EntityPaths},
    index::{
        initializer::{IndexInitializer, IndexSource},
        updater::{merge_fields, IndexUpdater},
        Index, IndexDefinition, IndexLookup,
    },
    primary_key_file::{PrimaryKeyEntry, PrimaryKeyFile},
    schema::{EntitySchema, FieldSet, FieldValues, Record},
    value::Value,
};

pub struct Collection {
    fs: Arc<dyn FileSystem>,
    schema: EntitySchema,
    paths: EntityPaths,
    primary_keys: PrimaryKeyFile,
    data: DataFile,
    entries: BTreeMap<Value, PrimaryKeyEntry>,
    indexes: IndexUpdater,
    sync: bool,
    // Set once this session's writes have made the persisted index files stale and they
    // have been removed. Cleared whenever index files are written again.
    index_files_invalidated: bool,
}

impl Collection {
    /// Opens (creating if needed) the files of `schema`'s entity under `root` and writes
    /// its meta file.
    ///
    /// Fields may be added or removed between sessions. The primary key type may not
    /// change, and neither may the type or compression of a field that is kept.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        root: &Path,
        schema: EntitySchema,
        sync: bool,
    ) -> Result<Self> {
        let paths = EntityPaths::build(root, schema.name());
        fs.create_dir_all(root)?;
        defrag::recover(fs.as_ref(), &paths)?;

        if fs.exists(&paths.meta) {
            let previous = EntitySchema::read_meta(fs.as_ref(), &paths.meta)?;
            if previous.primary_key().field_type != schema.primary_key().field_type {
                return Err(Error::definition(format!(
                    "primary key of {} was {:?} and cannot become {:?}",
                    schema.name(),
                    previous.primary_key().field_type,
                    schema.primary_key().field_type
                )));
            }
            check_kept_fields(&previous, &schema)?;
        }
        schema.write_meta(fs.as_ref(), &paths.meta, sync)?;

        let mut primary_keys = PrimaryKeyFile::open(
            fs.as_ref(),
            &paths.primary_key,
            schema.primary_key().field_type,
            Access::ReadWrite,
        )?
        .with_sync(sync);
        let data =
            DataFile::open(fs.as_ref(), &paths.data, &schema, Access::ReadWrite)?.with_sync(sync);

        let mut entries = BTreeMap::new();
        for entry in primary_keys.get_all()? {
            if entry.is_deleted {
                continue;
            }
            if let Some(previous) = entries.insert(entry.value.clone(), entry) {
                warn!(
                    "{}: key {} is live twice, keeping the later record",
                    paths.primary_key.display(),
                    previous.value
                );
            }
        }
        debug!("opened {} with {} live records", schema.name(), entries.len());

        Ok(Self {
            indexes: IndexUpdater::new(schema.name()),
            fs,
            schema,
            paths,
            primary_keys,
            data,
            entries,
            sync,
            index_files_invalidated: false,
        })
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &Value) -> Result<bool> {
        Ok(self.entries.contains_key(&self.schema.normalize_key(key)?))
    }

    pub fn insert(&mut self, record: Record) -> Result<()> {
        let record = self.schema.normalize(record)?;
        if self.entries.contains_key(&record.key) {
            return Err(Error::DuplicateKey(record.key.to_string()));
        }
        self.invalidate_index_files()?;

        let range = self.data.insert(&record.fields)?;
        let entry = self.primary_keys.insert(&record.key, range)?;
        debug!(
            "{}: inserted {} at {}..{}",
            self.schema.name(),
            record.key,
            range.start_offset,
            range.end_offset
        );
        self.entries.insert(record.key.clone(), entry);
        self.indexes.add_to_indexes([&record])
    }

    /// Inserts every record, stopping at the first failure. Returns how many were
    /// inserted.
    pub fn insert_many(&mut self, records: impl IntoIterator<Item = Record>) -> Result<usize> {
        let mut inserted = 0;
        for record in records {
            self.insert(record)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Replaces every field of an existing record.
    pub fn update(&mut self, record: Record) -> Result<()> {
        let record = self.schema.normalize(record)?;
        let old = self.current_fields(&record.key)?;
        self.write_new_state(&record.key, &old, &record.fields)
    }

    /// Changes some fields of an existing record. A `Null` value clears the field.
    pub fn update_fields(&mut self, key: &Value, changes: FieldValues) -> Result<()> {
        let key = self.schema.normalize_key(key)?;
        let mut normalized = FieldValues::new();
        for (number, value) in changes {
            let definition = self.schema.field(number).ok_or_else(|| Error::UnknownField {
                entity: self.schema.name().to_string(),
                number,
            })?;
            normalized.insert(number, value.coerce(definition.field_type)?);
        }

        let old = self.current_fields(&key)?;
        let new = merge_fields(&old, &normalized);
        self.write_new_state(&key, &old, &new)
    }

    /// Tombstones the record `key`. Returns `false` when there is no live record.
    pub fn delete(&mut self, key: &Value) -> Result<bool> {
        let key = self.schema.normalize_key(key)?;
        if !self.entries.contains_key(&key) {
            return Ok(false);
        }
        self.invalidate_index_files()?;

        let Some(entry) = self.entries.get_mut(&key) else {
            return Ok(false);
        };
        let old = if self.indexes.is_empty() {
            None
        } else {
            Some(self.data.read_fields(entry.range(), &self.schema.field_numbers())?)
        };
        self.primary_keys.mark_deleted(entry)?;
        self.entries.remove(&key);
        self.indexes.delete_from_indexes(&key, old.as_ref());
        debug!("{}: deleted {}", self.schema.name(), key);
        Ok(true)
    }

    pub fn get(&mut self, key: &Value) -> Result<Option<Record>> {
        let key = self.schema.normalize_key(key)?;
        let wanted = self.schema.field_numbers();
        Ok(self
            .read_live(&key, &wanted)?
            .map(|fields| Record { key, fields }))
    }

    /// Reads only the `wanted` fields of `key`.
    pub fn get_fields(&mut self, key: &Value, wanted: &FieldSet) -> Result<Option<FieldValues>> {
        let key = self.schema.normalize_key(key)?;
        self.read_live(&key, wanted)
    }

    /// Every live record in ascending key order.
    pub fn records(&mut self) -> Result<Vec<Record>> {
        let wanted = self.schema.field_numbers();
        let mut records = Vec::with_capacity(self.entries.len());
        for (key, entry) in &self.entries {
            records.push(Record {
                key: key.clone(),
                fields: self.data.read_fields(entry.range(), &wanted)?,
            });
        }
        Ok(records)
    }

    /// Registers the index described by `definition`, loading it from its file when one
    /// exists and building it from this entity's records otherwise.
    pub fn create_index(&mut self, definition: IndexDefinition) -> Result<IndexSource> {
        self.primary_keys.flush()?;
        self.data.flush()?;

        let (index, source) = IndexInitializer::new(self.fs.as_ref(), &self.paths, &self.schema)
            .with_sync(self.sync)
            .initialize(&definition)?;
        if self.indexes.register(index).is_some() {
            info!("{}: replaced index {}", self.schema.name(), definition.name);
        }
        // The initializer leaves a file matching the current records behind.
        self.index_files_invalidated = false;
        Ok(source)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.index(name)
    }

    /// Items of `index` whose indexed value equals `value`.
    pub fn get_equals(&self, index: &str, value: &Value) -> Result<Option<IndexLookup<'_>>> {
        let index = self.indexes.index(index).ok_or_else(|| Error::UnknownIndex {
            entity: self.schema.name().to_string(),
            index: index.to_string(),
        })?;
        Ok(index.get_equals(value))
    }

    /// Writes every registered index to its file.
    ///
    /// Until this is called (or [`close`](Self::close)), the first write of a session
    /// leaves the entity without persisted index files, so a session that ends any other
    /// way makes the next one rebuild its indexes instead of loading stale ones.
    pub fn save_indexes(&mut self) -> Result<()> {
        for index in self.indexes.indexes() {
            index.save(self.fs.as_ref(), &self.paths.index(index.name()), self.sync)?;
        }
        self.index_files_invalidated = false;
        Ok(())
    }

    /// Persists the indexes and flushes both files.
    pub fn close(mut self) -> Result<()> {
        self.save_indexes()?;
        self.primary_keys.flush()?;
        self.data.flush()
    }

    fn read_live(&mut self, key: &Value, wanted: &FieldSet) -> Result<Option<FieldValues>> {
        match self.entries.get(key) {
            Some(entry) => Ok(Some(self.data.read_fields(entry.range(), wanted)?)),
            None => Ok(None),
        }
    }

    fn current_fields(&mut self, key: &Value) -> Result<FieldValues> {
        let wanted = self.schema.field_numbers();
        self.read_live(key, &wanted)?
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    fn write_new_state(&mut self, key: &Value, old: &FieldValues, new: &FieldValues) -> Result<()> {
        self.invalidate_index_files()?;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;

        let range = self.data.update(new)?;
        self.primary_keys.update_offsets(entry, range)?;
        debug!(
            "{}: updated {} to {}..{}",
            self.schema.name(),
            key,
            range.start_offset,
            range.end_offset
        );
        self.indexes.update_indexes(key, old, new)
    }

    /// Deletes every persisted index file of this entity before the records change under
    /// them. Maintained indexes are written back by [`save_indexes`](Self::save_indexes).
    fn invalidate_index_files(&mut self) -> Result<()> {
        if self.index_files_invalidated {
            return Ok(());
        }
        let prefix = format!("{}.", self.schema.name());
        for stem in stems_with_ext(self.fs.as_ref(), self.paths.root(), INDEX_EXTENSION)? {
            let Some(name) = stem.strip_prefix(&prefix) else {
                continue;
            };
            if self.indexes.contains(name) {
                debug!("removing index file {stem} until it is saved again");
            } else {
                info!("dropping index {stem}, it is not maintained by this session");
            }
            self.fs.remove(&self.paths.index(name))?;
        }
        self.index_files_invalidated = true;
        Ok(())
    }
}

/// Fails when a field kept from the `previous` schema changed its type or compression,
/// which would make its existing blocks unreadable.
fn check_kept_fields(previous: &EntitySchema, schema: &EntitySchema) -> Result<()> {
    for field in schema.fields() {
        let Some(old) = previous.field(field.number) else {
            continue;
        };
        if old.field_type != field.field_type {
            return Err(Error::definition(format!(
                "field #{} of {} was {:?} and cannot become {:?}",
                field.number,
                schema.name(),
                old.field_type,
                field.field_type
            )));
        }
        if old.compressed != field.compressed {
            return Err(Error::definition(format!(
                "field #{} of {} cannot change its compression",
                field.number,
                schema.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{file_system::MemoryFileSystem, schema::FieldDefinition, value::FieldType};

    fn schema() -> EntitySchema {
        EntitySchema::builder("Person")
            .key(0, "id", FieldType::I64)
            .field(1, "age", FieldType::I32)
            .field(2, "name", FieldType::String)
            .build()
            .unwrap()
    }

    fn open(fs: &MemoryFileSystem) -> Collection {
        Collection::open(Arc::new(fs.clone()), Path::new("/store"), schema(), false).unwrap()
    }

    #[test]
    fn insert_get_update_delete() {
        let fs = MemoryFileSystem::new();
        let mut people = open(&fs);

        people.insert(Record::new(1).with(1, 30).with(2, "ann")).unwrap();
        assert!(matches!(
            people.insert(Record::new(1i32).with(1, 31)),
            Err(Error::DuplicateKey(_))
        ));

        people
            .update_fields(&Value::I32(1), FieldValues::from([(1, Value::U8(31))]))
            .unwrap();
        let ann = people.get(&Value::I64(1)).unwrap().unwrap();
        assert_eq!(ann.get(1), Some(&Value::I32(31)));
        assert_eq!(ann.get(2), Some(&Value::from("ann")));

        people.update(Record::new(1).with(2, "anna")).unwrap();
        let ann = people.get(&Value::I64(1)).unwrap().unwrap();
        assert_eq!(ann.get(1), None);

        assert!(people.delete(&Value::I64(1)).unwrap());
        assert!(!people.delete(&Value::I64(1)).unwrap());
        assert!(people.get(&Value::I64(1)).unwrap().is_none());
        assert!(matches!(
            people.update(Record::new(1).with(1, 1)),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn reopen_sees_live_records_and_reinserts() {
        let fs = MemoryFileSystem::new();
        let mut people = open(&fs);
        people
            .insert_many((1..=3).map(|id: i64| Record::new(id).with(1, id as i32 * 10)))
            .unwrap();
        people.delete(&Value::I64(2)).unwrap();
        people.close().unwrap();

        let mut people = open(&fs);
        assert_eq!(people.len(), 2);
        people.insert(Record::new(2).with(1, 99)).unwrap();
        let keys: Vec<_> = people.records().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![Value::I64(1), Value::I64(2), Value::I64(3)]);
        // The tombstone stays until defragmentation.
        let paths = EntityPaths::build(Path::new("/store"), "Person");
        let primary_keys = fs.contents(&paths.primary_key).unwrap();
        assert_eq!(primary_keys.len(), 4 * 25);
    }

    #[test]
    fn get_fields_reads_subset() {
        let fs = MemoryFileSystem::new();
        let mut people = open(&fs);
        people.insert(Record::new(7).with(1, 40).with(2, "eve")).unwrap();

        let fields = people
            .get_fields(&Value::I64(7), &FieldSet::from_iter([2]))
            .unwrap()
            .unwrap();
        assert_eq!(fields, FieldValues::from([(2, Value::from("eve"))]));
    }

    #[test]
    fn unknown_fields_and_indexes_are_errors() {
        let fs = MemoryFileSystem::new();
        let mut people = open(&fs);
        assert!(matches!(
            people.insert(Record::new(1).with(8, 1)),
            Err(Error::UnknownField { number: 8, .. })
        ));
        assert!(matches!(
            people.get_equals("by_age", &Value::I32(1)),
            Err(Error::UnknownIndex { .. })
        ));
    }

    #[test]
    fn primary_key_type_cannot_change() {
        let fs = MemoryFileSystem::new();
        open(&fs).close().unwrap();

        let changed = EntitySchema::builder("Person")
            .key(0, "id", FieldType::I32)
            .build()
            .unwrap();
        let result = Collection::open(Arc::new(fs.clone()), Path::new("/store"), changed, false);
        assert!(matches!(result, Err(Error::Definition(_))));
    }

    #[test]
    fn writes_drop_unmaintained_index_files() {
        let fs = MemoryFileSystem::new();
        let paths = EntityPaths::build(Path::new("/store"), "Person");
        let mut people = open(&fs);
        people.insert(Record::new(1).with(1, 30)).unwrap();
        people.create_index(IndexDefinition::new("by_age", 1)).unwrap();
        people.close().unwrap();
        assert!(fs.exists(&paths.index("by_age")));

        let mut people = open(&fs);
        people.get(&Value::I64(1)).unwrap();
        assert!(fs.exists(&paths.index("by_age")));
        people.insert(Record::new(2).with(1, 30)).unwrap();
        assert!(!fs.exists(&paths.index("by_age")));

        let source = people.create_index(IndexDefinition::new("by_age", 1)).unwrap();
        assert_eq!(source, IndexSource::Built);
        let lookup = people.get_equals("by_age", &Value::I32(30)).unwrap().unwrap();
        assert_eq!(lookup.items.len(), 2);
    }

    #[test]
    fn writes_remove_maintained_index_files_until_saved() {
        let fs = MemoryFileSystem::new();
        let paths = EntityPaths::build(Path::new("/store"), "Person");
        let mut people = open(&fs);
        people.insert(Record::new(1).with(1, 30)).unwrap();
        people.create_index(IndexDefinition::new("by_age", 1)).unwrap();
        assert!(fs.exists(&paths.index("by_age")));

        people.update_fields(&Value::I64(1), FieldValues::from([(1, Value::I32(31))])).unwrap();
        assert!(!fs.exists(&paths.index("by_age")));

        people.save_indexes().unwrap();
        assert!(fs.exists(&paths.index("by_age")));
        people.delete(&Value::I64(1)).unwrap();
        assert!(!fs.exists(&paths.index("by_age")));
        drop(people);

        let mut people = open(&fs);
        let source = people.create_index(IndexDefinition::new("by_age", 1)).unwrap();
        assert_eq!(source, IndexSource::Built);
        assert!(people.index("by_age").unwrap().is_empty());
    }

    #[test]
    fn kept_fields_cannot_change_type_or_compression() {
        let fs = MemoryFileSystem::new();
        let mut people = open(&fs);
        people.insert(Record::new(1).with(1, 30).with(2, "ann")).unwrap();
        people.close().unwrap();

        let retyped = EntitySchema::builder("Person")
            .key(0, "id", FieldType::I64)
            .field(1, "age", FieldType::I64)
            .build()
            .unwrap();
        let result = Collection::open(Arc::new(fs.clone()), Path::new("/store"), retyped, false);
        assert!(matches!(result, Err(Error::Definition(_))));

        let compressed = EntitySchema::builder("Person")
            .key(0, "id", FieldType::I64)
            .field(1, "age", FieldType::I32)
            .definition(FieldDefinition::new(2, "name", FieldType::String).compressed())
            .build()
            .unwrap();
        let result = Collection::open(Arc::new(fs.clone()), Path::new("/store"), compressed, false);
        assert!(matches!(result, Err(Error::Definition(_))));

        // Rejected opens leave the stored records readable.
        let mut people = open(&fs);
        let ann = people.get(&Value::I64(1)).unwrap().unwrap();
        assert_eq!(ann.get(2), Some(&Value::from("ann")));
    }
}

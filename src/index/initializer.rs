use log::{info, warn};

use crate::{
    data_file::DataFile,
    error::Result,
    file_system::{Access, FileSystem},
    helper::EntityPaths,
    primary_key_file::PrimaryKeyFile,
    schema::EntitySchema,
};

use super::{Index, IndexDefinition, IndexMetadata};

/// How [`IndexInitializer::initialize`] obtained an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    /// Read from its index file.
    Loaded,
    /// Built from the primary-key and data files, then persisted.
    Built,
}

/// Produces the indexes of one entity, from their file when one exists and from the
/// record files otherwise.
pub struct IndexInitializer<'a> {
    fs: &'a dyn FileSystem,
    paths: &'a EntityPaths,
    schema: &'a EntitySchema,
    sync: bool,
}

impl<'a> IndexInitializer<'a> {
    pub fn new(fs: &'a dyn FileSystem, paths: &'a EntityPaths, schema: &'a EntitySchema) -> Self {
        Self {
            fs,
            paths,
            schema,
            sync: false,
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn index_exists(&self, name: &str) -> bool {
        self.fs.exists(&self.paths.index(name))
    }

    /// Loads the persisted index for `definition`, or builds and persists it when there is
    /// none. An index file written for a different definition is rebuilt.
    ///
    /// Loading never opens the primary-key or data file.
    pub fn initialize(&self, definition: &IndexDefinition) -> Result<(Index, IndexSource)> {
        let metadata = IndexMetadata::resolve(self.schema, definition)?;
        let path = self.paths.index(&metadata.name);

        if self.index_exists(&metadata.name) {
            let index = Index::load(self.fs, &path)?;
            if *index.metadata() == metadata {
                info!(
                    "loaded index {}.{} ({} values)",
                    metadata.entity,
                    metadata.name,
                    index.bucket_count()
                );
                return Ok((index, IndexSource::Loaded));
            }
            warn!(
                "index file {} was written for another definition, rebuilding",
                path.display()
            );
        }

        let index = self.build(metadata)?;
        index.save(self.fs, &path, self.sync)?;
        info!(
            "built index {}.{} ({} values, {} items)",
            index.metadata().entity,
            index.name(),
            index.bucket_count(),
            index.item_count()
        );
        Ok((index, IndexSource::Built))
    }

    /// Scans every live record. Items are added in primary-key file order, which is
    /// insertion order.
    pub fn build(&self, metadata: IndexMetadata) -> Result<Index> {
        let mut index = Index::new(metadata);
        if !self.fs.exists(&self.paths.primary_key) {
            return Ok(index);
        }

        let mut primary_keys = PrimaryKeyFile::open(
            self.fs,
            &self.paths.primary_key,
            self.schema.primary_key().field_type,
            Access::Read,
        )?;
        let mut data = DataFile::open(self.fs, &self.paths.data, self.schema, Access::Read)?;

        let wanted = index.metadata().watched_fields();
        for entry in primary_keys.get_all()? {
            if entry.is_deleted {
                continue;
            }
            let fields = data.read_fields(entry.range(), &wanted)?;
            let (value, item) = index.item_for(&entry.value, &fields);
            index.add(value, item)?;
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        file_system::MemoryFileSystem,
        index::tests::{by_age, person},
        schema::FieldValues,
        value::Value,
    };

    fn seed(fs: &MemoryFileSystem, paths: &EntityPaths, schema: &EntitySchema) {
        let mut primary_keys = PrimaryKeyFile::open(
            fs,
            &paths.primary_key,
            schema.primary_key().field_type,
            Access::ReadWrite,
        )
        .unwrap();
        let mut data = DataFile::open(fs, &paths.data, schema, Access::ReadWrite).unwrap();
        for (key, age) in [(1i64, 10), (2, 20), (3, 10)] {
            let fields = FieldValues::from([
                (1, Value::I32(age)),
                (2, Value::from(format!("p{key}").as_str())),
            ]);
            let range = data.insert(&fields).unwrap();
            let mut entry = primary_keys.insert(&Value::I64(key), range).unwrap();
            if key == 2 {
                primary_keys.mark_deleted(&mut entry).unwrap();
            }
        }
    }

    #[test]
    fn builds_then_loads() {
        let fs = MemoryFileSystem::new();
        let schema = person();
        let paths = EntityPaths::build(Path::new("/store"), "Person");
        seed(&fs, &paths, &schema);
        let initializer = IndexInitializer::new(&fs, &paths, &schema);

        assert!(!initializer.index_exists("by_age"));
        let (built, source) = initializer.initialize(&by_age()).unwrap();
        assert_eq!(source, IndexSource::Built);
        assert!(initializer.index_exists("by_age"));
        assert_eq!(built.get_equals(&Value::I32(10)).unwrap().items.len(), 2);
        assert!(built.get_equals(&Value::I32(20)).is_none());

        let pk_opens = fs.open_count(&paths.primary_key);
        let data_opens = fs.open_count(&paths.data);
        let (loaded, source) = initializer.initialize(&by_age()).unwrap();
        assert_eq!(source, IndexSource::Loaded);
        assert_eq!(fs.open_count(&paths.primary_key), pk_opens);
        assert_eq!(fs.open_count(&paths.data), data_opens);
        assert_eq!(loaded.buckets(), built.buckets());
    }

    #[test]
    fn changed_definition_is_rebuilt() {
        let fs = MemoryFileSystem::new();
        let schema = person();
        let paths = EntityPaths::build(Path::new("/store"), "Person");
        seed(&fs, &paths, &schema);
        let initializer = IndexInitializer::new(&fs, &paths, &schema);
        initializer.initialize(&by_age()).unwrap();

        let narrower = IndexDefinition::new("by_age", 1);
        let (index, source) = initializer.initialize(&narrower).unwrap();
        assert_eq!(source, IndexSource::Built);
        assert!(index.metadata().included_fields.is_empty());
    }

    #[test]
    fn entity_without_files_builds_empty_index() {
        let fs = MemoryFileSystem::new();
        let schema = person();
        let paths = EntityPaths::build(Path::new("/store"), "Person");

        let (index, source) = IndexInitializer::new(&fs, &paths, &schema)
            .initialize(&by_age())
            .unwrap();
        assert_eq!(source, IndexSource::Built);
        assert!(index.is_empty());
        assert_eq!(fs.open_count(&paths.data), 0);
    }
}

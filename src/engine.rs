use std::{path::Path, sync::Arc};

use crate::{
    collection::Collection,
    config::{StoreConfig, META_EXTENSION},
    defrag::{Defragmentator, DefragmentReport},
    error::{Error, Result},
    file_system::{DiskFileSystem, FileSystem},
    helper::{stems_with_ext, EntityPaths},
    index::Index,
    schema::EntitySchema,
    statistics::{self, CollectionStatistics},
};

/// StorageEngine owns the store root and the file system every collection, index and
/// maintenance task works through.
#[derive(Debug, Clone)]
pub struct StorageEngine {
    config: StoreConfig,
    fs: Arc<dyn FileSystem>,
}

impl StorageEngine {
    /// Opens the store described by `config` on the local disk.
    ///
    /// # Arguments
    ///
    /// * `config` - Root directory and flush policy.
    ///
    /// # Returns
    ///
    /// The engine, after the root directory has been created if it was missing.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::with_file_system(config, Arc::new(DiskFileSystem))
    }

    /// Opens the store on an explicit [`FileSystem`], such as a
    /// [`MemoryFileSystem`](crate::file_system::MemoryFileSystem) in tests.
    pub fn with_file_system(config: StoreConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        fs.create_dir_all(&config.root)?;
        Ok(Self { config, fs })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Starts a read/write session over the entity described by `schema`.
    ///
    /// # Arguments
    ///
    /// * `schema` - Current description of the entity. It replaces the stored meta file.
    ///
    /// # Returns
    ///
    /// The open collection. Its files stay open until it is closed or dropped.
    pub fn collection(&self, schema: EntitySchema) -> Result<Collection> {
        Collection::open(
            Arc::clone(&self.fs),
            &self.config.root,
            schema,
            self.config.sync_writes,
        )
    }

    /// Names of every entity with a meta file, sorted.
    pub fn entities(&self) -> Result<Vec<String>> {
        stems_with_ext(self.fs.as_ref(), &self.config.root, META_EXTENSION)
    }

    /// The schema stored in the meta file of `entity`.
    pub fn schema(&self, entity: &str) -> Result<EntitySchema> {
        let paths = self.paths(entity);
        if !self.fs.exists(&paths.meta) {
            return Err(Error::UnknownEntity(entity.to_string()));
        }
        EntitySchema::read_meta(self.fs.as_ref(), &paths.meta)
    }

    /// Reads a persisted index without opening the entity's record files.
    ///
    /// # Arguments
    ///
    /// * `entity` - Entity the index belongs to.
    /// * `index` - Index name.
    ///
    /// # Returns
    ///
    /// The index as last saved, or [`Error::UnknownIndex`] when it was never persisted.
    pub fn load_index(&self, entity: &str, index: &str) -> Result<Index> {
        let path = self.paths(entity).index(index);
        if !self.fs.exists(&path) {
            return Err(Error::UnknownIndex {
                entity: entity.to_string(),
                index: index.to_string(),
            });
        }
        Index::load(self.fs.as_ref(), &path)
    }

    /// Compacts the primary-key and data files of `entity`. No collection of the entity
    /// may be open.
    pub fn defragment(&self, entity: &str) -> Result<DefragmentReport> {
        Defragmentator::new(self.fs.as_ref(), &self.config.root)
            .with_sync(self.config.sync_writes)
            .defragment_data_file(entity)
    }

    /// Dead-space accounting for `entity`, computed from its meta file.
    pub fn statistics(&self, entity: &str) -> Result<CollectionStatistics> {
        let schema = self.schema(entity)?;
        statistics::collect(self.fs.as_ref(), &self.paths(entity), &schema)
    }

    fn paths(&self, entity: &str) -> EntityPaths {
        EntityPaths::build(&self.config.root, entity)
    }
}

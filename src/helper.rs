use std::path::{Path, PathBuf};

use crate::{
    config::{
        BACKUP_SUFFIX, DATA_EXTENSION, DEFRAG_SUFFIX, INDEX_EXTENSION, META_EXTENSION,
        PRIMARY_KEY_EXTENSION,
    },
    error::Result,
    file_system::FileSystem,
};

/// Paths of every file that belongs to one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPaths {
    root: PathBuf,
    entity: String,
    pub primary_key: PathBuf,
    pub data: PathBuf,
    pub meta: PathBuf,
}

impl EntityPaths {
    pub fn build(root: &Path, entity: &str) -> Self {
        let root = root.to_path_buf();
        let primary_key = root.join(format!("{entity}.{PRIMARY_KEY_EXTENSION}"));
        let data = root.join(format!("{entity}.{DATA_EXTENSION}"));
        let meta = root.join(format!("{entity}.{META_EXTENSION}"));

        Self {
            root,
            entity: entity.to_string(),
            primary_key,
            data,
            meta,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn index(&self, index: &str) -> PathBuf {
        self.root
            .join(format!("{}.{index}.{INDEX_EXTENSION}", self.entity))
    }

    pub fn primary_key_defrag(&self) -> PathBuf {
        with_suffix(&self.primary_key, DEFRAG_SUFFIX)
    }

    pub fn data_defrag(&self) -> PathBuf {
        with_suffix(&self.data, DEFRAG_SUFFIX)
    }

    pub fn primary_key_backup(&self) -> PathBuf {
        with_suffix(&self.primary_key, BACKUP_SUFFIX)
    }

    pub fn data_backup(&self) -> PathBuf {
        with_suffix(&self.data, BACKUP_SUFFIX)
    }
}

/// `path` with `.suffix` appended to its file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// File stems in `dir` whose extension is `ext`, sorted.
pub(crate) fn stems_with_ext(fs: &dyn FileSystem, dir: &Path, ext: &str) -> Result<Vec<String>> {
    let mut stems: Vec<String> = fs
        .list(dir)?
        .into_iter()
        .filter(|path| path.extension().is_some_and(|e| e == ext))
        .filter_map(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .collect();
    stems.sort();
    Ok(stems)
}

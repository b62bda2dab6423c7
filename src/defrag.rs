//! Offline compaction of an entity's primary-key and data files.
//!
//! Live records are copied in ascending key order into two replacement files, keeping
//! only fields the schema still declares. The replacements are checked, then swapped in:
//! both originals are first moved to backups, then both replacements take their place,
//! and only then are the backups removed. A swap that fails part way is rolled back from
//! the backups. One interrupted by a crash is finished or rolled back by [`recover`],
//! which runs before every defragmentation and every collection open.
//!
//! No collection of the entity may be open while it is defragmented.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    data_file::{parse_block, retain_fields, DataFile},
    error::{Error, Result},
    file_system::{Access, FileSystem},
    helper::EntityPaths,
    primary_key_file::{PrimaryKeyEntry, PrimaryKeyFile},
    schema::EntitySchema,
    value::Value,
};

/// Outcome of one defragmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefragmentReport {
    pub records: u64,
    pub primary_key_bytes_before: u64,
    pub primary_key_bytes_after: u64,
    pub data_bytes_before: u64,
    pub data_bytes_after: u64,
}

impl DefragmentReport {
    pub fn reclaimed_bytes(&self) -> u64 {
        (self.primary_key_bytes_before + self.data_bytes_before)
            .saturating_sub(self.primary_key_bytes_after + self.data_bytes_after)
    }
}

/// One file taking part in the swap.
struct SwapFile {
    original: PathBuf,
    replacement: PathBuf,
    backup: PathBuf,
}

fn swap_files(paths: &EntityPaths) -> [SwapFile; 2] {
    [
        SwapFile {
            original: paths.primary_key.clone(),
            replacement: paths.primary_key_defrag(),
            backup: paths.primary_key_backup(),
        },
        SwapFile {
            original: paths.data.clone(),
            replacement: paths.data_defrag(),
            backup: paths.data_backup(),
        },
    ]
}

/// Leaves the files of one entity as either the complete old pair or the complete new
/// pair after an interrupted defragmentation.
///
/// Backups without replacements mean both replacements were already moved into place,
/// so the backups are dropped. Backups next to a replacement mean the swap stopped half
/// way, so the backups are moved back. Replacements without backups never touched the
/// originals and are removed.
pub fn recover(fs: &dyn FileSystem, paths: &EntityPaths) -> Result<()> {
    let files = swap_files(paths);
    let backed_up = files.iter().any(|file| fs.exists(&file.backup));
    let staged = files.iter().any(|file| fs.exists(&file.replacement));

    if backed_up && !staged {
        info!("finishing interrupted defragmentation of {}", paths.entity());
        for file in &files {
            if fs.exists(&file.backup) {
                fs.remove(&file.backup)?;
            }
        }
        return Ok(());
    }

    if backed_up {
        warn!("rolling back interrupted defragmentation of {}", paths.entity());
        for file in &files {
            if fs.exists(&file.backup) {
                fs.rename(&file.backup, &file.original)?;
            }
        }
    }
    for file in &files {
        if fs.exists(&file.replacement) {
            warn!("removing leftover {}", file.replacement.display());
            fs.remove(&file.replacement)?;
        }
    }
    Ok(())
}

pub struct Defragmentator<'a> {
    fs: &'a dyn FileSystem,
    root: &'a Path,
    sync: bool,
}

impl<'a> Defragmentator<'a> {
    pub fn new(fs: &'a dyn FileSystem, root: &'a Path) -> Self {
        Self {
            fs,
            root,
            sync: false,
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Compacts the files of entity `name`, interpreting them through its meta file.
    pub fn defragment_data_file(&self, name: &str) -> Result<DefragmentReport> {
        let paths = EntityPaths::build(self.root, name);
        if !self.fs.exists(&paths.meta) {
            return Err(Error::UnknownEntity(name.to_string()));
        }
        let schema = EntitySchema::read_meta(self.fs, &paths.meta)?;
        recover(self.fs, &paths)?;

        if !self.fs.exists(&paths.primary_key) {
            return Ok(DefragmentReport {
                records: 0,
                primary_key_bytes_before: 0,
                primary_key_bytes_after: 0,
                data_bytes_before: 0,
                data_bytes_after: 0,
            });
        }

        info!("defragmenting {name}");
        let report = match self.write_replacement(&paths, &schema) {
            Ok(report) => report,
            Err(e) => {
                for temp in [paths.primary_key_defrag(), paths.data_defrag()] {
                    if self.fs.exists(&temp) {
                        if let Err(remove_error) = self.fs.remove(&temp) {
                            warn!("could not remove {}: {}", temp.display(), remove_error);
                        }
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = self.swap(&paths) {
            if let Err(rollback_error) = recover(self.fs, &paths) {
                warn!(
                    "could not roll back defragmentation of {name}: {rollback_error}, \
                     it is retried on the next open"
                );
            }
            return Err(e);
        }

        info!(
            "defragmented {name}: {} records, {} bytes reclaimed",
            report.records,
            report.reclaimed_bytes()
        );
        Ok(report)
    }

    /// Moves the originals to their backups and the replacements into place, then drops
    /// the backups.
    fn swap(&self, paths: &EntityPaths) -> Result<()> {
        let files = swap_files(paths);
        for file in &files {
            self.fs.rename(&file.original, &file.backup)?;
        }
        for file in &files {
            self.fs.rename(&file.replacement, &file.original)?;
        }
        for file in &files {
            if let Err(e) = self.fs.remove(&file.backup) {
                warn!("could not remove {}: {}", file.backup.display(), e);
            }
        }
        Ok(())
    }

    /// Writes and verifies both replacement files.
    fn write_replacement(
        &self,
        paths: &EntityPaths,
        schema: &EntitySchema,
    ) -> Result<DefragmentReport> {
        let key_type = schema.primary_key().field_type;
        let current = schema.field_numbers();

        let mut primary_keys =
            PrimaryKeyFile::open(self.fs, &paths.primary_key, key_type, Access::Read)?;
        let primary_key_bytes_before = primary_keys.len()?;

        // Later records win should a key appear live twice.
        let live: BTreeMap<Value, PrimaryKeyEntry> = primary_keys
            .get_all()?
            .into_iter()
            .filter(|entry| !entry.is_deleted)
            .map(|entry| (entry.value.clone(), entry))
            .collect();

        let primary_key_temp = paths.primary_key_defrag();
        let data_temp = paths.data_defrag();
        let data_bytes_before;
        {
            let mut old_data = DataFile::open(self.fs, &paths.data, schema, Access::Read)?;
            data_bytes_before = old_data.len()?;

            let mut new_primary_keys =
                PrimaryKeyFile::open(self.fs, &primary_key_temp, key_type, Access::ReadWrite)?
                    .with_sync(self.sync);
            let mut new_data = DataFile::open(self.fs, &data_temp, schema, Access::ReadWrite)?
                .with_sync(self.sync);

            for (key, entry) in &live {
                let block = retain_fields(&old_data.read_block(entry.range())?, &current)?;
                let range = new_data.append_block(&block)?;
                new_primary_keys.insert(key, range)?;
            }
            new_data.flush()?;
            new_primary_keys.flush()?;
        }

        let (primary_key_bytes_after, data_bytes_after) =
            self.verify(&primary_key_temp, &data_temp, schema, live.len())?;

        Ok(DefragmentReport {
            records: live.len() as u64,
            primary_key_bytes_before,
            primary_key_bytes_after,
            data_bytes_before,
            data_bytes_after,
        })
    }

    /// Re-reads the replacement files: record count, strictly ascending live keys, and
    /// every block in range and parseable.
    fn verify(
        &self,
        primary_key_path: &Path,
        data_path: &Path,
        schema: &EntitySchema,
        expected: usize,
    ) -> Result<(u64, u64)> {
        let mut primary_keys = PrimaryKeyFile::open(
            self.fs,
            primary_key_path,
            schema.primary_key().field_type,
            Access::Read,
        )?;
        let mut data = DataFile::open(self.fs, data_path, schema, Access::Read)?;
        let entries = primary_keys.get_all()?;

        if entries.len() != expected {
            return Err(Error::corrupted(format!(
                "{}: wrote {} records, read back {}",
                primary_key_path.display(),
                expected,
                entries.len()
            )));
        }
        for (index, entry) in entries.iter().enumerate() {
            if entry.is_deleted {
                return Err(Error::corrupted(format!(
                    "{}: record {index} is deleted",
                    primary_key_path.display()
                )));
            }
            if index > 0 && entries[index - 1].value >= entry.value {
                return Err(Error::corrupted(format!(
                    "{}: key {} is out of order",
                    primary_key_path.display(),
                    entry.value
                )));
            }
            parse_block(&data.read_block(entry.range())?)?;
        }

        Ok((primary_keys.len()?, data.len()?))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::{
        file_system::{MemoryFileSystem, StorageFile},
        schema::{FieldSet, FieldValues},
        value::FieldType,
    };

    /// Refuses to rename `refused`. With `halt` set, every rename after the refused one
    /// fails too, as if the process had stopped there.
    #[derive(Debug)]
    struct RefusingRename {
        inner: MemoryFileSystem,
        refused: PathBuf,
        halt: bool,
        halted: AtomicBool,
    }

    impl RefusingRename {
        fn new(inner: &MemoryFileSystem, refused: PathBuf, halt: bool) -> Self {
            Self {
                inner: inner.clone(),
                refused,
                halt,
                halted: AtomicBool::new(false),
            }
        }
    }

    impl FileSystem for RefusingRename {
        fn open(&self, path: &Path, access: Access) -> io::Result<Box<dyn StorageFile>> {
            self.inner.open(path, access)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.inner.remove(path)
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if from == self.refused || (self.halt && self.halted.load(Ordering::SeqCst)) {
                self.halted.store(true, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Other, "rename refused"));
            }
            self.inner.rename(from, to)
        }

        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.inner.create_dir_all(path)
        }

        fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.list(dir)
        }
    }

    fn schema() -> EntitySchema {
        EntitySchema::builder("Item")
            .key(0, "id", FieldType::I32)
            .field(1, "label", FieldType::String)
            .field(2, "weight", FieldType::F64)
            .build()
            .unwrap()
    }

    fn seed(fs: &MemoryFileSystem, paths: &EntityPaths, schema: &EntitySchema) {
        schema.write_meta(fs, &paths.meta, false).unwrap();
        let mut primary_keys =
            PrimaryKeyFile::open(fs, &paths.primary_key, FieldType::I32, Access::ReadWrite)
                .unwrap();
        let mut data = DataFile::open(fs, &paths.data, schema, Access::ReadWrite).unwrap();
        for key in [5, 3, 9, 1, 7] {
            let fields = FieldValues::from([
                (1, Value::from(format!("item {key}").as_str())),
                (2, Value::F64(key as f64 / 2.0)),
            ]);
            let range = data.insert(&fields).unwrap();
            let mut entry = primary_keys.insert(&Value::I32(key), range).unwrap();
            if key == 9 {
                primary_keys.mark_deleted(&mut entry).unwrap();
            }
        }
    }

    fn live(
        fs: &MemoryFileSystem,
        paths: &EntityPaths,
        schema: &EntitySchema,
    ) -> Vec<(Value, FieldValues)> {
        let mut primary_keys =
            PrimaryKeyFile::open(fs, &paths.primary_key, FieldType::I32, Access::Read).unwrap();
        let mut data = DataFile::open(fs, &paths.data, schema, Access::Read).unwrap();
        primary_keys
            .get_all()
            .unwrap()
            .into_iter()
            .filter(|entry| !entry.is_deleted)
            .map(|entry| {
                let wanted = FieldSet::from_iter([1, 2]);
                let fields = data.read_fields(entry.range(), &wanted).unwrap();
                (entry.value, fields)
            })
            .collect()
    }

    #[test]
    fn compacts_in_key_order() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema);

        let mut before = live(&fs, &paths, &schema);
        before.sort_by(|a, b| a.0.cmp(&b.0));

        let report = Defragmentator::new(&fs, Path::new("/store"))
            .defragment_data_file("Item")
            .unwrap();
        assert_eq!(report.records, 4);
        assert_eq!(report.primary_key_bytes_after, 4 * 21);
        assert!(report.data_bytes_after < report.data_bytes_before);

        let after = live(&fs, &paths, &schema);
        assert_eq!(after, before);
        let keys: Vec<_> = after.iter().map(|(key, _)| key.clone()).collect();
        assert_eq!(keys, vec![Value::I32(1), Value::I32(3), Value::I32(5), Value::I32(7)]);
        assert!(!fs.exists(&paths.primary_key_defrag()));
        assert!(!fs.exists(&paths.data_defrag()));
    }

    #[test]
    fn drops_fields_missing_from_schema() {
        let fs = MemoryFileSystem::new();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema());

        let narrowed = EntitySchema::builder("Item")
            .key(0, "id", FieldType::I32)
            .field(1, "label", FieldType::String)
            .build()
            .unwrap();
        narrowed.write_meta(&fs, &paths.meta, false).unwrap();

        let report = Defragmentator::new(&fs, Path::new("/store"))
            .defragment_data_file("Item")
            .unwrap();
        // Each surviving block loses a 13 byte weight entry.
        let label_bytes: u64 = [1, 3, 5, 7]
            .iter()
            .map(|k: &i32| 5 + format!("item {k}").len() as u64)
            .sum();
        assert_eq!(report.data_bytes_after, label_bytes);
    }

    #[test]
    fn failure_leaves_originals_untouched() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema);

        // Cut the last block short so copying it fails.
        let mut data = fs.contents(&paths.data).unwrap();
        data.truncate(data.len() - 3);
        fs.remove(&paths.data).unwrap();
        {
            use std::io::Write;
            fs.open(&paths.data, Access::ReadWrite).unwrap().write_all(&data).unwrap();
        }
        let pk_before = fs.contents(&paths.primary_key).unwrap();

        let result = Defragmentator::new(&fs, Path::new("/store")).defragment_data_file("Item");
        assert!(result.is_err());
        assert_eq!(fs.contents(&paths.primary_key).unwrap(), pk_before);
        assert_eq!(fs.contents(&paths.data).unwrap(), data);
        assert!(!fs.exists(&paths.primary_key_defrag()));
        assert!(!fs.exists(&paths.data_defrag()));
    }

    fn assert_no_swap_files(fs: &MemoryFileSystem, paths: &EntityPaths) {
        for path in [
            paths.primary_key_defrag(),
            paths.data_defrag(),
            paths.primary_key_backup(),
            paths.data_backup(),
        ] {
            assert!(!fs.exists(&path), "{} was left behind", path.display());
        }
    }

    #[test]
    fn failed_swap_is_rolled_back() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema);
        let pk_before = fs.contents(&paths.primary_key).unwrap();
        let data_before = fs.contents(&paths.data).unwrap();
        let mut live_before = live(&fs, &paths, &schema);
        live_before.sort_by(|a, b| a.0.cmp(&b.0));

        // The primary-key file is already in place when the data file refuses to move.
        let refusing = RefusingRename::new(&fs, paths.data_defrag(), false);
        let result =
            Defragmentator::new(&refusing, Path::new("/store")).defragment_data_file("Item");
        assert!(matches!(result, Err(Error::Io(_))));

        assert_eq!(fs.contents(&paths.primary_key).unwrap(), pk_before);
        assert_eq!(fs.contents(&paths.data).unwrap(), data_before);
        assert_no_swap_files(&fs, &paths);

        Defragmentator::new(&fs, Path::new("/store"))
            .defragment_data_file("Item")
            .unwrap();
        assert_eq!(live(&fs, &paths, &schema), live_before);
    }

    #[test]
    fn interrupted_swap_is_rolled_back_by_recover() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema);
        let pk_before = fs.contents(&paths.primary_key).unwrap();
        let data_before = fs.contents(&paths.data).unwrap();

        let halting = RefusingRename::new(&fs, paths.data_defrag(), true);
        let result =
            Defragmentator::new(&halting, Path::new("/store")).defragment_data_file("Item");
        assert!(result.is_err());
        // Stopped between the two replacements: new pk file, no data file.
        assert!(fs.exists(&paths.data_defrag()));
        assert!(fs.exists(&paths.data_backup()));
        assert!(!fs.exists(&paths.data));

        recover(&fs, &paths).unwrap();
        assert_eq!(fs.contents(&paths.primary_key).unwrap(), pk_before);
        assert_eq!(fs.contents(&paths.data).unwrap(), data_before);
        assert_no_swap_files(&fs, &paths);
    }

    #[test]
    fn recover_drops_backups_of_a_finished_swap() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema);
        let pk = fs.contents(&paths.primary_key).unwrap();
        {
            use std::io::Write;
            let mut backup = fs.open(&paths.primary_key_backup(), Access::ReadWrite).unwrap();
            backup.write_all(b"old primary keys").unwrap();
        }

        recover(&fs, &paths).unwrap();
        assert_eq!(fs.contents(&paths.primary_key).unwrap(), pk);
        assert_no_swap_files(&fs, &paths);
    }

    #[test]
    fn leftover_replacements_are_removed() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        seed(&fs, &paths, &schema);
        let data = fs.contents(&paths.data).unwrap();
        {
            use std::io::Write;
            let mut leftover = fs.open(&paths.data_defrag(), Access::ReadWrite).unwrap();
            leftover.write_all(b"half written").unwrap();
        }

        recover(&fs, &paths).unwrap();
        assert_eq!(fs.contents(&paths.data).unwrap(), data);
        assert_no_swap_files(&fs, &paths);
    }

    #[test]
    fn unknown_entity() {
        let fs = MemoryFileSystem::new();
        let result = Defragmentator::new(&fs, Path::new("/store")).defragment_data_file("Nope");
        assert!(matches!(result, Err(Error::UnknownEntity(_))));
    }
}

//! Read-only accounting of dead space in an entity's files.
//!
//! Primary-key file: every tombstoned record is dead. Data file: everything that is not
//! part of a live record's current block is dead, and inside a current block so are the
//! entries of fields the schema no longer declares.

use std::fmt;

use crate::{
    data_file::DataFile,
    error::Result,
    file_system::{Access, FileSystem},
    helper::EntityPaths,
    primary_key_file::PrimaryKeyFile,
    schema::EntitySchema,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FileStatistics {
    pub file_name: String,
    pub total_bytes: u64,
    pub dead_bytes: u64,
    /// `0.0` for an empty file.
    pub dead_percent: f64,
}

impl FileStatistics {
    pub fn new(file_name: impl Into<String>, total_bytes: u64, dead_bytes: u64) -> Self {
        let dead_percent = if total_bytes == 0 {
            0.0
        } else {
            dead_bytes as f64 * 100.0 / total_bytes as f64
        };
        Self {
            file_name: file_name.into(),
            total_bytes,
            dead_bytes,
            dead_percent,
        }
    }
}

impl fmt::Display for FileStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes, {} dead ({:.1}%)",
            self.file_name, self.total_bytes, self.dead_bytes, self.dead_percent
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionStatistics {
    pub primary_key: FileStatistics,
    pub data: FileStatistics,
    pub live_records: u64,
    pub deleted_records: u64,
}

/// Measures the files of `schema`'s entity without modifying them. Missing files count
/// as empty.
pub fn collect(
    fs: &dyn FileSystem,
    paths: &EntityPaths,
    schema: &EntitySchema,
) -> Result<CollectionStatistics> {
    let pk_name = file_name(&paths.primary_key);
    let data_name = file_name(&paths.data);
    if !fs.exists(&paths.primary_key) {
        return Ok(CollectionStatistics {
            primary_key: FileStatistics::new(pk_name, 0, 0),
            data: FileStatistics::new(data_name, 0, 0),
            live_records: 0,
            deleted_records: 0,
        });
    }

    let mut primary_keys = PrimaryKeyFile::open(
        fs,
        &paths.primary_key,
        schema.primary_key().field_type,
        Access::Read,
    )?;
    let entries = primary_keys.get_all()?;
    let deleted_records = entries.iter().filter(|entry| entry.is_deleted).count() as u64;
    let live_records = entries.len() as u64 - deleted_records;
    let primary_key = FileStatistics::new(
        pk_name,
        primary_keys.len()?,
        deleted_records * primary_keys.record_size(),
    );

    let (data_total, live_bytes) = if fs.exists(&paths.data) {
        let mut data = DataFile::open(fs, &paths.data, schema, Access::Read)?;
        let current = schema.field_numbers();
        let mut live_bytes = 0;
        for entry in entries.iter().filter(|entry| !entry.is_deleted) {
            let range = entry.range();
            live_bytes += range.len() - data.unused_fields_size(range, &current)?;
        }
        (data.len()?, live_bytes)
    } else {
        (0, 0)
    };

    Ok(CollectionStatistics {
        primary_key,
        data: FileStatistics::new(data_name, data_total, data_total.saturating_sub(live_bytes)),
        live_records,
        deleted_records,
    })
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        file_system::MemoryFileSystem,
        schema::FieldValues,
        value::{FieldType, Value},
    };

    fn schema() -> EntitySchema {
        EntitySchema::builder("Item")
            .key(0, "id", FieldType::U32)
            .field(1, "label", FieldType::String)
            .build()
            .unwrap()
    }

    #[test]
    fn percent_of_empty_file_is_zero() {
        let stats = FileStatistics::new("Item.pk", 0, 0);
        assert_eq!(stats.dead_percent, 0.0);
        assert_eq!(FileStatistics::new("Item.dat", 200, 50).dead_percent, 25.0);
    }

    #[test]
    fn missing_files_are_empty() {
        let fs = MemoryFileSystem::new();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        let stats = collect(&fs, &paths, &schema()).unwrap();
        assert_eq!(stats.primary_key.file_name, "Item.pk");
        assert_eq!(stats.data.total_bytes, 0);
        assert_eq!(stats.live_records, 0);
    }

    #[test]
    fn counts_superseded_blocks_and_tombstones() {
        let fs = MemoryFileSystem::new();
        let schema = schema();
        let paths = EntityPaths::build(Path::new("/store"), "Item");
        {
            let mut primary_keys =
                PrimaryKeyFile::open(&fs, &paths.primary_key, FieldType::U32, Access::ReadWrite)
                    .unwrap();
            let mut data = DataFile::open(&fs, &paths.data, &schema, Access::ReadWrite).unwrap();

            let short = FieldValues::from([(1, Value::from("a"))]);
            let long = FieldValues::from([(1, Value::from("a much longer label"))]);
            let range = data.insert(&short).unwrap();
            let mut kept = primary_keys.insert(&Value::U32(1), range).unwrap();
            let range = data.update(&long).unwrap();
            primary_keys.update_offsets(&mut kept, range).unwrap();

            let range = data.insert(&short).unwrap();
            let mut gone = primary_keys.insert(&Value::U32(2), range).unwrap();
            primary_keys.mark_deleted(&mut gone).unwrap();
        }

        let stats = collect(&fs, &paths, &schema).unwrap();
        assert_eq!(stats.live_records, 1);
        assert_eq!(stats.deleted_records, 1);
        assert_eq!(stats.primary_key.total_bytes, 2 * 21);
        assert_eq!(stats.primary_key.dead_percent, 50.0);
        // Two short blocks of 6 bytes are dead, the long block is live.
        assert_eq!(stats.data.dead_bytes, 12);
        assert_eq!(stats.data.total_bytes, 12 + 5 + 19);
    }
}

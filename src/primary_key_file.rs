//! Primary-key file: one fixed-width record per inserted entity, in insertion order.
//!
//! ```text
//! +-------------------+-------------+-------------------+-----------------+
//! | key (fixed width) | deleted: u8 | start_offset: i64 | end_offset: i64 |
//! +-------------------+-------------+-------------------+-----------------+
//! ```
//!
//! Records are rewritten in place when an entity is updated (new offsets) or deleted (flag),
//! and only disappear when the file is defragmented. The file cannot be searched by key;
//! callers read it once with [`PrimaryKeyFile::get_all`] and keep their own map.

use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::warn;

use crate::{
    data_file::BlockRange,
    encoding::ByteReader,
    error::{Error, Result},
    file_system::{Access, FileSystem, StorageFile},
    value::{FieldType, Value},
};

const FLAG_SIZE: u64 = 1;
const OFFSET_SIZE: u64 = 8;

/// One record of the primary-key file.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyEntry {
    pub value: Value,
    pub is_deleted: bool,
    pub start_offset: i64,
    pub end_offset: i64,
    /// Byte offset of this record inside the primary-key file.
    pub position: u64,
}

impl PrimaryKeyEntry {
    pub fn range(&self) -> BlockRange {
        BlockRange {
            start_offset: self.start_offset,
            end_offset: self.end_offset,
        }
    }
}

/// Size of one record for a key of `key_type`, `None` if the type has no fixed width.
pub fn record_size(key_type: FieldType) -> Option<u64> {
    key_type
        .fixed_width()
        .map(|width| width as u64 + FLAG_SIZE + 2 * OFFSET_SIZE)
}

/// An open primary-key file. Dropping it flushes pending writes.
pub struct PrimaryKeyFile {
    file: Box<dyn StorageFile>,
    path: PathBuf,
    key_type: FieldType,
    key_width: u64,
    access: Access,
    sync: bool,
}

impl PrimaryKeyFile {
    pub fn open(
        fs: &dyn FileSystem,
        path: &Path,
        key_type: FieldType,
        access: Access,
    ) -> Result<Self> {
        let key_width = key_type.fixed_width().ok_or_else(|| {
            Error::definition(format!(
                "primary key type {key_type:?} has no fixed width"
            ))
        })? as u64;

        let file = fs.open(path, access)?;
        let pk_file = Self {
            file,
            path: path.to_path_buf(),
            key_type,
            key_width,
            access,
            sync: false,
        };

        let len = pk_file.len()?;
        if len % pk_file.record_size() != 0 {
            return Err(Error::corrupted(format!(
                "{}: length {} is not a multiple of the {}-byte record size",
                path.display(),
                len,
                pk_file.record_size()
            )));
        }
        Ok(pk_file)
    }

    /// `sync_data` on every flush.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> u64 {
        self.key_width + FLAG_SIZE + 2 * OFFSET_SIZE
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Appends a live record pointing at `range`.
    pub fn insert(&mut self, key: &Value, range: BlockRange) -> Result<PrimaryKeyEntry> {
        self.ensure_writable()?;
        check_range(range)?;

        let mut record = Vec::with_capacity(self.record_size() as usize);
        self.key_type.write(key, &mut record)?;
        record.push(0);
        record.extend_from_slice(&range.start_offset.to_le_bytes());
        record.extend_from_slice(&range.end_offset.to_le_bytes());

        let position = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record)?;

        Ok(PrimaryKeyEntry {
            value: key.coerce(self.key_type)?,
            is_deleted: false,
            start_offset: range.start_offset,
            end_offset: range.end_offset,
            position,
        })
    }

    /// Sets the deleted flag of `entry` in place.
    pub fn mark_deleted(&mut self, entry: &mut PrimaryKeyEntry) -> Result<()> {
        self.ensure_writable()?;
        self.file
            .seek(SeekFrom::Start(entry.position + self.key_width))?;
        self.file.write_all(&[1])?;
        entry.is_deleted = true;
        Ok(())
    }

    /// Points `entry` at a new block.
    pub fn update_offsets(&mut self, entry: &mut PrimaryKeyEntry, range: BlockRange) -> Result<()> {
        self.ensure_writable()?;
        check_range(range)?;

        let mut offsets = [0u8; 16];
        offsets[..8].copy_from_slice(&range.start_offset.to_le_bytes());
        offsets[8..].copy_from_slice(&range.end_offset.to_le_bytes());

        self.file
            .seek(SeekFrom::Start(entry.position + self.key_width + FLAG_SIZE))?;
        self.file.write_all(&offsets)?;

        entry.start_offset = range.start_offset;
        entry.end_offset = range.end_offset;
        Ok(())
    }

    /// Every record in file order, tombstones included.
    pub fn get_all(&mut self) -> Result<Vec<PrimaryKeyEntry>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;

        let record_size = self.record_size() as usize;
        let mut entries = Vec::with_capacity(bytes.len() / record_size);
        for (index, record) in bytes.chunks_exact(record_size).enumerate() {
            let mut reader = ByteReader::new(record);
            let value = self.key_type.read(&mut reader)?;
            let is_deleted = match reader.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(Error::corrupted(format!(
                        "{}: record {index} has deleted flag {other}",
                        self.path.display()
                    )))
                }
            };
            let start_offset = reader.read_i64()?;
            let end_offset = reader.read_i64()?;
            if start_offset < 0 || start_offset > end_offset {
                return Err(Error::corrupted(format!(
                    "{}: record {index} has range {start_offset}..{end_offset}",
                    self.path.display()
                )));
            }
            entries.push(PrimaryKeyEntry {
                value,
                is_deleted,
                start_offset,
                end_offset,
                position: (index * record_size) as u64,
            });
        }
        Ok(entries)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        if self.sync {
            self.file.sync()?;
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.access {
            Access::ReadWrite => Ok(()),
            Access::Read => Err(Error::ReadOnly(self.path.clone())),
        }
    }
}

impl Drop for PrimaryKeyFile {
    fn drop(&mut self) {
        if self.access == Access::ReadWrite {
            if let Err(e) = self.flush() {
                warn!("failed to flush {}: {}", self.path.display(), e);
            }
        }
    }
}

fn check_range(range: BlockRange) -> Result<()> {
    if range.start_offset < 0 || range.start_offset > range.end_offset {
        return Err(Error::corrupted(format!(
            "invalid block range {}..{}",
            range.start_offset, range.end_offset
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_system::MemoryFileSystem;

    fn range(start: i64, end: i64) -> BlockRange {
        BlockRange {
            start_offset: start,
            end_offset: end,
        }
    }

    fn open(fs: &MemoryFileSystem, access: Access) -> PrimaryKeyFile {
        PrimaryKeyFile::open(fs, Path::new("/store/Person.pk"), FieldType::I32, access).unwrap()
    }

    #[test]
    fn record_size_follows_key_type() {
        assert_eq!(record_size(FieldType::I32), Some(21));
        assert_eq!(record_size(FieldType::U64), Some(25));
        assert_eq!(record_size(FieldType::Bool), Some(18));
        assert_eq!(record_size(FieldType::String), None);
    }

    #[test]
    fn insert_then_get_all() {
        let fs = MemoryFileSystem::new();
        let mut pk = open(&fs, Access::ReadWrite);

        let first = pk.insert(&Value::I32(10), range(0, 12)).unwrap();
        let second = pk.insert(&Value::I64(5), range(12, 30)).unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 21);
        drop(pk);

        let all = open(&fs, Access::Read).get_all().unwrap();
        assert_eq!(all, vec![first, second]);
        assert_eq!(all[1].value.field_type(), Some(FieldType::I32));
    }

    #[test]
    fn mark_deleted_and_update_offsets_rewrite_in_place() {
        let fs = MemoryFileSystem::new();
        let mut pk = open(&fs, Access::ReadWrite);
        let mut first = pk.insert(&Value::I32(1), range(0, 10)).unwrap();
        let mut second = pk.insert(&Value::I32(2), range(10, 20)).unwrap();

        pk.mark_deleted(&mut first).unwrap();
        pk.update_offsets(&mut second, range(20, 45)).unwrap();
        assert_eq!(pk.len().unwrap(), 42);
        drop(pk);

        let all = open(&fs, Access::Read).get_all().unwrap();
        assert!(all[0].is_deleted);
        assert_eq!(all[0].range(), range(0, 10));
        assert!(!all[1].is_deleted);
        assert_eq!(all[1].range(), range(20, 45));
    }

    #[test]
    fn read_session_rejects_writes() {
        let fs = MemoryFileSystem::new();
        open(&fs, Access::ReadWrite);

        let mut pk = open(&fs, Access::Read);
        assert!(matches!(
            pk.insert(&Value::I32(1), range(0, 1)),
            Err(Error::ReadOnly(_))
        ));
    }

    #[test]
    fn rejects_inverted_range() {
        let fs = MemoryFileSystem::new();
        let mut pk = open(&fs, Access::ReadWrite);
        assert!(pk.insert(&Value::I32(1), range(10, 5)).is_err());
        assert!(pk.is_empty().unwrap());
    }

    #[test]
    fn torn_file_is_corrupted() {
        let fs = MemoryFileSystem::new();
        let path = Path::new("/store/Person.pk");
        fs.open(path, Access::ReadWrite)
            .unwrap()
            .write_all(&[0; 30])
            .unwrap();

        let result = PrimaryKeyFile::open(&fs, path, FieldType::I32, Access::Read);
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }
}

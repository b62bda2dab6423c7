//! Data file: append-only field blocks.
//!
//! A block is the sequence of entries written for one version of one record:
//!
//! ```text
//! +------------------+-------------+---------------------+
//! | field_number: u8 | length: u32 | payload (length B)  |
//! +------------------+-------------+---------------------+
//! ```
//!
//! Blocks are never modified. An update appends a new block and the old one becomes dead
//! space until the file is defragmented. Entries are skipped by length, so a block may
//! carry fields that the current schema no longer declares.

use std::{
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::warn;

use crate::{
    encoding::{write_prefixed, ByteReader},
    error::{Error, Result},
    file_system::{Access, FileSystem, StorageFile},
    schema::{EntitySchema, FieldDefinition, FieldSet, FieldValues},
};

const ENTRY_HEADER_SIZE: u64 = 5;

/// Byte range `[start_offset, end_offset)` of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start_offset: i64,
    pub end_offset: i64,
}

impl BlockRange {
    pub fn len(&self) -> u64 {
        (self.end_offset - self.start_offset) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.start_offset == self.end_offset
    }
}

/// One entry of a block, borrowed from the block bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockEntry<'a> {
    pub number: u8,
    pub payload: &'a [u8],
}

impl BlockEntry<'_> {
    /// Bytes the entry occupies in the file, header included.
    pub fn encoded_len(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.payload.len() as u64
    }
}

/// Splits a block into its entries without decoding any payload.
pub(crate) fn parse_block(block: &[u8]) -> Result<Vec<BlockEntry<'_>>> {
    let mut reader = ByteReader::new(block);
    let mut entries = Vec::new();
    while !reader.is_empty() {
        let number = reader.read_u8()?;
        let payload = reader.read_prefixed()?;
        entries.push(BlockEntry { number, payload });
    }
    Ok(entries)
}

/// Copy of `block` holding only the entries whose number is in `keep`.
pub(crate) fn retain_fields(block: &[u8], keep: &FieldSet) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(block.len());
    for entry in parse_block(block)? {
        if keep.contains(entry.number) {
            out.push(entry.number);
            write_prefixed(&mut out, entry.payload)?;
        }
    }
    Ok(out)
}

/// An open data file. Dropping it flushes pending writes.
pub struct DataFile {
    file: Box<dyn StorageFile>,
    path: PathBuf,
    entity: String,
    layout: BTreeMap<u8, FieldDefinition>,
    access: Access,
    sync: bool,
}

impl DataFile {
    /// Opens the data file of `schema`'s entity. The schema decides how payloads are
    /// encoded; fields it does not declare are still skipped correctly.
    pub fn open(
        fs: &dyn FileSystem,
        path: &Path,
        schema: &EntitySchema,
        access: Access,
    ) -> Result<Self> {
        let layout = schema
            .fields()
            .iter()
            .map(|definition| (definition.number, definition.clone()))
            .collect();
        Ok(Self {
            file: fs.open(path, access)?,
            path: path.to_path_buf(),
            entity: schema.name().to_string(),
            layout,
            access,
            sync: false,
        })
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Encodes `fields` as a block, in field-number order.
    pub fn encode_block(&self, fields: &FieldValues) -> Result<Vec<u8>> {
        let mut block = Vec::new();
        for (&number, value) in fields {
            if value.is_null() {
                continue;
            }
            let definition = self.layout.get(&number).ok_or_else(|| Error::UnknownField {
                entity: self.entity.clone(),
                number,
            })?;

            let raw = definition.field_type.encode_raw(value)?;
            let payload = if definition.compressed {
                lz4_flex::compress_prepend_size(&raw)
            } else {
                raw
            };
            block.push(number);
            write_prefixed(&mut block, &payload)?;
        }
        Ok(block)
    }

    /// Appends a new block for `fields` and returns where it landed.
    pub fn insert(&mut self, fields: &FieldValues) -> Result<BlockRange> {
        let block = self.encode_block(fields)?;
        self.append_block(&block)
    }

    /// Writes the new state of a record as a fresh block. The caller points the
    /// primary-key entry at the returned range; the previous block is left as dead space.
    pub fn update(&mut self, fields: &FieldValues) -> Result<BlockRange> {
        self.insert(fields)
    }

    /// Appends already-encoded block bytes.
    pub fn append_block(&mut self, block: &[u8]) -> Result<BlockRange> {
        self.ensure_writable()?;
        let start = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(block)?;
        Ok(BlockRange {
            start_offset: start as i64,
            end_offset: (start + block.len() as u64) as i64,
        })
    }

    /// Raw bytes of the block at `range`.
    pub fn read_block(&mut self, range: BlockRange) -> Result<Vec<u8>> {
        let len = self.len()?;
        if range.start_offset < 0
            || range.start_offset > range.end_offset
            || range.end_offset as u64 > len
        {
            return Err(Error::corrupted(format!(
                "{}: block {}..{} is outside the {} byte file",
                self.path.display(),
                range.start_offset,
                range.end_offset,
                len
            )));
        }

        let mut block = vec![0; range.len() as usize];
        self.file.seek(SeekFrom::Start(range.start_offset as u64))?;
        self.file.read_exact(&mut block)?;
        Ok(block)
    }

    /// Decodes the fields of `wanted` present in the block. Wanted fields missing from the
    /// block are absent from the result; other entries are skipped undecoded.
    pub fn read_fields(&mut self, range: BlockRange, wanted: &FieldSet) -> Result<FieldValues> {
        let block = self.read_block(range)?;
        let mut fields = FieldValues::new();
        for entry in parse_block(&block)? {
            if !wanted.contains(entry.number) {
                continue;
            }
            // Undeclared fields cannot be decoded without a type.
            let Some(definition) = self.layout.get(&entry.number) else {
                continue;
            };

            let value = if definition.compressed {
                let raw = lz4_flex::decompress_size_prepended(entry.payload).map_err(|e| {
                    Error::corrupted(format!(
                        "{}: field {} does not decompress: {}",
                        self.path.display(),
                        entry.number,
                        e
                    ))
                })?;
                definition.field_type.decode_raw(&raw)?
            } else {
                definition.field_type.decode_raw(entry.payload)?
            };
            fields.insert(entry.number, value);
        }
        Ok(fields)
    }

    /// Bytes in the block taken by entries whose number is not in `current`.
    pub fn unused_fields_size(&mut self, range: BlockRange, current: &FieldSet) -> Result<u64> {
        let block = self.read_block(range)?;
        Ok(parse_block(&block)?
            .iter()
            .filter(|entry| !current.contains(entry.number))
            .map(BlockEntry::encoded_len)
            .sum())
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

impl Drop for DataFile {
    fn drop(&mut self) {
        if self.access == Access::ReadWrite {
            if let Err(e) = self.flush() {
                warn!("failed to flush {}: {}", self.path.display(), e);
            }
        }
    }
}

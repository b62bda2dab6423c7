//! Wire format for [`RedBlackTree`].
//!
//! A tree is written depth first, node before left subtree before right subtree. Each node
//! is:
//!
//! ```text
//! +-----------+----------------+------------------+-----------------+
//! | flags: u8 | key (per type) | payload len: u32 | payload bytes   |
//! +-----------+----------------+------------------+-----------------+
//! ```
//!
//! `flags` bit 0 is the color (set = red), bit 1 marks a left child, bit 2 a right child.
//! An empty tree is the single byte [`EMPTY_TREE`], which no node flag byte can equal.
//!
//! Colors are stored as they are, so a decoded tree has exactly the shape it was written
//! with and needs no rebalancing.

use crate::{
    encoding::{write_prefixed, ByteReader},
    error::{Error, Result},
    value::{FieldType, Value},
};

use super::{Color, NodeId, RedBlackTree, Side};

/// Sole byte of an encoded empty tree.
pub const EMPTY_TREE: u8 = 0xFF;

const RED: u8 = 0b001;
const HAS_LEFT: u8 = 0b010;
const HAS_RIGHT: u8 = 0b100;
const FLAG_MASK: u8 = RED | HAS_LEFT | HAS_RIGHT;

/// Encodes tree keys. The encoding must be self-delimiting.
pub trait KeyCodec<K> {
    fn write_key(&self, key: &K, out: &mut Vec<u8>) -> Result<()>;
    fn read_key(&self, reader: &mut ByteReader<'_>) -> Result<K>;
}

/// Encodes tree values. The tree frames the bytes with a length, so the encoding need not
/// be self-delimiting.
pub trait PayloadCodec<V> {
    fn write_payload(&self, value: &V, out: &mut Vec<u8>) -> Result<()>;
    fn read_payload(&self, bytes: &[u8]) -> Result<V>;
}

/// Keys of a declared field type; `Null` keys are allowed.
impl KeyCodec<Value> for FieldType {
    fn write_key(&self, key: &Value, out: &mut Vec<u8>) -> Result<()> {
        self.write_nullable(key, out)
    }

    fn read_key(&self, reader: &mut ByteReader<'_>) -> Result<Value> {
        self.read_nullable(reader)
    }
}

pub fn serialize<K, V>(
    tree: &RedBlackTree<K, V>,
    keys: &impl KeyCodec<K>,
    payloads: &impl PayloadCodec<V>,
    out: &mut Vec<u8>,
) -> Result<()> {
    if tree.is_empty() {
        out.push(EMPTY_TREE);
        return Ok(());
    }

    let mut payload = Vec::new();
    for node in tree.pre_order() {
        let mut flags = 0;
        if node.color == Color::Red {
            flags |= RED;
        }
        if node.has_left {
            flags |= HAS_LEFT;
        }
        if node.has_right {
            flags |= HAS_RIGHT;
        }
        out.push(flags);
        keys.write_key(node.key, out)?;

        payload.clear();
        payloads.write_payload(node.value, &mut payload)?;
        write_prefixed(out, &payload)?;
    }
    Ok(())
}

pub fn deserialize<K, V>(
    reader: &mut ByteReader<'_>,
    keys: &impl KeyCodec<K>,
    payloads: &impl PayloadCodec<V>,
) -> Result<RedBlackTree<K, V>> {
    let mut tree = RedBlackTree::new();
    match reader.peek_u8() {
        None => return Err(Error::corrupted("tree stream is empty")),
        Some(EMPTY_TREE) => {
            reader.read_u8()?;
            return Ok(tree);
        }
        Some(_) => {}
    }

    // Slots still waiting for a node, most recent on top. Right is pushed before left so
    // the left subtree is read first.
    let mut pending: Vec<Option<(NodeId, Side)>> = vec![None];
    while let Some(slot) = pending.pop() {
        let offset = reader.position();
        let flags = reader.read_u8()?;
        if flags & !FLAG_MASK != 0 {
            return Err(Error::corrupted(format!(
                "invalid node flags {flags:#04x} at offset {offset}"
            )));
        }

        let key = keys.read_key(reader)?;
        let value = payloads.read_payload(reader.read_prefixed()?)?;
        let color = if flags & RED != 0 {
            Color::Red
        } else {
            Color::Black
        };

        let id = tree.attach(slot, key, value, color);
        if flags & HAS_RIGHT != 0 {
            pending.push(Some((id, Side::Right)));
        }
        if flags & HAS_LEFT != 0 {
            pending.push(Some((id, Side::Left)));
        }
    }
    Ok(tree)
}

//! Typed field values and their binary encodings.
//!
//! Every field carries a declared [`FieldType`]. The type decides, once, how values of
//! that field are laid out on disk:
//!
//! - fixed width for booleans, chars and numbers,
//! - a `u32` length prefix plus UTF-8 (or raw bytes) for text and blobs,
//! - a length-prefixed `serde_json` document for structured types (`DateTime`).
//!
//! [`Value`] orders numbers by magnitude regardless of their width, so a 32-bit `10` and a
//! 64-bit `10` land in the same index bucket.

use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    encoding::{write_prefixed, ByteReader},
    error::{Error, Result},
};

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Bytes,
    DateTime,
}

/// How values of a [`FieldType`] are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Always exactly this many bytes.
    Fixed(usize),
    /// `u32` length followed by the bytes.
    LengthPrefixed,
    /// `u32` length followed by a serialized document.
    Structured,
}

impl FieldType {
    const ALL: [FieldType; 15] = [
        FieldType::Bool,
        FieldType::Char,
        FieldType::I8,
        FieldType::U8,
        FieldType::I16,
        FieldType::U16,
        FieldType::I32,
        FieldType::U32,
        FieldType::I64,
        FieldType::U64,
        FieldType::F32,
        FieldType::F64,
        FieldType::String,
        FieldType::Bytes,
        FieldType::DateTime,
    ];

    pub const fn encoding(self) -> Encoding {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Encoding::Fixed(1),
            Self::I16 | Self::U16 => Encoding::Fixed(2),
            Self::Char | Self::I32 | Self::U32 | Self::F32 => Encoding::Fixed(4),
            Self::I64 | Self::U64 | Self::F64 => Encoding::Fixed(8),
            Self::String | Self::Bytes => Encoding::LengthPrefixed,
            Self::DateTime => Encoding::Structured,
        }
    }

    pub const fn fixed_width(self) -> Option<usize> {
        match self.encoding() {
            Encoding::Fixed(width) => Some(width),
            _ => None,
        }
    }

    /// Only variable-length payloads are worth compressing.
    pub const fn is_compressible(self) -> bool {
        matches!(self, Self::String | Self::Bytes)
    }

    pub(crate) fn tag(self) -> u8 {
        Self::ALL
            .iter()
            .position(|t| *t == self)
            .map(|p| p as u8)
            .unwrap_or(u8::MAX)
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or_else(|| Error::corrupted(format!("unknown field type tag {tag}")))
    }

    /// Encodes `value` without any framing. The caller knows the length.
    pub fn encode_raw(self, value: &Value) -> Result<Vec<u8>> {
        let value = value.coerce(self)?;
        let bytes = match value {
            Value::Null => {
                return Err(Error::TypeMismatch {
                    expected: self,
                    actual: "null".to_string(),
                })
            }
            Value::Bool(v) => vec![v as u8],
            Value::Char(v) => (v as u32).to_le_bytes().to_vec(),
            Value::I8(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::String(v) => v.into_bytes(),
            Value::Bytes(v) => v,
            Value::DateTime(v) => serde_json::to_vec(&v)?,
        };
        Ok(bytes)
    }

    /// Decodes a payload produced by [`FieldType::encode_raw`].
    pub fn decode_raw(self, bytes: &[u8]) -> Result<Value> {
        if let Some(width) = self.fixed_width() {
            if bytes.len() != width {
                return Err(Error::corrupted(format!(
                    "{self:?} payload must be {width} bytes, found {}",
                    bytes.len()
                )));
            }
        }

        let mut reader = ByteReader::new(bytes);
        let value = match self {
            Self::Bool => Value::Bool(reader.read_u8()? != 0),
            Self::Char => {
                let code = u32::from_le_bytes(reader.read_array()?);
                Value::Char(char::from_u32(code).ok_or_else(|| {
                    Error::corrupted(format!("invalid char code point {code:#x}"))
                })?)
            }
            Self::I8 => Value::I8(i8::from_le_bytes(reader.read_array()?)),
            Self::U8 => Value::U8(reader.read_u8()?),
            Self::I16 => Value::I16(i16::from_le_bytes(reader.read_array()?)),
            Self::U16 => Value::U16(u16::from_le_bytes(reader.read_array()?)),
            Self::I32 => Value::I32(i32::from_le_bytes(reader.read_array()?)),
            Self::U32 => Value::U32(reader.read_u32()?),
            Self::I64 => Value::I64(reader.read_i64()?),
            Self::U64 => Value::U64(u64::from_le_bytes(reader.read_array()?)),
            Self::F32 => Value::F32(f32::from_le_bytes(reader.read_array()?)),
            Self::F64 => Value::F64(f64::from_le_bytes(reader.read_array()?)),
            Self::String => Value::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::corrupted(format!("invalid UTF-8 string: {e}")))?,
            ),
            Self::Bytes => Value::Bytes(bytes.to_vec()),
            Self::DateTime => Value::DateTime(serde_json::from_slice(bytes)?),
        };
        Ok(value)
    }

    /// Writes a self-delimiting encoding: raw for fixed-width types, length-prefixed otherwise.
    pub fn write(self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let raw = self.encode_raw(value)?;
        match self.encoding() {
            Encoding::Fixed(_) => out.extend_from_slice(&raw),
            Encoding::LengthPrefixed | Encoding::Structured => write_prefixed(out, &raw)?,
        }
        Ok(())
    }

    pub fn read(self, reader: &mut ByteReader<'_>) -> Result<Value> {
        match self.encoding() {
            Encoding::Fixed(width) => self.decode_raw(reader.read_bytes(width)?),
            Encoding::LengthPrefixed | Encoding::Structured => {
                self.decode_raw(reader.read_prefixed()?)
            }
        }
    }

    /// Like [`FieldType::write`], preceded by a presence byte so `Null` can be stored.
    pub fn write_nullable(self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        if value.is_null() {
            out.push(0);
            return Ok(());
        }
        out.push(1);
        self.write(value, out)
    }

    pub fn read_nullable(self, reader: &mut ByteReader<'_>) -> Result<Value> {
        match reader.read_u8()? {
            0 => Ok(Value::Null),
            1 => self.read(reader),
            other => Err(Error::corrupted(format!("invalid presence byte {other}"))),
        }
    }
}

/// A single field value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Char(char),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type this value carries, `None` for `Null`.
    pub fn field_type(&self) -> Option<FieldType> {
        let field_type = match self {
            Value::Null => return None,
            Value::Bool(_) => FieldType::Bool,
            Value::Char(_) => FieldType::Char,
            Value::I8(_) => FieldType::I8,
            Value::U8(_) => FieldType::U8,
            Value::I16(_) => FieldType::I16,
            Value::U16(_) => FieldType::U16,
            Value::I32(_) => FieldType::I32,
            Value::U32(_) => FieldType::U32,
            Value::I64(_) => FieldType::I64,
            Value::U64(_) => FieldType::U64,
            Value::F32(_) => FieldType::F32,
            Value::F64(_) => FieldType::F64,
            Value::String(_) => FieldType::String,
            Value::Bytes(_) => FieldType::Bytes,
            Value::DateTime(_) => FieldType::DateTime,
        };
        Some(field_type)
    }

    fn type_name(&self) -> String {
        match self.field_type() {
            Some(field_type) => format!("{field_type:?}"),
            None => "null".to_string(),
        }
    }

    /// Converts the value to `target` when that loses nothing.
    ///
    /// Numbers move freely between widths as long as the magnitude fits; `Null` is
    /// returned unchanged.
    pub fn coerce(&self, target: FieldType) -> Result<Value> {
        if self.is_null() || self.field_type() == Some(target) {
            return Ok(self.clone());
        }
        let coerced = match self.numeric() {
            Some(Numeric::Int(i)) => int_to(i, target),
            Some(Numeric::Float(f)) => float_to(f, target),
            None => None,
        };
        coerced.ok_or_else(|| Error::TypeMismatch {
            expected: target,
            actual: format!("{} ({})", self.type_name(), self),
        })
    }

    /// Parses user input (CLI arguments) as a value of `field_type`.
    pub fn parse(field_type: FieldType, input: &str) -> Result<Value> {
        let mismatch = || Error::TypeMismatch {
            expected: field_type,
            actual: format!("'{input}'"),
        };
        let value = match field_type {
            FieldType::Bool => Value::Bool(input.parse().map_err(|_| mismatch())?),
            FieldType::Char => {
                let mut chars = input.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Value::Char(c),
                    _ => return Err(mismatch()),
                }
            }
            FieldType::I8 => Value::I8(input.parse().map_err(|_| mismatch())?),
            FieldType::U8 => Value::U8(input.parse().map_err(|_| mismatch())?),
            FieldType::I16 => Value::I16(input.parse().map_err(|_| mismatch())?),
            FieldType::U16 => Value::U16(input.parse().map_err(|_| mismatch())?),
            FieldType::I32 => Value::I32(input.parse().map_err(|_| mismatch())?),
            FieldType::U32 => Value::U32(input.parse().map_err(|_| mismatch())?),
            FieldType::I64 => Value::I64(input.parse().map_err(|_| mismatch())?),
            FieldType::U64 => Value::U64(input.parse().map_err(|_| mismatch())?),
            FieldType::F32 => Value::F32(input.parse().map_err(|_| mismatch())?),
            FieldType::F64 => Value::F64(input.parse().map_err(|_| mismatch())?),
            FieldType::String => Value::String(input.to_string()),
            FieldType::Bytes => Value::Bytes(input.as_bytes().to_vec()),
            FieldType::DateTime => Value::DateTime(
                DateTime::parse_from_rfc3339(input)
                    .map_err(|_| mismatch())?
                    .with_timezone(&Utc),
            ),
        };
        Ok(value)
    }

    fn numeric(&self) -> Option<Numeric> {
        let numeric = match *self {
            Value::I8(v) => Numeric::Int(v.into()),
            Value::U8(v) => Numeric::Int(v.into()),
            Value::I16(v) => Numeric::Int(v.into()),
            Value::U16(v) => Numeric::Int(v.into()),
            Value::I32(v) => Numeric::Int(v.into()),
            Value::U32(v) => Numeric::Int(v.into()),
            Value::I64(v) => Numeric::Int(v.into()),
            Value::U64(v) => Numeric::Int(v.into()),
            Value::F32(v) => Numeric::Float(v.into()),
            Value::F64(v) => Numeric::Float(v),
            _ => return None,
        };
        Some(numeric)
    }

    /// Ordering between values of unrelated types.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::I8(_)
            | Value::U8(_)
            | Value::I16(_)
            | Value::U16(_)
            | Value::I32(_)
            | Value::U32(_)
            | Value::I64(_)
            | Value::U64(_)
            | Value::F32(_)
            | Value::F64(_) => 2,
            Value::Char(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::DateTime(_) => 6,
        }
    }
}

fn int_to(i: i128, target: FieldType) -> Option<Value> {
    let value = match target {
        FieldType::I8 => Value::I8(i8::try_from(i).ok()?),
        FieldType::U8 => Value::U8(u8::try_from(i).ok()?),
        FieldType::I16 => Value::I16(i16::try_from(i).ok()?),
        FieldType::U16 => Value::U16(u16::try_from(i).ok()?),
        FieldType::I32 => Value::I32(i32::try_from(i).ok()?),
        FieldType::U32 => Value::U32(u32::try_from(i).ok()?),
        FieldType::I64 => Value::I64(i64::try_from(i).ok()?),
        FieldType::U64 => Value::U64(u64::try_from(i).ok()?),
        FieldType::F32 => {
            let f = i as f32;
            (f as i128 == i).then_some(Value::F32(f))?
        }
        FieldType::F64 => {
            let f = i as f64;
            (f as i128 == i).then_some(Value::F64(f))?
        }
        _ => return None,
    };
    Some(value)
}

fn float_to(f: f64, target: FieldType) -> Option<Value> {
    match target {
        FieldType::F64 => Some(Value::F64(f)),
        FieldType::F32 => {
            let narrowed = f as f32;
            (f64::from(narrowed) == f || f.is_nan()).then_some(Value::F32(narrowed))
        }
        _ if f.fract() == 0.0 && f.abs() < 1.0e38 => int_to(f as i128, target),
        _ => None,
    }
}

fn compare_numeric(a: Numeric, b: Numeric) -> Ordering {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x.cmp(&y),
        (Numeric::Float(x), Numeric::Float(y)) => match (x.is_nan(), y.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        },
        (Numeric::Int(x), Numeric::Float(y)) => compare_int_float(x, y),
        (Numeric::Float(x), Numeric::Int(y)) => compare_int_float(y, x).reverse(),
    }
}

fn compare_int_float(i: i128, f: f64) -> Ordering {
    // Every NaN, whatever its sign or payload, sorts above every number.
    if f.is_nan() {
        return Ordering::Less;
    }
    if f.fract() == 0.0 && f.abs() < 1.0e38 {
        i.cmp(&(f as i128))
    } else {
        (i as f64).partial_cmp(&f).unwrap_or(Ordering::Less)
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return compare_numeric(a, b);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Char(a), Value::Char(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

/// Equality used to pick index buckets and to detect changed fields.
///
/// Numbers of different widths are equal when their magnitudes are; `Null` only equals `Null`.
pub fn are_equals(a: &Value, b: &Value) -> bool {
    a == b
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Bytes(v) => {
                write!(f, "0x")?;
                v.iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
            Value::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

impl_from!(
    bool => Bool,
    char => Char,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Bytes,
    DateTime<Utc> => DateTime,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

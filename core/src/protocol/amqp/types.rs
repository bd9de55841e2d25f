//! Primitive AMQP value encodings: integers, strings, field tables and Xids.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::FramingError;

/// Longest value a short string can carry on the wire.
pub const MAX_SHORTSTR_LEN: usize = u8::MAX as usize;

/// The longest prefix of `value` that fits in a short string without
/// splitting a character.
pub fn clip_shortstr(value: &str) -> &str {
    let mut end = value.len().min(MAX_SHORTSTR_LEN);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Cursor over a borrowed payload with explicit-width reads.
///
/// Every read checks the remaining length first and reports a
/// [`FramingError::Truncated`] rather than panicking.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        let available = self.remaining();
        if available < n {
            return Err(FramingError::Truncated {
                needed: n,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_octet(&mut self) -> Result<u8, FramingError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_short(&mut self) -> Result<u16, FramingError> {
        Ok(self.take(2)?.get_u16())
    }

    pub fn read_long(&mut self) -> Result<u32, FramingError> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn read_longlong(&mut self) -> Result<u64, FramingError> {
        Ok(self.take(8)?.get_u64())
    }

    pub fn read_i8(&mut self) -> Result<i8, FramingError> {
        Ok(self.take(1)?.get_i8())
    }

    pub fn read_i16(&mut self) -> Result<i16, FramingError> {
        Ok(self.take(2)?.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32, FramingError> {
        Ok(self.take(4)?.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, FramingError> {
        Ok(self.take(8)?.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32, FramingError> {
        Ok(self.take(4)?.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64, FramingError> {
        Ok(self.take(8)?.get_f64())
    }

    /// One signed byte promoted to a native int.
    pub fn read_small_int(&mut self) -> Result<i32, FramingError> {
        self.read_i8().map(i32::from)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, FramingError> {
        self.take(n).map(Bytes::copy_from_slice)
    }

    pub fn read_shortstr(&mut self) -> Result<String, FramingError> {
        let len = self.read_octet()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| FramingError::malformed("short string", e.to_string()))
    }

    pub fn read_longstr(&mut self) -> Result<Bytes, FramingError> {
        let len = self.read_long()? as usize;
        self.read_bytes(len)
    }

    pub fn read_table(&mut self) -> Result<FieldTable, FramingError> {
        let len = self.read_long()? as usize;
        let mut inner = WireReader::new(self.take(len)?);
        let mut table = FieldTable::new();
        while inner.remaining() > 0 {
            let name = inner.read_shortstr()?;
            let value = inner.read_field_value()?;
            table.0.push((name, value));
        }
        Ok(table)
    }

    pub fn read_xid(&mut self) -> Result<Xid, FramingError> {
        let format = self.read_i64()?;
        let global_id = self.read_longstr()?;
        let branch_id = self.read_longstr()?;
        Ok(Xid {
            format,
            global_id,
            branch_id,
        })
    }

    fn read_array(&mut self) -> Result<Vec<FieldValue>, FramingError> {
        let len = self.read_long()? as usize;
        let mut inner = WireReader::new(self.take(len)?);
        let mut values = Vec::new();
        while inner.remaining() > 0 {
            values.push(inner.read_field_value()?);
        }
        Ok(values)
    }

    pub fn read_field_value(&mut self) -> Result<FieldValue, FramingError> {
        let tag = self.read_octet()?;
        Ok(match tag {
            b't' => FieldValue::Boolean(self.read_octet()? != 0),
            b'b' => FieldValue::ShortShortInt(self.read_small_int()?),
            b'B' => FieldValue::ShortShortUint(self.read_octet()?),
            b's' => FieldValue::ShortInt(self.read_i16()?),
            b'u' => FieldValue::ShortUint(self.read_short()?),
            b'I' => FieldValue::LongInt(self.read_i32()?),
            b'i' => FieldValue::LongUint(self.read_long()?),
            b'l' => FieldValue::LongLongInt(self.read_i64()?),
            b'f' => FieldValue::Float(self.read_f32()?),
            b'd' => FieldValue::Double(self.read_f64()?),
            b'D' => {
                let scale = self.read_octet()?;
                FieldValue::Decimal(scale, self.read_long()?)
            }
            b'S' => FieldValue::LongString(self.read_longstr()?),
            b'A' => FieldValue::Array(self.read_array()?),
            b'T' => FieldValue::Timestamp(self.read_longlong()?),
            b'F' => FieldValue::Table(self.read_table()?),
            b'V' => FieldValue::Void,
            b'x' => FieldValue::ByteArray(self.read_longstr()?),
            other => return Err(FramingError::UnknownFieldType(other as char)),
        })
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> Result<(), FramingError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(FramingError::TrailingBytes(n)),
        }
    }
}

/// Encoding helpers for the composite wire types.
pub trait WireWrite {
    fn put_shortstr(&mut self, value: &str);
    fn put_longstr(&mut self, value: &[u8]);
    fn put_table(&mut self, table: &FieldTable);
    fn put_field_value(&mut self, value: &FieldValue);
    fn put_xid(&mut self, xid: &Xid);
}

impl WireWrite for BytesMut {
    /// Callers bound free text with [`clip_shortstr`]; names are limited to
    /// 255 bytes when declared. Anything longer is clipped here as well.
    fn put_shortstr(&mut self, value: &str) {
        let value = clip_shortstr(value);
        self.put_u8(value.len() as u8);
        self.put_slice(value.as_bytes());
    }

    fn put_longstr(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    fn put_table(&mut self, table: &FieldTable) {
        let start = self.len();
        self.put_u32(0);
        for (name, value) in table.iter() {
            self.put_shortstr(name);
            self.put_field_value(value);
        }
        let size = (self.len() - start - 4) as u32;
        self[start..start + 4].copy_from_slice(&size.to_be_bytes());
    }

    fn put_field_value(&mut self, value: &FieldValue) {
        self.put_u8(value.tag());
        match value {
            FieldValue::Boolean(v) => self.put_u8(u8::from(*v)),
            FieldValue::ShortShortInt(v) => self.put_i8(*v as i8),
            FieldValue::ShortShortUint(v) => self.put_u8(*v),
            FieldValue::ShortInt(v) => self.put_i16(*v),
            FieldValue::ShortUint(v) => self.put_u16(*v),
            FieldValue::LongInt(v) => self.put_i32(*v),
            FieldValue::LongUint(v) => self.put_u32(*v),
            FieldValue::LongLongInt(v) => self.put_i64(*v),
            FieldValue::Float(v) => self.put_f32(*v),
            FieldValue::Double(v) => self.put_f64(*v),
            FieldValue::Decimal(scale, v) => {
                self.put_u8(*scale);
                self.put_u32(*v);
            }
            FieldValue::LongString(v) | FieldValue::ByteArray(v) => self.put_longstr(v),
            FieldValue::Array(values) => {
                let start = self.len();
                self.put_u32(0);
                for v in values {
                    self.put_field_value(v);
                }
                let size = (self.len() - start - 4) as u32;
                self[start..start + 4].copy_from_slice(&size.to_be_bytes());
            }
            FieldValue::Timestamp(v) => self.put_u64(*v),
            FieldValue::Table(t) => self.put_table(t),
            FieldValue::Void => {}
        }
    }

    fn put_xid(&mut self, xid: &Xid) {
        self.put_i64(xid.format);
        self.put_longstr(&xid.global_id);
        self.put_longstr(&xid.branch_id);
    }
}

/// A typed field-table value.
///
/// `ShortShortInt` holds the signed small int already promoted to `i32`; it is
/// narrowed back to one byte on encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i32),
    ShortShortUint(u8),
    ShortInt(i16),
    ShortUint(u16),
    LongInt(i32),
    LongUint(u32),
    LongLongInt(i64),
    Float(f32),
    Double(f64),
    Decimal(u8, u32),
    LongString(Bytes),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    ByteArray(Bytes),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            Self::Boolean(_) => b't',
            Self::ShortShortInt(_) => b'b',
            Self::ShortShortUint(_) => b'B',
            Self::ShortInt(_) => b's',
            Self::ShortUint(_) => b'u',
            Self::LongInt(_) => b'I',
            Self::LongUint(_) => b'i',
            Self::LongLongInt(_) => b'l',
            Self::Float(_) => b'f',
            Self::Double(_) => b'd',
            Self::Decimal(..) => b'D',
            Self::LongString(_) => b'S',
            Self::Array(_) => b'A',
            Self::Timestamp(_) => b'T',
            Self::Table(_) => b'F',
            Self::Void => b'V',
            Self::ByteArray(_) => b'x',
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::LongString(Bytes::from(value.into()))
    }

    /// Integral view across all integer widths.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::ShortShortInt(v) | Self::LongInt(v) => Some(i64::from(*v)),
            Self::ShortShortUint(v) => Some(i64::from(*v)),
            Self::ShortInt(v) => Some(i64::from(*v)),
            Self::ShortUint(v) => Some(i64::from(*v)),
            Self::LongUint(v) => Some(i64::from(*v)),
            Self::LongLongInt(v) => Some(*v),
            Self::Timestamp(v) => i64::try_from(*v).ok(),
            Self::LongString(s) => std::str::from_utf8(s).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Textual view of string-like values, and of numbers for sort keys.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::LongString(s) | Self::ByteArray(s) => {
                Some(String::from_utf8_lossy(s).into_owned())
            }
            Self::Boolean(b) => Some(b.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Double(v) => Some(v.to_string()),
            other => other.as_i64().map(|v| v.to_string()),
        }
    }
}

/// An ordered field table. Order is preserved so that decode/encode is exact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTable(Vec<(String, FieldValue)>);

impl FieldTable {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Inserts or replaces `name`, keeping the original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Distributed transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format: i64,
    pub global_id: Bytes,
    pub branch_id: Bytes,
}

impl Xid {
    pub fn new(format: i64, global_id: impl Into<Bytes>, branch_id: impl Into<Bytes>) -> Self {
        Self {
            format,
            global_id: global_id.into(),
            branch_id: branch_id.into(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{})",
            self.format,
            String::from_utf8_lossy(&self.global_id),
            String::from_utf8_lossy(&self.branch_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_shortstr_keeps_whole_characters() {
        assert_eq!(clip_shortstr("short"), "short");
        let ascii = "a".repeat(300);
        assert_eq!(clip_shortstr(&ascii).len(), MAX_SHORTSTR_LEN);
        // 'é' is two bytes; 128 of them straddle the limit.
        let accented = "é".repeat(128);
        let clipped = clip_shortstr(&accented);
        assert_eq!(clipped.len(), 254);
        assert_eq!(clipped.chars().count(), 127);
    }

    #[test]
    fn small_int_is_sign_extended() {
        let mut reader = WireReader::new(&[0xFF, 0x7F]);
        assert_eq!(reader.read_small_int(), Ok(-1));
        assert_eq!(reader.read_small_int(), Ok(127));
    }

    #[test]
    fn small_int_without_data_is_truncated() {
        let mut reader = WireReader::new(&[]);
        let err = reader.read_small_int().unwrap_err();
        assert_eq!(
            err,
            FramingError::Truncated {
                needed: 1,
                available: 0
            }
        );
        assert!(err.to_string().contains("insufficient input data"));
    }

    #[test]
    fn field_table_keeps_order_and_bytes() {
        let table = FieldTable::new()
            .with("z-last", FieldValue::Boolean(true))
            .with("a-first", FieldValue::ShortShortInt(-5))
            .with("nested", FieldValue::Table(FieldTable::new().with("k", FieldValue::Void)))
            .with(
                "list",
                FieldValue::Array(vec![FieldValue::LongInt(7), FieldValue::string("x")]),
            );

        let mut buf = BytesMut::new();
        buf.put_table(&table);
        let encoded = buf.freeze();

        let mut reader = WireReader::new(&encoded);
        let decoded = reader.read_table().unwrap();
        reader.finish().unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.iter().next().map(|(k, _)| k), Some("z-last"));

        let mut again = BytesMut::new();
        again.put_table(&decoded);
        assert_eq!(again.freeze(), encoded);
    }

    #[test]
    fn unknown_field_tag_is_rejected() {
        let mut reader = WireReader::new(&[b'?', 0]);
        assert_eq!(
            reader.read_field_value(),
            Err(FramingError::UnknownFieldType('?'))
        );
    }

    #[test]
    fn table_length_beyond_input_is_truncated() {
        let mut reader = WireReader::new(&[0, 0, 0, 10, b'a']);
        assert!(matches!(
            reader.read_table(),
            Err(FramingError::Truncated {
                needed: 10,
                available: 1
            })
        ));
    }

    #[test]
    fn shortstr_encoding_is_capped() {
        let long = "q".repeat(300);
        let mut buf = BytesMut::new();
        buf.put_shortstr(&long);
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn xid_display_matches_log_format() {
        let xid = Xid::new(1, &b"gtx"[..], &b"b1"[..]);
        assert_eq!(xid.to_string(), "(1,gtx,b1)");
    }

    #[test]
    fn numeric_views() {
        assert_eq!(FieldValue::ShortUint(9).as_i64(), Some(9));
        assert_eq!(FieldValue::string("12").as_i64(), Some(12));
        assert_eq!(FieldValue::string("k1").as_text().as_deref(), Some("k1"));
    }
}

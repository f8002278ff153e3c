//! Incremental BSON serializer.

use alloc::vec::Vec;

use super::{BINARY_SUBTYPE_GENERIC, ElementType};
use crate::error::BsonError;

const MIN_CAPACITY: usize = 64;

/// Builds one BSON document.
///
/// The buffer starts with a placeholder for the document length. Elements are
/// appended in order and [`BsonSerializer::end_document`] terminates the
/// document and writes its final length. Once finalized the serializer
/// rejects every further append.
///
/// ```ignore
/// let mut bson = BsonSerializer::new();
/// bson.append_int32("v", 42)?;
/// bson.end_document()?;
/// assert_eq!(bson.as_bytes()?.len(), 12);
/// ```
#[derive(Debug, Clone)]
pub struct BsonSerializer {
    buf: Vec<u8>,
    finalized: bool,
}

impl Default for BsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl BsonSerializer {
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(MIN_CAPACITY);
        buf.extend_from_slice(&[0; 4]);
        Self {
            buf,
            finalized: false,
        }
    }

    /// Whether `end_document` was already called.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of bytes written so far, including the length placeholder.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= 4
    }

    /// The finalized document.
    pub fn as_bytes(&self) -> Result<&[u8], BsonError> {
        if !self.finalized {
            return Err(BsonError::NotFinalized);
        }
        Ok(&self.buf)
    }

    /// Consumes the serializer returning the finalized document.
    pub fn into_bytes(self) -> Result<Vec<u8>, BsonError> {
        if !self.finalized {
            return Err(BsonError::NotFinalized);
        }
        Ok(self.buf)
    }

    /// Terminates the document and writes its total length at offset 0.
    pub fn end_document(&mut self) -> Result<(), BsonError> {
        self.ensure_open()?;
        self.reserve(1);
        self.buf.push(0);
        let size = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&size.to_le_bytes());
        self.finalized = true;
        Ok(())
    }

    pub fn append_double(&mut self, key: &str, value: f64) -> Result<(), BsonError> {
        self.write_header(ElementType::Double, key, 8)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn append_int32(&mut self, key: &str, value: i32) -> Result<(), BsonError> {
        self.write_header(ElementType::Int32, key, 4)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn append_int64(&mut self, key: &str, value: i64) -> Result<(), BsonError> {
        self.write_header(ElementType::Int64, key, 8)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Appends a UTF-8 string. The length field counts the trailing NUL.
    pub fn append_string(&mut self, key: &str, value: &str) -> Result<(), BsonError> {
        let len = value.len() + 1;
        self.write_header(ElementType::String, key, 4 + len)?;
        self.buf.extend_from_slice(&(len as u32).to_le_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// Appends a binary blob with the generic subtype.
    pub fn append_binary(&mut self, key: &str, value: &[u8]) -> Result<(), BsonError> {
        self.write_header(ElementType::Binary, key, 5 + value.len())?;
        self.buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.push(BINARY_SUBTYPE_GENERIC);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn append_boolean(&mut self, key: &str, value: bool) -> Result<(), BsonError> {
        self.write_header(ElementType::Boolean, key, 1)?;
        self.buf.push(u8::from(value));
        Ok(())
    }

    /// Appends a datetime as milliseconds since the Unix epoch.
    pub fn append_datetime(&mut self, key: &str, millis: i64) -> Result<(), BsonError> {
        self.write_header(ElementType::DateTime, key, 8)?;
        self.buf.extend_from_slice(&millis.to_le_bytes());
        Ok(())
    }

    /// Appends an already finalized document as a sub-document.
    ///
    /// The number of copied bytes is taken from the length header of `document`.
    pub fn append_document(&mut self, key: &str, document: &[u8]) -> Result<(), BsonError> {
        self.append_raw_document(ElementType::Document, key, document)
    }

    pub fn append_boolean_array(&mut self, key: &str, values: &[bool]) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_boolean(idx, *v))
    }

    pub fn append_int32_array(&mut self, key: &str, values: &[i32]) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_int32(idx, *v))
    }

    pub fn append_int64_array(&mut self, key: &str, values: &[i64]) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_int64(idx, *v))
    }

    pub fn append_double_array(&mut self, key: &str, values: &[f64]) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_double(idx, *v))
    }

    pub fn append_string_array<S: AsRef<str>>(
        &mut self,
        key: &str,
        values: &[S],
    ) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_string(idx, v.as_ref()))
    }

    pub fn append_binary_array<B: AsRef<[u8]>>(
        &mut self,
        key: &str,
        values: &[B],
    ) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_binary(idx, v.as_ref()))
    }

    pub fn append_datetime_array(&mut self, key: &str, values: &[i64]) -> Result<(), BsonError> {
        self.append_array(key, values, |bson, idx, v| bson.append_datetime(idx, *v))
    }

    /// Arrays are sub-documents keyed by the decimal index of each item.
    fn append_array<T>(
        &mut self,
        key: &str,
        values: &[T],
        mut append: impl FnMut(&mut BsonSerializer, &str, &T) -> Result<(), BsonError>,
    ) -> Result<(), BsonError> {
        self.ensure_open()?;
        let mut inner = BsonSerializer::new();
        let mut idx = heapless::String::<12>::new();
        for (i, value) in values.iter().enumerate() {
            idx.clear();
            write_index(&mut idx, i);
            append(&mut inner, &idx, value)?;
        }
        inner.end_document()?;
        self.append_raw_document(ElementType::Array, key, &inner.buf)
    }

    fn append_raw_document(
        &mut self,
        ty: ElementType,
        key: &str,
        document: &[u8],
    ) -> Result<(), BsonError> {
        let header = document.get(..4).ok_or(BsonError::Malformed)?;
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let raw = document.get(..size).ok_or(BsonError::Malformed)?;
        self.write_header(ty, key, size)?;
        self.buf.extend_from_slice(raw);
        Ok(())
    }

    /// Writes the type byte and the NUL terminated name, reserving room for
    /// `payload` more bytes.
    fn write_header(&mut self, ty: ElementType, key: &str, payload: usize) -> Result<(), BsonError> {
        self.ensure_open()?;
        if key.as_bytes().contains(&0) {
            return Err(BsonError::InvalidKey);
        }
        self.reserve(1 + key.len() + 1 + payload);
        self.buf.push(ty as u8);
        self.buf.extend_from_slice(key.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), BsonError> {
        if self.finalized {
            return Err(BsonError::Finalized);
        }
        Ok(())
    }

    /// Grows geometrically: double the capacity or fit exactly, whichever is larger.
    fn reserve(&mut self, needed: usize) {
        let len = self.buf.len();
        let cap = self.buf.capacity();
        if len + needed > cap {
            let new_cap = core::cmp::max(cap * 2, len + needed);
            self.buf.reserve_exact(new_cap - len);
        }
    }
}

fn write_index(out: &mut heapless::String<12>, mut idx: usize) {
    let mut digits = [0u8; 20];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (idx % 10) as u8;
        n += 1;
        idx /= 10;
        if idx == 0 {
            break;
        }
    }
    for d in digits[..n].iter().rev() {
        // Indexes of in-memory slices always fit.
        let _ = out.push(*d as char);
    }
}

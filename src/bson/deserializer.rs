//! Zero-copy BSON deserializer.

use super::{ElementType, EMPTY_DOCUMENT_SIZE};
use crate::error::BsonError;

/// A validated BSON document borrowed from a caller-owned buffer.
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    bytes: &'a [u8],
}

/// One element of a [`Document`]. Names, strings and blobs point into the
/// original buffer.
#[derive(Debug, Clone, Copy)]
pub struct Element<'a> {
    ty: ElementType,
    name: &'a str,
    value: &'a [u8],
    /// Offset of the byte following this element inside the parent document.
    end: usize,
}

impl<'a> Document<'a> {
    /// Validates `buf` and returns a view over the document it starts with.
    ///
    /// The buffer may be longer than the declared document length; trailing
    /// bytes are ignored.
    pub fn new(buf: &'a [u8]) -> Result<Self, BsonError> {
        if buf.len() < EMPTY_DOCUMENT_SIZE {
            return Err(BsonError::Malformed);
        }
        let size = read_u32(buf, 0)? as usize;
        if size < EMPTY_DOCUMENT_SIZE || size > buf.len() {
            return Err(BsonError::Malformed);
        }
        if buf[size - 1] != 0 {
            return Err(BsonError::Malformed);
        }
        // The smallest element is a type byte, an empty name and a boolean.
        if size > EMPTY_DOCUMENT_SIZE
            && (size < 8 || ElementType::from_byte(buf[4]).is_none())
        {
            return Err(BsonError::Malformed);
        }
        Ok(Self {
            bytes: &buf[..size],
        })
    }

    /// Total size of the document in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() == EMPTY_DOCUMENT_SIZE
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn first_element(&self) -> Result<Element<'a>, BsonError> {
        self.element_at(4)
    }

    pub fn next_element(&self, current: &Element<'a>) -> Result<Element<'a>, BsonError> {
        self.element_at(current.end)
    }

    /// Finds the first element whose name equals `name` exactly.
    pub fn lookup(&self, name: &str) -> Result<Element<'a>, BsonError> {
        for element in self.elements() {
            let element = element?;
            if element.name == name {
                return Ok(element);
            }
        }
        Err(BsonError::NotFound)
    }

    pub fn elements(&self) -> Elements<'a> {
        Elements {
            document: *self,
            offset: 4,
            done: false,
        }
    }

    fn element_at(&self, offset: usize) -> Result<Element<'a>, BsonError> {
        let bytes = self.bytes;
        // The terminator occupies the last byte.
        let last = bytes.len() - 1;
        if offset >= last {
            return Err(BsonError::NotFound);
        }
        let ty = ElementType::from_byte(bytes[offset]).ok_or(BsonError::Malformed)?;

        let name_start = offset + 1;
        let name_len = bytes[name_start..last]
            .iter()
            .position(|b| *b == 0)
            .ok_or(BsonError::Malformed)?;
        let name = core::str::from_utf8(&bytes[name_start..name_start + name_len])
            .map_err(|_| BsonError::Malformed)?;

        let value_start = name_start + name_len + 1;
        let value_len = match ty {
            ElementType::Double | ElementType::DateTime | ElementType::Int64 => 8,
            ElementType::Int32 => 4,
            ElementType::Boolean => 1,
            ElementType::String => {
                let len = read_u32(bytes, value_start)? as usize;
                if len == 0 {
                    return Err(BsonError::Malformed);
                }
                len.checked_add(4).ok_or(BsonError::Malformed)?
            }
            ElementType::Document | ElementType::Array => {
                let len = read_u32(bytes, value_start)? as usize;
                if len < EMPTY_DOCUMENT_SIZE {
                    return Err(BsonError::Malformed);
                }
                len
            }
            ElementType::Binary => (read_u32(bytes, value_start)? as usize)
                .checked_add(4 + 1)
                .ok_or(BsonError::Malformed)?,
        };
        let end = value_start
            .checked_add(value_len)
            .ok_or(BsonError::Malformed)?;
        if end > last {
            return Err(BsonError::Malformed);
        }

        Ok(Element {
            ty,
            name,
            value: &bytes[value_start..end],
            end,
        })
    }
}

/// Iterator over the elements of a [`Document`].
///
/// Yields an error once and then stops when an element is malformed.
pub struct Elements<'a> {
    document: Document<'a>,
    offset: usize,
    done: bool,
}

impl<'a> Iterator for Elements<'a> {
    type Item = Result<Element<'a>, BsonError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.document.element_at(self.offset) {
            Ok(element) => {
                self.offset = element.end;
                Some(Ok(element))
            }
            Err(BsonError::NotFound) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> Element<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    fn expect(&self, ty: ElementType) -> Result<&'a [u8], BsonError> {
        if self.ty != ty {
            return Err(BsonError::TypeMismatch);
        }
        Ok(self.value)
    }

    pub fn as_double(&self) -> Result<f64, BsonError> {
        let value = self.expect(ElementType::Double)?;
        Ok(f64::from_le_bytes(array8(value)?))
    }

    /// The string without its trailing NUL.
    pub fn as_str(&self) -> Result<&'a str, BsonError> {
        let value = self.expect(ElementType::String)?;
        let raw = value.get(4..).ok_or(BsonError::Malformed)?;
        let (terminator, text) = raw.split_last().ok_or(BsonError::Malformed)?;
        if *terminator != 0 {
            return Err(BsonError::Malformed);
        }
        core::str::from_utf8(text).map_err(|_| BsonError::Malformed)
    }

    pub fn as_document(&self) -> Result<Document<'a>, BsonError> {
        Document::new(self.expect(ElementType::Document)?)
    }

    /// Arrays are returned as documents keyed by index.
    pub fn as_array(&self) -> Result<Document<'a>, BsonError> {
        Document::new(self.expect(ElementType::Array)?)
    }

    pub fn as_binary(&self) -> Result<&'a [u8], BsonError> {
        let value = self.expect(ElementType::Binary)?;
        value.get(5..).ok_or(BsonError::Malformed)
    }

    pub fn as_bool(&self) -> Result<bool, BsonError> {
        let value = self.expect(ElementType::Boolean)?;
        match value[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(BsonError::Malformed),
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_datetime(&self) -> Result<i64, BsonError> {
        let value = self.expect(ElementType::DateTime)?;
        Ok(i64::from_le_bytes(array8(value)?))
    }

    pub fn as_int32(&self) -> Result<i32, BsonError> {
        let value = self.expect(ElementType::Int32)?;
        Ok(i32::from_le_bytes([value[0], value[1], value[2], value[3]]))
    }

    pub fn as_int64(&self) -> Result<i64, BsonError> {
        let value = self.expect(ElementType::Int64)?;
        Ok(i64::from_le_bytes(array8(value)?))
    }

    /// Reads a 64-bit integer, accepting int32 elements as well.
    ///
    /// Small long integers are encoded as int32 on the wire. The widening only
    /// goes this way: [`Element::as_int32`] never accepts an int64.
    pub fn as_long_integer(&self) -> Result<i64, BsonError> {
        match self.ty {
            ElementType::Int32 => self.as_int32().map(i64::from),
            _ => self.as_int64(),
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, BsonError> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(BsonError::Malformed)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn array8(value: &[u8]) -> Result<[u8; 8], BsonError> {
    value.try_into().map_err(|_| BsonError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::BsonSerializer;
    use alloc::vec::Vec;

    fn build(f: impl FnOnce(&mut BsonSerializer)) -> Vec<u8> {
        let mut bson = BsonSerializer::new();
        f(&mut bson);
        bson.end_document().unwrap();
        bson.into_bytes().unwrap()
    }

    #[test]
    fn decodes_int32_document() {
        let bytes = [0x0C, 0x00, 0x00, 0x00, 0x10, 0x76, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x00];
        let doc = Document::new(&bytes).unwrap();
        let v = doc.lookup("v").unwrap();
        assert_eq!(v.element_type(), ElementType::Int32);
        assert_eq!(v.as_int32().unwrap(), 42);
    }

    #[test]
    fn rejects_short_or_inconsistent_buffers() {
        assert_eq!(Document::new(&[5, 0, 0]).unwrap_err(), BsonError::Malformed);
        // Declared length larger than the buffer.
        assert_eq!(
            Document::new(&[9, 0, 0, 0, 0]).unwrap_err(),
            BsonError::Malformed
        );
        // Missing terminator.
        assert_eq!(
            Document::new(&[5, 0, 0, 0, 1]).unwrap_err(),
            BsonError::Malformed
        );
        // Unsupported first element type.
        assert_eq!(
            Document::new(&[8, 0, 0, 0, 0x7F, 0, 0, 0]).unwrap_err(),
            BsonError::Malformed
        );
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = build(|b| b.append_boolean("b", true).unwrap());
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        let doc = Document::new(&bytes).unwrap();
        assert_eq!(doc.size(), bytes.len() - 2);
        assert!(doc.lookup("b").unwrap().as_bool().unwrap());
    }

    #[test]
    fn empty_document_has_no_elements() {
        let bytes = build(|_| {});
        let doc = Document::new(&bytes).unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.first_element().unwrap_err(), BsonError::NotFound);
        assert_eq!(doc.elements().count(), 0);
    }

    #[test]
    fn walks_every_element_type() {
        let bytes = build(|b| {
            b.append_double("d", 1.5).unwrap();
            b.append_string("s", "text").unwrap();
            b.append_binary("b", &[9, 8]).unwrap();
            b.append_boolean("t", true).unwrap();
            b.append_datetime("dt", 1_700_000_000_000).unwrap();
            b.append_int32("i", -7).unwrap();
            b.append_int64("l", 1 << 40).unwrap();
            b.append_string_array("sa", &["x", "y"]).unwrap();
        });
        let doc = Document::new(&bytes).unwrap();

        let first = doc.first_element().unwrap();
        assert_eq!(first.name(), "d");
        assert_eq!(first.as_double().unwrap(), 1.5);
        let second = doc.next_element(&first).unwrap();
        assert_eq!(second.as_str().unwrap(), "text");

        assert_eq!(doc.lookup("b").unwrap().as_binary().unwrap(), &[9, 8]);
        assert!(doc.lookup("t").unwrap().as_bool().unwrap());
        assert_eq!(
            doc.lookup("dt").unwrap().as_datetime().unwrap(),
            1_700_000_000_000
        );
        assert_eq!(doc.lookup("i").unwrap().as_int32().unwrap(), -7);
        assert_eq!(doc.lookup("l").unwrap().as_int64().unwrap(), 1 << 40);

        let array = doc.lookup("sa").unwrap().as_array().unwrap();
        let items: Vec<&str> = array
            .elements()
            .map(|e| e.unwrap().as_str().unwrap())
            .collect();
        assert_eq!(items, ["x", "y"]);

        let names: Vec<&str> = doc.elements().map(|e| e.unwrap().name()).collect();
        assert_eq!(names, ["d", "s", "b", "t", "dt", "i", "l", "sa"]);

        let last = doc.lookup("sa").unwrap();
        assert_eq!(doc.next_element(&last).unwrap_err(), BsonError::NotFound);
    }

    #[test]
    fn lookup_requires_full_name_match() {
        let bytes = build(|b| b.append_int32("value", 1).unwrap());
        let doc = Document::new(&bytes).unwrap();
        assert_eq!(doc.lookup("v").unwrap_err(), BsonError::NotFound);
        assert_eq!(doc.lookup("values").unwrap_err(), BsonError::NotFound);
        assert_eq!(doc.lookup("value").unwrap().as_int32().unwrap(), 1);
    }

    #[test]
    fn int32_widens_to_long_integer_only() {
        let bytes = build(|b| {
            b.append_int32("small", -5).unwrap();
            b.append_int64("big", -5_000_000_000).unwrap();
        });
        let doc = Document::new(&bytes).unwrap();
        let small = doc.lookup("small").unwrap();
        let big = doc.lookup("big").unwrap();

        assert_eq!(small.as_long_integer().unwrap(), -5);
        assert_eq!(big.as_long_integer().unwrap(), -5_000_000_000);
        assert_eq!(big.as_int32().unwrap_err(), BsonError::TypeMismatch);
        assert_eq!(small.as_int64().unwrap_err(), BsonError::TypeMismatch);
    }

    #[test]
    fn wrong_accessor_is_type_mismatch() {
        let bytes = build(|b| b.append_string("s", "x").unwrap());
        let doc = Document::new(&bytes).unwrap();
        let s = doc.lookup("s").unwrap();
        assert_eq!(s.as_double().unwrap_err(), BsonError::TypeMismatch);
        assert_eq!(s.as_bool().unwrap_err(), BsonError::TypeMismatch);
        assert_eq!(s.as_document().unwrap_err(), BsonError::TypeMismatch);
    }

    #[test]
    fn truncated_element_is_malformed() {
        // int64 element claiming 8 bytes but only 3 are present.
        let bytes = [12, 0, 0, 0, 0x12, b'x', 0, 1, 2, 3, 0, 0];
        let doc = Document::new(&bytes).unwrap();
        let mut elements = doc.elements();
        assert_eq!(elements.next().unwrap().unwrap_err(), BsonError::Malformed);
        assert!(elements.next().is_none());
    }

    #[test]
    fn oversized_lengths_are_malformed() {
        // String and binary elements declaring a u32::MAX length, which wraps
        // the element size on 32-bit targets.
        let string = [13, 0, 0, 0, 0x02, b'v', 0, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0];
        let doc = Document::new(&string).unwrap();
        assert_eq!(doc.lookup("v").unwrap_err(), BsonError::Malformed);

        let binary = [13, 0, 0, 0, 0x05, b'v', 0, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0];
        let doc = Document::new(&binary).unwrap();
        assert_eq!(doc.lookup("v").unwrap_err(), BsonError::Malformed);

        let nearly = [13, 0, 0, 0, 0x02, b'v', 0, 0xFC, 0xFF, 0xFF, 0xFF, 0, 0];
        let doc = Document::new(&nearly).unwrap();
        assert_eq!(doc.lookup("v").unwrap_err(), BsonError::Malformed);
    }

    #[test]
    fn nested_documents() {
        let mut inner = BsonSerializer::new();
        inner.append_double("temp", 20.0).unwrap();
        inner.end_document().unwrap();
        let bytes = build(|b| b.append_document("v", inner.as_bytes().unwrap()).unwrap());

        let doc = Document::new(&bytes).unwrap();
        let nested = doc.lookup("v").unwrap().as_document().unwrap();
        assert_eq!(nested.lookup("temp").unwrap().as_double().unwrap(), 20.0);
    }
}

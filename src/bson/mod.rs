//! # BSON Document Codec
//!
//! The subset of BSON used by every Astarte payload: doubles, strings,
//! embedded documents, arrays, binary blobs, booleans, datetimes and 32/64-bit
//! integers. The serializer builds a document incrementally into an owned
//! buffer; the deserializer is a zero-copy view over a borrowed slice.

mod deserializer;
mod serializer;

pub use deserializer::{Document, Element, Elements};
pub use serializer::BsonSerializer;

/// The BSON element types understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Boolean = 0x08,
    DateTime = 0x09,
    Int32 = 0x10,
    Int64 = 0x12,
}

impl ElementType {
    /// Maps a type byte to an element type, `None` for unsupported types.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Double),
            0x02 => Some(Self::String),
            0x03 => Some(Self::Document),
            0x04 => Some(Self::Array),
            0x05 => Some(Self::Binary),
            0x08 => Some(Self::Boolean),
            0x09 => Some(Self::DateTime),
            0x10 => Some(Self::Int32),
            0x12 => Some(Self::Int64),
            _ => None,
        }
    }
}

/// Binary subtype used for generic blobs.
pub const BINARY_SUBTYPE_GENERIC: u8 = 0x00;

/// Size of the smallest valid document: the length field and the terminator.
pub const EMPTY_DOCUMENT_SIZE: usize = 5;

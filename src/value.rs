//! # Value Model
//!
//! Every value exchanged with Astarte is one of fourteen variants: seven
//! scalars and the array form of each. [`Value`] owns its payload, so values
//! decoded from the wire release their buffers on drop. Borrowed access to
//! the raw wire bytes goes through [`crate::bson::Element`] instead.

use alloc::string::String;
use alloc::vec::Vec;

use crate::bson::{BsonSerializer, Document, Element};
use crate::error::{BsonError, ValueError};

/// The type of a mapping, as declared in the interface and stored in the
/// property cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MappingType {
    Integer = 1,
    LongInteger = 2,
    Double = 3,
    String = 4,
    BinaryBlob = 5,
    Boolean = 6,
    DateTime = 7,
    IntegerArray = 8,
    LongIntegerArray = 9,
    DoubleArray = 10,
    StringArray = 11,
    BinaryBlobArray = 12,
    BooleanArray = 13,
    DateTimeArray = 14,
}

impl MappingType {
    /// Numeric tag persisted with cached properties.
    pub fn tag(self) -> i64 {
        self as u8 as i64
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        Some(match tag {
            1 => Self::Integer,
            2 => Self::LongInteger,
            3 => Self::Double,
            4 => Self::String,
            5 => Self::BinaryBlob,
            6 => Self::Boolean,
            7 => Self::DateTime,
            8 => Self::IntegerArray,
            9 => Self::LongIntegerArray,
            10 => Self::DoubleArray,
            11 => Self::StringArray,
            12 => Self::BinaryBlobArray,
            13 => Self::BooleanArray,
            14 => Self::DateTimeArray,
            _ => return None,
        })
    }

    pub fn is_array(self) -> bool {
        self as u8 >= Self::IntegerArray as u8
    }
}

/// A value of one of the Astarte types.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i32),
    LongInteger(i64),
    Double(f64),
    String(String),
    BinaryBlob(Vec<u8>),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    IntegerArray(Vec<i32>),
    LongIntegerArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    BinaryBlobArray(Vec<Vec<u8>>),
    BooleanArray(Vec<bool>),
    DateTimeArray(Vec<i64>),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::LongInteger(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::BinaryBlob(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::IntegerArray(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::LongIntegerArray(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::DoubleArray(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

impl From<Vec<Vec<u8>>> for Value {
    fn from(v: Vec<Vec<u8>>) -> Self {
        Value::BinaryBlobArray(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BooleanArray(v)
    }
}

impl Value {
    /// A datetime in milliseconds since the Unix epoch.
    pub fn datetime(millis: i64) -> Self {
        Value::DateTime(millis)
    }

    pub fn datetime_array(millis: Vec<i64>) -> Self {
        Value::DateTimeArray(millis)
    }

    pub fn mapping_type(&self) -> MappingType {
        match self {
            Value::Integer(_) => MappingType::Integer,
            Value::LongInteger(_) => MappingType::LongInteger,
            Value::Double(_) => MappingType::Double,
            Value::String(_) => MappingType::String,
            Value::BinaryBlob(_) => MappingType::BinaryBlob,
            Value::Boolean(_) => MappingType::Boolean,
            Value::DateTime(_) => MappingType::DateTime,
            Value::IntegerArray(_) => MappingType::IntegerArray,
            Value::LongIntegerArray(_) => MappingType::LongIntegerArray,
            Value::DoubleArray(_) => MappingType::DoubleArray,
            Value::StringArray(_) => MappingType::StringArray,
            Value::BinaryBlobArray(_) => MappingType::BinaryBlobArray,
            Value::BooleanArray(_) => MappingType::BooleanArray,
            Value::DateTimeArray(_) => MappingType::DateTimeArray,
        }
    }

    fn mismatch(&self, expected: MappingType) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            found: self.mapping_type(),
        }
    }

    pub fn as_integer(&self) -> Result<i32, ValueError> {
        match self {
            Value::Integer(v) => Ok(*v),
            _ => Err(self.mismatch(MappingType::Integer)),
        }
    }

    pub fn as_long_integer(&self) -> Result<i64, ValueError> {
        match self {
            Value::LongInteger(v) => Ok(*v),
            _ => Err(self.mismatch(MappingType::LongInteger)),
        }
    }

    pub fn as_double(&self) -> Result<f64, ValueError> {
        match self {
            Value::Double(v) => Ok(*v),
            _ => Err(self.mismatch(MappingType::Double)),
        }
    }

    pub fn as_string(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::String)),
        }
    }

    pub fn as_binary_blob(&self) -> Result<&[u8], ValueError> {
        match self {
            Value::BinaryBlob(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::BinaryBlob)),
        }
    }

    pub fn as_boolean(&self) -> Result<bool, ValueError> {
        match self {
            Value::Boolean(v) => Ok(*v),
            _ => Err(self.mismatch(MappingType::Boolean)),
        }
    }

    pub fn as_datetime(&self) -> Result<i64, ValueError> {
        match self {
            Value::DateTime(v) => Ok(*v),
            _ => Err(self.mismatch(MappingType::DateTime)),
        }
    }

    pub fn as_integer_array(&self) -> Result<&[i32], ValueError> {
        match self {
            Value::IntegerArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::IntegerArray)),
        }
    }

    pub fn as_long_integer_array(&self) -> Result<&[i64], ValueError> {
        match self {
            Value::LongIntegerArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::LongIntegerArray)),
        }
    }

    pub fn as_double_array(&self) -> Result<&[f64], ValueError> {
        match self {
            Value::DoubleArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::DoubleArray)),
        }
    }

    pub fn as_string_array(&self) -> Result<&[String], ValueError> {
        match self {
            Value::StringArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::StringArray)),
        }
    }

    pub fn as_binary_blob_array(&self) -> Result<&[Vec<u8>], ValueError> {
        match self {
            Value::BinaryBlobArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::BinaryBlobArray)),
        }
    }

    pub fn as_boolean_array(&self) -> Result<&[bool], ValueError> {
        match self {
            Value::BooleanArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::BooleanArray)),
        }
    }

    pub fn as_datetime_array(&self) -> Result<&[i64], ValueError> {
        match self {
            Value::DateTimeArray(v) => Ok(v),
            _ => Err(self.mismatch(MappingType::DateTimeArray)),
        }
    }

    /// Whether every double carried by the value is a finite number.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Double(v) => v.is_finite(),
            Value::DoubleArray(v) => v.iter().all(|d| d.is_finite()),
            _ => true,
        }
    }

    /// Appends the value to `bson` under `key`.
    pub fn serialize(&self, bson: &mut BsonSerializer, key: &str) -> Result<(), BsonError> {
        match self {
            Value::Integer(v) => bson.append_int32(key, *v),
            Value::LongInteger(v) => bson.append_int64(key, *v),
            Value::Double(v) => bson.append_double(key, *v),
            Value::String(v) => bson.append_string(key, v),
            Value::BinaryBlob(v) => bson.append_binary(key, v),
            Value::Boolean(v) => bson.append_boolean(key, *v),
            Value::DateTime(v) => bson.append_datetime(key, *v),
            Value::IntegerArray(v) => bson.append_int32_array(key, v),
            Value::LongIntegerArray(v) => bson.append_int64_array(key, v),
            Value::DoubleArray(v) => bson.append_double_array(key, v),
            Value::StringArray(v) => bson.append_string_array(key, v),
            Value::BinaryBlobArray(v) => bson.append_binary_array(key, v),
            Value::BooleanArray(v) => bson.append_boolean_array(key, v),
            Value::DateTimeArray(v) => bson.append_datetime_array(key, v),
        }
    }

    /// Decodes an element received from Astarte as a value of type `expected`.
    ///
    /// Arrays must be homogeneous and non-empty.
    pub fn deserialize(element: &Element<'_>, expected: MappingType) -> Result<Self, BsonError> {
        decode(element, expected, false)
    }

    /// Decodes an element persisted by the property cache, where empty arrays
    /// are legitimate.
    pub fn deserialize_stored(
        element: &Element<'_>,
        expected: MappingType,
    ) -> Result<Self, BsonError> {
        decode(element, expected, true)
    }
}

fn decode(element: &Element<'_>, expected: MappingType, allow_empty: bool) -> Result<Value, BsonError> {
    let value = match expected {
        MappingType::Integer => Value::Integer(element.as_int32()?),
        MappingType::LongInteger => Value::LongInteger(element.as_long_integer()?),
        MappingType::Double => Value::Double(element.as_double()?),
        MappingType::String => Value::String(element.as_str()?.into()),
        MappingType::BinaryBlob => Value::BinaryBlob(element.as_binary()?.to_vec()),
        MappingType::Boolean => Value::Boolean(element.as_bool()?),
        MappingType::DateTime => Value::DateTime(element.as_datetime()?),
        MappingType::IntegerArray => {
            Value::IntegerArray(decode_array(element, allow_empty, |e| e.as_int32())?)
        }
        MappingType::LongIntegerArray => {
            Value::LongIntegerArray(decode_array(element, allow_empty, |e| e.as_long_integer())?)
        }
        MappingType::DoubleArray => {
            Value::DoubleArray(decode_array(element, allow_empty, |e| e.as_double())?)
        }
        MappingType::StringArray => Value::StringArray(decode_array(element, allow_empty, |e| {
            e.as_str().map(String::from)
        })?),
        MappingType::BinaryBlobArray => Value::BinaryBlobArray(decode_array(
            element,
            allow_empty,
            |e| e.as_binary().map(<[u8]>::to_vec),
        )?),
        MappingType::BooleanArray => {
            Value::BooleanArray(decode_array(element, allow_empty, |e| e.as_bool())?)
        }
        MappingType::DateTimeArray => {
            Value::DateTimeArray(decode_array(element, allow_empty, |e| e.as_datetime())?)
        }
    };
    Ok(value)
}

fn decode_array<T>(
    element: &Element<'_>,
    allow_empty: bool,
    mut item: impl FnMut(&Element<'_>) -> Result<T, BsonError>,
) -> Result<Vec<T>, BsonError> {
    let array = element.as_array()?;
    if array.is_empty() && !allow_empty {
        return Err(BsonError::EmptyArray);
    }
    let mut out = Vec::new();
    for entry in array.elements() {
        out.push(item(&entry?)?);
    }
    Ok(out)
}

/// One endpoint of an aggregated object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    /// Path relative to the object path, without the leading `/`.
    pub path: String,
    pub value: Value,
}

/// A sample of an object-aggregated interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    entries: Vec<ObjectEntry>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, rejecting a path that is already present.
    pub fn insert(&mut self, path: impl Into<String>, value: Value) -> Result<(), ValueError> {
        let path = path.into();
        if self.get(&path).is_some() {
            return Err(ValueError::DuplicatePath);
        }
        self.entries.push(ObjectEntry { path, value });
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|entry| entry.path == path)
            .map(|entry| &entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.iter()
    }

    /// Appends every entry to `bson`, one element per path.
    pub fn serialize(&self, bson: &mut BsonSerializer) -> Result<(), BsonError> {
        for entry in &self.entries {
            entry.value.serialize(bson, &entry.path)?;
        }
        Ok(())
    }

    /// Decodes a received object document, resolving the type of each entry
    /// with `type_of`. Entries whose path does not resolve yield `None` from
    /// `type_of` and fail with [`BsonError::NotFound`].
    pub fn deserialize(
        document: &Document<'_>,
        mut type_of: impl FnMut(&str) -> Option<MappingType>,
    ) -> Result<Self, BsonError> {
        if document.is_empty() {
            return Err(BsonError::EmptyDocument);
        }
        let mut object = Object::new();
        for element in document.elements() {
            let element = element?;
            let ty = type_of(element.name()).ok_or(BsonError::NotFound)?;
            let value = Value::deserialize(&element, ty)?;
            object
                .insert(element.name(), value)
                .map_err(|_| BsonError::Malformed)?;
        }
        Ok(object)
    }
}

impl FromIterator<(String, Value)> for Object {
    /// Later duplicates of a path are dropped.
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut object = Object::new();
        for (path, value) in iter {
            let _ = object.insert(path, value);
        }
        object
    }
}

//! # MQTT Serialization Utilities
//!
//! Helpers for reading and writing MQTT-specific data types from and to byte
//! buffers, such as variable-byte integers and length-prefixed strings.

use crate::error::{ErrorPlaceHolder, MqttError, ProtocolError};

/// Largest value a four byte variable-byte integer can carry.
pub const MAX_VARIABLE_BYTE_INTEGER: usize = 268_435_455;

const MALFORMED: MqttError<ErrorPlaceHolder> = MqttError::Protocol(ProtocolError::MalformedPacket);

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// Returns `Ok(None)` when the buffer ends before the integer does.
pub fn try_read_variable_byte_integer(
    cursor: &mut usize,
    buf: &[u8],
) -> Result<Option<usize>, MqttError<ErrorPlaceHolder>> {
    let mut multiplier = 1;
    let mut value = 0;
    for i in 0..4 {
        let Some(encoded_byte) = buf.get(*cursor + i) else {
            return Ok(None);
        };
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            *cursor += i + 1;
            return Ok(Some(value));
        }
        multiplier *= 128;
    }
    Err(MALFORMED)
}

/// Reads a variable-byte integer from the buffer, advancing the cursor.
pub fn read_variable_byte_integer(
    cursor: &mut usize,
    buf: &[u8],
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    try_read_variable_byte_integer(cursor, buf)?.ok_or(MALFORMED)
}

/// Number of bytes needed to encode `val` as a variable-byte integer.
pub fn variable_byte_integer_len(val: usize) -> usize {
    match val {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Writes a variable-byte integer at the start of `buf`, returning the byte count.
pub fn write_variable_byte_integer_len(
    buf: &mut [u8],
    mut val: usize,
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    if val > MAX_VARIABLE_BYTE_INTEGER {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(MqttError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, MqttError<ErrorPlaceHolder>> {
    let bytes = buf.get(*cursor..*cursor + 2).ok_or(MALFORMED)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(
    cursor: &mut usize,
    buf: &'a [u8],
) -> Result<&'a str, MqttError<ErrorPlaceHolder>> {
    let len = read_u16(cursor, buf)? as usize;
    let s = core::str::from_utf8(buf.get(*cursor..*cursor + len).ok_or(MALFORMED)?)
        .map_err(|_| MqttError::Protocol(ProtocolError::InvalidUtf8String))?;
    *cursor += len;
    Ok(s)
}

/// Writes a UTF-8 encoded string (prefixed with a 2-byte length) to the buffer.
pub fn write_utf8_string(buf: &mut [u8], s: &str) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }

    let required_space = 2 + len;
    let slice = buf
        .get_mut(0..required_space)
        .ok_or(MqttError::BufferTooSmall)?;

    slice[0..2].copy_from_slice(&(len as u16).to_be_bytes());
    slice[2..].copy_from_slice(s.as_bytes());
    Ok(required_space)
}

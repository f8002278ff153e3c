//! # MQTT Packet Structures and Serialization
//!
//! The MQTT 3.1.1 control packets used by the device, with the traits for
//! encoding and decoding them to and from a byte buffer. Every packet can be
//! encoded and decoded, so the same code drives both the client and the test
//! brokers that exercise it.

use crate::error::{ErrorPlaceHolder, MqttError, ProtocolError};
use crate::util::{
    self, read_u16, read_utf8_string, variable_byte_integer_len, write_utf8_string,
};
use heapless::Vec;

/// Maximum number of topic filters in one SUBSCRIBE packet.
pub const MAX_SUBSCRIBE_TOPICS: usize = 16;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        }
    }
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    /// Writes the packet at the start of `buf`, returning its length.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>>;
}

/// A trait for packets that can be decoded from a byte buffer.
///
/// `buf` holds exactly one complete packet, fixed header included.
pub trait DecodePacket<'a>: Sized {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>>;
}

/// An enumeration of all possible MQTT control packets.
#[derive(Debug, PartialEq)]
pub enum MqttPacket<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// Length of the first complete packet in `buf`, or `None` when more bytes
/// are needed.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, MqttError<ErrorPlaceHolder>> {
    let mut cursor = 1;
    if buf.is_empty() {
        return Ok(None);
    }
    let Some(remaining_len) = util::try_read_variable_byte_integer(&mut cursor, buf)? else {
        return Ok(None);
    };
    let total = cursor + remaining_len;
    Ok((buf.len() >= total).then_some(total))
}

/// Decodes a raw byte buffer into a specific `MqttPacket`.
pub fn decode<'a, T>(buf: &'a [u8]) -> Result<Option<MqttPacket<'a>>, MqttError<T>> {
    if buf.is_empty() {
        return Ok(None);
    }
    decode_packet(buf)
        .map(Some)
        .map_err(MqttError::cast_transport_error)
}

fn decode_packet(buf: &[u8]) -> Result<MqttPacket<'_>, MqttError<ErrorPlaceHolder>> {
    let packet_type = buf[0] >> 4;
    let packet = match packet_type {
        1 => MqttPacket::Connect(Connect::decode(buf)?),
        2 => MqttPacket::ConnAck(ConnAck::decode(buf)?),
        3 => MqttPacket::Publish(Publish::decode(buf)?),
        4 => MqttPacket::PubAck(PubAck::decode(buf)?),
        5 => MqttPacket::PubRec(PubRec::decode(buf)?),
        6 => MqttPacket::PubRel(PubRel::decode(buf)?),
        7 => MqttPacket::PubComp(PubComp::decode(buf)?),
        8 => MqttPacket::Subscribe(Subscribe::decode(buf)?),
        9 => MqttPacket::SubAck(SubAck::decode(buf)?),
        12 => MqttPacket::PingReq,
        13 => MqttPacket::PingResp,
        14 => MqttPacket::Disconnect,
        _ => {
            return Err(MqttError::Protocol(ProtocolError::InvalidPacketType(
                packet_type,
            )));
        }
    };
    Ok(packet)
}

/// Writes the fixed header and returns the offset of the variable header.
///
/// The whole packet must fit: the check happens here, so the body writes
/// that follow can index `buf` directly.
fn write_fixed_header(
    buf: &mut [u8],
    first_byte: u8,
    remaining_len: usize,
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let header_len = 1 + variable_byte_integer_len(remaining_len);
    if buf.len() < header_len + remaining_len {
        return Err(MqttError::BufferTooSmall);
    }
    buf[0] = first_byte;
    util::write_variable_byte_integer_len(&mut buf[1..], remaining_len)?;
    Ok(header_len)
}

/// Skips the fixed header, returning the body start and the packet end.
fn read_fixed_header(buf: &[u8]) -> Result<(usize, usize), MqttError<ErrorPlaceHolder>> {
    let mut cursor = 1;
    let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
    let end = cursor + remaining_len;
    if end > buf.len() {
        return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
    }
    Ok((cursor, end))
}

// --- CONNECT Packet ---
#[derive(Debug, PartialEq)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
        }
    }
}

impl EncodePacket for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        // Protocol name, level, flags, keep alive, client id.
        let remaining_len = 6 + 1 + 1 + 2 + 2 + self.client_id.len();
        let mut cursor = write_fixed_header(buf, 0x10, remaining_len)?;
        cursor += write_utf8_string(&mut buf[cursor..], "MQTT")?;
        // Protocol level 4 is MQTT 3.1.1.
        buf[cursor] = 4;
        cursor += 1;
        buf[cursor] = if self.clean_session { 0x02 } else { 0x00 };
        cursor += 1;
        buf[cursor..cursor + 2].copy_from_slice(&self.keep_alive.to_be_bytes());
        cursor += 2;
        cursor += write_utf8_string(&mut buf[cursor..], self.client_id)?;
        Ok(cursor)
    }
}

impl<'a> DecodePacket<'a> for Connect<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let (mut cursor, end) = read_fixed_header(buf)?;
        let buf = &buf[..end];
        if read_utf8_string(&mut cursor, buf)? != "MQTT" {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        let flags = *buf
            .get(cursor + 1)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
        cursor += 2;
        let keep_alive = read_u16(&mut cursor, buf)?;
        let client_id = read_utf8_string(&mut cursor, buf)?;
        Ok(Self {
            clean_session: (flags & 0x02) != 0,
            keep_alive,
            client_id,
        })
    }
}

// --- CONNACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl EncodePacket for ConnAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        let cursor = write_fixed_header(buf, 0x20, 2)?;
        buf[cursor] = self.session_present as u8;
        buf[cursor + 1] = self.return_code;
        Ok(cursor + 2)
    }
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let (cursor, end) = read_fixed_header(buf)?;
        if end - cursor != 2 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        Ok(Self {
            session_present: (buf[cursor] & 0x01) != 0,
            return_code: buf[cursor + 1],
        })
    }
}

// --- PUBLISH Packet ---
#[derive(Debug, Clone, PartialEq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub payload: &'a [u8],
    /// Present exactly when `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

impl<'a> Publish<'a> {
    pub fn new(topic: &'a str, payload: &'a [u8], qos: QoS, packet_id: Option<u16>) -> Self {
        Self {
            topic,
            qos,
            payload,
            packet_id,
            dup: false,
            retain: false,
        }
    }
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let flags = buf[0] & 0x0F;
        let qos = QoS::from_bits((flags >> 1) & 0x03)?;

        let (mut cursor, end) = read_fixed_header(buf)?;
        let buf = &buf[..end];
        let topic = read_utf8_string(&mut cursor, buf)?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_u16(&mut cursor, buf)?)
        } else {
            None
        };

        Ok(Publish {
            topic,
            qos,
            payload: &buf[cursor..],
            packet_id,
            dup: (flags & 0x08) != 0,
            retain: (flags & 0x01) != 0,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        let packet_id = match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => return Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        };

        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        let remaining_len =
            2 + self.topic.len() + packet_id.map_or(0, |_| 2) + self.payload.len();
        let mut cursor = write_fixed_header(buf, 0x30 | flags, remaining_len)?;
        cursor += write_utf8_string(&mut buf[cursor..], self.topic)?;
        if let Some(id) = packet_id {
            buf[cursor..cursor + 2].copy_from_slice(&id.to_be_bytes());
            cursor += 2;
        }
        buf[cursor..cursor + self.payload.len()].copy_from_slice(self.payload);
        Ok(cursor + self.payload.len())
    }
}

// --- PUBACK, PUBREC, PUBREL and PUBCOMP Packets ---

fn encode_ack(
    buf: &mut [u8],
    first_byte: u8,
    packet_id: u16,
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let cursor = write_fixed_header(buf, first_byte, 2)?;
    buf[cursor..cursor + 2].copy_from_slice(&packet_id.to_be_bytes());
    Ok(cursor + 2)
}

fn decode_ack(buf: &[u8]) -> Result<u16, MqttError<ErrorPlaceHolder>> {
    let (mut cursor, end) = read_fixed_header(buf)?;
    if end - cursor != 2 {
        return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
    }
    read_u16(&mut cursor, buf)
}

/// Acknowledges a QoS 1 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubAck {
    pub packet_id: u16,
}

/// First acknowledgement of a QoS 2 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubRec {
    pub packet_id: u16,
}

/// Releases a QoS 2 PUBLISH after its PUBREC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubRel {
    pub packet_id: u16,
}

/// Completes a QoS 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PubComp {
    pub packet_id: u16,
}

impl EncodePacket for PubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        encode_ack(buf, 0x40, self.packet_id)
    }
}

impl<'a> DecodePacket<'a> for PubAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        Ok(Self {
            packet_id: decode_ack(buf)?,
        })
    }
}

impl EncodePacket for PubRec {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        encode_ack(buf, 0x50, self.packet_id)
    }
}

impl<'a> DecodePacket<'a> for PubRec {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        Ok(Self {
            packet_id: decode_ack(buf)?,
        })
    }
}

impl EncodePacket for PubRel {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        // PUBREL carries the reserved flag bits 0b0010.
        encode_ack(buf, 0x62, self.packet_id)
    }
}

impl<'a> DecodePacket<'a> for PubRel {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        Ok(Self {
            packet_id: decode_ack(buf)?,
        })
    }
}

impl EncodePacket for PubComp {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        encode_ack(buf, 0x70, self.packet_id)
    }
}

impl<'a> DecodePacket<'a> for PubComp {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        Ok(Self {
            packet_id: decode_ack(buf)?,
        })
    }
}

// --- SUBSCRIBE Packet ---
#[derive(Debug, PartialEq)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<(&'a str, QoS), MAX_SUBSCRIBE_TOPICS>,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic.
    pub fn new(packet_id: u16, topic: &'a str, qos: QoS) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push((topic, qos));
        Self { packet_id, topics }
    }
}

impl<'a> DecodePacket<'a> for Subscribe<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let (mut cursor, end) = read_fixed_header(buf)?;
        let buf = &buf[..end];
        let packet_id = read_u16(&mut cursor, buf)?;
        let mut topics = Vec::new();
        while cursor < end {
            let topic = read_utf8_string(&mut cursor, buf)?;
            let qos = QoS::from_bits(
                *buf.get(cursor)
                    .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?,
            )?;
            cursor += 1;
            topics
                .push((topic, qos))
                .map_err(|_| MqttError::Protocol(ProtocolError::PayloadTooLarge))?;
        }
        Ok(Subscribe { packet_id, topics })
    }
}

impl EncodePacket for Subscribe<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        if self.topics.is_empty() {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        let remaining_len = 2 + self
            .topics
            .iter()
            .map(|(topic, _)| 2 + topic.len() + 1)
            .sum::<usize>();

        // Fixed header: SUBSCRIBE packet type (8) with reserved bits (0x02)
        let mut cursor = write_fixed_header(buf, 0x82, remaining_len)?;
        buf[cursor..cursor + 2].copy_from_slice(&self.packet_id.to_be_bytes());
        cursor += 2;
        for (topic, qos) in &self.topics {
            cursor += write_utf8_string(&mut buf[cursor..], topic)?;
            buf[cursor] = *qos as u8;
            cursor += 1;
        }
        Ok(cursor)
    }
}

// --- SUBACK Packet ---

/// Return code of a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, PartialEq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8, MAX_SUBSCRIBE_TOPICS>,
}

impl SubAck {
    /// Whether the broker refused at least one of the topic filters.
    pub fn has_failure(&self) -> bool {
        self.return_codes.contains(&SUBACK_FAILURE)
    }
}

impl EncodePacket for SubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        let remaining_len = 2 + self.return_codes.len();
        let mut cursor = write_fixed_header(buf, 0x90, remaining_len)?;
        buf[cursor..cursor + 2].copy_from_slice(&self.packet_id.to_be_bytes());
        cursor += 2;
        buf[cursor..cursor + self.return_codes.len()].copy_from_slice(&self.return_codes);
        Ok(cursor + self.return_codes.len())
    }
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(buf: &'a [u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let (mut cursor, end) = read_fixed_header(buf)?;
        let packet_id = read_u16(&mut cursor, &buf[..end])?;
        let mut return_codes = Vec::new();
        for code in &buf[cursor..end] {
            return_codes
                .push(*code)
                .map_err(|_| MqttError::Protocol(ProtocolError::MalformedPacket))?;
        }
        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}

// --- PINGREQ, PINGRESP and DISCONNECT Packets ---

fn encode_empty(buf: &mut [u8], first_byte: u8) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    write_fixed_header(buf, first_byte, 0)
}

#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        encode_empty(buf, 0xC0)
    }
}

#[derive(Debug)]
pub struct PingResp;

impl EncodePacket for PingResp {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        encode_empty(buf, 0xD0)
    }
}

#[derive(Debug)]
pub struct Disconnect;

impl EncodePacket for Disconnect {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, MqttError<ErrorPlaceHolder>> {
        encode_empty(buf, 0xE0)
    }
}

//! # Error Types
//!
//! This module defines the error types used throughout the crate, from MQTT
//! transport issues and protocol violations up to codec, storage and
//! interface validation failures.

use crate::value::MappingType;

/// An uninhabited placeholder used where the specific transport error is not
/// known, such as in the packet encoding functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPlaceHolder {}

/// The primary error enum for the MQTT client.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying network transport (e.g., TCP, TLS).
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT protocol.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// The client is not currently connected to the broker.
    NotConnected,
    /// A connection is already open or being opened.
    AlreadyConnected,
    /// The buffer provided for an operation was too small.
    BufferTooSmall,
    /// An operation timed out.
    Timeout,
}

impl<T> MqttError<T> {
    /// Converts an error produced by the packet codec into an error carrying the
    /// client's transport error type.
    ///
    /// The codec never produces transport errors, which the uninhabited
    /// [`ErrorPlaceHolder`] encodes at the type level.
    pub fn cast_transport_error(other: MqttError<ErrorPlaceHolder>) -> MqttError<T> {
        match other {
            MqttError::Protocol(p) => MqttError::Protocol(p),
            MqttError::ConnectionRefused(c) => MqttError::ConnectionRefused(c),
            MqttError::NotConnected => MqttError::NotConnected,
            MqttError::AlreadyConnected => MqttError::AlreadyConnected,
            MqttError::BufferTooSmall => MqttError::BufferTooSmall,
            MqttError::Timeout => MqttError::Timeout,
            MqttError::Transport(never) => match never {},
        }
    }
}

/// Represents the return codes of a `CONNACK` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// An unknown or unspecified error occurred.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The server sent an invalid or unexpected response.
    InvalidResponse,
    /// The connection was closed by the broker.
    ConnectionClosed,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
    /// No packet identifier is available because every id is in flight.
    PacketIdsExhausted,
}

/// Errors of the BSON document codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BsonError {
    /// The document is truncated or its length fields are inconsistent.
    Malformed,
    /// No element with the requested name, or no further element.
    NotFound,
    /// The element has a different type than the requested one.
    TypeMismatch,
    /// An array that must carry values was empty.
    EmptyArray,
    /// A document that must carry values was empty.
    EmptyDocument,
    /// The serializer was already finalized with `end_document`.
    Finalized,
    /// The serialized bytes were requested before `end_document`.
    NotFinalized,
    /// Element names can not contain NUL bytes.
    InvalidKey,
}

/// Errors returned by the typed accessors of [`crate::value::Value`] and by [`crate::value::Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ValueError {
    /// The stored variant is not the requested one.
    TypeMismatch {
        expected: MappingType,
        found: MappingType,
    },
    /// An object already contains an entry for this path.
    DuplicatePath,
}

/// Errors raised while checking data against the interface it is sent on or
/// received from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataError {
    /// The interface is not part of the introspection.
    InterfaceNotFound,
    /// No mapping of the interface matches the path.
    MappingNotFound,
    /// The value type differs from the mapping type.
    TypeMismatch {
        expected: MappingType,
        found: MappingType,
    },
    /// Doubles must be finite numbers.
    NonFiniteDouble,
    /// The mapping requires an explicit timestamp.
    ExplicitTimestampRequired,
    /// The mapping does not accept an explicit timestamp.
    ExplicitTimestampNotSupported,
    /// The mapping does not allow unsetting the property.
    UnsetNotAllowed,
    /// An aggregated object must carry a value for every mapping.
    IncompleteObject,
    /// Paths must start with `/`.
    InvalidPath,
    /// The operation does not apply to this kind of interface.
    WrongInterfaceKind,
}

/// Errors of the introspection registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IntrospectionError {
    /// An interface with the same name is already present.
    AlreadyPresent,
    /// The new interface is not a compatible update of the present one.
    Conflicting,
    /// No interface with the given name.
    NotFound,
    /// Major and minor version can not be both zero.
    InvalidVersion,
    /// An interface needs at least one mapping.
    NoMappings,
    /// The output buffer can not hold the introspection string.
    BufferTooSmall { required: usize },
}

/// Errors of the flash key-value store, generic over the flash driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError<E> {
    /// The flash driver failed.
    Flash(E),
    /// No live record for the key.
    NotFound,
    /// The region has no room left even after reclaiming stale sectors.
    Full,
    /// The region must hold at least two sectors, each a multiple of the
    /// record slot size.
    InvalidGeometry,
    /// Namespaces and keys are limited to 255 bytes.
    KeyTooLong,
    /// Values are limited to 65535 bytes.
    ValueTooLarge,
    /// The output buffer is smaller than the stored value.
    BufferTooSmall { required: usize },
    /// A record failed its integrity check where one was expected.
    Corrupted,
}

/// Errors of the property cache, generic over the flash driver error.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CacheError<E> {
    Store(StoreError<E>),
    Bson(BsonError),
    Value(ValueError),
    /// A cached record does not have the expected layout.
    Malformed,
    /// The interface major version does not fit the stored `int32`.
    MajorOutOfRange,
}

impl<E> From<StoreError<E>> for CacheError<E> {
    fn from(err: StoreError<E>) -> Self {
        CacheError::Store(err)
    }
}

impl<E> From<BsonError> for CacheError<E> {
    fn from(err: BsonError) -> Self {
        CacheError::Bson(err)
    }
}

impl<E> From<ValueError> for CacheError<E> {
    fn from(err: ValueError) -> Self {
        CacheError::Value(err)
    }
}

impl<E> CacheError<E> {
    /// Whether the error only reports a missing record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Store(StoreError::NotFound))
    }
}

/// Rejected session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Empty, too long, or containing `/`, `+` or `#`.
    InvalidRealm,
    /// Empty, too long, or containing `/`, `+` or `#`.
    InvalidDeviceId,
}

/// Rejected broker address or TLS credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CredentialsError {
    /// Not a `host:port` pair or an `mqtts://` URL.
    InvalidBroker,
    /// Not a PEM encoded certificate.
    InvalidCertificate,
    /// Not a PEM encoded private key.
    InvalidPrivateKey,
}

/// Top level error of the device session.
///
/// Generic over the transport error `T` and the flash driver error `F`.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError<T, F> {
    Mqtt(MqttError<T>),
    Cache(CacheError<F>),
    Introspection(IntrospectionError),
    Data(DataError),
    Bson(BsonError),
    Value(ValueError),
    /// `connect` was called while a connection attempt is in progress.
    AlreadyConnecting,
    /// `connect` was called while already connected.
    AlreadyConnected,
    /// A caller supplied argument is not usable.
    InvalidParam,
    /// A compressed control payload could not be decoded.
    Compression,
}

impl<T, F> From<MqttError<T>> for DeviceError<T, F> {
    fn from(err: MqttError<T>) -> Self {
        DeviceError::Mqtt(err)
    }
}

impl<T, F> From<CacheError<F>> for DeviceError<T, F> {
    fn from(err: CacheError<F>) -> Self {
        DeviceError::Cache(err)
    }
}

impl<T, F> From<IntrospectionError> for DeviceError<T, F> {
    fn from(err: IntrospectionError) -> Self {
        DeviceError::Introspection(err)
    }
}

impl<T, F> From<DataError> for DeviceError<T, F> {
    fn from(err: DataError) -> Self {
        DeviceError::Data(err)
    }
}

impl<T, F> From<BsonError> for DeviceError<T, F> {
    fn from(err: BsonError) -> Self {
        DeviceError::Bson(err)
    }
}

impl<T, F> From<ConfigError> for DeviceError<T, F> {
    fn from(_: ConfigError) -> Self {
        DeviceError::InvalidParam
    }
}

impl<T, F> From<ValueError> for DeviceError<T, F> {
    fn from(err: ValueError) -> Self {
        DeviceError::Value(err)
    }
}

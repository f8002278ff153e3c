//! # Interface Descriptors
//!
//! Interfaces are declared statically, usually as `const` items generated from
//! the Astarte interface JSON files:
//!
//! ```ignore
//! const SENSOR: Interface = Interface {
//!     name: "org.example.Sensor",
//!     major_version: 1,
//!     minor_version: 0,
//!     interface_type: InterfaceType::Datastream,
//!     ownership: Ownership::Device,
//!     aggregation: Aggregation::Individual,
//!     mappings: &[Mapping::new("/%{sensor_id}/value", MappingType::Double)],
//! };
//! ```

use crate::error::DataError;
use crate::packet::QoS;
use crate::value::MappingType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InterfaceType {
    Datastream,
    Property,
}

/// Which side of the connection produces data on the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ownership {
    Device,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Aggregation {
    Individual,
    Object,
}

/// Delivery guarantee of a datastream mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reliability {
    Unreliable,
    Guaranteed,
    Unique,
}

impl Reliability {
    pub fn qos(self) -> QoS {
        match self {
            Reliability::Unreliable => QoS::AtMostOnce,
            Reliability::Guaranteed => QoS::AtLeastOnce,
            Reliability::Unique => QoS::ExactlyOnce,
        }
    }
}

/// One endpoint of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Endpoint pattern, e.g. `/%{room}/temperature`.
    pub endpoint: &'static str,
    pub mapping_type: MappingType,
    pub reliability: Reliability,
    pub explicit_timestamp: bool,
    /// Only meaningful for properties.
    pub allow_unset: bool,
}

impl Mapping {
    /// An unreliable mapping without explicit timestamp that can not be unset.
    pub const fn new(endpoint: &'static str, mapping_type: MappingType) -> Self {
        Self {
            endpoint,
            mapping_type,
            reliability: Reliability::Unreliable,
            explicit_timestamp: false,
            allow_unset: false,
        }
    }

    pub const fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub const fn with_explicit_timestamp(mut self) -> Self {
        self.explicit_timestamp = true;
        self
    }

    pub const fn with_allow_unset(mut self) -> Self {
        self.allow_unset = true;
        self
    }

    /// Matches a concrete path against the endpoint pattern.
    ///
    /// Both must start with `/` and have the same number of segments. A
    /// `%{name}` segment matches any non-empty segment.
    pub fn matches(&self, path: &str) -> bool {
        let (Some(endpoint), Some(path)) = (
            self.endpoint.strip_prefix('/'),
            path.strip_prefix('/'),
        ) else {
            return false;
        };

        let mut endpoint_segments = endpoint.split('/');
        let mut path_segments = path.split('/');
        loop {
            match (endpoint_segments.next(), path_segments.next()) {
                (None, None) => return true,
                (Some(pattern), Some(segment)) => {
                    if segment.is_empty() || segment.contains(['+', '#']) {
                        return false;
                    }
                    let parametric = pattern.starts_with("%{") && pattern.ends_with('}');
                    if !parametric && pattern != segment {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }
}

/// An Astarte interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub name: &'static str,
    pub major_version: u32,
    pub minor_version: u32,
    pub interface_type: InterfaceType,
    pub ownership: Ownership,
    pub aggregation: Aggregation,
    pub mappings: &'static [Mapping],
}

impl Interface {
    pub fn is_property(&self) -> bool {
        self.interface_type == InterfaceType::Property
    }

    pub fn is_server_owned(&self) -> bool {
        self.ownership == Ownership::Server
    }

    /// The mapping matching `path`.
    pub fn mapping(&self, path: &str) -> Result<&'static Mapping, DataError> {
        self.mappings
            .iter()
            .find(|mapping| mapping.matches(path))
            .ok_or(DataError::MappingNotFound)
    }

    /// The mapping of one entry of an object sent or received on `path`.
    pub fn object_mapping(&self, path: &str, entry: &str) -> Result<&'static Mapping, DataError> {
        let entry = entry.trim_start_matches('/');
        self.mappings
            .iter()
            .find(|mapping| {
                mapping
                    .endpoint
                    .rsplit_once('/')
                    .is_some_and(|(prefix, last)| {
                        last == entry
                            && Mapping {
                                endpoint: prefix,
                                ..**mapping
                            }
                            .matches(path)
                    })
            })
            .ok_or(DataError::MappingNotFound)
    }

    /// QoS of data published on `path`. Object interfaces share the
    /// reliability of their first mapping.
    pub fn qos(&self, path: &str) -> Result<QoS, DataError> {
        let mapping = match self.aggregation {
            Aggregation::Individual => self.mapping(path)?,
            Aggregation::Object => self.mappings.first().ok_or(DataError::MappingNotFound)?,
        };
        Ok(mapping.reliability.qos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSORS: Interface = Interface {
        name: "org.example.Sensors",
        major_version: 1,
        minor_version: 2,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Device,
        aggregation: Aggregation::Individual,
        mappings: &[
            Mapping::new("/%{sensor}/value", MappingType::Double)
                .with_reliability(Reliability::Guaranteed),
            Mapping::new("/status", MappingType::String),
        ],
    };

    const WEATHER: Interface = Interface {
        name: "org.example.Weather",
        major_version: 0,
        minor_version: 1,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Device,
        aggregation: Aggregation::Object,
        mappings: &[
            Mapping::new("/%{station}/temperature", MappingType::Double)
                .with_reliability(Reliability::Unique),
            Mapping::new("/%{station}/humidity", MappingType::Integer),
        ],
    };

    #[test]
    fn endpoint_matching() {
        let mapping = SENSORS.mappings[0];
        assert!(mapping.matches("/kitchen/value"));
        assert!(!mapping.matches("/kitchen/value/extra"));
        assert!(!mapping.matches("/kitchen"));
        assert!(!mapping.matches("//value"));
        assert!(!mapping.matches("/+/value"));
        assert!(!mapping.matches("kitchen/value"));
        assert!(SENSORS.mappings[1].matches("/status"));
        assert!(!SENSORS.mappings[1].matches("/statuses"));
    }

    #[test]
    fn mapping_lookup_and_qos() {
        assert_eq!(
            SENSORS.mapping("/a/value").unwrap().mapping_type,
            MappingType::Double
        );
        assert_eq!(SENSORS.mapping("/a/other"), Err(DataError::MappingNotFound));
        assert_eq!(SENSORS.qos("/a/value"), Ok(QoS::AtLeastOnce));
        assert_eq!(SENSORS.qos("/status"), Ok(QoS::AtMostOnce));
        assert_eq!(WEATHER.qos("/anything"), Ok(QoS::ExactlyOnce));
    }

    #[test]
    fn object_entry_lookup() {
        assert_eq!(
            WEATHER.object_mapping("/rome", "humidity").unwrap().mapping_type,
            MappingType::Integer
        );
        assert_eq!(
            WEATHER.object_mapping("/rome", "pressure"),
            Err(DataError::MappingNotFound)
        );
        assert_eq!(
            WEATHER.object_mapping("/rome/center", "humidity"),
            Err(DataError::MappingNotFound)
        );
    }
}

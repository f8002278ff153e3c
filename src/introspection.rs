//! # Introspection Registry
//!
//! The set of interfaces the device declares to Astarte. Its wire form is the
//! introspection string, `name:major:minor` entries joined by `;`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::error::IntrospectionError;
use crate::interface::Interface;

/// Introspection strings longer than this are accepted but may be refused by
/// brokers with small message limits.
const INTROSPECTION_WARN_SIZE: usize = 4096;

#[derive(Debug, Default, Clone)]
pub struct Introspection {
    interfaces: Vec<&'static Interface>,
}

impl Introspection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new interface.
    pub fn add(&mut self, interface: &'static Interface) -> Result<(), IntrospectionError> {
        validate(interface)?;
        if self.position(interface.name).is_some() {
            warn!("Interface {} is already in the introspection", interface.name);
            return Err(IntrospectionError::AlreadyPresent);
        }
        self.interfaces.push(interface);
        Ok(())
    }

    /// Adds an interface or replaces a previous version of it.
    ///
    /// A replacement keeps type and ownership and must raise the version:
    /// a greater major, or the same major with a greater minor. Re-adding the
    /// very same version is a conflict.
    pub fn update(&mut self, interface: &'static Interface) -> Result<(), IntrospectionError> {
        validate(interface)?;
        let Some(idx) = self.position(interface.name) else {
            self.interfaces.push(interface);
            return Ok(());
        };

        let old = self.interfaces[idx];
        if old.ownership != interface.ownership || old.interface_type != interface.interface_type {
            error!("Interface {} changes ownership or type", interface.name);
            return Err(IntrospectionError::Conflicting);
        }
        if interface.major_version < old.major_version
            || (interface.major_version == old.major_version
                && interface.minor_version <= old.minor_version)
        {
            error!(
                "Interface {} version {}.{} does not supersede {}.{}",
                interface.name,
                interface.major_version,
                interface.minor_version,
                old.major_version,
                old.minor_version
            );
            return Err(IntrospectionError::Conflicting);
        }

        debug!(
            "Updating interface {} to {}.{}",
            interface.name, interface.major_version, interface.minor_version
        );
        self.interfaces[idx] = interface;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&'static Interface> {
        self.position(name).map(|idx| self.interfaces[idx])
    }

    pub fn remove(&mut self, name: &str) -> Result<&'static Interface, IntrospectionError> {
        let idx = self.position(name).ok_or(IntrospectionError::NotFound)?;
        Ok(self.interfaces.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Interface> + '_ {
        self.interfaces.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Exact length in bytes of the introspection string.
    pub fn string_size(&self) -> usize {
        let mut counter = Counter(0);
        // Counting never fails.
        let _ = self.write_to(&mut counter);
        counter.0
    }

    /// Writes the introspection string into `buf`, returning the written length.
    pub fn fill_string(&self, buf: &mut [u8]) -> Result<usize, IntrospectionError> {
        let required = self.string_size();
        if buf.len() < required {
            return Err(IntrospectionError::BufferTooSmall { required });
        }
        let mut writer = SliceWriter { buf, len: 0 };
        self.write_to(&mut writer)
            .map_err(|_| IntrospectionError::BufferTooSmall { required })?;
        Ok(writer.len)
    }

    /// Allocates exactly [`Introspection::string_size`] bytes and renders the
    /// introspection string.
    pub fn to_introspection_string(&self) -> String {
        let size = self.string_size();
        if size > INTROSPECTION_WARN_SIZE {
            warn!("Introspection string is {} bytes long", size);
        }
        let mut out = String::with_capacity(size);
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut impl Write) -> core::fmt::Result {
        for (i, interface) in self.interfaces.iter().enumerate() {
            if i > 0 {
                out.write_char(';')?;
            }
            write!(
                out,
                "{}:{}:{}",
                interface.name, interface.major_version, interface.minor_version
            )?;
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| i.name == name)
    }
}

fn validate(interface: &Interface) -> Result<(), IntrospectionError> {
    if interface.major_version == 0 && interface.minor_version == 0 {
        return Err(IntrospectionError::InvalidVersion);
    }
    if interface.mappings.is_empty() {
        return Err(IntrospectionError::NoMappings);
    }
    Ok(())
}

struct Counter(usize);

impl Write for Counter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let end = self.len + s.len();
        let dst = self.buf.get_mut(self.len..end).ok_or(core::fmt::Error)?;
        dst.copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Aggregation, InterfaceType, Mapping, Ownership};
    use crate::value::MappingType;

    const MAPPINGS: &[Mapping] = &[Mapping::new("/value", MappingType::Integer)];

    const fn interface(name: &'static str, major: u32, minor: u32, ownership: Ownership) -> Interface {
        Interface {
            name,
            major_version: major,
            minor_version: minor,
            interface_type: InterfaceType::Datastream,
            ownership,
            aggregation: Aggregation::Individual,
            mappings: MAPPINGS,
        }
    }

    static FOO_1_0: Interface = interface("com.example.Foo", 1, 0, Ownership::Device);
    static FOO_1_0_AGAIN: Interface = interface("com.example.Foo", 1, 0, Ownership::Device);
    static FOO_1_1: Interface = interface("com.example.Foo", 1, 1, Ownership::Device);
    static FOO_2_0: Interface = interface("com.example.Foo", 2, 0, Ownership::Device);
    static FOO_0_9: Interface = interface("com.example.Foo", 0, 9, Ownership::Device);
    static FOO_SERVER: Interface = interface("com.example.Foo", 3, 0, Ownership::Server);
    static BAR: Interface = interface("com.example.Bar", 0, 1, Ownership::Server);
    static INVALID: Interface = interface("com.example.Invalid", 0, 0, Ownership::Device);

    #[test]
    fn add_get_remove() {
        let mut introspection = Introspection::new();
        introspection.add(&FOO_1_0).unwrap();
        introspection.add(&BAR).unwrap();
        assert_eq!(
            introspection.add(&FOO_1_1),
            Err(IntrospectionError::AlreadyPresent)
        );
        assert_eq!(introspection.get("com.example.Foo"), Some(&FOO_1_0));
        assert_eq!(introspection.len(), 2);

        introspection.remove("com.example.Bar").unwrap();
        assert_eq!(
            introspection.remove("com.example.Bar"),
            Err(IntrospectionError::NotFound)
        );
        assert!(introspection.get("com.example.Bar").is_none());
    }

    #[test]
    fn rejects_invalid_versions() {
        let mut introspection = Introspection::new();
        assert_eq!(
            introspection.add(&INVALID),
            Err(IntrospectionError::InvalidVersion)
        );
        assert_eq!(
            introspection.update(&INVALID),
            Err(IntrospectionError::InvalidVersion)
        );
    }

    #[test]
    fn update_with_identical_version_conflicts() {
        let mut introspection = Introspection::new();
        introspection.update(&FOO_1_0).unwrap();
        assert_eq!(
            introspection.update(&FOO_1_0_AGAIN),
            Err(IntrospectionError::Conflicting)
        );
        assert_eq!(
            introspection.update(&FOO_1_0),
            Err(IntrospectionError::Conflicting)
        );
    }

    #[test]
    fn update_requires_a_version_bump() {
        let mut introspection = Introspection::new();
        introspection.add(&FOO_1_1).unwrap();
        assert_eq!(
            introspection.update(&FOO_1_0),
            Err(IntrospectionError::Conflicting)
        );
        assert_eq!(
            introspection.update(&FOO_0_9),
            Err(IntrospectionError::Conflicting)
        );
        assert_eq!(
            introspection.update(&FOO_SERVER),
            Err(IntrospectionError::Conflicting)
        );
        introspection.update(&FOO_2_0).unwrap();
        assert_eq!(
            introspection.get("com.example.Foo").unwrap().major_version,
            2
        );
    }

    #[test]
    fn introspection_string() {
        let mut introspection = Introspection::new();
        assert_eq!(introspection.string_size(), 0);
        assert_eq!(introspection.to_introspection_string(), "");

        introspection.add(&FOO_1_1).unwrap();
        introspection.add(&BAR).unwrap();
        let expected = "com.example.Foo:1:1;com.example.Bar:0:1";
        assert_eq!(introspection.string_size(), expected.len());
        assert_eq!(introspection.to_introspection_string(), expected);

        let mut buf = [0u8; 64];
        let len = introspection.fill_string(&mut buf).unwrap();
        assert_eq!(&buf[..len], expected.as_bytes());

        let mut small = [0u8; 8];
        assert_eq!(
            introspection.fill_string(&mut small),
            Err(IntrospectionError::BufferTooSmall {
                required: expected.len()
            })
        );
    }
}

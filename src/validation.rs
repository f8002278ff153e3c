//! Checks applied to data before it is published on, or after it is received
//! from, an interface.

use crate::error::DataError;
use crate::interface::{Aggregation, Interface, Mapping};
use crate::value::{Object, Value};

/// Checks that `value` has the type of `mapping` and carries finite doubles.
pub fn check_value(mapping: &Mapping, value: &Value) -> Result<(), DataError> {
    let found = value.mapping_type();
    if found != mapping.mapping_type {
        return Err(DataError::TypeMismatch {
            expected: mapping.mapping_type,
            found,
        });
    }
    if !value.is_finite() {
        return Err(DataError::NonFiniteDouble);
    }
    Ok(())
}

fn check_timestamp(mapping: &Mapping, timestamp: Option<i64>) -> Result<(), DataError> {
    match (mapping.explicit_timestamp, timestamp) {
        (true, None) => Err(DataError::ExplicitTimestampRequired),
        (false, Some(_)) => Err(DataError::ExplicitTimestampNotSupported),
        _ => Ok(()),
    }
}

fn check_path(path: &str) -> Result<(), DataError> {
    if !path.starts_with('/') {
        return Err(DataError::InvalidPath);
    }
    Ok(())
}

/// Validates an individual datastream sample.
pub fn check_individual(
    interface: &Interface,
    path: &str,
    value: &Value,
    timestamp: Option<i64>,
) -> Result<(), DataError> {
    check_path(path)?;
    if interface.aggregation != Aggregation::Individual {
        return Err(DataError::WrongInterfaceKind);
    }
    let mapping = interface.mapping(path)?;
    check_value(mapping, value)?;
    check_timestamp(mapping, timestamp)
}

/// Validates an aggregated object sample.
///
/// Objects sent by the device must carry a value for every mapping.
pub fn check_object(
    interface: &Interface,
    path: &str,
    object: &Object,
    timestamp: Option<i64>,
) -> Result<(), DataError> {
    check_path(path)?;
    if interface.aggregation != Aggregation::Object || interface.is_property() {
        return Err(DataError::WrongInterfaceKind);
    }
    if object.len() != interface.mappings.len() {
        return Err(DataError::IncompleteObject);
    }
    for entry in object.iter() {
        let mapping = interface.object_mapping(path, &entry.path)?;
        check_value(mapping, &entry.value)?;
        check_timestamp(mapping, timestamp)?;
    }
    Ok(())
}

/// Validates a property set. Properties never carry explicit timestamps.
pub fn check_set_property(interface: &Interface, path: &str, value: &Value) -> Result<(), DataError> {
    if !interface.is_property() {
        return Err(DataError::WrongInterfaceKind);
    }
    check_individual(interface, path, value, None)
}

/// Validates a property unset.
pub fn check_unset_property(interface: &Interface, path: &str) -> Result<(), DataError> {
    check_path(path)?;
    if !interface.is_property() {
        return Err(DataError::WrongInterfaceKind);
    }
    let mapping = interface.mapping(path)?;
    if !mapping.allow_unset {
        return Err(DataError::UnsetNotAllowed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{InterfaceType, Ownership};
    use crate::value::MappingType;
    use alloc::string::String;
    use alloc::vec;

    const LOG: Interface = Interface {
        name: "org.example.Log",
        major_version: 1,
        minor_version: 0,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Device,
        aggregation: Aggregation::Individual,
        mappings: &[
            Mapping::new("/line", MappingType::String).with_explicit_timestamp(),
            Mapping::new("/level", MappingType::Double),
        ],
    };

    const SETTINGS: Interface = Interface {
        name: "org.example.Settings",
        major_version: 2,
        minor_version: 0,
        interface_type: InterfaceType::Property,
        ownership: Ownership::Device,
        aggregation: Aggregation::Individual,
        mappings: &[
            Mapping::new("/name", MappingType::String).with_allow_unset(),
            Mapping::new("/%{slot}/enabled", MappingType::Boolean),
        ],
    };

    const SAMPLE: Interface = Interface {
        name: "org.example.Sample",
        major_version: 1,
        minor_version: 0,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Device,
        aggregation: Aggregation::Object,
        mappings: &[
            Mapping::new("/%{id}/a", MappingType::Integer),
            Mapping::new("/%{id}/b", MappingType::DoubleArray),
        ],
    };

    #[test]
    fn timestamps_follow_the_mapping() {
        let line = Value::from("boot");
        assert_eq!(check_individual(&LOG, "/line", &line, Some(10)), Ok(()));
        assert_eq!(
            check_individual(&LOG, "/line", &line, None),
            Err(DataError::ExplicitTimestampRequired)
        );
        assert_eq!(
            check_individual(&LOG, "/level", &Value::Double(1.0), Some(10)),
            Err(DataError::ExplicitTimestampNotSupported)
        );
    }

    #[test]
    fn types_and_doubles() {
        assert_eq!(
            check_individual(&LOG, "/level", &Value::Integer(1), None),
            Err(DataError::TypeMismatch {
                expected: MappingType::Double,
                found: MappingType::Integer,
            })
        );
        assert_eq!(
            check_individual(&LOG, "/level", &Value::Double(f64::NAN), None),
            Err(DataError::NonFiniteDouble)
        );
        assert_eq!(
            check_individual(&LOG, "level", &Value::Double(1.0), None),
            Err(DataError::InvalidPath)
        );
    }

    #[test]
    fn property_rules() {
        assert_eq!(
            check_set_property(&SETTINGS, "/3/enabled", &Value::Boolean(true)),
            Ok(())
        );
        assert_eq!(
            check_set_property(&LOG, "/level", &Value::Double(1.0)),
            Err(DataError::WrongInterfaceKind)
        );
        assert_eq!(check_unset_property(&SETTINGS, "/name"), Ok(()));
        assert_eq!(
            check_unset_property(&SETTINGS, "/3/enabled"),
            Err(DataError::UnsetNotAllowed)
        );
        assert_eq!(
            check_unset_property(&SETTINGS, "/missing"),
            Err(DataError::MappingNotFound)
        );
    }

    #[test]
    fn objects_must_be_complete() {
        let mut object = Object::new();
        object.insert("a", Value::Integer(1)).unwrap();
        assert_eq!(
            check_object(&SAMPLE, "/x", &object, None),
            Err(DataError::IncompleteObject)
        );
        object.insert("b", Value::from(vec![0.5])).unwrap();
        assert_eq!(check_object(&SAMPLE, "/x", &object, None), Ok(()));

        let wrong: Object = [
            (String::from("a"), Value::Integer(1)),
            (String::from("c"), Value::Integer(2)),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            check_object(&SAMPLE, "/x", &wrong, None),
            Err(DataError::MappingNotFound)
        );
    }
}

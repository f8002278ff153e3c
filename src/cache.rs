//! # Property Cache
//!
//! Persists what the device needs to resume a session without a full
//! handshake: the last property values, the introspection sent to Astarte and
//! whether that handshake completed.
//!
//! Properties are stored as BSON documents `{major, type, data}` under the key
//! `<interface>;<path>`.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::bson::{BsonSerializer, Document};
use crate::error::{CacheError, StoreError};
use crate::introspection::Introspection;
use crate::storage::{FlashRegion, KvStore};
use crate::value::{MappingType, Value};

const SYNCHRONIZATION_NAMESPACE: &str = "synchronization_namespace";
const SYNCHRONIZATION_KEY: &str = "synchronization_status";
const INTROSPECTION_NAMESPACE: &str = "introspection_namespace";
const INTROSPECTION_KEY: &str = "introspection_string";
const PROPERTIES_NAMESPACE: &str = "properties_namespace";

/// A property read back from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProperty {
    /// Major version of the interface at the time the value was stored.
    pub major: u32,
    pub value: Value,
}

pub struct PropertyCache<F: FlashRegion> {
    store: KvStore<F>,
}

type Result<T, F> = core::result::Result<T, CacheError<<F as FlashRegion>::Error>>;

impl<F: FlashRegion> PropertyCache<F> {
    pub fn new(store: KvStore<F>) -> Self {
        Self { store }
    }

    /// Mounts the key-value store on `flash`.
    pub async fn mount(flash: F) -> Result<Self, F> {
        Ok(Self::new(KvStore::mount(flash).await?))
    }

    pub fn into_store(self) -> KvStore<F> {
        self.store
    }

    /// Stores or overwrites a property value.
    pub async fn store_property(
        &mut self,
        interface: &str,
        path: &str,
        major: u32,
        value: &Value,
    ) -> Result<(), F> {
        // Loading reads the major back as a non-negative int32.
        let major = i32::try_from(major).map_err(|_| CacheError::MajorOutOfRange)?;
        let mut bson = BsonSerializer::new();
        bson.append_int32("major", major)?;
        bson.append_int64("type", value.mapping_type().tag())?;
        value.serialize(&mut bson, "data")?;
        bson.end_document()?;

        trace!("Caching property {}{}", interface, path);
        self.store
            .namespace(PROPERTIES_NAMESPACE)
            .insert(&property_key(interface, path), bson.as_bytes()?)
            .await?;
        Ok(())
    }

    pub async fn load_property(&mut self, interface: &str, path: &str) -> Result<StoredProperty, F> {
        let raw = self
            .store
            .namespace(PROPERTIES_NAMESPACE)
            .find_vec(&property_key(interface, path))
            .await?;
        parse_property(&raw)
    }

    /// Removes a property. Removing a missing property is not an error.
    pub async fn delete_property(&mut self, interface: &str, path: &str) -> Result<(), F> {
        match self
            .store
            .namespace(PROPERTIES_NAMESPACE)
            .delete(&property_key(interface, path))
            .await
        {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// `(interface, path)` of every cached property, most recently stored
    /// first.
    pub fn property_keys(&mut self) -> Vec<(String, String)> {
        self.store
            .namespace(PROPERTIES_NAMESPACE)
            .keys()
            .filter_map(|key| match key.split_once(';') {
                Some((interface, path)) => Some((interface.into(), path.into())),
                None => {
                    warn!("Ignoring malformed property key {}", key);
                    None
                }
            })
            .collect()
    }

    /// The `;`-joined `<interface><path>` list of cached device-owned
    /// properties.
    ///
    /// Properties of interfaces missing from `introspection` are deleted on
    /// the way.
    pub async fn device_properties_string(&mut self, introspection: &Introspection) -> Result<String, F> {
        let mut out = String::new();
        for (interface_name, path) in self.property_keys() {
            let Some(interface) = introspection.get(&interface_name) else {
                debug!("Purging property from unknown interface {}{}", interface_name, path);
                self.delete_property(&interface_name, &path).await?;
                continue;
            };
            if interface.is_server_owned() {
                continue;
            }
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(&interface_name);
            out.push_str(&path);
        }
        Ok(out)
    }

    /// Deletes the cached server-owned properties that Astarte no longer
    /// knows about, along with properties of interfaces missing from
    /// `introspection`.
    ///
    /// `allow_list` holds `<interface><path>` entries. Device-owned properties
    /// are kept.
    pub async fn purge_server_properties(
        &mut self,
        introspection: &Introspection,
        allow_list: &[&str],
    ) -> Result<(), F> {
        for (interface_name, path) in self.property_keys() {
            let purge = match introspection.get(&interface_name) {
                None => true,
                Some(interface) if interface.is_server_owned() => {
                    let property = format!("{interface_name}{path}");
                    !allow_list.contains(&property.as_str())
                }
                Some(_) => false,
            };
            if purge {
                debug!("Purging property {}{}", interface_name, path);
                self.delete_property(&interface_name, &path).await?;
            }
        }
        Ok(())
    }

    pub async fn store_introspection(&mut self, introspection: &str) -> Result<(), F> {
        debug!("Caching introspection: {}", introspection);
        self.store
            .namespace(INTROSPECTION_NAMESPACE)
            .insert(INTROSPECTION_KEY, introspection.as_bytes())
            .await?;
        Ok(())
    }

    /// Whether `introspection` is the one stored by the last successful
    /// handshake.
    pub async fn introspection_matches(&mut self, introspection: &str) -> Result<bool, F> {
        let mut ns = self.store.namespace(INTROSPECTION_NAMESPACE);
        let size = match ns.find(INTROSPECTION_KEY, None).await {
            Ok(size) => size,
            Err(StoreError::NotFound) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if size != introspection.len() {
            return Ok(false);
        }
        Ok(ns.find_vec(INTROSPECTION_KEY).await? == introspection.as_bytes())
    }

    pub async fn set_synchronized(&mut self, synchronized: bool) -> Result<(), F> {
        debug!("Storing synchronization flag: {}", synchronized);
        self.store
            .namespace(SYNCHRONIZATION_NAMESPACE)
            .insert(SYNCHRONIZATION_KEY, &[synchronized as u8])
            .await?;
        Ok(())
    }

    /// Whether the last handshake completed. A missing flag reads as `false`.
    pub async fn is_synchronized(&mut self) -> Result<bool, F> {
        let mut flag = [0u8; 1];
        match self
            .store
            .namespace(SYNCHRONIZATION_NAMESPACE)
            .find(SYNCHRONIZATION_KEY, Some(&mut flag))
            .await
        {
            Ok(_) => Ok(flag[0] != 0),
            Err(StoreError::NotFound) => {
                info!("No previous synchronization with Astarte present");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn property_key(interface: &str, path: &str) -> String {
    format!("{interface};{path}")
}

fn parse_property<E>(raw: &[u8]) -> core::result::Result<StoredProperty, CacheError<E>> {
    let document = Document::new(raw)?;
    let major = document.lookup("major")?.as_int32()?;
    let tag = document.lookup("type")?.as_long_integer()?;
    let ty = MappingType::from_tag(tag).ok_or(CacheError::Malformed)?;
    let value = Value::deserialize_stored(&document.lookup("data")?, ty)?;
    Ok(StoredProperty {
        major: u32::try_from(major).map_err(|_| CacheError::Malformed)?,
        value,
    })
}

//! # Astarte Device Client for Embedded Systems
//!
//! `myrtio-astarte` connects a `no_std` device to [Astarte](https://docs.astarte-platform.org/)
//! over MQTT 3.1.1, built upon the [Embassy](https://embassy.dev/) async ecosystem.
//!
//! ## Core Features
//!
//! - **`no_std` + `alloc`:** Runs on bare-metal microcontrollers with a global allocator.
//!   Configuration lives in `heapless` strings, payloads in `alloc` buffers.
//! - **Fully Async:** Built with `async/await` on Embassy timers and networking.
//! - **Rust 2024 Edition:** Uses native `async fn` in traits, removing the need for `async-trait`.
//! - **Transport Agnostic:** The `MqttTransport` trait runs the client over plain TCP, or over
//!   mutual TLS with `TlsTransport` and the TLS engine the application plugs in.
//! - **QoS 0, 1 & 2:** Both directions, with retransmission of unacknowledged packets.
//! - **Persistent Properties:** Property values, the last introspection and the handshake state
//!   survive reboots in an append-only key-value log on flash.
//!
//! ## Architecture
//!
//! ### 1. Interfaces
//!
//! Interfaces are declared statically and collected into an [`Introspection`]:
//!
//! ```ignore
//! static SENSORS: Interface = Interface {
//!     name: "org.example.Sensors",
//!     major_version: 1,
//!     minor_version: 0,
//!     interface_type: InterfaceType::Datastream,
//!     ownership: Ownership::Device,
//!     aggregation: Aggregation::Individual,
//!     mappings: &[Mapping::new("/%{sensor_id}/value", MappingType::Double)],
//! };
//!
//! let mut introspection = Introspection::new();
//! introspection.add(&SENSORS)?;
//! ```
//!
//! ### 2. Session
//!
//! A [`Session`] owns the MQTT client, the introspection and optionally the
//! [`PropertyCache`]:
//!
//! ```ignore
//! let cache = PropertyCache::mount(flash).await?;
//! let config = SessionConfig::new("realm", "device-id")?;
//! let mut session = Session::<_, _, _, 2048>::new(transport, EmbassyClock, config, introspection, Some(cache));
//! session.connect().await?;
//!
//! loop {
//!     match session.poll().await {
//!         Ok(Some(DeviceEvent::Connected)) => {
//!             session.stream_individual("org.example.Sensors", "/1/value", &21.5.into(), None).await?;
//!         }
//!         Ok(Some(event)) => handle(event),
//!         Ok(None) => {}
//!         Err(e) => log_error(e),
//!     }
//! }
//! ```
//!
//! ### 3. Direct Client Usage
//!
//! The MQTT layer is usable on its own:
//!
//! ```ignore
//! let mut client = MqttClient::<_, _, 256>::new(transport, EmbassyClock, MqttOptions::new("client-id"));
//! client.connect().await?;
//! client.subscribe("topic", QoS::AtMostOnce).await?;
//! client.publish("topic", b"payload", QoS::AtMostOnce).await?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod backoff;
pub mod bson;
pub mod cache;
pub mod client;
pub mod device_id;
pub mod error;
pub mod interface;
pub mod introspection;
pub mod packet;
pub mod session;
pub mod storage;
pub mod time;
pub mod tls;
pub mod transport;
pub mod util;
pub mod validation;
pub mod value;
pub mod zlib;

// Re-export key types for easier access at the crate root.
pub use cache::{PropertyCache, StoredProperty};
pub use client::{MqttClient, MqttEvent, MqttOptions};
pub use error::DeviceError;
pub use interface::{Aggregation, Interface, InterfaceType, Mapping, Ownership, Reliability};
pub use introspection::Introspection;
pub use packet::QoS;
pub use session::{DeviceEvent, EventChannel, Session, SessionConfig, SessionState};
pub use storage::{FlashRegion, KvStore, RamFlash};
pub use time::{Clock, EmbassyClock};
pub use tls::{BrokerAddress, ClientCredentials, TlsConnector, TlsTransport};
pub use transport::{MqttTransport, TcpTransport};
pub use value::{MappingType, Object, Value};

//! # Astarte Device Session
//!
//! [`Session`] runs the Astarte protocol on top of an [`MqttClient`]: the
//! handshake after every new MQTT session, routing of data published by
//! Astarte and validation of the data the device sends.
//!
//! The session is driven by a single task calling [`Session::poll`], or
//! [`Session::run`] to forward every [`DeviceEvent`] to an [`EventChannel`].
//! Other tasks share the session behind an `embassy_sync::mutex::Mutex`.
//!
//! ```ignore
//! static EVENTS: EventChannel<8> = EventChannel::new();
//!
//! let config = SessionConfig::new("realm", "device-id")?;
//! let mut session = Session::<_, _, _, 2048>::new(transport, EmbassyClock, config, introspection, Some(cache));
//! session.connect().await?;
//! session.run(EVENTS.sender()).await;
//! ```

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Duration, Instant, Timer};

use crate::backoff::Backoff;
use crate::bson::{BsonSerializer, Document};
use crate::cache::PropertyCache;
use crate::client::{ConnectionState, Message, MqttClient, MqttEvent, MqttOptions};
use crate::error::{BsonError, ConfigError, DataError, DeviceError, MqttError};
use crate::interface::{Aggregation, Interface};
use crate::introspection::Introspection;
use crate::packet::QoS;
use crate::storage::FlashRegion;
use crate::time::Clock;
use crate::transport::MqttTransport;
use crate::validation::{
    check_individual, check_object, check_set_property, check_unset_property, check_value,
};
use crate::value::{Object, Value};
use crate::zlib;

pub const MAX_REALM_LEN: usize = 64;
pub const MAX_DEVICE_ID_LEN: usize = 32;

/// Pause of [`Session::run`] while waiting for a reconnection deadline.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type EventChannel<const N: usize> = Channel<CriticalSectionRawMutex, DeviceEvent, N>;
pub type EventSender<'a, const N: usize> = Sender<'a, CriticalSectionRawMutex, DeviceEvent, N>;
pub type EventReceiver<'a, const N: usize> = Receiver<'a, CriticalSectionRawMutex, DeviceEvent, N>;

type Result<T, Tr, F> = core::result::Result<
    T,
    DeviceError<<Tr as MqttTransport>::Error, <F as FlashRegion>::Error>,
>;

/// Identity and timing of a device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    realm: heapless::String<MAX_REALM_LEN>,
    device_id: heapless::String<MAX_DEVICE_ID_LEN>,
    keep_alive: Duration,
    connection_timeout: Duration,
    retransmit_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    max_purge_size: usize,
}

impl SessionConfig {
    pub fn new(realm: &str, device_id: &str) -> core::result::Result<Self, ConfigError> {
        Ok(Self {
            realm: topic_segment(realm).ok_or(ConfigError::InvalidRealm)?,
            device_id: topic_segment(device_id).ok_or(ConfigError::InvalidDeviceId)?,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            retransmit_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_purge_size: zlib::DEFAULT_MAX_PURGE_SIZE,
        })
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    /// Bounds of the delay before reconnecting, and before retrying a failed
    /// handshake.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Largest uncompressed purge list accepted from the server.
    pub fn with_max_purge_size(mut self, max: usize) -> Self {
        self.max_purge_size = max;
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// `<realm>/<device_id>`, the MQTT client id and the root of every topic.
    pub fn base_topic(&self) -> String {
        format!("{}/{}", self.realm, self.device_id)
    }

    fn mqtt_options(&self) -> MqttOptions {
        MqttOptions::new(self.base_topic())
            .with_keep_alive(self.keep_alive)
            .with_clean_session(false)
            .with_connection_timeout(self.connection_timeout)
            .with_retransmit_timeout(self.retransmit_timeout)
            .with_backoff(self.backoff_initial, self.backoff_max)
    }
}

fn topic_segment<const N: usize>(segment: &str) -> Option<heapless::String<N>> {
    if segment.is_empty() || segment.contains(['/', '+', '#']) {
        return None;
    }
    let mut out = heapless::String::new();
    out.push_str(segment).ok()?;
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Disconnected,
    /// Waiting for CONNACK or for the handshake to be acknowledged.
    Connecting,
    Connected,
    Disconnecting,
    /// Waiting to reconnect, or to retry a refused handshake.
    ConnectionError,
}

/// Something that happened on the session.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The handshake completed, the device can send data.
    Connected,
    Disconnected,
    Datastream {
        interface: &'static str,
        path: String,
        value: Value,
        timestamp: Option<i64>,
    },
    Object {
        interface: &'static str,
        path: String,
        object: Object,
        timestamp: Option<i64>,
    },
    PropertySet {
        interface: &'static str,
        path: String,
        value: Value,
    },
    PropertyUnset {
        interface: &'static str,
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    InProgress,
    Failed { retry_at: Instant },
    Done,
}

/// An Astarte device connected through the transport `T`, caching properties
/// on the flash region `F`.
pub struct Session<T, F, C, const BUF_SIZE: usize>
where
    T: MqttTransport,
    F: FlashRegion,
    C: Clock,
{
    client: MqttClient<T, C, BUF_SIZE>,
    config: SessionConfig,
    base_topic: String,
    introspection: Introspection,
    cache: Option<PropertyCache<F>>,
    /// Whether the last handshake completed, mirrored in the cache.
    synchronized: bool,
    handshake: Handshake,
    subscription_failed: bool,
    /// Delay before retrying a failed handshake.
    backoff: Backoff,
    /// A completed session was lost and the event was not reported yet.
    pending_disconnected: bool,
    /// Events received while draining before a disconnection.
    deferred: VecDeque<DeviceEvent>,
}

impl<T, F, C, const BUF_SIZE: usize> Session<T, F, C, BUF_SIZE>
where
    T: MqttTransport,
    F: FlashRegion,
    C: Clock,
{
    pub fn new(
        transport: T,
        clock: C,
        config: SessionConfig,
        introspection: Introspection,
        cache: Option<PropertyCache<F>>,
    ) -> Self {
        Self {
            client: MqttClient::new(transport, clock, config.mqtt_options()),
            base_topic: config.base_topic(),
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            config,
            introspection,
            cache,
            synchronized: false,
            handshake: Handshake::Idle,
            subscription_failed: false,
            pending_disconnected: false,
            deferred: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn introspection(&self) -> &Introspection {
        &self.introspection
    }

    /// Adds `interface`, or moves the registered one to a newer version.
    ///
    /// The cached handshake state is dropped so the next connection runs the
    /// full handshake. A connected device announces the new introspection
    /// right away, subscribing first when the interface is server owned.
    pub async fn add_interface(&mut self, interface: &'static Interface) -> Result<(), T, F> {
        self.introspection.update(interface)?;
        self.introspection_changed(Some(interface)).await
    }

    /// Removes the interface called `name`, announcing the change like
    /// [`Session::add_interface`].
    pub async fn remove_interface(&mut self, name: &str) -> Result<(), T, F> {
        self.introspection.remove(name)?;
        self.introspection_changed(None).await
    }

    pub fn cache_mut(&mut self) -> Option<&mut PropertyCache<F>> {
        self.cache.as_mut()
    }

    pub fn has_pending_outgoing(&self) -> bool {
        self.client.has_pending_outgoing()
    }

    pub fn state(&self) -> SessionState {
        match self.client.state() {
            ConnectionState::Disconnected => SessionState::Disconnected,
            ConnectionState::Connecting => SessionState::Connecting,
            ConnectionState::Disconnecting => SessionState::Disconnecting,
            ConnectionState::ConnectionError => SessionState::ConnectionError,
            ConnectionState::Connected => match self.handshake {
                Handshake::Done => SessionState::Connected,
                Handshake::Failed { .. } => SessionState::ConnectionError,
                Handshake::Idle | Handshake::InProgress => SessionState::Connecting,
            },
        }
    }

    /// Starts connecting. [`DeviceEvent::Connected`] follows from
    /// [`Session::poll`] once the handshake is acknowledged.
    ///
    /// While the MQTT link is up but the handshake waits for a retry, the
    /// session is still connecting.
    pub async fn connect(&mut self) -> Result<(), T, F> {
        match (self.client.state(), self.state()) {
            (_, SessionState::Connected) => return Err(DeviceError::AlreadyConnected),
            (ConnectionState::Connecting | ConnectionState::Connected, _) => {
                return Err(DeviceError::AlreadyConnecting);
            }
            _ => {}
        }
        info!("Connecting to {}", self.base_topic.as_str());
        self.handshake = Handshake::Idle;
        self.client.connect().await?;
        Ok(())
    }

    /// Waits up to `timeout` for every QoS 1 and 2 message to be
    /// acknowledged, then closes the connection.
    ///
    /// Events received meanwhile are returned by the next calls to
    /// [`Session::poll`], ahead of [`DeviceEvent::Disconnected`]. When
    /// messages are still pending at the deadline the connection is closed
    /// anyway and `MqttError::Timeout` is returned.
    pub async fn disconnect_graceful(&mut self, timeout: Duration) -> Result<(), T, F> {
        let deadline = self.client.clock().now() + timeout;
        while self.client.state() == ConnectionState::Connected
            && self.client.has_pending_outgoing()
            && self.client.clock().now() < deadline
        {
            match self.step().await {
                Ok(Some(event)) => self.deferred.push_back(event),
                Ok(None) => {}
                Err(_) => {
                    warn!("Session poll failed while draining");
                    self.check_link();
                }
            }
        }

        let drained = !self.client.has_pending_outgoing();
        if !drained {
            warn!("Disconnecting with unacknowledged messages");
        }
        self.disconnect().await;
        if drained {
            Ok(())
        } else {
            Err(DeviceError::Mqtt(MqttError::Timeout))
        }
    }

    /// Closes the connection right away, dropping unacknowledged messages.
    /// [`DeviceEvent::Disconnected`] follows from the next [`Session::poll`].
    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
        self.handshake = Handshake::Idle;
        self.pending_disconnected = false;
    }

    /// Advances the session by at most one received packet.
    pub async fn poll(&mut self) -> Result<Option<DeviceEvent>, T, F> {
        if let Some(event) = self.deferred.pop_front() {
            return Ok(Some(event));
        }
        if core::mem::take(&mut self.pending_disconnected) {
            return Ok(Some(DeviceEvent::Disconnected));
        }
        let result = self.step().await;
        if result.is_err() {
            self.check_link();
        }
        result
    }

    /// Polls forever, forwarding every event to `events`.
    pub async fn run<const N: usize>(&mut self, events: EventSender<'_, N>) {
        loop {
            match self.poll().await {
                Ok(Some(event)) => events.send(event).await,
                Ok(None) => match self.state() {
                    SessionState::Disconnected | SessionState::ConnectionError => {
                        Timer::after(IDLE_POLL_INTERVAL).await
                    }
                    _ => embassy_futures::yield_now().await,
                },
                Err(_) => warn!("Session poll failed"),
            }
        }
    }

    /// Streams a sample on an individual datastream.
    pub async fn stream_individual(
        &mut self,
        interface: &str,
        path: &str,
        value: &Value,
        timestamp: Option<i64>,
    ) -> Result<(), T, F> {
        self.ensure_connected()?;
        let interface = self.device_interface(interface)?;
        if interface.is_property() {
            return Err(DataError::WrongInterfaceKind.into());
        }
        check_individual(interface, path, value, timestamp)?;
        let payload = individual_payload(value, timestamp)?;
        let qos = interface.qos(path)?;
        self.publish(interface, path, &payload, qos).await
    }

    /// Streams a sample on an object-aggregated datastream.
    pub async fn stream_aggregated(
        &mut self,
        interface: &str,
        path: &str,
        object: &Object,
        timestamp: Option<i64>,
    ) -> Result<(), T, F> {
        self.ensure_connected()?;
        let interface = self.device_interface(interface)?;
        check_object(interface, path, object, timestamp)?;
        let payload = object_payload(object, timestamp)?;
        let qos = interface.qos(path)?;
        self.publish(interface, path, &payload, qos).await
    }

    /// Sets a device property and caches its value.
    pub async fn set_property(&mut self, interface: &str, path: &str, value: &Value) -> Result<(), T, F> {
        self.ensure_connected()?;
        let interface = self.device_interface(interface)?;
        check_set_property(interface, path, value)?;
        let payload = individual_payload(value, None)?;
        self.publish(interface, path, &payload, QoS::ExactlyOnce).await?;
        if let Some(cache) = &mut self.cache {
            cache
                .store_property(interface.name, path, interface.major_version, value)
                .await?;
        }
        Ok(())
    }

    /// Unsets a device property and drops it from the cache.
    pub async fn unset_property(&mut self, interface: &str, path: &str) -> Result<(), T, F> {
        self.ensure_connected()?;
        let interface = self.device_interface(interface)?;
        check_unset_property(interface, path)?;
        self.publish(interface, path, &[], QoS::ExactlyOnce).await?;
        if let Some(cache) = &mut self.cache {
            cache.delete_property(interface.name, path).await?;
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), T, F> {
        if self.state() != SessionState::Connected {
            return Err(DeviceError::Mqtt(MqttError::NotConnected));
        }
        Ok(())
    }

    fn device_interface(&self, name: &str) -> core::result::Result<&'static Interface, DataError> {
        let interface = self
            .introspection
            .get(name)
            .ok_or(DataError::InterfaceNotFound)?;
        if interface.is_server_owned() {
            return Err(DataError::WrongInterfaceKind);
        }
        Ok(interface)
    }

    async fn publish(
        &mut self,
        interface: &Interface,
        path: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), T, F> {
        let topic = format!("{}/{}{}", self.base_topic, interface.name, path);
        if let Err(err) = self.client.publish(&topic, payload, qos).await {
            self.check_link();
            return Err(err.into());
        }
        Ok(())
    }

    async fn introspection_changed(&mut self, added: Option<&'static Interface>) -> Result<(), T, F> {
        if self.synchronized {
            self.synchronized = false;
            if let Some(cache) = &mut self.cache {
                cache.set_synchronized(false).await?;
            }
        }
        let announced = matches!(self.handshake, Handshake::InProgress | Handshake::Done);
        if !announced || self.client.state() != ConnectionState::Connected {
            return Ok(());
        }

        if let Some(interface) = added.filter(|i| i.is_server_owned()) {
            let topic = format!("{}/{}/#", self.base_topic, interface.name);
            self.client.subscribe(&topic, QoS::ExactlyOnce).await?;
        }
        let introspection = self.introspection.to_introspection_string();
        info!("Announcing introspection {}", introspection.as_str());
        self.client
            .publish(&self.base_topic, introspection.as_bytes(), QoS::ExactlyOnce)
            .await?;
        Ok(())
    }

    /// Resets the handshake after the MQTT connection was lost.
    fn check_link(&mut self) {
        if self.client.state() == ConnectionState::Connected {
            return;
        }
        if self.handshake == Handshake::Done {
            self.pending_disconnected = true;
        }
        self.handshake = Handshake::Idle;
    }

    async fn step(&mut self) -> Result<Option<DeviceEvent>, T, F> {
        if let Handshake::Failed { retry_at } = self.handshake
            && self.client.state() == ConnectionState::Connected
            && self.client.clock().now() >= retry_at
        {
            info!("Retrying the handshake");
            self.begin_handshake().await?;
        }

        let event = match self.client.poll().await? {
            None | Some(MqttEvent::Delivered { .. }) => None,
            Some(MqttEvent::Connected { session_present }) => {
                self.on_connack(session_present).await?;
                None
            }
            Some(MqttEvent::Disconnected) => {
                self.handshake = Handshake::Idle;
                Some(DeviceEvent::Disconnected)
            }
            Some(MqttEvent::Subscribed { failed, .. }) => {
                if failed {
                    error!("Astarte refused a subscription");
                    self.subscription_failed = true;
                }
                None
            }
            Some(MqttEvent::Message(message)) => self.route(message).await?,
        };
        if event.is_some() {
            return Ok(event);
        }
        self.finish_handshake().await
    }

    async fn on_connack(&mut self, session_present: bool) -> Result<(), T, F> {
        self.subscription_failed = false;
        let mut in_sync = false;
        if let Some(cache) = &mut self.cache {
            self.synchronized = cache.is_synchronized().await?;
            in_sync = session_present
                && self.synchronized
                && cache
                    .introspection_matches(&self.introspection.to_introspection_string())
                    .await?;
        }

        if in_sync {
            info!("Session present and synchronized, skipping the handshake");
            self.handshake = Handshake::InProgress;
            return Ok(());
        }
        self.begin_handshake().await
    }

    async fn begin_handshake(&mut self) -> Result<(), T, F> {
        self.handshake = Handshake::InProgress;
        self.subscription_failed = false;
        let result = self.send_handshake().await;
        if result.is_err() && self.client.state() == ConnectionState::Connected {
            self.handshake_failed().await;
        }
        result
    }

    async fn send_handshake(&mut self) -> Result<(), T, F> {
        info!("Starting the Astarte handshake");
        let base = self.base_topic.clone();

        self.client
            .subscribe(&format!("{base}/control/consumer/properties"), QoS::ExactlyOnce)
            .await?;
        for interface in self.introspection.iter().filter(|i| i.is_server_owned()) {
            self.client
                .subscribe(&format!("{base}/{}/#", interface.name), QoS::ExactlyOnce)
                .await?;
        }

        let introspection = self.introspection.to_introspection_string();
        debug!("Sending introspection {}", introspection.as_str());
        self.client
            .publish(&base, introspection.as_bytes(), QoS::ExactlyOnce)
            .await?;
        self.client
            .publish(&format!("{base}/control/emptyCache"), b"1", QoS::ExactlyOnce)
            .await?;

        let Some(cache) = self.cache.as_mut() else {
            return Ok(());
        };
        let properties = cache.device_properties_string(&self.introspection).await?;
        self.client
            .publish(
                &format!("{base}/control/producer/properties"),
                &zlib::compress(&properties),
                QoS::ExactlyOnce,
            )
            .await?;

        for (name, path) in cache.property_keys() {
            let stored = match cache.load_property(&name, &path).await {
                Ok(stored) => stored,
                Err(err) if err.is_not_found() => continue,
                Err(_) => {
                    warn!("Dropping unreadable property {}{}", name.as_str(), path.as_str());
                    cache.delete_property(&name, &path).await?;
                    continue;
                }
            };
            match self.introspection.get(&name) {
                Some(interface) if interface.major_version == stored.major => {
                    if interface.is_server_owned() {
                        continue;
                    }
                    let payload = individual_payload(&stored.value, None)?;
                    self.client
                        .publish(&format!("{base}/{name}{path}"), &payload, QoS::ExactlyOnce)
                        .await?;
                }
                _ => {
                    debug!("Deleting outdated property {}{}", name.as_str(), path.as_str());
                    cache.delete_property(&name, &path).await?;
                }
            }
        }
        Ok(())
    }

    async fn finish_handshake(&mut self) -> Result<Option<DeviceEvent>, T, F> {
        if self.handshake != Handshake::InProgress
            || self.client.state() != ConnectionState::Connected
            || self.client.has_pending_outgoing()
        {
            return Ok(None);
        }
        if self.subscription_failed {
            self.handshake_failed().await;
            return Ok(None);
        }

        if let Some(cache) = &mut self.cache {
            if !self.synchronized {
                cache.set_synchronized(true).await?;
            }
            let introspection = self.introspection.to_introspection_string();
            if !cache.introspection_matches(&introspection).await? {
                cache.store_introspection(&introspection).await?;
            }
        }
        self.synchronized = true;
        self.handshake = Handshake::Done;
        self.backoff.reset();
        info!("Device connected to Astarte");
        Ok(Some(DeviceEvent::Connected))
    }

    async fn handshake_failed(&mut self) {
        if self.synchronized {
            self.synchronized = false;
            if let Some(cache) = &mut self.cache
                && cache.set_synchronized(false).await.is_err()
            {
                error!("Failed clearing the synchronization flag");
            }
        }
        let delay = self.backoff.next_delay();
        self.handshake = Handshake::Failed {
            retry_at: self.client.clock().now() + delay,
        };
        warn!("Handshake failed, retrying in {} ms", delay.as_millis());
    }

    async fn route(&mut self, message: Message) -> Result<Option<DeviceEvent>, T, F> {
        let Some(relative) = message
            .topic
            .strip_prefix(self.base_topic.as_str())
            .and_then(|topic| topic.strip_prefix('/'))
        else {
            warn!("Dropping message on foreign topic {}", message.topic.as_str());
            return Ok(None);
        };

        if let Some(control) = relative.strip_prefix("control/") {
            self.handle_control(control, &message.payload).await?;
            return Ok(None);
        }

        let Some((name, _)) = relative.split_once('/') else {
            warn!("Dropping message without path on {}", relative);
            return Ok(None);
        };
        let path = &relative[name.len()..];
        let Some(interface) = self.introspection.get(name) else {
            warn!("Dropping message for unknown interface {}", name);
            return Ok(None);
        };
        if !interface.is_server_owned() {
            warn!("Dropping message on device owned interface {}", name);
            return Ok(None);
        }

        if interface.is_property() && message.payload.is_empty() {
            check_unset_property(interface, path)?;
            if let Some(cache) = &mut self.cache
                && cache.delete_property(name, path).await.is_err()
            {
                error!("Failed removing property {}{}", name, path);
            }
            return Ok(Some(DeviceEvent::PropertyUnset {
                interface: interface.name,
                path: path.into(),
            }));
        }

        let document = Document::new(&message.payload)?;
        let data = document.lookup("v")?;
        let timestamp = match document.lookup("t") {
            Ok(t) => Some(t.as_datetime()?),
            Err(BsonError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };

        if interface.aggregation == Aggregation::Object {
            let object = Object::deserialize(&data.as_document()?, |entry| {
                interface
                    .object_mapping(path, entry)
                    .ok()
                    .map(|mapping| mapping.mapping_type)
            })?;
            for entry in object.iter() {
                check_value(interface.object_mapping(path, &entry.path)?, &entry.value)?;
            }
            return Ok(Some(DeviceEvent::Object {
                interface: interface.name,
                path: path.into(),
                object,
                timestamp,
            }));
        }

        let mapping = interface.mapping(path)?;
        let value = Value::deserialize(&data, mapping.mapping_type)?;
        check_value(mapping, &value)?;

        if !interface.is_property() {
            return Ok(Some(DeviceEvent::Datastream {
                interface: interface.name,
                path: path.into(),
                value,
                timestamp,
            }));
        }

        if let Some(cache) = &mut self.cache
            && cache
                .store_property(name, path, interface.major_version, &value)
                .await
                .is_err()
        {
            error!("Failed caching property {}{}", name, path);
        }
        Ok(Some(DeviceEvent::PropertySet {
            interface: interface.name,
            path: path.into(),
            value,
        }))
    }

    async fn handle_control(&mut self, control: &str, payload: &[u8]) -> Result<(), T, F> {
        if control != "consumer/properties" {
            warn!("Dropping unrecognized control message {}", control);
            return Ok(());
        }
        let content = zlib::decompress_with_limit(payload, self.config.max_purge_size)
            .map_err(|_| DeviceError::Compression)?;
        let Some(cache) = &mut self.cache else {
            debug!("No property cache, ignoring the purge");
            return Ok(());
        };
        let allow_list: Vec<&str> = zlib::entries(&content).collect();
        debug!("Purging server properties, {} kept", allow_list.len());
        if cache
            .purge_server_properties(&self.introspection, &allow_list)
            .await
            .is_err()
        {
            error!("Failed purging server properties");
        }
        Ok(())
    }
}

/// `{v: value, t?: datetime}`.
fn individual_payload(value: &Value, timestamp: Option<i64>) -> core::result::Result<Vec<u8>, BsonError> {
    let mut bson = BsonSerializer::new();
    value.serialize(&mut bson, "v")?;
    if let Some(timestamp) = timestamp {
        bson.append_datetime("t", timestamp)?;
    }
    bson.end_document()?;
    bson.into_bytes()
}

/// `{v: {path: value, ...}, t?: datetime}`.
fn object_payload(object: &Object, timestamp: Option<i64>) -> core::result::Result<Vec<u8>, BsonError> {
    let mut inner = BsonSerializer::new();
    object.serialize(&mut inner)?;
    inner.end_document()?;

    let mut bson = BsonSerializer::new();
    bson.append_document("v", inner.as_bytes()?)?;
    if let Some(timestamp) = timestamp {
        bson.append_datetime("t", timestamp)?;
    }
    bson.end_document()?;
    bson.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntrospectionError;
    use crate::interface::{InterfaceType, Mapping, Ownership, Reliability};
    use crate::packet::{ConnAck, MqttPacket, PubAck, PubComp, PubRec, Publish, SUBACK_FAILURE, SubAck};
    use crate::storage::RamFlash;
    use crate::time::manual::ManualClock;
    use crate::transport::mock::{MockBroker, MockTransport, decode};
    use crate::value::MappingType;
    use embassy_futures::block_on;

    static SENSORS: Interface = Interface {
        name: "org.example.Sensors",
        major_version: 1,
        minor_version: 0,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Device,
        aggregation: Aggregation::Individual,
        mappings: &[
            Mapping::new("/%{sensor}/value", MappingType::Double)
                .with_reliability(Reliability::Guaranteed),
            Mapping::new("/%{sensor}/stamped", MappingType::Double).with_explicit_timestamp(),
        ],
    };

    static DEVICE_PROPS: Interface = Interface {
        name: "org.example.DeviceProps",
        major_version: 1,
        minor_version: 2,
        interface_type: InterfaceType::Property,
        ownership: Ownership::Device,
        aggregation: Aggregation::Individual,
        mappings: &[Mapping::new("/%{id}/enabled", MappingType::Boolean).with_allow_unset()],
    };

    static SERVER_PROPS: Interface = Interface {
        name: "org.example.ServerProps",
        major_version: 1,
        minor_version: 0,
        interface_type: InterfaceType::Property,
        ownership: Ownership::Server,
        aggregation: Aggregation::Individual,
        mappings: &[Mapping::new("/%{id}/limit", MappingType::Integer).with_allow_unset()],
    };

    static COMMANDS: Interface = Interface {
        name: "org.example.Commands",
        major_version: 0,
        minor_version: 1,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Server,
        aggregation: Aggregation::Object,
        mappings: &[
            Mapping::new("/%{id}/speed", MappingType::Double),
            Mapping::new("/%{id}/label", MappingType::String),
        ],
    };

    static COMMANDS_LOG: Interface = Interface {
        name: "org.example.CommandsLog",
        major_version: 1,
        minor_version: 0,
        interface_type: InterfaceType::Datastream,
        ownership: Ownership::Server,
        aggregation: Aggregation::Individual,
        mappings: &[Mapping::new("/value", MappingType::Integer)],
    };

    type TestSession = Session<MockTransport, RamFlash, ManualClock, 1024>;

    fn config() -> SessionConfig {
        SessionConfig::new("realm", "device")
            .unwrap()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(8))
    }

    fn full_introspection() -> Introspection {
        let mut introspection = Introspection::new();
        for interface in [&SENSORS, &DEVICE_PROPS, &SERVER_PROPS, &COMMANDS, &COMMANDS_LOG] {
            introspection.add(interface).unwrap();
        }
        introspection
    }

    fn empty_cache() -> PropertyCache<RamFlash> {
        block_on(PropertyCache::mount(RamFlash::new(1024, 8))).unwrap()
    }

    fn session(
        introspection: Introspection,
        cache: Option<PropertyCache<RamFlash>>,
    ) -> (TestSession, MockBroker, ManualClock) {
        let (transport, broker) = MockTransport::new();
        let clock = ManualClock::default();
        let session = Session::new(transport, clock.clone(), config(), introspection, cache);
        (session, broker, clock)
    }

    fn connack(session_present: bool) -> ConnAck {
        ConnAck {
            session_present,
            return_code: 0,
        }
    }

    /// Plays the broker side for one packet sent by the device.
    fn answer(broker: &MockBroker, raw: &[u8], fail_subscriptions: bool) {
        match decode(raw) {
            MqttPacket::Subscribe(subscribe) => {
                let code = if fail_subscriptions { SUBACK_FAILURE } else { 2 };
                let mut return_codes = heapless::Vec::new();
                return_codes.push(code).unwrap();
                broker.push(&SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes,
                });
            }
            MqttPacket::Publish(publish) => match (publish.qos, publish.packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => broker.push(&PubAck { packet_id }),
                (QoS::ExactlyOnce, Some(packet_id)) => broker.push(&PubRec { packet_id }),
                _ => {}
            },
            MqttPacket::PubRel(rel) => broker.push(&PubComp {
                packet_id: rel.packet_id,
            }),
            _ => {}
        }
    }

    /// Polls a fixed number of times while acknowledging everything sent.
    fn drive(
        session: &mut TestSession,
        broker: &MockBroker,
        fail_subscriptions: bool,
    ) -> (Vec<DeviceEvent>, Vec<Vec<u8>>) {
        let mut events = Vec::new();
        let mut sent = Vec::new();
        for _ in 0..64 {
            if let Some(event) = block_on(session.poll()).unwrap() {
                events.push(event);
            }
            let batch = broker.take_sent();
            for raw in &batch {
                answer(broker, raw, fail_subscriptions);
            }
            sent.extend(batch);
        }
        (events, sent)
    }

    fn establish(session: &mut TestSession, broker: &MockBroker, session_present: bool) -> Vec<Vec<u8>> {
        block_on(session.connect()).unwrap();
        broker.push(&connack(session_present));
        let (events, sent) = drive(session, broker, false);
        assert_eq!(events, [DeviceEvent::Connected]);
        assert_eq!(session.state(), SessionState::Connected);
        sent
    }

    /// Drops the link and brings the MQTT connection back, stopping before
    /// the handshake.
    fn reconnect(session: &mut TestSession, broker: &MockBroker, clock: &ManualClock, session_present: bool) {
        broker.drop_connection();
        assert!(block_on(session.poll()).is_err());
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Disconnected)
        );
        clock.advance(Duration::from_secs(1));
        assert_eq!(block_on(session.poll()).unwrap(), None);
        broker.take_sent();
        broker.push(&connack(session_present));
    }

    fn publishes(sent: &[Vec<u8>]) -> Vec<(String, Vec<u8>)> {
        sent.iter()
            .filter_map(|raw| match decode(raw) {
                MqttPacket::Publish(publish) => {
                    Some((publish.topic.into(), publish.payload.to_vec()))
                }
                _ => None,
            })
            .collect()
    }

    fn subscriptions(sent: &[Vec<u8>]) -> Vec<String> {
        sent.iter()
            .filter_map(|raw| match decode(raw) {
                MqttPacket::Subscribe(subscribe) => Some(subscribe.topics[0].0.into()),
                _ => None,
            })
            .collect()
    }

    fn push_data(broker: &MockBroker, topic: &str, payload: &[u8]) {
        broker.push(&Publish::new(topic, payload, QoS::AtLeastOnce, Some(500)));
    }

    #[test]
    fn config_validation() {
        assert_eq!(
            SessionConfig::new("", "device").unwrap_err(),
            ConfigError::InvalidRealm
        );
        assert_eq!(
            SessionConfig::new("realm", "dev/ice").unwrap_err(),
            ConfigError::InvalidDeviceId
        );
        let long = "x".repeat(MAX_DEVICE_ID_LEN + 1);
        assert!(SessionConfig::new("realm", &long).is_err());
        assert_eq!(config().base_topic(), "realm/device");
    }

    #[test]
    fn handshake_gates_connected_state() {
        let mut introspection = Introspection::new();
        introspection.add(&SENSORS).unwrap();
        let (mut session, broker, _clock) = session(introspection, None);

        block_on(session.connect()).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(matches!(
            block_on(session.connect()),
            Err(DeviceError::AlreadyConnecting)
        ));
        broker.take_sent();

        broker.push(&connack(false));
        assert_eq!(block_on(session.poll()).unwrap(), None);
        let sent = broker.take_sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            subscriptions(&sent),
            ["realm/device/control/consumer/properties"]
        );
        assert_eq!(
            publishes(&sent),
            [
                (String::from("realm/device"), b"org.example.Sensors:1:0".to_vec()),
                (String::from("realm/device/control/emptyCache"), b"1".to_vec()),
            ]
        );
        assert_eq!(session.state(), SessionState::Connecting);

        for raw in &sent {
            answer(&broker, raw, false);
        }
        for _ in 0..3 {
            assert_eq!(block_on(session.poll()).unwrap(), None);
        }
        let releases = broker.take_sent();
        assert_eq!(releases.len(), 2);
        answer(&broker, &releases[0], false);
        assert_eq!(block_on(session.poll()).unwrap(), None);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.has_pending_outgoing());

        answer(&broker, &releases[1], false);
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Connected)
        );
        assert_eq!(session.state(), SessionState::Connected);
        assert!(matches!(
            block_on(session.connect()),
            Err(DeviceError::AlreadyConnected)
        ));
    }

    #[test]
    fn handshake_subscribes_server_interfaces_and_records_state() {
        let (mut session, broker, _clock) = session(full_introspection(), Some(empty_cache()));
        let sent = establish(&mut session, &broker, false);

        assert_eq!(
            subscriptions(&sent),
            [
                "realm/device/control/consumer/properties",
                "realm/device/org.example.ServerProps/#",
                "realm/device/org.example.Commands/#",
                "realm/device/org.example.CommandsLog/#",
            ]
        );
        let purge = publishes(&sent)
            .into_iter()
            .find(|(topic, _)| topic == "realm/device/control/producer/properties")
            .unwrap();
        assert_eq!(purge.1, [0, 0, 0, 0]);

        let introspection = session.introspection().to_introspection_string();
        let cache = session.cache_mut().unwrap();
        assert!(block_on(cache.is_synchronized()).unwrap());
        assert!(block_on(cache.introspection_matches(&introspection)).unwrap());
    }

    #[test]
    fn present_synchronized_session_skips_handshake() {
        let (mut session, broker, clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        reconnect(&mut session, &broker, &clock, true);
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Connected)
        );
        assert!(broker.take_sent().is_empty());
    }

    #[test]
    fn lost_session_repeats_handshake() {
        let (mut session, broker, clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        reconnect(&mut session, &broker, &clock, false);
        let (events, sent) = drive(&mut session, &broker, false);
        assert_eq!(events, [DeviceEvent::Connected]);
        assert_eq!(subscriptions(&sent).len(), 4);
    }

    #[test]
    fn refused_subscription_retries_handshake() {
        let (mut session, broker, clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        reconnect(&mut session, &broker, &clock, false);
        let (events, _) = drive(&mut session, &broker, true);
        assert!(events.is_empty());
        assert_eq!(session.state(), SessionState::ConnectionError);
        let cache = session.cache_mut().unwrap();
        assert!(!block_on(cache.is_synchronized()).unwrap());

        // The MQTT link is still up, so it must not be opened again.
        let opens = broker.opens();
        assert!(matches!(
            block_on(session.connect()),
            Err(DeviceError::AlreadyConnecting)
        ));
        assert_eq!(broker.opens(), opens);
        assert!(broker.take_sent().is_empty());

        clock.advance(Duration::from_secs(1));
        let (events, sent) = drive(&mut session, &broker, false);
        assert_eq!(events, [DeviceEvent::Connected]);
        assert_eq!(subscriptions(&sent).len(), 4);
        let cache = session.cache_mut().unwrap();
        assert!(block_on(cache.is_synchronized()).unwrap());
    }

    #[test]
    fn handshake_resends_and_reconciles_cached_properties() {
        let mut cache = empty_cache();
        let props = "org.example.DeviceProps";
        block_on(cache.store_property(props, "/1/enabled", 1, &Value::Boolean(true))).unwrap();
        block_on(cache.store_property(props, "/2/enabled", 2, &Value::Boolean(false))).unwrap();
        block_on(cache.store_property("org.example.Gone", "/x", 1, &Value::Integer(1))).unwrap();
        block_on(cache.store_property("org.example.ServerProps", "/3/limit", 1, &Value::Integer(9)))
            .unwrap();

        let (mut session, broker, _clock) = session(full_introspection(), Some(cache));
        let sent = establish(&mut session, &broker, false);
        let publishes = publishes(&sent);

        let (_, purge) = publishes
            .iter()
            .find(|(topic, _)| topic == "realm/device/control/producer/properties")
            .unwrap();
        assert_eq!(
            zlib::decompress(purge).unwrap(),
            "org.example.DeviceProps/2/enabled;org.example.DeviceProps/1/enabled"
        );

        let resent: Vec<&str> = publishes
            .iter()
            .map(|(topic, _)| topic.as_str())
            .filter(|topic| topic.contains("Props/"))
            .collect();
        assert_eq!(resent, ["realm/device/org.example.DeviceProps/1/enabled"]);
        let (_, payload) = publishes
            .iter()
            .find(|(topic, _)| topic.ends_with("/1/enabled"))
            .unwrap();
        assert_eq!(
            *payload,
            individual_payload(&Value::Boolean(true), None).unwrap()
        );

        let cache = session.cache_mut().unwrap();
        assert!(block_on(cache.load_property(props, "/2/enabled")).unwrap_err().is_not_found());
        assert!(
            block_on(cache.load_property("org.example.Gone", "/x"))
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(
            block_on(cache.load_property("org.example.ServerProps", "/3/limit"))
                .unwrap()
                .value,
            Value::Integer(9)
        );
    }

    #[test]
    fn routes_server_properties() {
        let (mut session, broker, _clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        let topic = "realm/device/org.example.ServerProps/7/limit";
        push_data(&broker, topic, &individual_payload(&Value::Integer(5), None).unwrap());
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::PropertySet {
                interface: "org.example.ServerProps",
                path: "/7/limit".into(),
                value: Value::Integer(5),
            })
        );
        let cache = session.cache_mut().unwrap();
        let stored = block_on(cache.load_property("org.example.ServerProps", "/7/limit")).unwrap();
        assert_eq!((stored.major, stored.value), (1, Value::Integer(5)));

        push_data(&broker, topic, &[]);
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::PropertyUnset {
                interface: "org.example.ServerProps",
                path: "/7/limit".into(),
            })
        );
        let cache = session.cache_mut().unwrap();
        assert!(
            block_on(cache.load_property("org.example.ServerProps", "/7/limit"))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn purge_control_message_drops_unlisted_properties() {
        let (mut session, broker, _clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        let cache = session.cache_mut().unwrap();
        for path in ["/1/limit", "/2/limit"] {
            block_on(cache.store_property("org.example.ServerProps", path, 1, &Value::Integer(1)))
                .unwrap();
        }
        block_on(cache.store_property("org.example.DeviceProps", "/1/enabled", 1, &true.into()))
            .unwrap();

        push_data(
            &broker,
            "realm/device/control/consumer/properties",
            &zlib::compress("org.example.ServerProps/1/limit"),
        );
        assert_eq!(block_on(session.poll()).unwrap(), None);

        let mut keys = session.cache_mut().unwrap().property_keys();
        keys.sort();
        assert_eq!(
            keys,
            [
                (String::from("org.example.DeviceProps"), String::from("/1/enabled")),
                (String::from("org.example.ServerProps"), String::from("/1/limit")),
            ]
        );
    }

    #[test]
    fn corrupted_purge_payload_is_reported() {
        let (mut session, broker, _clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        push_data(
            &broker,
            "realm/device/control/consumer/properties",
            &[0, 0, 0, 9, 1, 2, 3],
        );
        assert!(matches!(
            block_on(session.poll()),
            Err(DeviceError::Compression)
        ));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn oversized_purge_list_is_refused() {
        let (transport, broker) = MockTransport::new();
        let clock = ManualClock::default();
        let config = config().with_max_purge_size(16);
        let mut session = Session::new(transport, clock, config, full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);

        let cache = session.cache_mut().unwrap();
        block_on(cache.store_property("org.example.ServerProps", "/1/limit", 1, &Value::Integer(1)))
            .unwrap();

        push_data(
            &broker,
            "realm/device/control/consumer/properties",
            &zlib::compress("org.example.ServerProps/2/limit"),
        );
        assert!(matches!(
            block_on(session.poll()),
            Err(DeviceError::Compression)
        ));
        assert_eq!(session.cache_mut().unwrap().property_keys().len(), 1);
    }

    #[test]
    fn routes_datastreams_by_exact_interface_name() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);

        let mut bson = BsonSerializer::new();
        bson.append_int32("v", 12).unwrap();
        bson.append_datetime("t", 1_700_000_000_000).unwrap();
        bson.end_document().unwrap();
        push_data(
            &broker,
            "realm/device/org.example.CommandsLog/value",
            bson.as_bytes().unwrap(),
        );
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Datastream {
                interface: "org.example.CommandsLog",
                path: "/value".into(),
                value: Value::Integer(12),
                timestamp: Some(1_700_000_000_000),
            })
        );
    }

    #[test]
    fn routes_objects() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);

        let mut object = Object::new();
        object.insert("speed", Value::Double(2.5)).unwrap();
        object.insert("label", Value::from("fast")).unwrap();
        push_data(
            &broker,
            "realm/device/org.example.Commands/4",
            &object_payload(&object, None).unwrap(),
        );
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Object {
                interface: "org.example.Commands",
                path: "/4".into(),
                object,
                timestamp: None,
            })
        );
    }

    #[test]
    fn drops_unknown_and_rejects_mistyped_data() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);

        let payload = individual_payload(&Value::Integer(1), None).unwrap();
        push_data(&broker, "realm/device/org.example.Unknown/value", &payload);
        assert_eq!(block_on(session.poll()).unwrap(), None);
        push_data(&broker, "realm/device/control/unknown", &payload);
        assert_eq!(block_on(session.poll()).unwrap(), None);

        let mistyped = individual_payload(&Value::from("nope"), None).unwrap();
        push_data(&broker, "realm/device/org.example.CommandsLog/value", &mistyped);
        assert!(block_on(session.poll()).is_err());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn streams_validated_data() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        assert!(matches!(
            block_on(session.stream_individual("org.example.Sensors", "/1/value", &Value::Double(1.0), None)),
            Err(DeviceError::Mqtt(MqttError::NotConnected))
        ));
        establish(&mut session, &broker, false);

        block_on(session.stream_individual(
            "org.example.Sensors",
            "/1/value",
            &Value::Double(1.5),
            None,
        ))
        .unwrap();
        let sent = broker.take_sent();
        let MqttPacket::Publish(publish) = decode(&sent[0]) else {
            panic!("expected a PUBLISH");
        };
        assert_eq!(publish.topic, "realm/device/org.example.Sensors/1/value");
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        let document = Document::new(publish.payload).unwrap();
        assert_eq!(document.lookup("v").unwrap().as_double().unwrap(), 1.5);

        assert!(matches!(
            block_on(session.stream_individual("org.example.Sensors", "/1/stamped", &Value::Double(1.0), None)),
            Err(DeviceError::Data(DataError::ExplicitTimestampRequired))
        ));
        assert!(matches!(
            block_on(session.stream_individual("org.example.Sensors", "/1/value", &Value::Integer(1), None)),
            Err(DeviceError::Data(DataError::TypeMismatch { .. }))
        ));
        assert!(matches!(
            block_on(session.stream_individual("org.example.Missing", "/1/value", &Value::Double(1.0), None)),
            Err(DeviceError::Data(DataError::InterfaceNotFound))
        ));
        assert!(matches!(
            block_on(session.stream_individual("org.example.CommandsLog", "/value", &Value::Integer(1), None)),
            Err(DeviceError::Data(DataError::WrongInterfaceKind))
        ));
        assert!(broker.take_sent().is_empty());
    }

    #[test]
    fn device_properties_update_cache() {
        let (mut session, broker, _clock) = session(full_introspection(), Some(empty_cache()));
        establish(&mut session, &broker, false);
        let props = "org.example.DeviceProps";

        block_on(session.set_property(props, "/1/enabled", &Value::Boolean(true))).unwrap();
        let sent = broker.take_sent();
        let MqttPacket::Publish(publish) = decode(&sent[0]) else {
            panic!("expected a PUBLISH");
        };
        assert_eq!(publish.topic, "realm/device/org.example.DeviceProps/1/enabled");
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        let stored = block_on(session.cache_mut().unwrap().load_property(props, "/1/enabled")).unwrap();
        assert_eq!((stored.major, stored.value), (1, Value::Boolean(true)));

        block_on(session.unset_property(props, "/1/enabled")).unwrap();
        let sent = broker.take_sent();
        let MqttPacket::Publish(publish) = decode(&sent[0]) else {
            panic!("expected a PUBLISH");
        };
        assert!(publish.payload.is_empty());
        assert_eq!(publish.qos, QoS::ExactlyOnce);
        assert!(
            block_on(session.cache_mut().unwrap().load_property(props, "/1/enabled"))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn disconnect_reports_event() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);

        block_on(session.disconnect());
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Disconnected)
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(block_on(session.poll()).unwrap(), None);
    }

    fn last_packet_id(sent: &[Vec<u8>]) -> u16 {
        sent.iter()
            .rev()
            .find_map(|raw| match decode(raw) {
                MqttPacket::Publish(publish) => publish.packet_id,
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn graceful_disconnect_waits_for_acknowledgments() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);

        let value = Value::Double(1.5);
        block_on(session.stream_individual("org.example.Sensors", "/1/value", &value, None))
            .unwrap();
        assert!(session.has_pending_outgoing());
        let packet_id = last_packet_id(&broker.take_sent());

        let payload = individual_payload(&Value::Integer(3), None).unwrap();
        push_data(&broker, "realm/device/org.example.CommandsLog/value", &payload);
        broker.push(&PubAck { packet_id });

        block_on(session.disconnect_graceful(Duration::from_secs(5))).unwrap();
        assert!(!session.has_pending_outgoing());
        let sent = broker.take_sent();
        assert!(matches!(decode(sent.last().unwrap()), MqttPacket::Disconnect));

        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Datastream {
                interface: "org.example.CommandsLog",
                path: "/value".into(),
                value: Value::Integer(3),
                timestamp: None,
            })
        );
        assert_eq!(
            block_on(session.poll()).unwrap(),
            Some(DeviceEvent::Disconnected)
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn graceful_disconnect_gives_up_at_the_deadline() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);

        let value = Value::Double(1.5);
        block_on(session.stream_individual("org.example.Sensors", "/1/value", &value, None))
            .unwrap();
        assert!(matches!(
            block_on(session.disconnect_graceful(Duration::from_secs(0))),
            Err(DeviceError::Mqtt(MqttError::Timeout))
        ));
        assert!(!broker.is_open());
        assert_eq!(session.state(), SessionState::Disconnecting);
    }

    #[test]
    fn added_interface_is_announced() {
        let mut introspection = Introspection::new();
        introspection.add(&SENSORS).unwrap();
        let (mut session, broker, clock) = session(introspection, Some(empty_cache()));
        establish(&mut session, &broker, false);

        block_on(session.add_interface(&SERVER_PROPS)).unwrap();
        let sent = broker.take_sent();
        assert_eq!(
            subscriptions(&sent),
            ["realm/device/org.example.ServerProps/#"]
        );
        assert_eq!(
            publishes(&sent),
            [(
                String::from("realm/device"),
                b"org.example.Sensors:1:0;org.example.ServerProps:1:0".to_vec()
            )]
        );
        let cache = session.cache_mut().unwrap();
        assert!(!block_on(cache.is_synchronized()).unwrap());
        for raw in &sent {
            answer(&broker, raw, false);
        }
        let (events, _) = drive(&mut session, &broker, false);
        assert!(events.is_empty());
        assert_eq!(session.state(), SessionState::Connected);

        // A present session no longer skips the handshake.
        reconnect(&mut session, &broker, &clock, true);
        let (events, sent) = drive(&mut session, &broker, false);
        assert_eq!(events, [DeviceEvent::Connected]);
        assert_eq!(subscriptions(&sent).len(), 2);
        let cache = session.cache_mut().unwrap();
        assert!(block_on(cache.is_synchronized()).unwrap());
        assert!(
            block_on(cache.introspection_matches(
                "org.example.Sensors:1:0;org.example.ServerProps:1:0"
            ))
            .unwrap()
        );
    }

    #[test]
    fn removed_interface_is_announced() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        block_on(session.remove_interface("org.example.Commands")).unwrap();
        assert!(broker.take_sent().is_empty());
        establish(&mut session, &broker, false);

        block_on(session.remove_interface("org.example.CommandsLog")).unwrap();
        assert_eq!(
            publishes(&broker.take_sent()),
            [(
                String::from("realm/device"),
                b"org.example.Sensors:1:0;org.example.DeviceProps:1:2;org.example.ServerProps:1:0"
                    .to_vec()
            )]
        );
        assert!(matches!(
            block_on(session.remove_interface("org.example.CommandsLog")),
            Err(DeviceError::Introspection(IntrospectionError::NotFound))
        ));
        assert!(session.introspection().get("org.example.CommandsLog").is_none());
    }

    #[test]
    fn run_forwards_events() {
        let (mut session, broker, _clock) = session(full_introspection(), None);
        establish(&mut session, &broker, false);
        let payload = individual_payload(&Value::Integer(3), None).unwrap();
        push_data(&broker, "realm/device/org.example.CommandsLog/value", &payload);

        let events: EventChannel<4> = EventChannel::new();
        let run = session.run(events.sender());
        let received = block_on(embassy_futures::select::select(
            core::pin::pin!(run),
            events.receive(),
        ));
        let embassy_futures::select::Either::Second(event) = received else {
            panic!("run never returns");
        };
        assert!(matches!(event, DeviceEvent::Datastream { .. }));
    }

    #[test]
    fn object_payload_layout() {
        let mut object = Object::new();
        object.insert("a", Value::Integer(1)).unwrap();
        let payload = object_payload(&object, None).unwrap();
        assert_eq!(
            payload,
            [
                0x14, 0, 0, 0, 0x03, b'v', 0, 0x0C, 0, 0, 0, 0x10, b'a', 0, 1, 0, 0, 0, 0, 0
            ]
        );
    }
}

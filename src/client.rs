//! # MQTT Client
//!
//! An MQTT 3.1.1 client driven by [`MqttClient::poll`]. The client owns one
//! transport, reconnects it with exponential backoff after failures and keeps
//! every unacknowledged outgoing message until the broker confirms it.
//!
//! ```ignore
//! let options = MqttOptions::new("realm/device-id").with_keep_alive(Duration::from_secs(30));
//! let mut client = MqttClient::<_, _, 2048>::new(transport, EmbassyClock, options);
//! client.connect().await?;
//! loop {
//!     if let Some(event) = client.poll().await? {
//!         // ...
//!     }
//! }
//! ```

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::error::{ConnectReasonCode, ErrorPlaceHolder, MqttError, ProtocolError};
use crate::packet::{
    self, ConnAck, Connect, Disconnect, EncodePacket, MqttPacket, PingReq, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe,
};
use crate::time::Clock;
use crate::transport::MqttTransport;

const DUP_FLAG: u8 = 0x08;

/// Connection settings of an [`MqttClient`].
#[derive(Debug, Clone)]
pub struct MqttOptions {
    client_id: String,
    keep_alive: Duration,
    clean_session: bool,
    connection_timeout: Duration,
    retransmit_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl MqttOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(30),
            clean_session: false,
            connection_timeout: Duration::from_secs(10),
            retransmit_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }

    /// Interval after which an idle connection is checked with PINGREQ.
    /// Zero disables keep alive.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Time allowed for CONNACK and for PINGRESP.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Time after which an unacknowledged packet is sent again.
    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    /// Bounds of the delay between reconnection attempts.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Disconnected,
    /// CONNECT sent, waiting for CONNACK.
    Connecting,
    Connected,
    /// `disconnect` was called; the next poll completes it.
    Disconnecting,
    /// The connection failed; a new attempt starts once the backoff delay expires.
    ConnectionError,
}

/// An application message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// What a call to [`MqttClient::poll`] observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    Connected { session_present: bool },
    Disconnected,
    Message(Message),
    /// A QoS 1 or QoS 2 publish completed.
    Delivered { packet_id: u16 },
    Subscribed { packet_id: u16, failed: bool },
}

/// Step of the exchange an outgoing packet waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    PubAck,
    PubRec,
    PubComp,
    SubAck,
}

#[derive(Debug)]
struct Outgoing {
    /// Encoded packet to send again on expiry.
    packet: Vec<u8>,
    awaiting: Awaiting,
    deadline: Instant,
}

/// A received packet, copied out of the receive buffer.
enum Incoming {
    ConnAck(ConnAck),
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        packet_id: Option<u16>,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    SubAck(SubAck),
    PingResp,
    Unexpected,
}

impl Incoming {
    fn parse(buf: &[u8]) -> Result<Self, MqttError<ErrorPlaceHolder>> {
        let incoming = match packet::decode::<ErrorPlaceHolder>(buf)? {
            Some(MqttPacket::ConnAck(ack)) => Incoming::ConnAck(ack),
            Some(MqttPacket::Publish(publish)) => Incoming::Publish {
                topic: publish.topic.into(),
                payload: publish.payload.to_vec(),
                qos: publish.qos,
                packet_id: publish.packet_id,
            },
            Some(MqttPacket::PubAck(ack)) => Incoming::PubAck(ack.packet_id),
            Some(MqttPacket::PubRec(ack)) => Incoming::PubRec(ack.packet_id),
            Some(MqttPacket::PubRel(ack)) => Incoming::PubRel(ack.packet_id),
            Some(MqttPacket::PubComp(ack)) => Incoming::PubComp(ack.packet_id),
            Some(MqttPacket::SubAck(ack)) => Incoming::SubAck(ack),
            Some(MqttPacket::PingResp) => Incoming::PingResp,
            _ => Incoming::Unexpected,
        };
        Ok(incoming)
    }
}

/// An MQTT client over the transport `T`, timed by the clock `C`.
///
/// `BUF_SIZE` bounds both the largest packet sent and the largest packet
/// received.
pub struct MqttClient<T, C, const BUF_SIZE: usize>
where
    T: MqttTransport,
    C: Clock,
{
    transport: T,
    clock: C,
    options: MqttOptions,
    state: ConnectionState,
    backoff: Backoff,
    /// Connection timeout while connecting, next attempt after an error.
    deadline: Instant,
    ping_deadline: Option<Instant>,
    last_tx: Instant,
    next_packet_id: u16,
    outgoing: BTreeMap<u16, Outgoing>,
    /// QoS 2 packet ids received and not yet released.
    incoming: BTreeSet<u16>,
    rx_buf: [u8; BUF_SIZE],
    rx_len: usize,
    tx_buf: [u8; BUF_SIZE],
}

impl<T, C, const BUF_SIZE: usize> MqttClient<T, C, BUF_SIZE>
where
    T: MqttTransport,
    C: Clock,
{
    pub fn new(transport: T, clock: C, options: MqttOptions) -> Self {
        let now = clock.now();
        Self {
            transport,
            backoff: Backoff::new(options.backoff_initial, options.backoff_max),
            clock,
            options,
            state: ConnectionState::Disconnected,
            deadline: now,
            ping_deadline: None,
            last_tx: now,
            next_packet_id: 1,
            outgoing: BTreeMap::new(),
            incoming: BTreeSet::new(),
            rx_buf: [0; BUF_SIZE],
            rx_len: 0,
            tx_buf: [0; BUF_SIZE],
        }
    }

    fn encode<P: EncodePacket>(packet: &P, buf: &mut [u8]) -> Result<usize, MqttError<T::Error>> {
        packet.encode(buf).map_err(MqttError::cast_transport_error)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Whether a sent packet still waits for its acknowledgment.
    pub fn has_pending_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Opens the transport and sends CONNECT. Completion is reported by
    /// [`MqttClient::poll`] with [`MqttEvent::Connected`].
    pub async fn connect(&mut self) -> Result<(), MqttError<T::Error>> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(MqttError::AlreadyConnected);
        }
        self.rx_len = 0;
        self.ping_deadline = None;
        if let Err(e) = self.transport.open().await {
            error!("Failed opening the transport");
            self.enter_error().await;
            return Err(MqttError::Transport(e));
        }

        let keep_alive = u16::try_from(self.options.keep_alive.as_secs()).unwrap_or(u16::MAX);
        let connect = Connect::new(
            &self.options.client_id,
            keep_alive,
            self.options.clean_session,
        );
        let len = Self::encode(&connect, &mut self.tx_buf)?;
        self.transmit(len).await?;

        self.state = ConnectionState::Connecting;
        self.deadline = self.clock.now() + self.options.connection_timeout;
        debug!("CONNECT sent");
        Ok(())
    }

    /// Closes the connection and discards all in-flight state.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Connected
            && let Ok(len) = Self::encode(&Disconnect, &mut self.tx_buf)
        {
            let _ = self.transport.send(&self.tx_buf[..len]).await;
        }
        self.transport.close().await;
        self.outgoing.clear();
        self.incoming.clear();
        self.rx_len = 0;
        self.ping_deadline = None;
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Publishes `payload` on `topic`. QoS 1 and 2 publishes return the
    /// packet id later reported by [`MqttEvent::Delivered`].
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<Option<u16>, MqttError<T::Error>> {
        if self.state != ConnectionState::Connected {
            return Err(MqttError::NotConnected);
        }
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.allocate_packet_id()?),
        };
        let len = Self::encode(&Publish::new(topic, payload, qos, packet_id), &mut self.tx_buf)?;
        if let Some(id) = packet_id {
            let awaiting = if qos == QoS::AtLeastOnce {
                Awaiting::PubAck
            } else {
                Awaiting::PubRec
            };
            self.track(id, len, awaiting);
        }
        trace!("PUBLISH {} ({} bytes)", topic, payload.len());
        self.transmit(len).await?;
        Ok(packet_id)
    }

    /// Subscribes to one topic filter, returning the packet id later
    /// reported by [`MqttEvent::Subscribed`].
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16, MqttError<T::Error>> {
        if self.state != ConnectionState::Connected {
            return Err(MqttError::NotConnected);
        }
        let id = self.allocate_packet_id()?;
        let len = Self::encode(&Subscribe::new(id, topic, qos), &mut self.tx_buf)?;
        self.track(id, len, Awaiting::SubAck);
        debug!("SUBSCRIBE {}", topic);
        self.transmit(len).await?;
        Ok(id)
    }

    /// Advances the connection: reconnects after errors, times out
    /// connection attempts, retransmits expired packets, keeps the connection
    /// alive and processes at most one received packet.
    pub async fn poll(&mut self) -> Result<Option<MqttEvent>, MqttError<T::Error>> {
        let now = self.clock.now();
        match self.state {
            ConnectionState::Disconnected => Ok(None),
            ConnectionState::Disconnecting => {
                info!("Disconnected");
                self.state = ConnectionState::Disconnected;
                Ok(Some(MqttEvent::Disconnected))
            }
            ConnectionState::ConnectionError => {
                if now < self.deadline {
                    return Ok(None);
                }
                info!("Attempting a reconnection");
                self.connect().await?;
                Ok(None)
            }
            ConnectionState::Connecting => {
                if now >= self.deadline {
                    error!("Connection attempt has timed out");
                    self.enter_error().await;
                    return Err(MqttError::Timeout);
                }
                self.receive().await
            }
            ConnectionState::Connected => {
                self.retransmit_expired(now).await?;
                self.keep_alive(now).await?;
                self.receive().await
            }
        }
    }

    fn allocate_packet_id(&mut self) -> Result<u16, MqttError<T::Error>> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = id.checked_add(1).unwrap_or(1);
            if !self.outgoing.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(MqttError::Protocol(ProtocolError::PacketIdsExhausted))
    }

    /// Keeps the packet encoded in `tx_buf[..len]` until it is acknowledged.
    fn track(&mut self, id: u16, len: usize, awaiting: Awaiting) {
        self.outgoing.insert(
            id,
            Outgoing {
                packet: self.tx_buf[..len].to_vec(),
                awaiting,
                deadline: self.clock.now() + self.options.retransmit_timeout,
            },
        );
    }

    async fn transmit(&mut self, len: usize) -> Result<(), MqttError<T::Error>> {
        let result = self.transport.send(&self.tx_buf[..len]).await;
        self.sent(result).await
    }

    async fn sent(&mut self, result: Result<(), T::Error>) -> Result<(), MqttError<T::Error>> {
        match result {
            Ok(()) => {
                self.last_tx = self.clock.now();
                Ok(())
            }
            Err(e) => {
                error!("Transport send failed");
                self.enter_error().await;
                Err(MqttError::Transport(e))
            }
        }
    }

    async fn enter_error(&mut self) {
        self.transport.close().await;
        self.state = ConnectionState::ConnectionError;
        self.rx_len = 0;
        self.ping_deadline = None;
        let delay = self.backoff.next_delay();
        self.deadline = self.clock.now() + delay;
        warn!("Connection lost, next attempt in {} ms", delay.as_millis());
    }

    async fn retransmit_expired(&mut self, now: Instant) -> Result<(), MqttError<T::Error>> {
        let expired: Vec<u16> = self
            .outgoing
            .iter()
            .filter(|(_, outgoing)| outgoing.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let next_deadline = now + self.options.retransmit_timeout;

        for id in expired {
            let Some(outgoing) = self.outgoing.get_mut(&id) else {
                continue;
            };
            if matches!(outgoing.awaiting, Awaiting::PubAck | Awaiting::PubRec) {
                outgoing.packet[0] |= DUP_FLAG;
            }
            outgoing.deadline = next_deadline;
            debug!("Retransmitting packet {}", id);
            let result = self.transport.send(&outgoing.packet).await;
            self.sent(result).await?;
        }
        Ok(())
    }

    async fn keep_alive(&mut self, now: Instant) -> Result<(), MqttError<T::Error>> {
        if let Some(deadline) = self.ping_deadline {
            if now >= deadline {
                error!("PINGRESP not received in time");
                self.enter_error().await;
                return Err(MqttError::Timeout);
            }
            return Ok(());
        }
        if self.options.keep_alive.as_ticks() == 0 || now < self.last_tx + self.options.keep_alive {
            return Ok(());
        }
        trace!("PINGREQ");
        let len = Self::encode(&PingReq, &mut self.tx_buf)?;
        self.transmit(len).await?;
        self.ping_deadline = Some(now + self.options.connection_timeout);
        Ok(())
    }

    /// Reads from the transport unless a whole packet is already buffered,
    /// then handles the first buffered packet.
    async fn receive(&mut self) -> Result<Option<MqttEvent>, MqttError<T::Error>> {
        if self.buffered_frame().await?.is_none() {
            if self.rx_len == BUF_SIZE {
                error!("Incoming packet exceeds the receive buffer");
                self.enter_error().await;
                return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
            }
            match self.transport.recv(&mut self.rx_buf[self.rx_len..]).await {
                Ok(n) => self.rx_len += n,
                Err(e) => {
                    error!("Transport receive failed");
                    self.enter_error().await;
                    return Err(MqttError::Transport(e));
                }
            }
        }

        let Some(frame) = self.buffered_frame().await? else {
            return Ok(None);
        };
        let incoming = Incoming::parse(&self.rx_buf[..frame]);
        self.rx_buf.copy_within(frame..self.rx_len, 0);
        self.rx_len -= frame;

        match incoming {
            Ok(incoming) => self.handle(incoming).await,
            Err(e) => {
                error!("Received a malformed packet");
                self.enter_error().await;
                Err(MqttError::cast_transport_error(e))
            }
        }
    }

    async fn buffered_frame(&mut self) -> Result<Option<usize>, MqttError<T::Error>> {
        match packet::frame_len(&self.rx_buf[..self.rx_len]) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                error!("Received a malformed packet header");
                self.enter_error().await;
                Err(MqttError::cast_transport_error(e))
            }
        }
    }

    async fn handle(&mut self, incoming: Incoming) -> Result<Option<MqttEvent>, MqttError<T::Error>> {
        if self.state == ConnectionState::Connecting {
            let Incoming::ConnAck(ack) = incoming else {
                error!("Expected CONNACK");
                self.enter_error().await;
                return Err(MqttError::Protocol(ProtocolError::InvalidResponse));
            };
            return self.on_connack(ack).await;
        }

        match incoming {
            Incoming::ConnAck(_) | Incoming::Unexpected => {
                warn!("Ignoring unexpected packet");
                Ok(None)
            }
            Incoming::Publish {
                topic,
                payload,
                qos,
                packet_id,
            } => {
                trace!("Received PUBLISH on {}", topic.as_str());
                match (qos, packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => {
                        let len = Self::encode(&PubAck { packet_id: id }, &mut self.tx_buf)?;
                        self.transmit(len).await?;
                    }
                    (QoS::ExactlyOnce, Some(id)) => {
                        let first = self.incoming.insert(id);
                        let len = Self::encode(&PubRec { packet_id: id }, &mut self.tx_buf)?;
                        self.transmit(len).await?;
                        if !first {
                            debug!("Dropping duplicate of packet {}", id);
                            return Ok(None);
                        }
                    }
                    _ => {}
                }
                Ok(Some(MqttEvent::Message(Message {
                    topic,
                    payload,
                    qos,
                })))
            }
            Incoming::PubAck(id) => Ok(self.complete(id, Awaiting::PubAck)),
            Incoming::PubRec(id) => {
                let len = Self::encode(&PubRel { packet_id: id }, &mut self.tx_buf)?;
                match self.outgoing.get(&id) {
                    Some(outgoing) if outgoing.awaiting == Awaiting::PubRec => {
                        self.track(id, len, Awaiting::PubComp);
                    }
                    Some(_) => {}
                    None => warn!("PUBREC for unknown packet {}", id),
                }
                self.transmit(len).await?;
                Ok(None)
            }
            Incoming::PubRel(id) => {
                self.incoming.remove(&id);
                let len = Self::encode(&PubComp { packet_id: id }, &mut self.tx_buf)?;
                self.transmit(len).await?;
                Ok(None)
            }
            Incoming::PubComp(id) => Ok(self.complete(id, Awaiting::PubComp)),
            Incoming::SubAck(ack) => {
                let failed = ack.return_codes.is_empty() || ack.has_failure();
                Ok(self
                    .complete(ack.packet_id, Awaiting::SubAck)
                    .map(|_| MqttEvent::Subscribed {
                        packet_id: ack.packet_id,
                        failed,
                    }))
            }
            Incoming::PingResp => {
                self.ping_deadline = None;
                Ok(None)
            }
        }
    }

    async fn on_connack(&mut self, ack: ConnAck) -> Result<Option<MqttEvent>, MqttError<T::Error>> {
        if ack.return_code != 0 {
            let code = ConnectReasonCode::from(ack.return_code);
            error!("Connection refused with code {}", ack.return_code);
            self.enter_error().await;
            return Err(MqttError::ConnectionRefused(code));
        }

        info!("Connected, session present: {}", ack.session_present);
        self.state = ConnectionState::Connected;
        self.backoff.reset();
        if ack.session_present {
            // Resend everything still unacknowledged on the next poll.
            let now = self.clock.now();
            for outgoing in self.outgoing.values_mut() {
                outgoing.deadline = now;
            }
        } else {
            self.outgoing.clear();
            self.incoming.clear();
        }
        Ok(Some(MqttEvent::Connected {
            session_present: ack.session_present,
        }))
    }

    /// Removes `id` from the in-flight map when it waits on `step`.
    fn complete(&mut self, id: u16, step: Awaiting) -> Option<MqttEvent> {
        match self.outgoing.get(&id) {
            Some(outgoing) if outgoing.awaiting == step => {
                self.outgoing.remove(&id);
                trace!("Packet {} acknowledged", id);
                Some(MqttEvent::Delivered { packet_id: id })
            }
            _ => {
                warn!("Unexpected acknowledgment for packet {}", id);
                None
            }
        }
    }
}

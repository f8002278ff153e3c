//! # TLS Transport
//!
//! Astarte brokers only accept mutual TLS: the device presents the client
//! certificate obtained from pairing together with its private key.
//!
//! The TLS engine itself is supplied by the application through
//! [`TlsConnector`] (`embedded-tls`, `esp-mbedtls`, ...), which turns the
//! broker address and the credentials into an encrypted
//! `embedded-io-async` stream. [`TlsTransport`] runs the MQTT client over that
//! stream and reconnects through the connector.

use alloc::string::String;
use alloc::vec::Vec;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Error as _, ErrorKind, Read, Write};
use futures::future::{Either, select};

use crate::error::CredentialsError;
use crate::transport::MqttTransport;

/// Longest host name accepted in a broker address.
pub const MAX_HOST_LEN: usize = 253;

/// Port of MQTT over TLS.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Address of the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    host: heapless::String<MAX_HOST_LEN>,
    port: u16,
}

impl BrokerAddress {
    pub fn new(host: &str, port: u16) -> Result<Self, CredentialsError> {
        if host.is_empty() || host.contains(['/', ':', ' ']) {
            return Err(CredentialsError::InvalidBroker);
        }
        let host = heapless::String::try_from(host).map_err(|_| CredentialsError::InvalidBroker)?;
        Ok(Self { host, port })
    }

    /// Parses `host:port`, or the `mqtts://host:port/` URL returned by pairing.
    ///
    /// The port defaults to 8883 when missing.
    pub fn parse(address: &str) -> Result<Self, CredentialsError> {
        let address = address.strip_prefix("mqtts://").unwrap_or(address);
        let address = address.strip_suffix('/').unwrap_or(address);
        match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| CredentialsError::InvalidBroker)?;
                Self::new(host, port)
            }
            None => Self::new(address, DEFAULT_TLS_PORT),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// The client certificate and private key of the device, in PEM.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    certificate: String,
    private_key: String,
}

impl core::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    /// Checks that both documents are well formed PEM before accepting them.
    pub fn new(certificate_pem: &str, private_key_pem: &str) -> Result<Self, CredentialsError> {
        match pem_block(certificate_pem) {
            Some((label, _)) if label == "CERTIFICATE" => {}
            _ => return Err(CredentialsError::InvalidCertificate),
        }
        match pem_block(private_key_pem) {
            Some((label, _)) if label.ends_with("PRIVATE KEY") => {}
            _ => return Err(CredentialsError::InvalidPrivateKey),
        }
        Ok(Self {
            certificate: String::from(certificate_pem),
            private_key: String::from(private_key_pem),
        })
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key
    }

    /// DER encoding of the certificate, as most embedded TLS stacks expect it.
    pub fn certificate_der(&self) -> Result<Vec<u8>, CredentialsError> {
        pem_block(&self.certificate)
            .map(|(_, der)| der)
            .ok_or(CredentialsError::InvalidCertificate)
    }

    /// DER encoding of the private key.
    pub fn private_key_der(&self) -> Result<Vec<u8>, CredentialsError> {
        pem_block(&self.private_key)
            .map(|(_, der)| der)
            .ok_or(CredentialsError::InvalidPrivateKey)
    }
}

/// Decodes the first PEM block of `pem` into its label and DER content.
fn pem_block(pem: &str) -> Option<(&str, Vec<u8>)> {
    let start = pem.find("-----BEGIN ")?;
    let rest = &pem[start + "-----BEGIN ".len()..];
    let (label, rest) = rest.split_once("-----")?;
    let (body, rest) = rest.split_once("-----END ")?;
    let end_label = rest.strip_prefix(label)?;
    if !end_label.starts_with("-----") {
        return None;
    }

    let body: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let der = STANDARD.decode(body).ok()?;
    if der.is_empty() {
        return None;
    }
    Some((label, der))
}

/// Opens TLS sessions to the broker.
#[allow(async_fn_in_trait)]
pub trait TlsConnector {
    /// The encrypted stream.
    type Stream: Read + Write;
    type Error: core::fmt::Debug;

    /// Connects to `broker` and completes the handshake, authenticating with
    /// `credentials`.
    async fn connect(
        &mut self,
        broker: &BrokerAddress,
        credentials: &ClientCredentials,
    ) -> Result<Self::Stream, Self::Error>;
}

/// Errors of [`TlsTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsError<E> {
    /// The connector failed to open the session.
    Connect(E),
    /// I/O on the established stream failed.
    Io(ErrorKind),
    /// The broker closed the connection.
    Closed,
    /// No session is open.
    NotConnected,
}

/// MQTT transport over mutual TLS.
pub struct TlsTransport<C: TlsConnector> {
    connector: C,
    broker: BrokerAddress,
    credentials: ClientCredentials,
    timeout: Duration,
    stream: Option<C::Stream>,
}

impl<C: TlsConnector> TlsTransport<C> {
    /// A transport reaching `broker` with the device `credentials`.
    ///
    /// `timeout` bounds every read, so the session keeps its timers running
    /// while the broker is silent.
    pub fn new(
        connector: C,
        broker: BrokerAddress,
        credentials: ClientCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            broker,
            credentials,
            timeout,
            stream: None,
        }
    }

    /// Parses `broker` (see [`BrokerAddress::parse`]) and the PEM documents.
    pub fn from_pem(
        connector: C,
        broker: &str,
        certificate_pem: &str,
        private_key_pem: &str,
        timeout: Duration,
    ) -> Result<Self, CredentialsError> {
        Ok(Self::new(
            connector,
            BrokerAddress::parse(broker)?,
            ClientCredentials::new(certificate_pem, private_key_pem)?,
            timeout,
        ))
    }

    pub fn broker(&self) -> &BrokerAddress {
        &self.broker
    }

    /// Replaces the credentials, e.g. after renewing an expired certificate.
    /// They are used from the next `open`.
    pub fn set_credentials(&mut self, credentials: ClientCredentials) {
        self.credentials = credentials;
    }
}

impl<C: TlsConnector> MqttTransport for TlsTransport<C> {
    type Error = TlsError<C::Error>;

    async fn open(&mut self) -> Result<(), Self::Error> {
        debug!("Opening TLS connection to port {}", self.broker.port());
        self.stream = None;
        let stream = self
            .connector
            .connect(&self.broker, &self.credentials)
            .await
            .map_err(TlsError::Connect)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        let stream = self.stream.as_mut().ok_or(TlsError::NotConnected)?;
        trace!("TLS TX {} bytes", buf.len());
        stream
            .write_all(buf)
            .await
            .map_err(|e| TlsError::Io(e.kind()))?;
        stream.flush().await.map_err(|e| TlsError::Io(e.kind()))
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let stream = self.stream.as_mut().ok_or(TlsError::NotConnected)?;
        let read = stream.read(buf);
        let timer = Timer::after(self.timeout);

        match select(core::pin::pin!(read), core::pin::pin!(timer)).await {
            Either::Left((Ok(0), _)) => {
                warn!("TLS connection closed by peer");
                Err(TlsError::Closed)
            }
            Either::Left((Ok(n), _)) => {
                trace!("TLS RX {} bytes", n);
                Ok(n)
            }
            Either::Left((Err(e), _)) => Err(TlsError::Io(e.kind())),
            Either::Right(((), _)) => Ok(0),
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

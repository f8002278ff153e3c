//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the underlying
//! communication channel (plain TCP, TLS over TCP, a simulated link in tests),
//! allowing the MQTT client to be hardware and network-stack agnostic.
//!
//! With the Rust 2024 Edition, this trait uses native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use embassy_net::IpEndpoint;
use embassy_net::tcp::{ConnectError, Error as SocketError, TcpSocket};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;
use futures::future::{Either, select};

/// A trait representing a reconnectable transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: core::fmt::Debug;

    /// Opens a new connection to the broker.
    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read, `0` when nothing arrived before the
    /// transport timeout. A connection closed by the peer is an error.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Drops the current connection, if any.
    async fn close(&mut self);
}

/// Errors of [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    Connect(ConnectError),
    Socket(SocketError),
    /// The broker closed the connection.
    Closed,
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    remote: IpEndpoint,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` connecting `socket` to `remote`.
    ///
    /// `timeout` bounds every read, so the session keeps its timers running
    /// while the broker is silent.
    pub fn new(socket: TcpSocket<'a>, remote: impl Into<IpEndpoint>, timeout: Duration) -> Self {
        Self {
            socket,
            remote: remote.into(),
            timeout,
        }
    }
}

impl MqttTransport for TcpTransport<'_> {
    type Error = TcpError;

    async fn open(&mut self) -> Result<(), Self::Error> {
        debug!("Opening TCP connection");
        self.socket
            .connect(self.remote)
            .await
            .map_err(TcpError::Connect)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("TCP TX {} bytes", buf.len());
        self.socket.write_all(buf).await.map_err(TcpError::Socket)?;
        // Flush to ensure data is actually sent to the network
        self.socket.flush().await.map_err(TcpError::Socket)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        // Race the read against a timer.
        let read = self.socket.read(buf);
        let timer = Timer::after(self.timeout);

        match select(core::pin::pin!(read), core::pin::pin!(timer)).await {
            Either::Left((Ok(0), _)) => {
                warn!("TCP connection closed by peer");
                Err(TcpError::Closed)
            }
            Either::Left((Ok(n), _)) => {
                trace!("TCP RX {} bytes", n);
                Ok(n)
            }
            Either::Left((Err(e), _)) => Err(TcpError::Socket(e)),
            Either::Right(((), _)) => Ok(0),
        }
    }

    async fn close(&mut self) {
        self.socket.abort();
        // Waits until the reset reached the peer, so the socket can connect again.
        let _ = self.socket.flush().await;
    }
}

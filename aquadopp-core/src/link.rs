//! Byte links to the instrument.
//!
//! The engine talks to the instrument through any async byte stream. A
//! [`Connector`] opens a fresh one on every connect.

use crate::config::LinkConfig;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Opens links to the instrument.
pub trait Connector: Send + Sync + 'static {
    type Link: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Link>> + Send;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}

/// Connects to a port agent over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.port_agent.clone(), config.connect_timeout())
    }
}

impl Connector for TcpConnector {
    type Link = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        tracing::debug!("Connecting to port agent {}...", self.addr);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )
            })??;
        stream.set_nodelay(true)?;

        tracing::debug!("Connected to port agent {}", self.addr);
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

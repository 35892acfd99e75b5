//! TCP connection to the photon-transport backend.
//!
//! A [`Connector`] opens connections; a [`Transport`] is one open
//! connection. A connection that timed out is never reused: the client drops
//! the transport value and asks the connector for a fresh one.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

use photon_protocol::{decode_multipart, encode_multipart, ClientError, Frames};

use crate::context::OffloadContext;

/// Initial read buffer capacity.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One open request/reply channel.
pub trait Transport {
    /// Send one multipart message.
    fn send(&mut self, frames: &[Bytes]) -> Result<(), ClientError>;

    /// Wait up to `timeout` for one complete message.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. An error means the
    /// connection is unusable.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Frames>, ClientError>;
}

/// Factory for transports to a fixed endpoint.
pub trait Connector {
    type Transport: Transport;

    fn connect(&self) -> Result<Self::Transport, ClientError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> &str;
}

/// Opens [`TcpConnection`]s to one address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    ctx: OffloadContext,
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(ctx: &OffloadContext, addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            ctx: ctx.clone(),
            addr: addr.into(),
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Transport = TcpConnection;

    fn connect(&self) -> Result<TcpConnection, ClientError> {
        let runtime = self.ctx.runtime();
        let addr = self.addr.as_str();

        debug!("Connecting to {} (timeout {:?})", addr, self.connect_timeout);
        let stream = runtime
            .block_on(async {
                tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
            })
            .map_err(|_| ClientError::ConnectionFailed(format!("connect to {} timed out", addr)))?
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
        debug!("Connected to {}", addr);

        Ok(TcpConnection {
            runtime,
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_timeout: self.connect_timeout,
        })
    }

    fn endpoint(&self) -> &str {
        &self.addr
    }
}

/// A live TCP connection carrying multipart envelopes.
pub struct TcpConnection {
    runtime: Arc<Runtime>,
    stream: TcpStream,
    read_buf: BytesMut,
    write_timeout: Duration,
}

impl TcpConnection {
    async fn read_message(&mut self) -> Result<Frames, ClientError> {
        loop {
            if let Some(frames) = decode_multipart(&mut self.read_buf)? {
                trace!("Received message with {} frames", frames.len());
                return Ok(frames);
            }

            self.read_buf.reserve(READ_BUFFER_SIZE);
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }
}

impl Transport for TcpConnection {
    fn send(&mut self, frames: &[Bytes]) -> Result<(), ClientError> {
        let encoded = encode_multipart(frames)?;
        trace!("Sending {} frames ({} bytes)", frames.len(), encoded.len());

        let runtime = Arc::clone(&self.runtime);
        let timeout = self.write_timeout;
        let stream = &mut self.stream;
        runtime
            .block_on(async { tokio::time::timeout(timeout, stream.write_all(&encoded)).await })
            .map_err(|_| ClientError::SendFailed("write timed out".to_string()))?
            .map_err(|e| ClientError::SendFailed(e.to_string()))
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Frames>, ClientError> {
        let runtime = Arc::clone(&self.runtime);
        match runtime.block_on(async { tokio::time::timeout(timeout, self.read_message()).await }) {
            Ok(Ok(frames)) => Ok(Some(frames)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

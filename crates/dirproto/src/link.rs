//! Wire boundary
//!
//! A [`Link`] is one established transport to a directory server, moving
//! whole request/response messages. [`Connector`] opens links. The byte
//! format is supplied by a [`Codec`]; [`FramedLink`] glues a codec to any
//! async byte stream and [`TcpConnector`] opens TCP-backed framed links.

use crate::endpoint::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::message::{Control, MessageId, Request};
use crate::result::Response;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// One established transport to a directory server
#[async_trait]
pub trait Link: Send {
    /// Write one request with its message id and controls
    async fn send(&mut self, id: MessageId, request: &Request, controls: &[Control]) -> Result<()>;

    /// Read the next response message
    ///
    /// Must be cancel-safe: dropping the future before completion must not
    /// lose a partially read message.
    async fn recv(&mut self) -> Result<(MessageId, Response)>;

    /// Upgrade the transport to TLS in place
    async fn start_tls(&mut self) -> Result<()> {
        Err(ProtocolError::Unsupported(
            "this link cannot negotiate TLS".into(),
        ))
    }

    async fn close(&mut self) -> Result<()>;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}

/// Opens links to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>>;
}

/// Byte-level message format
pub trait Codec: Send + Sync {
    fn encode(
        &self,
        id: MessageId,
        request: &Request,
        controls: &[Control],
        dst: &mut BytesMut,
    ) -> Result<()>;

    /// Decode one message from the front of `src`
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// split off `src`.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<(MessageId, Response)>>;
}

const READ_CHUNK: usize = 8192;

/// A codec over an async byte stream
pub struct FramedLink<S, C> {
    stream: Option<S>,
    codec: Arc<C>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    peer: String,
}

impl<S, C> FramedLink<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Codec,
{
    pub fn new(stream: S, codec: Arc<C>, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            codec,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            peer: peer.into(),
        }
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or(ProtocolError::NotOpen)
    }
}

#[async_trait]
impl<S, C> Link for FramedLink<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: Codec + 'static,
{
    async fn send(&mut self, id: MessageId, request: &Request, controls: &[Control]) -> Result<()> {
        self.write_buf.clear();
        self.codec
            .encode(id, request, controls, &mut self.write_buf)?;
        let frame = self.write_buf.split().freeze();
        let stream = self.stream()?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        tracing::trace!("sent {} (id {}, {} bytes) to {}", request.operation(), id, frame.len(), self.peer);
        Ok(())
    }

    async fn recv(&mut self) -> Result<(MessageId, Response)> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.read_buf)? {
                return Ok(message);
            }
            // read_buf is cancel-safe: bytes already read stay in self.read_buf
            let stream = self.stream.as_mut().ok_or(ProtocolError::NotOpen)?;
            let n = stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        self.read_buf.clear();
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Opens plain TCP links framed by a codec
///
/// `ldaps` endpoints are refused: TLS belongs to a link implementation that
/// wraps the stream before framing.
pub struct TcpConnector<C> {
    codec: Arc<C>,
}

impl<C: Codec> TcpConnector<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec: Arc::new(codec),
        }
    }
}

#[async_trait]
impl<C: Codec + 'static> Connector for TcpConnector<C> {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>> {
        if endpoint.use_ssl {
            return Err(ProtocolError::Unsupported(format!(
                "{} requires a TLS-capable connector",
                endpoint
            )));
        }

        let authority = endpoint.authority();
        let stream = match endpoint.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(&authority))
                .await
                .map_err(|_| ProtocolError::Timeout)??,
            None => TcpStream::connect(&authority).await?,
        };
        stream.set_nodelay(true)?;
        tracing::debug!("TCP connection established to {}", endpoint);

        Ok(Box::new(FramedLink::new(
            stream,
            Arc::clone(&self.codec),
            endpoint.url(),
        )))
    }
}

//! Message framing and payload encodings.
//!
//! Every RPC message is a length-prefixed header frame followed by a
//! length-prefixed body frame (u32 big-endian lengths). What the frames
//! contain is decided by the [`CodecKind`] negotiated in the preamble; the
//! preamble itself is always a JSON frame so the two sides can agree before
//! a codec exists.

use crate::{Error, Options};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Ceiling on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload encodings selectable in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    /// Compact self-describing binary encoding (the default).
    #[serde(rename = "application/bincode")]
    Bincode,
    /// JSON, for interop and debugging by eye.
    #[serde(rename = "application/json")]
    Json,
}

impl CodecKind {
    /// Encode a payload value.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Error> {
        match self {
            Self::Bincode => bincode::serialize(value).map_err(|e| Error::Encode {
                message: e.to_string(),
            }),
            Self::Json => serde_json::to_vec(value).map_err(|e| Error::Encode {
                message: e.to_string(),
            }),
        }
    }

    /// Decode a payload value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Error> {
        match self {
            Self::Bincode => bincode::deserialize(bytes).map_err(|e| Error::Decode {
                message: e.to_string(),
            }),
            Self::Json => serde_json::from_slice(bytes).map_err(|e| Error::Decode {
                message: e.to_string(),
            }),
        }
    }
}

/// Per-message header.
///
/// Requests carry an empty `error`. A response with a non-empty `error`
/// carries a placeholder body that must be read and discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// `<service>.<method>` to dispatch to; echoed back in responses.
    pub service_method: String,
    /// Client-assigned sequence number pairing responses to calls.
    pub seq: u64,
    /// Server-side failure, empty on success.
    pub error: String,
}

/// Reading side of a framed connection.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    kind: CodecKind,
}

impl<R> std::fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap the reading half of a connection.
    pub fn new(inner: R, kind: CodecKind) -> Self {
        Self {
            inner: BufReader::new(inner),
            kind,
        }
    }

    async fn read_frame(&mut self) -> Result<Bytes, Error> {
        let len = self.inner.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf.into())
    }

    /// Read and decode one message header.
    pub async fn read_header(&mut self) -> Result<Header, Error> {
        let frame = self.read_frame().await?;
        self.kind.decode(&frame)
    }

    /// Read one body frame without decoding it.
    ///
    /// Bodies stay opaque at this layer: the caller decides whether to
    /// decode (matched response) or discard (stale response, placeholder).
    pub async fn read_body(&mut self) -> Result<Bytes, Error> {
        self.read_frame().await
    }
}

/// Writing side of a framed connection.
///
/// Writers are shared behind a `tokio::sync::Mutex`; holding that lock
/// across [`write`](Self::write) is what keeps header/body pairs of
/// concurrent senders from interleaving.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
    kind: CodecKind,
}

impl<W> std::fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap the writing half of a connection.
    pub fn new(inner: W, kind: CodecKind) -> Self {
        Self {
            inner: BufWriter::new(inner),
            kind,
        }
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.inner.write_u32(bytes.len() as u32).await?;
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    /// Write one message: encoded header frame, body frame, flush.
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> Result<(), Error> {
        let header_bytes = self.kind.encode(header)?;
        self.write_frame(&header_bytes).await?;
        self.write_frame(body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Write the JSON preamble frame opening a connection.
pub(crate) async fn write_preamble<W>(stream: &mut W, options: &Options) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(options).map_err(|e| Error::Encode {
        message: e.to_string(),
    })?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the JSON preamble frame opening a connection.
pub(crate) async fn read_preamble<R>(stream: &mut R) -> Result<Options, Error>
where
    R: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| Error::InvalidPreamble {
        message: e.to_string(),
    })
}

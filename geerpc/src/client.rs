//! Multiplexed RPC client.

use crate::{
    codec::{write_preamble, FrameReader, FrameWriter, Header},
    server::{read_http_head, DEFAULT_RPC_PATH},
    CodecKind, Error, Options,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::oneshot,
};
use tracing::{debug, warn};

struct ClientState {
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Bytes, Error>>>,
    /// Set by [`Client::close`].
    closing: bool,
    /// Set by the receive loop when the connection fails.
    shutdown: bool,
}

/// A client multiplexing many in-flight calls over one connection.
///
/// Calls are paired with responses by sequence number: requests are written
/// (header then body, atomically under the sending lock) by the calling
/// task, while a single receive task reads responses and completes whatever
/// call each one belongs to. Dropping a call future (e.g. from
/// `tokio::time::timeout`) deregisters it; its response, should one still
/// arrive, is discarded.
pub struct Client {
    kind: CodecKind,
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    state: Arc<Mutex<ClientState>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Client")
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Dial a plain-TCP RPC server.
    pub async fn dial(addr: &str, options: &Options) -> Result<Self, Error> {
        let stream = Self::connect(addr, options).await?;
        Self::from_stream(stream, options).await
    }

    /// Dial an HTTP endpoint and tunnel the RPC protocol through CONNECT.
    pub async fn dial_http(addr: &str, options: &Options) -> Result<Self, Error> {
        let mut stream = Self::connect(addr, options).await?;
        stream
            .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())
            .await?;

        let head = read_http_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        if status_line.split_whitespace().nth(1) != Some("202") {
            return Err(Error::TunnelRejected {
                status_line: status_line.to_string(),
            });
        }
        debug!(addr, "http tunnel established");
        Self::from_stream(stream, options).await
    }

    /// Dial an `<protocol>@<host:port>` address (`tcp@` or `http@`).
    pub async fn dial_addr(rpc_addr: &str, options: &Options) -> Result<Self, Error> {
        let Some((protocol, addr)) = rpc_addr.split_once('@') else {
            return Err(Error::InvalidAddress {
                addr: rpc_addr.to_string(),
            });
        };
        match protocol {
            "http" => Self::dial_http(addr, options).await,
            "tcp" => Self::dial(addr, options).await,
            other => Err(Error::UnsupportedProtocol {
                protocol: other.to_string(),
            }),
        }
    }

    async fn connect(addr: &str, options: &Options) -> Result<TcpStream, Error> {
        if options.connect_timeout.is_zero() {
            return Ok(TcpStream::connect(addr).await?);
        }
        match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(connected) => Ok(connected?),
            Err(_) => Err(Error::ConnectTimeout(options.connect_timeout)),
        }
    }

    /// Send the preamble on an established stream and start the receive
    /// loop.
    async fn from_stream(mut stream: TcpStream, options: &Options) -> Result<Self, Error> {
        write_preamble(&mut stream, options).await?;

        let (read_half, write_half) = stream.into_split();
        let kind = options.codec_type;
        let state = Arc::new(Mutex::new(ClientState {
            seq: 1,
            pending: HashMap::new(),
            closing: false,
            shutdown: false,
        }));
        tokio::spawn(receive_loop(
            FrameReader::new(read_half, kind),
            Arc::clone(&state),
        ));

        Ok(Self {
            kind,
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half, kind)),
            state,
        })
    }

    /// Whether the client can still place calls.
    pub fn is_alive(&self) -> bool {
        let state = self.state.lock();
        !state.closing && !state.shutdown
    }

    /// Close the connection. Returns [`Error::Shutdown`] if already closed.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.writer.lock().await.shutdown().await
    }

    /// Invoke `<service>.<method>` and await the typed reply.
    ///
    /// Cancellation-safe: dropping the returned future deregisters the
    /// call.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self.kind.encode(args)?;
        let reply = self.call_raw(service_method, body).await?;
        self.kind.decode(&reply)
    }

    /// [`call`](Self::call) bounded by `timeout`.
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        match tokio::time::timeout(timeout, self.call(service_method, args)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CallTimeout {
                method: service_method.to_string(),
            }),
        }
    }

    /// Place a call with an already-encoded body, returning the raw reply.
    pub(crate) async fn call_raw(&self, service_method: &str, body: Vec<u8>) -> Result<Bytes, Error> {
        let (seq, receiver) = {
            let mut state = self.state.lock();
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            let (sender, receiver) = oneshot::channel();
            state.pending.insert(seq, sender);
            (seq, receiver)
        };
        let _deregister = PendingGuard {
            state: Arc::clone(&self.state),
            seq,
        };

        {
            let header = Header {
                service_method: service_method.to_string(),
                seq,
                error: String::new(),
            };
            let mut writer = self.writer.lock().await;
            writer.write(&header, &body).await?;
        }
        debug!(service_method, seq, "request sent");

        match receiver.await {
            Ok(result) => result,
            // Sender dropped without a response: terminated mid-call.
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// Removes a call from the pending map when its future goes away, however
/// that happens.
struct PendingGuard {
    state: Arc<Mutex<ClientState>>,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.state.lock().pending.remove(&self.seq);
    }
}

async fn receive_loop(mut reader: FrameReader<OwnedReadHalf>, state: Arc<Mutex<ClientState>>) {
    let err = loop {
        let header = match reader.read_header().await {
            Ok(header) => header,
            Err(e) => break e,
        };
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => break e,
        };

        let sender = state.lock().pending.remove(&header.seq);
        match sender {
            None => {
                // Stale response (cancelled or timed-out call); body is
                // already consumed, nothing to do.
                debug!(seq = header.seq, "discarding response without a pending call");
            }
            Some(sender) => {
                let result = if header.error.is_empty() {
                    Ok(body)
                } else {
                    Err(Error::Remote(header.error))
                };
                // The caller may have gone away; that is its business.
                sender.send(result).ok();
            }
        }
    };

    debug!(error = %err, "receive loop terminated");
    let mut state = state.lock();
    state.shutdown = true;
    if !state.pending.is_empty() {
        warn!(
            pending = state.pending.len(),
            "failing pending calls after connection loss"
        );
    }
    for (_, sender) in state.pending.drain() {
        sender
            .send(Err(Error::Disconnected {
                message: err.to_string(),
            }))
            .ok();
    }
}

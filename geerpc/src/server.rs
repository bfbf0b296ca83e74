//! Connection handling and request dispatch.

use crate::{
    codec::{read_preamble, FrameReader, FrameWriter, Header},
    service::{Method, Service},
    CodecKind, Error, MAGIC_NUMBER,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

/// Path on which [`Server::serve_http`] accepts CONNECT handshakes.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc";

/// Exact response accepting a CONNECT handshake. Bare-LF framing is part of
/// the protocol; clients must not insist on CRLF.
const CONNECT_RESPONSE: &str = "HTTP/1.0 202 Connected to Gee RPC accepted\n\n";

/// Largest request head the tunnel endpoint will read.
const MAX_HTTP_HEAD: usize = 8 * 1024;

type SharedWriter = Arc<tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>>;

/// An RPC server: a map of registered services plus connection loops.
///
/// Each accepted connection runs in its own task; each request on a
/// connection is dispatched in its own task. Responses are serialized
/// through a per-connection sending lock so concurrent handlers cannot
/// interleave header/body pairs.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
    rpc_path: String,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.services.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            rpc_path: DEFAULT_RPC_PATH.to_string(),
        }
    }
}

impl Server {
    /// Create a server with no services registered.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a service under its name.
    ///
    /// A duplicate registration keeps the first service and logs.
    pub fn register(&self, service: Service) {
        let name = service.name().to_string();
        let mut services = self.services.write();
        if services.contains_key(&name) {
            warn!(service = %name, "service already registered; keeping the first");
            return;
        }
        info!(service = %name, "service registered");
        services.insert(name, Arc::new(service));
    }

    /// How many times `<service>.<method>` has been invoked, if registered.
    pub fn call_count(&self, service: &str, method: &str) -> Option<u64> {
        self.services.read().get(service)?.call_count(method)
    }

    fn find_method(&self, service_method: &str) -> Result<Arc<Method>, String> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(format!(
                "ill-formed service method {service_method:?}: expected <service>.<method>"
            ));
        };
        let services = self.services.read();
        let service = services
            .get(service_name)
            .ok_or_else(|| format!("service {service_name:?} doesn't exist"))?;
        service
            .get_method(method_name)
            .ok_or_else(|| format!("method {method_name:?} doesn't exist"))
    }

    /// Accept plain-TCP connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, remote) = listener.accept().await?;
            debug!(%remote, "accepted connection");
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.serve_conn(stream).await });
        }
    }

    /// Run the RPC protocol on an established stream: preamble validation
    /// followed by the request loop.
    pub async fn serve_conn(self: Arc<Self>, mut stream: TcpStream) {
        let options = match read_preamble(&mut stream).await {
            Ok(options) => options,
            Err(e) => {
                warn!(error = %e, "rejecting connection: unreadable preamble");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            warn!(magic = options.magic_number, "rejecting connection: bad magic number");
            return;
        }
        self.request_loop(stream, options.codec_type, options.handle_timeout)
            .await
    }

    async fn request_loop(self: Arc<Self>, stream: TcpStream, kind: CodecKind, timeout: Duration) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, kind);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(
            write_half, kind,
        )));

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    debug!(error = %e, "request loop done");
                    break;
                }
            };
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(error = %e, "request loop done mid-message");
                    break;
                }
            };
            debug!(service_method = %header.service_method, seq = header.seq, "request");

            match self.find_method(&header.service_method) {
                Err(message) => {
                    Self::send_response(
                        &writer,
                        Header {
                            service_method: header.service_method,
                            seq: header.seq,
                            error: message,
                        },
                        placeholder_body(kind),
                    )
                    .await;
                }
                Ok(method) => {
                    let writer = Arc::clone(&writer);
                    tokio::spawn(handle_request(method, header, body, writer, kind, timeout));
                }
            }
        }
    }

    async fn send_response(writer: &SharedWriter, header: Header, body: Vec<u8>) {
        if let Err(e) = writer.lock().await.write(&header, &body).await {
            warn!(seq = header.seq, error = %e, "writing response failed");
        }
    }

    /// Accept HTTP CONNECT handshakes and run the RPC protocol on the
    /// tunneled stream.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, remote) = listener.accept().await?;
            debug!(%remote, "accepted http connection");
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.serve_http_conn(stream).await });
        }
    }

    async fn serve_http_conn(self: Arc<Self>, mut stream: TcpStream) {
        let head = match read_http_head(&mut stream).await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "unreadable http request head");
                return;
            }
        };
        let request_line = head.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, target) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());

        if method != "CONNECT" {
            let _ = stream
                .write_all(
                    b"HTTP/1.0 405 Method Not Allowed\r\n\
                      Content-Type: text/plain; charset=utf-8\r\n\r\n\
                      http request must use CONNECT first",
                )
                .await;
            return;
        }
        if target != self.rpc_path {
            let _ = stream
                .write_all(b"HTTP/1.0 404 Not Found\r\n\r\n")
                .await;
            return;
        }

        if let Err(e) = stream.write_all(CONNECT_RESPONSE.as_bytes()).await {
            warn!(error = %e, "writing connect response failed");
            return;
        }
        debug!("http tunnel established");
        self.serve_conn(stream).await
    }
}

async fn handle_request(
    method: Arc<Method>,
    header: Header,
    body: Bytes,
    writer: SharedWriter,
    kind: CodecKind,
    timeout: Duration,
) {
    let result = if timeout.is_zero() {
        method.invoke(kind, body).await
    } else {
        match tokio::time::timeout(timeout, method.invoke(kind, body)).await {
            Ok(result) => result,
            // The invocation future is dropped here: a late success has
            // nothing left to send.
            Err(_) => Err(format!("handle timeout within {timeout:?}")),
        }
    };

    let (response_header, response_body) = match result {
        Ok(reply) => (
            Header {
                service_method: header.service_method,
                seq: header.seq,
                error: String::new(),
            },
            reply,
        ),
        Err(message) => {
            debug!(seq = header.seq, error = %message, "request failed");
            (
                Header {
                    service_method: header.service_method,
                    seq: header.seq,
                    error: message,
                },
                placeholder_body(kind),
            )
        }
    };
    Server::send_response(&writer, response_header, response_body).await
}

/// Body accompanying an error response; read and discarded by clients.
fn placeholder_body(kind: CodecKind) -> Vec<u8> {
    kind.encode(&()).unwrap_or_default()
}

/// Read an HTTP request or response head up to (and including) its blank
/// line, accepting bare-LF framing. Reads byte-wise so no bytes beyond the
/// head are consumed.
pub(crate) async fn read_http_head<R>(stream: &mut R) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    loop {
        head.push(stream.read_u8().await?);
        if head.ends_with(b"\n\n") || head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HTTP_HEAD {
            return Err(Error::InvalidPreamble {
                message: format!("http head exceeds {MAX_HTTP_HEAD} bytes"),
            });
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

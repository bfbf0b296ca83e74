//! HTTP peer protocol: one server handler and one client getter per node.
//!
//! Every node of the cluster runs an [`HttpPool`]: it serves the node's
//! groups under `GET <base_path>/<group>/<key>` and, as a
//! [`PeerPicker`], routes keys to their owning node on a consistent-hash
//! ring with one [`HttpGetter`] per peer.

use crate::{
    group::{DecodePeerResponseSnafu, Error as CacheError, PeerSnafu},
    peer::{PeerGetter, PeerPicker},
    ring::HashRing,
    wire::CacheValue,
    ByteView, Group,
};
use async_trait::async_trait;
use hyper::{
    client::HttpConnector,
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Client, Request, Response, Server, StatusCode, Uri,
};
use parking_lot::Mutex;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use prost::Message;
use snafu::{OptionExt, ResultExt, Snafu};
use std::{collections::HashMap, convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tracing::{debug, info};

/// Path prefix under which peers serve cache lookups.
pub const DEFAULT_BASE_PATH: &str = "/_geecache/";

/// Virtual-node multiplier for the peer ring.
const DEFAULT_REPLICAS: usize = 50;

/// Characters escaped in the `<group>` and `<key>` path segments.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Snafu)]
enum ApplicationError {
    #[snafu(display("invalid request path {:?}: expected <base>/<group>/<key>", path))]
    InvalidPath { path: String },

    #[snafu(display("invalid percent-encoding in {:?}: {}", segment, source))]
    InvalidEncoding {
        segment: String,
        source: std::str::Utf8Error,
    },

    #[snafu(display("no such group {:?}", name))]
    GroupNotFound { name: String },

    #[snafu(display("{}", source))]
    GroupGet { source: CacheError },
}

impl ApplicationError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidEncoding { .. } => StatusCode::BAD_REQUEST,
            Self::GroupNotFound { .. } => StatusCode::NOT_FOUND,
            // A failed load is not a transport problem; the error text
            // travels in the body of an intentionally empty-content status.
            Self::GroupGet { .. } => StatusCode::NO_CONTENT,
        }
    }
}

struct PoolState {
    ring: HashRing,
    getters: HashMap<String, Arc<HttpGetter>>,
}

/// One node's view of the distributed cache cluster.
///
/// `self_url` is this node's own base URL (scheme://host:port); it must
/// appear in [`set_peers`](Self::set_peers) for self-ownership detection to
/// work.
pub struct HttpPool {
    self_url: String,
    base_path: String,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for HttpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPool")
            .field("self_url", &self.self_url)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl HttpPool {
    /// Create a pool serving under [`DEFAULT_BASE_PATH`].
    pub fn new(self_url: impl Into<String>) -> Arc<Self> {
        Self::with_base_path(self_url, DEFAULT_BASE_PATH)
    }

    /// Create a pool serving under a custom base path (must end in `/`).
    pub fn with_base_path(self_url: impl Into<String>, base_path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            self_url: self_url.into(),
            base_path: base_path.into(),
            state: Mutex::new(PoolState {
                ring: HashRing::new(DEFAULT_REPLICAS),
                getters: HashMap::new(),
            }),
        })
    }

    /// Replace the cluster membership: rebuilds the ring and the per-peer
    /// getters. Peers are base URLs, including this node's own.
    pub fn set_peers<I, S>(&self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock();
        state.ring = HashRing::new(DEFAULT_REPLICAS);
        state.getters.clear();
        for peer in peers {
            let peer = peer.as_ref();
            state.ring.add([peer]);
            state.getters.insert(
                peer.to_string(),
                Arc::new(HttpGetter::new(format!("{}{}", peer, self.base_path))),
            );
        }
    }

    /// Bind `addr` and return the bound address together with the serve
    /// future. Useful when binding port 0.
    pub fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> (SocketAddr, impl Future<Output = Result<(), hyper::Error>>) {
        let pool = Arc::clone(self);
        let make_svc = make_service_fn(move |_conn| {
            let pool = Arc::clone(&pool);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| Arc::clone(&pool).route_request(req)))
            }
        });
        let server = Server::bind(&addr).serve(make_svc);
        let local_addr = server.local_addr();
        info!(addr = %local_addr, self_url = %self.self_url, "peer cache server listening");
        (local_addr, server)
    }

    /// Serve peer lookups on `addr` until the server fails.
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> Result<(), hyper::Error> {
        self.bind(addr).1.await
    }

    async fn route_request(self: Arc<Self>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        // Deployments must only route the pool's own prefix here; anything
        // else is a wiring error, not a client error.
        assert!(
            path.starts_with(&self.base_path),
            "http pool serving unexpected path: {path}"
        );
        debug!(method = %req.method(), %path, "peer cache request");

        let response = match self.handle_get(&path).await {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(body)),
            Err(e) => {
                debug!(%path, error = %e, "peer cache request failed");
                Response::builder()
                    .status(e.status_code())
                    .body(Body::from(e.to_string()))
            }
        };
        Ok(response.expect("building response with valid parts"))
    }

    async fn handle_get(&self, path: &str) -> Result<Vec<u8>, ApplicationError> {
        let rest = &path[self.base_path.len()..];
        let (group_raw, key_raw) = rest
            .split_once('/')
            .context(InvalidPathSnafu { path })?;

        let group_name = percent_decode_str(group_raw)
            .decode_utf8()
            .context(InvalidEncodingSnafu { segment: group_raw })?;
        let key = percent_decode_str(key_raw)
            .decode_utf8()
            .context(InvalidEncodingSnafu { segment: key_raw })?;

        let group = Group::lookup(&group_name).context(GroupNotFoundSnafu {
            name: &*group_name,
        })?;
        let view = group.get(&key).await.context(GroupGetSnafu)?;

        Ok(CacheValue {
            value: view.to_vec(),
        }
        .encode_to_vec())
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.lock();
        let peer = state.ring.get(key)?;
        if peer == self.self_url {
            return None;
        }
        debug!(%peer, key, "picked peer");
        state
            .getters
            .get(peer)
            .map(|getter| Arc::clone(getter) as Arc<dyn PeerGetter>)
    }
}

/// HTTP client fetching values from one peer.
pub struct HttpGetter {
    base_url: String,
    client: Client<HttpConnector>,
}

impl std::fmt::Debug for HttpGetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGetter")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpGetter {
    /// Create a getter for the peer serving under `base_url`
    /// (ends in the pool base path).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    fn peer_error(&self, message: impl Into<String>) -> CacheError {
        PeerSnafu {
            peer: self.base_url.clone(),
            message: message.into(),
        }
        .build()
    }
}

#[async_trait]
impl PeerGetter for HttpGetter {
    async fn get(&self, group: &str, key: &str) -> Result<ByteView, CacheError> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            utf8_percent_encode(group, PATH_SEGMENT),
            utf8_percent_encode(key, PATH_SEGMENT),
        );
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| self.peer_error(e.to_string()))?;

        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| self.peer_error(e.to_string()))?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| self.peer_error(e.to_string()))?;

        if status != StatusCode::OK {
            let text = String::from_utf8_lossy(&body);
            let message = if text.is_empty() {
                format!("server returned {status}")
            } else {
                format!("server returned {status}: {text}")
            };
            return Err(self.peer_error(message));
        }

        let decoded = CacheValue::decode(body.as_ref()).map_err(|e| {
            DecodePeerResponseSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        Ok(ByteView::from(decoded.value))
    }
}

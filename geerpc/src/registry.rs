//! Heartbeat-based server registry.
//!
//! Servers announce themselves with periodic `POST`s carrying their rpc
//! address in the `X-Geerpc-Server` header; clients `GET` the alive set
//! back out of the same header. An entry is alive while its last heartbeat
//! is younger than the registry timeout; expired entries are dropped on
//! read.

use crate::Error;
use gee_time::{Clock, SystemClock, Timestamp};
use hyper::{
    client::HttpConnector,
    service::{make_service_fn, service_fn},
    Body, Client, Method, Request, Response, Server, StatusCode,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap, convert::Infallible, future::Future, net::SocketAddr, sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Default path the registry serves under.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc/registry";

/// Default liveness window for registered servers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Header carrying rpc addresses in both directions.
pub(crate) const SERVER_HEADER: &str = "X-Geerpc-Server";

/// Tracks which rpc servers are alive.
pub struct Registry {
    path: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    /// addr -> last heartbeat.
    servers: Mutex<HashMap<String, Timestamp>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .field("servers", &self.servers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a registry expiring entries after `timeout` (0 = never).
    pub fn new(timeout: Duration) -> Arc<Self> {
        Self::with_clock(timeout, Arc::new(SystemClock::new()))
    }

    /// Create a registry reading time from `clock` (tests use a manual
    /// one).
    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            path: DEFAULT_REGISTRY_PATH.to_string(),
            timeout,
            clock,
            servers: Mutex::new(HashMap::new()),
        })
    }

    fn put_server(&self, addr: String) {
        debug!(%addr, "heartbeat");
        self.servers.lock().insert(addr, self.clock.now());
    }

    /// The sorted alive set; expired entries are removed as a side effect.
    fn alive_servers(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut servers = self.servers.lock();
        if !self.timeout.is_zero() {
            servers.retain(|addr, last_heartbeat| {
                let alive = now <= last_heartbeat.after(self.timeout);
                if !alive {
                    debug!(%addr, "expiring server");
                }
                alive
            });
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort_unstable();
        alive
    }

    /// Serve one registry request.
    pub async fn handle(self: Arc<Self>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        if req.uri().path() != self.path {
            return Ok(status_response(StatusCode::NOT_FOUND));
        }
        let response = match req.method() {
            &Method::GET => {
                let servers = self.alive_servers().join(",");
                Response::builder()
                    .header(SERVER_HEADER, servers)
                    .body(Body::empty())
                    .expect("valid response parts")
            }
            &Method::POST => {
                let addr = req
                    .headers()
                    .get(SERVER_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .filter(|value| !value.is_empty());
                match addr {
                    Some(addr) => {
                        self.put_server(addr.to_string());
                        status_response(StatusCode::OK)
                    }
                    None => status_response(StatusCode::BAD_REQUEST),
                }
            }
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED),
        };
        Ok(response)
    }

    /// Bind `addr` and return the bound address together with the serve
    /// future. Useful when binding port 0.
    pub fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> (SocketAddr, impl Future<Output = Result<(), hyper::Error>>) {
        let registry = Arc::clone(self);
        let make_svc = make_service_fn(move |_conn| {
            let registry = Arc::clone(&registry);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| Arc::clone(&registry).handle(req)))
            }
        });
        let server = Server::bind(&addr).serve(make_svc);
        let local_addr = server.local_addr();
        info!(addr = %local_addr, path = %self.path, "registry listening");
        (local_addr, server)
    }

    /// Serve the registry on `addr` until the server fails.
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> Result<(), hyper::Error> {
        self.bind(addr).1.await
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("valid response parts")
}

/// Announce `rpc_addr` to `registry_url` now, then keep announcing every
/// `period` from a background task until a send fails.
///
/// `period = None` means a beat one minute inside the default registry
/// timeout.
pub async fn start_heartbeat(
    registry_url: impl Into<String>,
    rpc_addr: impl Into<String>,
    period: Option<Duration>,
) -> Result<(), Error> {
    let registry_url = registry_url.into();
    let rpc_addr = rpc_addr.into();
    let period = match period {
        Some(period) if !period.is_zero() => period,
        // A beat one minute inside the default registry timeout.
        _ => DEFAULT_TIMEOUT - Duration::from_secs(60),
    };

    let client = Client::new();
    send_heartbeat(&client, &registry_url, &rpc_addr).await?;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick of an interval fires immediately; that beat was
        // already sent above.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&client, &registry_url, &rpc_addr).await {
                warn!(error = %e, "heartbeat failed; stopping");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(
    client: &Client<HttpConnector>,
    registry_url: &str,
    rpc_addr: &str,
) -> Result<(), Error> {
    debug!(rpc_addr, registry_url, "sending heartbeat");
    let request = Request::builder()
        .method(Method::POST)
        .uri(registry_url)
        .header(SERVER_HEADER, rpc_addr)
        .body(Body::empty())
        .map_err(|e| Error::Heartbeat {
            registry: registry_url.to_string(),
            message: e.to_string(),
        })?;
    client.request(request).await.map_err(|e| Error::Heartbeat {
        registry: registry_url.to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

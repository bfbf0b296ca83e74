//! Client-side discovery of rpc servers.

use crate::{registry::SERVER_HEADER, Error};
use async_trait::async_trait;
use hyper::{client::HttpConnector, Client, Uri};
use parking_lot::Mutex;
use rand::Rng;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};
use tracing::debug;

/// How a single server is picked from the discovered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random pick.
    Random,
    /// Rotating pick, starting from a random offset.
    RoundRobin,
}

/// Supplies candidate rpc server addresses.
#[async_trait]
pub trait Discovery: std::fmt::Debug + Send + Sync + 'static {
    /// Bring the server list up to date, if the source supports that.
    async fn refresh(&self) -> Result<(), Error>;

    /// Replace the server list.
    async fn update(&self, servers: Vec<String>);

    /// Pick one server according to `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String, Error>;

    /// All currently known servers.
    async fn get_all(&self) -> Result<Vec<String>, Error>;
}

/// A fixed server list maintained by the caller.
#[derive(Debug)]
pub struct StaticDiscovery {
    servers: Mutex<Vec<String>>,
    /// Round-robin cursor; starts at a random offset so a fleet of fresh
    /// clients does not gang up on the first server.
    index: AtomicUsize,
}

impl StaticDiscovery {
    /// Create a discovery over a fixed list.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers: Mutex::new(servers),
            index: AtomicUsize::new(rand::thread_rng().gen_range(0..=u32::MAX as usize)),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn refresh(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        *self.servers.lock() = servers;
    }

    async fn get(&self, mode: SelectMode) -> Result<String, Error> {
        let servers = self.servers.lock();
        if servers.is_empty() {
            return Err(Error::NoAvailableServers);
        }
        let picked = match mode {
            SelectMode::Random => &servers[rand::thread_rng().gen_range(0..servers.len())],
            SelectMode::RoundRobin => {
                let index = self.index.fetch_add(1, Ordering::Relaxed);
                &servers[index % servers.len()]
            }
        };
        Ok(picked.clone())
    }

    async fn get_all(&self) -> Result<Vec<String>, Error> {
        Ok(self.servers.lock().clone())
    }
}

/// Default staleness bound for a registry-backed server list.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Discovery fed from a [`Registry`](crate::registry::Registry).
///
/// The list refreshes lazily: every `get`/`get_all` refreshes first, and a
/// refresh hits the registry only when the local list is older than the
/// refresh interval.
#[derive(Debug)]
pub struct RegistryDiscovery {
    inner: StaticDiscovery,
    registry_url: String,
    refresh_interval: Duration,
    last_update: Mutex<Option<Instant>>,
    client: Client<HttpConnector>,
}

impl RegistryDiscovery {
    /// Create a discovery polling `registry_url`.
    pub fn new(registry_url: impl Into<String>, refresh_interval: Option<Duration>) -> Self {
        Self {
            inner: StaticDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            refresh_interval: refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
            last_update: Mutex::new(None),
            client: Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_update
            .lock()
            .is_some_and(|at| at.elapsed() < self.refresh_interval)
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), Error> {
        if self.is_fresh() {
            return Ok(());
        }

        debug!(registry = %self.registry_url, "refreshing server list");
        let uri: Uri = self
            .registry_url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| Error::RegistryRefresh {
                message: e.to_string(),
            })?;
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| Error::RegistryRefresh {
                message: e.to_string(),
            })?;

        let servers: Vec<String> = response
            .headers()
            .get(SERVER_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect();
        debug!(count = servers.len(), "discovered servers");

        self.inner.update(servers).await;
        *self.last_update.lock() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        self.inner.update(servers).await;
        *self.last_update.lock() = Some(Instant::now());
    }

    async fn get(&self, mode: SelectMode) -> Result<String, Error> {
        self.refresh().await?;
        self.inner.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, Error> {
        self.refresh().await?;
        self.inner.get_all().await
    }
}

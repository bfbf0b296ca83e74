//! Named read-through caches.

use crate::{lru::LruCache, peer::PeerPicker, singleflight::SingleFlight, ByteView};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use snafu::{ensure, Snafu};
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::debug;

/// Errors surfaced by [`Group::get`].
///
/// Cloneable on purpose: all callers coalesced onto one in-flight load
/// observe the same error.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The empty key is reserved.
    #[snafu(display("cache key must not be empty"))]
    EmptyKey,

    /// The loader failed; the message is the loader's own.
    #[snafu(display("{}", message))]
    Fetch {
        /// Loader-supplied failure text.
        message: String,
    },

    /// A remote fetch failed. Peer routing is authoritative: this is not
    /// retried against the local loader.
    #[snafu(display("fetching from peer {}: {}", peer, message))]
    Peer {
        /// Base URL of the peer that failed.
        peer: String,
        /// Transport or status failure text.
        message: String,
    },

    /// A peer answered 200 but the body did not decode.
    #[snafu(display("decoding peer response: {}", message))]
    DecodePeerResponse {
        /// Decoder failure text.
        message: String,
    },
}

/// Loads values for keys missing from a [`Group`]'s store.
#[async_trait]
pub trait Loader: std::fmt::Debug + Send + Sync + 'static {
    /// Load the value for `key` from the source of truth.
    async fn load(&self, key: &str) -> Result<ByteView, Error>;
}

/// Adapter turning an async function into a [`Loader`].
pub struct FunctionLoader {
    load: Box<dyn (Fn(String) -> BoxFuture<'static, Result<ByteView, Error>>) + Send + Sync>,
}

impl FunctionLoader {
    /// Create a loader from a function.
    pub fn new<T, F>(load: T) -> Self
    where
        T: Fn(String) -> F + Send + Sync + 'static,
        F: Future<Output = Result<ByteView, Error>> + Send + 'static,
    {
        Self {
            load: Box::new(move |key| load(key).boxed()),
        }
    }
}

impl std::fmt::Debug for FunctionLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionLoader").finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for FunctionLoader {
    async fn load(&self, key: &str) -> Result<ByteView, Error> {
        (self.load)(key.to_string()).await
    }
}

/// Process-wide group registry, keyed by group name.
static GROUPS: Lazy<RwLock<HashMap<String, Arc<Group>>>> = Lazy::new(Default::default);

/// A named, size-bounded, read-through cache.
///
/// `get` serves hits from the local store; misses are routed to the owning
/// peer when a [`PeerPicker`] is registered (values fetched from a peer are
/// cached only on the owner), otherwise loaded locally and inserted.
/// Either miss path runs under [`SingleFlight`], so a burst of concurrent
/// gets for one key produces a single load.
///
/// Groups are created once, registered process-wide under their name, and
/// never destroyed.
pub struct Group {
    name: String,
    loader: Arc<dyn Loader>,
    store: Mutex<LruCache<ByteView>>,
    peers: OnceCell<Arc<dyn PeerPicker>>,
    flight: SingleFlight<String, Result<ByteView, Error>>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Group {
    /// Create a group bounded to `cache_bytes` and register it under `name`.
    ///
    /// Creating a second group under an existing name replaces the
    /// registration (the old group stays usable by holders of its `Arc`).
    pub fn new(name: impl Into<String>, cache_bytes: usize, loader: Arc<dyn Loader>) -> Arc<Self> {
        let name = name.into();
        let group = Arc::new(Self {
            name: name.clone(),
            loader,
            store: Mutex::new(LruCache::new(cache_bytes)),
            peers: OnceCell::new(),
            flight: SingleFlight::new(),
        });
        GROUPS.write().insert(name, Arc::clone(&group));
        group
    }

    /// Look up a previously created group.
    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        GROUPS.read().get(name).cloned()
    }

    /// The group's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the cluster's peer picker.
    ///
    /// # Panics
    ///
    /// Panics when called a second time; wiring the cluster twice is a
    /// programming error.
    pub fn register_peer_picker(&self, picker: Arc<dyn PeerPicker>) {
        if self.peers.set(picker).is_err() {
            panic!("register_peer_picker called more than once");
        }
    }

    /// Get the value for `key`, loading it on a miss.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<ByteView, Error> {
        ensure!(!key.is_empty(), EmptyKeySnafu);

        if let Some(view) = self.store.lock().get(key) {
            debug!(group = %self.name, key, "cache hit");
            return Ok(view);
        }
        debug!(group = %self.name, key, "cache miss");
        self.load(key).await
    }

    async fn load(self: &Arc<Self>, key: &str) -> Result<ByteView, Error> {
        if let Some(picker) = self.peers.get() {
            if let Some(peer) = picker.pick_peer(key) {
                let group_name = self.name.clone();
                let key_owned = key.to_string();
                let flight_key = key.to_string();
                return self
                    .flight
                    .run(flight_key, async move {
                        debug!(group = %group_name, key = %key_owned, "loading from peer");
                        peer.get(&group_name, &key_owned).await
                    })
                    .await;
            }
        }

        let this = Arc::clone(self);
        let key_owned = key.to_string();
        self.flight
            .run(key.to_string(), async move {
                debug!(group = %this.name, key = %key_owned, "loading locally");
                let view = this.loader.load(&key_owned).await?;
                this.store.lock().insert(key_owned, view.clone());
                Ok(view)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerGetter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn score_loader(calls: Arc<AtomicUsize>) -> Arc<FunctionLoader> {
        Arc::new(FunctionLoader::new(move |key: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match key.as_str() {
                    "Tom" => Ok(ByteView::from("630")),
                    "Jack" => Ok(ByteView::from("589")),
                    "Sam" => Ok(ByteView::from("567")),
                    _ => FetchSnafu {
                        message: format!("{key} not exist"),
                    }
                    .fail(),
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("scores-basic", 2048, score_loader(Arc::clone(&calls)));

        assert_eq!(group.get("Tom").await.unwrap().to_string(), "630");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Served from cache: the loader is not consulted again.
        assert_eq!(group.get("Tom").await.unwrap().to_string(), "630");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = group.get("unknown").await.unwrap_err();
        assert_eq!(err.to_string(), "unknown not exist");
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("scores-empty", 2048, score_loader(Arc::clone(&calls)));

        assert_eq!(group.get("").await.unwrap_err(), Error::EmptyKey);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("scores-lookup", 2048, score_loader(calls));

        let found = Group::lookup("scores-lookup").expect("group was registered");
        assert_eq!(found.name(), group.name());
        assert!(Group::lookup("no-such-group").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_misses_invoke_loader_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_captured = Arc::clone(&calls);
        let loader = Arc::new(FunctionLoader::new(move |key: String| {
            let calls = Arc::clone(&calls_captured);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(ByteView::from(key))
            }
        }));
        let group = Group::new("scores-flight", 2048, loader);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let group = Arc::clone(&group);
            handles.push(tokio::spawn(async move { group.get("k").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().to_string(), "k");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct FailingGetter;

    #[async_trait]
    impl PeerGetter for FailingGetter {
        async fn get(&self, _group: &str, _key: &str) -> Result<ByteView, Error> {
            PeerSnafu {
                peer: "http://peer.invalid",
                message: "connection refused",
            }
            .fail()
        }
    }

    #[derive(Debug)]
    struct AlwaysRemote;

    impl PeerPicker for AlwaysRemote {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            Some(Arc::new(FailingGetter))
        }
    }

    #[derive(Debug)]
    struct AlwaysSelf;

    impl PeerPicker for AlwaysSelf {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            None
        }
    }

    #[tokio::test]
    async fn test_peer_error_does_not_fall_back_to_loader() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("scores-remote", 2048, score_loader(Arc::clone(&calls)));
        group.register_peer_picker(Arc::new(AlwaysRemote));

        let err = group.get("Tom").await.unwrap_err();
        assert!(matches!(err, Error::Peer { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_self_owned_key_loads_locally() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("scores-self", 2048, score_loader(Arc::clone(&calls)));
        group.register_peer_picker(Arc::new(AlwaysSelf));

        assert_eq!(group.get("Jack").await.unwrap().to_string(), "589");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "register_peer_picker called more than once")]
    async fn test_duplicate_peer_picker_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let group = Group::new("scores-dup", 2048, score_loader(calls));
        group.register_peer_picker(Arc::new(AlwaysSelf));
        group.register_peer_picker(Arc::new(AlwaysSelf));
    }
}

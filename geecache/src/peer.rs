//! Seams between a cache group and its cluster.

use crate::{group::Error, ByteView};
use async_trait::async_trait;
use std::sync::Arc;

/// Chooses the node that owns a key.
pub trait PeerPicker: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the getter for the key's owner, or `None` when the key is
    /// owned by this node (or no peers are configured) and must be loaded
    /// locally.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches a value from one remote peer.
#[async_trait]
pub trait PeerGetter: std::fmt::Debug + Send + Sync + 'static {
    /// Fetch `key` of `group` from the peer.
    async fn get(&self, group: &str, key: &str) -> Result<ByteView, Error>;
}

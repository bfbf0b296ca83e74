//! Consistent-hash ring for key -> node placement.

use std::collections::HashMap;

/// Hash function mapping bytes onto the ring.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// A consistent-hash ring over virtual nodes.
///
/// Every physical node is projected onto the ring `replicas` times (virtual
/// node `i` hashes the string `"{i}{node}"`), which evens out the key
/// distribution. `get` walks clockwise from the key's hash to the first
/// virtual node and returns its physical owner. Nodes cannot be removed;
/// cluster membership changes rebuild the ring (see
/// [`HttpPool::set_peers`](crate::http::HttpPool::set_peers)).
pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    /// Sorted virtual-node hashes.
    keys: Vec<u32>,
    /// Virtual-node hash -> physical node.
    nodes: HashMap<u32, String>,
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("virtual_nodes", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl HashRing {
    /// Create a ring with the default CRC32-IEEE hash.
    pub fn new(replicas: usize) -> Self {
        Self::with_hash_fn(replicas, Box::new(|data| crc32fast::hash(data)))
    }

    /// Create a ring with a caller-supplied hash function.
    pub fn with_hash_fn(replicas: usize, hash: HashFn) -> Self {
        Self {
            replicas,
            hash,
            keys: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Add physical nodes to the ring.
    pub fn add<I, S>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for node in nodes {
            let node = node.as_ref();
            for i in 0..self.replicas {
                let vkey = (self.hash)(format!("{i}{node}").as_bytes());
                self.keys.push(vkey);
                self.nodes.insert(vkey, node.to_string());
            }
        }
        self.keys.sort_unstable();
    }

    /// Map `key` to its owning node, or `None` if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let h = (self.hash)(key.as_bytes());
        let idx = self.keys.partition_point(|&k| k < h);
        let vkey = self.keys[idx % self.keys.len()];
        Some(&self.nodes[&vkey])
    }

    /// Whether any node has been added.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

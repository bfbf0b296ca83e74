#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! A distributed read-through cache.
//!
//! A [`Group`](group::Group) is a named, size-bounded cache that loads
//! missing entries through a caller-supplied [`Loader`](group::Loader).
//! Groups can be joined into a cluster via [`HttpPool`](http::HttpPool):
//! each key is owned by exactly one node (selected on a consistent-hash
//! [`HashRing`](ring::HashRing)) and misses for remote keys are fetched from
//! the owner over HTTP. Concurrent misses for the same key are coalesced by
//! [`SingleFlight`](singleflight::SingleFlight) so the loader and the peer
//! protocol see at most one in-flight request per key.

pub mod byte_view;
pub mod group;
pub mod http;
pub mod lru;
pub mod peer;
pub mod ring;
pub mod singleflight;
mod wire;

pub use byte_view::ByteView;
pub use group::{Error, Group, Loader};

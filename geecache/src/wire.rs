//! Peer-protocol wire messages.
//!
//! The peer HTTP response body is a single protobuf message; the struct is
//! written out by hand rather than generated, there being exactly one.

/// Body of a successful peer `GET`: the cached value as field 1.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CacheValue {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
}

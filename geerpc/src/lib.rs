#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! A concurrent RPC runtime.
//!
//! One TCP connection carries many in-flight calls: the [`Client`] assigns
//! every call a sequence number, writes `header + body` frames under a
//! sending lock, and a receive task pairs responses back to their callers.
//! The [`Server`] dispatches each request to a registered [`Service`] method
//! in its own task, optionally bounded by a per-call timeout. On top sit a
//! heartbeat-based [`Registry`](registry::Registry), client-side
//! [`Discovery`](discovery::Discovery), and a load-balancing
//! [`BalancedClient`](balanced::BalancedClient) with unicast and broadcast
//! invocations.
//!
//! Connections open with a JSON preamble ([`Options`]) selecting the codec
//! and timeouts; a server can also accept the same protocol tunneled
//! through an `HTTP CONNECT` handshake (see [`Server::serve_http`]).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error as ThisError;

pub mod balanced;
pub mod client;
pub mod codec;
pub mod discovery;
pub mod registry;
pub mod server;
pub mod service;

pub use balanced::BalancedClient;
pub use client::Client;
pub use codec::{CodecKind, Header};
pub use registry::Registry;
pub use server::Server;
pub use service::{MethodError, MethodResult, Service};

/// Marks the preamble of a conforming connection.
pub const MAGIC_NUMBER: i32 = 0x3bef5c;

/// Connection handshake, JSON-encoded as the first frame of every
/// connection.
///
/// `handle_timeout` bounds each server-side method invocation; zero means
/// unbounded. `connect_timeout` bounds the client's dial; zero disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`].
    pub magic_number: i32,
    /// Payload encoding for everything after the preamble.
    pub codec_type: CodecKind,
    /// Client-side dial bound, serialized as integer nanoseconds.
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    /// Server-side per-invocation bound, serialized as integer nanoseconds.
    #[serde(with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecKind::Bincode,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

/// Errors surfaced by the RPC runtime.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The connection is closing or shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// Dialing did not finish within the configured bound.
    #[error("connect timeout: expected to connect within {0:?}")]
    ConnectTimeout(Duration),

    /// A call did not complete within the caller's bound.
    #[error("call {method} timed out")]
    CallTimeout {
        /// `<service>.<method>` of the timed-out call.
        method: String,
    },

    /// The server reported an error; the message is the server's own.
    #[error("{0}")]
    Remote(String),

    /// The connection failed while calls were pending.
    #[error("connection lost: {message}")]
    Disconnected {
        /// Failure observed by the receive loop.
        message: String,
    },

    /// Payload or header serialization failed.
    #[error("encoding message: {message}")]
    Encode {
        /// Serializer failure text.
        message: String,
    },

    /// Payload or header deserialization failed.
    #[error("decoding message: {message}")]
    Decode {
        /// Deserializer failure text.
        message: String,
    },

    /// A frame announced an unreasonable length.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// The connection preamble was rejected.
    #[error("invalid preamble: {message}")]
    InvalidPreamble {
        /// What was wrong with it.
        message: String,
    },

    /// An rpc address did not parse.
    #[error("invalid rpc address {addr:?}: expected <protocol>@<host:port>")]
    InvalidAddress {
        /// Offending address.
        addr: String,
    },

    /// The address scheme is not one of `tcp@` / `http@`.
    #[error("unsupported protocol {protocol:?}")]
    UnsupportedProtocol {
        /// Offending scheme.
        protocol: String,
    },

    /// The CONNECT handshake was not accepted.
    #[error("http tunnel rejected: {status_line:?}")]
    TunnelRejected {
        /// Status line the server answered with.
        status_line: String,
    },

    /// Discovery has no servers to offer.
    #[error("no available servers")]
    NoAvailableServers,

    /// The registry could not be reached for a refresh.
    #[error("registry refresh failed: {message}")]
    RegistryRefresh {
        /// Transport failure text.
        message: String,
    },

    /// A heartbeat POST failed.
    #[error("heartbeat to {registry}: {message}")]
    Heartbeat {
        /// Registry URL.
        registry: String,
        /// Transport failure text.
        message: String,
    },

    /// A broadcast sibling failed first and this call was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

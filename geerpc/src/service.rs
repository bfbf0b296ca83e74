//! Service definitions and method dispatch.
//!
//! The runtime dispatches by name: a request's `<service>.<method>` selects
//! a handler closure registered at startup. Each handler decodes its
//! argument with the connection's codec, invokes the method body, and
//! encodes the reply; a method failure travels back as the response
//! header's error string.

use crate::codec::CodecKind;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Failure returned by a method body; its text is what the caller sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError(String);

impl MethodError {
    /// Create a method error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// What method bodies return.
pub type MethodResult<R> = Result<R, MethodError>;

type HandlerFn =
    Box<dyn Fn(CodecKind, Bytes) -> BoxFuture<'static, Result<Vec<u8>, String>> + Send + Sync>;

pub(crate) struct Method {
    calls: AtomicU64,
    handler: HandlerFn,
}

impl Method {
    /// Invoke the handler, counting the call.
    pub(crate) async fn invoke(&self, kind: CodecKind, body: Bytes) -> Result<Vec<u8>, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, body).await
    }

    pub(crate) fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Names usable on the wire: exported-style, like the types and methods
/// they stand in for.
fn suitable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A named collection of callable methods.
///
/// Built once at startup and registered with a
/// [`Server`](crate::server::Server):
///
/// ```
/// use geerpc::Service;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct TwoInts {
///     a: i32,
///     b: i32,
/// }
///
/// let service = Service::new("Arith")
///     .method("Sum", |args: TwoInts| async move { Ok(args.a + args.b) });
/// assert_eq!(service.name(), "Arith");
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Start building a service.
    ///
    /// # Panics
    ///
    /// Panics on a name that is not exported-style (leading ASCII
    /// uppercase); an unroutable service is a programming error.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(
            suitable_name(&name),
            "service name {name:?} must start with an ASCII uppercase letter"
        );
        Self {
            name,
            methods: HashMap::new(),
        }
    }

    /// Register a method.
    ///
    /// Unsuitable or duplicate names are logged and skipped, leaving the
    /// rest of the service usable.
    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<R>> + Send + 'static,
    {
        if !suitable_name(name) {
            warn!(service = %self.name, method = name, "skipping method with unsuitable name");
            return self;
        }
        if self.methods.contains_key(name) {
            warn!(service = %self.name, method = name, "skipping duplicate method");
            return self;
        }

        let handler: HandlerFn = Box::new(move |kind, body| {
            let arg = match kind.decode::<A>(&body) {
                Ok(arg) => arg,
                Err(e) => {
                    return futures::future::ready(Err(format!("decoding argument: {e}"))).boxed()
                }
            };
            let fut = f(arg);
            async move {
                match fut.await {
                    Ok(reply) => kind.encode(&reply).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            .boxed()
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(Method {
                calls: AtomicU64::new(0),
                handler,
            }),
        );
        self
    }

    /// The service's routable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times `method` has been invoked, if it exists.
    pub fn call_count(&self, method: &str) -> Option<u64> {
        self.methods.get(method).map(|m| m.call_count())
    }

    pub(crate) fn get_method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }
}

//! Load-balancing client over discovered servers.

use crate::{
    discovery::{Discovery, SelectMode},
    Client, Error, Options,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A client that spreads calls over the servers a [`Discovery`] supplies.
///
/// Connections are cached per address and reused across calls; a cached
/// client that went dead is closed, evicted, and redialed on the next call
/// that needs its address.
pub struct BalancedClient {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    options: Options,
    clients: tokio::sync::Mutex<HashMap<String, Arc<Client>>>,
}

impl std::fmt::Debug for BalancedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancedClient")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl BalancedClient {
    /// Create a balanced client.
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, options: Options) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            mode,
            options,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn dial_cached(&self, rpc_addr: &str) -> Result<Arc<Client>, Error> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_alive() {
                return Ok(Arc::clone(client));
            }
            debug!(addr = rpc_addr, "evicting dead connection");
            if let Some(dead) = clients.remove(rpc_addr) {
                dead.close().await.ok();
            }
        }

        debug!(addr = rpc_addr, "dialing");
        let client = Arc::new(Client::dial_addr(rpc_addr, &self.options).await?);
        clients.insert(rpc_addr.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Invoke `<service>.<method>` on one discovered server.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.dial_cached(&addr).await?;
        client.call(service_method, args).await
    }

    /// Invoke `<service>.<method>` on every discovered server.
    ///
    /// The first failure is returned and cancels the calls still in flight
    /// (each is awaited regardless, so nothing outlives this function). The
    /// first success supplies the reply; with no servers the reply is
    /// `None`.
    pub async fn broadcast<A, R>(
        self: &Arc<Self>,
        service_method: &str,
        args: &A,
    ) -> Result<Option<R>, Error>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        let body = self.options.codec_type.encode(args)?;
        let cancel = CancellationToken::new();

        let mut tasks = JoinSet::new();
        for addr in servers {
            let this = Arc::clone(self);
            let body = body.clone();
            let cancel = cancel.clone();
            let service_method = service_method.to_string();
            tasks.spawn(async move {
                let call = async {
                    let client = this.dial_cached(&addr).await?;
                    client.call_raw(&service_method, body).await
                };
                tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    result = call => result,
                }
            });
        }

        let mut first_error: Option<Error> = None;
        let mut first_reply: Option<Bytes> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(Error::Disconnected {
                    message: format!("broadcast task failed: {e}"),
                })
            });
            match result {
                Ok(reply) => {
                    if first_reply.is_none() {
                        first_reply = Some(reply);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        debug!(error = %e, "broadcast peer failed; cancelling the rest");
                        first_error = Some(e);
                        cancel.cancel();
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => first_reply
                .map(|reply| self.options.codec_type.decode(&reply))
                .transpose(),
        }
    }

    /// Close and drop every cached connection.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            client.close().await.ok();
        }
    }
}

// Wire layer: the generated gRPC service plus a small dial cache that
// keeps one live channel per peer shard around instead of redialing on
// every request. Keep-alive parameters are fixed at compile time rather
// than being configurable — there is nothing to tune at runtime and a
// fixed set of constants keeps node behavior predictable across the fleet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::lock::Mutex as AsyncMutex;
use tonic::transport::{Channel, Endpoint, Server};

pub mod proto {
    tonic::include_proto!("kvstore");
}

pub use proto::kvstore_client::KvstoreClient;
pub use proto::kvstore_server::{Kvstore, KvstoreServer};
pub use proto::{
    DeleteExtraKeysRequest, DeleteExtraKeysResponse, GetRequest, GetResponse, SetRequest,
    SetResponse,
};

/// HTTP-style status codes used in every response's `status` field.
pub mod status {
    pub const OK: i32 = 200;
    pub const FAILED_DEPENDENCY: i32 = 424;
    pub const INTERNAL: i32 = 500;
}

/// Per-attempt RPC timeout: every remote Get/Set call a coordinator makes
/// to a peer replica is bounded by this deadline.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Ping interval for established connections.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// How long a ping may go unacknowledged before the connection is dropped.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2);
/// Server-side: how long a connection may sit idle before being closed.
pub const IDLE_CUTOFF: Duration = Duration::from_secs(30);
/// Server-side: hard cap on connection lifetime, plus grace to finish
/// in-flight RPCs before the connection is forcibly closed.
pub const MAX_CONNECTION_AGE: Duration = Duration::from_secs(16 * 60 * 60);
pub const MAX_CONNECTION_AGE_GRACE: Duration = Duration::from_secs(5);

/// Applies the fixed keep-alive parameters to an outgoing client endpoint.
pub fn configure_client_endpoint(endpoint: Endpoint) -> Endpoint {
    endpoint
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .timeout(RPC_TIMEOUT)
}

/// Applies the fixed keep-alive parameters to the listening server.
pub fn configure_server(server: Server) -> Server {
    server
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
        .http2_max_pending_accept_reset_streams(None)
        .tcp_keepalive(Some(IDLE_CUTOFF))
        .max_connection_age(MAX_CONNECTION_AGE)
        .max_connection_age_grace(MAX_CONNECTION_AGE_GRACE)
}

/// A dial cache keyed by shard index: keeps at most one live channel per
/// peer around, dialing lazily on first use and letting idle peers be
/// swept out. Modeled on gazette's `Router` (a `futures`-mutex-guarded
/// per-member dial slot so concurrent requests to the same shard share a
/// single in-flight dial instead of racing to connect).
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<std::sync::Mutex<HashMap<usize, Arc<AsyncMutex<Option<(Channel, usize)>>>>>>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Returns a ready channel to the peer at `address`, dialing it if
    /// necessary. Concurrent callers for the same shard share the dial.
    pub async fn channel(
        &self,
        shard: usize,
        address: &str,
    ) -> Result<Channel, tonic::transport::Error> {
        let slot = {
            let mut states = self.inner.lock().unwrap();
            Arc::clone(states.entry(shard).or_default())
        };

        let mut state = slot.lock().await;
        if let Some((channel, uses)) = &mut *state {
            *uses += 1;
            return Ok(channel.clone());
        }

        let endpoint = configure_client_endpoint(Endpoint::from_shared(format!(
            "http://{address}"
        ))?);
        let channel = endpoint.connect().await?;
        *state = Some((channel.clone(), 1));
        Ok(channel)
    }

    /// Drops channels to peers that have not been used since the previous
    /// sweep. Safe to call periodically from a background task.
    pub fn sweep(&self) {
        let mut states = self.inner.lock().unwrap();
        states.retain(|shard, slot| {
            let Some(mut state) = slot.try_lock() else {
                return true;
            };
            let Some((_channel, uses)) = &mut *state else {
                return false;
            };
            if *uses == 0 {
                tracing::debug!(target: "kvstore", shard, "dropping idle peer connection");
                return false;
            }
            *uses = 0;
            true
        });
    }
}

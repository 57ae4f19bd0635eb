// Top-level per-node request handler: local-vs-remote dispatch for GET,
// quorum fan-out for SET, and the DeleteExtraKeys maintenance call. Mirrors
// the original HTTP handler's control flow (local-first GET with remote
// fallback, fire-and-forget propose plus a direct quorum write for SET)
// but replaces an ad hoc success/error channel split — prone to reading
// an error while a success is still in-flight — with a single channel
// carrying both outcomes, so the selection loop treats them symmetrically.

use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use kvstore_base::{err, Result};
use kvstore_locator::Locator;
use kvstore_replicator::Replicator;
use kvstore_rpc::{
    status, DeleteExtraKeysRequest, DeleteExtraKeysResponse, GetRequest, GetResponse, Kvstore,
    KvstoreClient, Router, SetRequest, SetResponse, RPC_TIMEOUT,
};
use kvstore_storage::StorageAdapter;
use kvstore_topology::Topology;

pub struct GetOutcome {
    pub status: i32,
    pub value: Option<Vec<u8>>,
}

pub struct SetOutcome {
    pub status: i32,
    pub replicated_on: Vec<usize>,
}

/// Per-node request handler. Holds read-only handles to the shared,
/// already-constructed Topology/Locator/Storage/Replicator plus its own
/// peer dial cache.
pub struct Coordinator<S: StorageAdapter + 'static> {
    topology: Arc<Topology>,
    locator: Arc<Locator>,
    storage: Arc<S>,
    replicator: Arc<Replicator<S>>,
    router: Router,
    replication_factor: usize,
    consistency_level: usize,
}

impl<S: StorageAdapter + 'static> Coordinator<S> {
    pub fn new(
        topology: Arc<Topology>,
        locator: Arc<Locator>,
        storage: Arc<S>,
        replicator: Arc<Replicator<S>>,
        router: Router,
        replication_factor: usize,
        consistency_level: usize,
    ) -> Coordinator<S> {
        Coordinator {
            topology,
            locator,
            storage,
            replicator,
            router,
            replication_factor,
            consistency_level,
        }
    }

    /// GET(key, coordinator). `coordinator=false` means a peer is asking
    /// for this node's own local value only.
    pub async fn get(&self, key: &[u8], coordinator: bool) -> GetOutcome {
        if !coordinator {
            return self.local_get(key).await;
        }

        let replicas = match self.locator.closest(key, self.replication_factor) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(target: "kvstore", "locator failure: {e}");
                return GetOutcome {
                    status: status::INTERNAL,
                    value: None,
                };
            }
        };

        // "Success" here means a value was actually found, not merely that
        // the call completed without error: a local or remote NotFound is
        // itself a clean response, but it must not stop the search while
        // other replicas in the set haven't been tried yet (see S3).
        if replicas.contains(&self.topology.current_index()) {
            let local = self.local_get(key).await;
            if local.status == status::OK && local.value.is_some() {
                return local;
            }
        }

        for &replica in &replicas {
            if self.topology.is_local(replica) {
                continue;
            }
            if let Some(outcome) = self.remote_get(replica, key).await {
                if outcome.status == status::OK && outcome.value.is_some() {
                    return outcome;
                }
            }
        }

        GetOutcome {
            status: status::FAILED_DEPENDENCY,
            value: None,
        }
    }

    async fn local_get(&self, key: &[u8]) -> GetOutcome {
        let storage = Arc::clone(&self.storage);
        let key = key.to_vec();
        let result = tokio::task::spawn_blocking(move || storage.get(&key)).await;
        match result {
            Ok(Ok(value)) => GetOutcome {
                status: status::OK,
                value,
            },
            Ok(Err(e)) => {
                tracing::error!(target: "kvstore", "local get failed: {e}");
                GetOutcome {
                    status: status::INTERNAL,
                    value: None,
                }
            }
            Err(join_err) => {
                tracing::error!(target: "kvstore", "local get task panicked: {join_err}");
                GetOutcome {
                    status: status::INTERNAL,
                    value: None,
                }
            }
        }
    }

    async fn remote_get(&self, replica: usize, key: &[u8]) -> Option<GetOutcome> {
        let address = self.topology.address(replica)?;
        let channel = self.dial(replica, address).await?;
        let mut client = KvstoreClient::new(channel);
        let request = GetRequest {
            key: key.to_vec(),
            coordinator: false,
        };
        match tokio::time::timeout(RPC_TIMEOUT, client.get(request)).await {
            Ok(Ok(response)) => {
                let response = response.into_inner();
                Some(GetOutcome {
                    status: response.status,
                    value: if response.found {
                        Some(response.value)
                    } else {
                        None
                    },
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "kvstore", shard = replica, "remote get failed: {e}");
                None
            }
            Err(_elapsed) => {
                tracing::warn!(target: "kvstore", shard = replica, "remote get timed out");
                None
            }
        }
    }

    async fn dial(&self, replica: usize, address: &str) -> Option<Channel> {
        match self.router.channel(replica, address).await {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::warn!(target: "kvstore", shard = replica, "dial failed: {e}");
                None
            }
        }
    }

    /// SET(key, value, coordinator).
    pub async fn set(&self, key: &str, value: Vec<u8>, coordinator: bool) -> SetOutcome {
        if !coordinator {
            return self.local_set(key, value).await;
        }

        if let Err(e) = self.replicator.propose(key.to_string(), value.clone()) {
            tracing::error!(target: "kvstore", "propose failed: {e}");
        }

        let replicas = match self.locator.closest(key.as_bytes(), self.replication_factor) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(target: "kvstore", "locator failure: {e}");
                return SetOutcome {
                    status: status::INTERNAL,
                    replicated_on: Vec::new(),
                };
            }
        };

        // Single bounded, symmetric channel: both successes and failures
        // flow through it, so the selection loop below can never read an
        // error while a pending success is still in flight.
        let (tx, mut rx) =
            mpsc::channel::<std::result::Result<usize, usize>>(replicas.len().max(1));

        for &replica in &replicas {
            let tx = tx.clone();
            if self.topology.is_local(replica) {
                let storage = Arc::clone(&self.storage);
                let key = key.to_string();
                let value = value.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        storage.set(key.as_bytes(), &value)
                    })
                    .await;
                    let outcome = match result {
                        Ok(Ok(())) => Ok(replica),
                        _ => Err(replica),
                    };
                    let _ = tx.send(outcome).await;
                });
            } else {
                let router = self.router.clone();
                let address = self.topology.address(replica).map(str::to_string);
                let key = key.to_string();
                let value = value.clone();
                tokio::spawn(async move {
                    let outcome = match address {
                        Some(address) => {
                            match Self::remote_set_call(&router, replica, &address, &key, &value)
                                .await
                            {
                                true => Ok(replica),
                                false => Err(replica),
                            }
                        }
                        None => Err(replica),
                    };
                    let _ = tx.send(outcome).await;
                });
            }
        }
        drop(tx);

        let mut successes = Vec::new();
        let mut responses = 0usize;
        while let Some(outcome) = rx.recv().await {
            responses += 1;
            if let Ok(replica) = outcome {
                successes.push(replica);
            }
            if successes.len() >= self.consistency_level {
                break;
            }
            if responses >= replicas.len() {
                break;
            }
        }

        let status = if successes.len() >= self.consistency_level {
            status::OK
        } else {
            status::FAILED_DEPENDENCY
        };

        SetOutcome {
            status,
            replicated_on: successes,
        }
    }

    async fn local_set(&self, key: &str, value: Vec<u8>) -> SetOutcome {
        let storage = Arc::clone(&self.storage);
        let key_bytes = key.as_bytes().to_vec();
        let result = tokio::task::spawn_blocking(move || storage.set(&key_bytes, &value)).await;
        match result {
            Ok(Ok(())) => SetOutcome {
                status: status::OK,
                replicated_on: vec![self.topology.current_index()],
            },
            _ => SetOutcome {
                status: status::INTERNAL,
                replicated_on: Vec::new(),
            },
        }
    }

    async fn remote_set_call(
        router: &Router,
        replica: usize,
        address: &str,
        key: &str,
        value: &[u8],
    ) -> bool {
        let channel = match router.channel(replica, address).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(target: "kvstore", shard = replica, "dial failed: {e}");
                return false;
            }
        };
        let mut client = KvstoreClient::new(channel);
        let request = SetRequest {
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
            coordinator: false,
        };
        match tokio::time::timeout(RPC_TIMEOUT, client.set(request)).await {
            Ok(Ok(response)) => response.into_inner().status == status::OK,
            Ok(Err(e)) => {
                tracing::warn!(target: "kvstore", shard = replica, "remote set failed: {e}");
                false
            }
            Err(_elapsed) => {
                tracing::warn!(target: "kvstore", shard = replica, "remote set timed out");
                false
            }
        }
    }

    /// A maintenance call: drops keys this shard no longer owns under the
    /// current locator. Safe to invoke at any time, typically after a
    /// reshard.
    pub async fn delete_extra_keys(&self) -> Result<()> {
        let locator = Arc::clone(&self.locator);
        let storage = Arc::clone(&self.storage);
        let local_index = self.topology.current_index();
        tokio::task::spawn_blocking(move || {
            storage.scan_and_delete(&|key: &[u8]| locator.index_of(key) != local_index)
        })
        .await
        .map_err(|join_err| err(format!("delete_extra_keys task panicked: {join_err}")))?
    }
}

/// Adapts a `Coordinator` to the generated tonic service trait. Thin by
/// design — mirrors `coordinator/grpc/grpcServer.go`, whose handlers are
/// themselves one-line calls into the node's actual logic.
pub struct GrpcService<S: StorageAdapter + 'static> {
    coordinator: Arc<Coordinator<S>>,
}

impl<S: StorageAdapter + 'static> GrpcService<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>) -> GrpcService<S> {
        GrpcService { coordinator }
    }
}

#[tonic::async_trait]
impl<S: StorageAdapter + 'static> Kvstore for GrpcService<S> {
    async fn get(&self, request: Request<GetRequest>) -> std::result::Result<Response<GetResponse>, Status> {
        let request = request.into_inner();
        let outcome = self.coordinator.get(&request.key, request.coordinator).await;
        Ok(Response::new(GetResponse {
            status: outcome.status,
            found: outcome.value.is_some(),
            value: outcome.value.unwrap_or_default(),
            error: String::new(),
        }))
    }

    async fn set(&self, request: Request<SetRequest>) -> std::result::Result<Response<SetResponse>, Status> {
        let request = request.into_inner();
        let key = String::from_utf8_lossy(&request.key).into_owned();
        let outcome = self
            .coordinator
            .set(&key, request.value, request.coordinator)
            .await;
        Ok(Response::new(SetResponse {
            status: outcome.status,
            replicated_on: outcome.replicated_on.iter().map(|&i| i as u32).collect(),
            error: String::new(),
        }))
    }

    async fn delete_extra_keys(
        &self,
        _request: Request<DeleteExtraKeysRequest>,
    ) -> std::result::Result<Response<DeleteExtraKeysResponse>, Status> {
        match self.coordinator.delete_extra_keys().await {
            Ok(()) => Ok(Response::new(DeleteExtraKeysResponse {
                status: status::OK,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(DeleteExtraKeysResponse {
                status: status::INTERNAL,
                error: e.to_string(),
            })),
        }
    }
}

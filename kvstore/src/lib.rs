// Wires the five components together into a running node: loads the
// sharding config, builds Topology/Locator/Storage, resolves the
// consensus <-> Ordered Replicator cycle via two-step construction, then
// serves the RPC surface.

use std::net::SocketAddr;
use std::sync::Arc;

use kvstore_admin::{load_config, Cli};
use kvstore_base::{err, Result};
use kvstore_consensus::{Consensus, ConsensusSink, LocalSequencer};
use kvstore_coordinator::{Coordinator, GrpcService};
use kvstore_locator::Locator;
use kvstore_replicator::Replicator;
use kvstore_rpc::{configure_server, KvstoreServer, Router};
use kvstore_storage::{Maintainable, RedbAdapter};
use kvstore_topology::Topology;

/// Builds every component and serves the RPC surface on `cli.http_addr`
/// until the process is killed. Returns only on a fatal bootstrap or
/// transport-level error.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config_file)?;
    let topology = Arc::new(Topology::new(&config.shards, &cli.shard)?);
    tracing::info!(
        target: "kvstore",
        count = topology.count(),
        current_index = topology.current_index(),
        "shard count is {}, current shard: {}",
        topology.count(),
        topology.current_index()
    );

    let locator = Arc::new(Locator::new(&config.shards));
    let storage = Arc::new(
        RedbAdapter::open(&cli.db_location)
            .map_err(|e| err(format!("creating {:?}: {e}", cli.db_location)))?,
    );
    storage.clone().spawn_maintenance();

    // Two-step construction breaks the Replicator <-> consensus cycle: the
    // replicator is built first with no consensus handle bound, the
    // consensus module is built with the replicator (as an `Arc<dyn
    // ConsensusSink>`) as its one sink, then the handle is bound back in.
    let replicator = Replicator::new(
        Arc::clone(&locator),
        topology.current_index(),
        config.replication_factor,
        Arc::clone(&storage),
    );
    let consensus = Arc::new(LocalSequencer::new());
    consensus.register(Arc::clone(&replicator) as Arc<dyn ConsensusSink>);
    replicator.bind_consensus(Arc::clone(&consensus) as Arc<dyn Consensus>);
    replicator.spawn_flusher();

    let router = Router::new();
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&topology),
        Arc::clone(&locator),
        Arc::clone(&storage),
        replicator,
        router,
        config.replication_factor,
        config.consistency_level,
    ));

    let addr: SocketAddr = cli
        .http_addr
        .parse()
        .map_err(|e| err(format!("invalid --http-addr {:?}: {e}", cli.http_addr)))?;

    tracing::info!(target: "kvstore", %addr, "listening");
    configure_server(tonic::transport::Server::builder())
        .add_service(KvstoreServer::new(GrpcService::new(coordinator)))
        .serve(addr)
        .await
        .map_err(|e| err(format!("serving on {addr}: {e}")))?;

    Ok(())
}

// The Ordered Replicator sits between the Coordinator (a producer of
// proposals) and the Storage Adapter (the consumer of committed writes),
// talking to the consensus module through the `ConsensusSink`/`Consensus`
// seam defined in `kvstore-consensus`.
//
// Construction is two-step because of the cyclic dependency this creates:
// the consensus module needs a sink (us) before it exists, and we need a
// handle to the consensus module (to `propose`) before it exists either.
// `Replicator::new` builds the queue and worker with no consensus handle
// bound yet; the caller then constructs the consensus module with the
// `Replicator`'s `Arc` as its sink, and finally calls `bind_consensus` to
// give the replicator back a handle it can `propose` through. See the
// `kvstore` binary for the wiring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use kvstore_base::Result;
use kvstore_consensus::{Consensus, ConsensusSink};
use kvstore_locator::Locator;
use kvstore_storage::StorageAdapter;

/// Default max batch size before the flusher drains the queue early.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default periodic flush deadline.
pub const DEFAULT_FLUSH_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// A single write, serialized deterministically for consensus transport.
/// MessagePack's array-of-fields encoding (`rmp-serde`'s default,
/// non-"human readable" mode) gives the same bytes for the same
/// `(key, value)` every time, which is what lets every replica's
/// `determine_conflict` agree on whether two payloads touch the same key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCommand {
    pub key: String,
    pub value: Vec<u8>,
}

impl WriteCommand {
    pub fn encode(&self) -> Vec<u8> {
        // Infallible: the type has no maps, no non-serializable fields.
        rmp_serde::to_vec(self).expect("WriteCommand always encodes")
    }

    pub fn decode(payload: &[u8]) -> Option<WriteCommand> {
        rmp_serde::from_slice(payload).ok()
    }
}

/// The ordered batch buffer plus its single background flusher.
///
/// Constructed with a null consensus handle; `bind_consensus` must be
/// called once, after the consensus module itself has been constructed
/// with this replicator (wrapped in an `Arc`) as its sink, before
/// `propose` can be used.
pub struct Replicator<S: StorageAdapter> {
    locator: Arc<Locator>,
    local_index: usize,
    replication_factor: usize,
    storage: Arc<S>,
    max_batch_size: usize,
    flush_deadline: Duration,
    queue: Mutex<VecDeque<WriteCommand>>,
    notify: Notify,
    consensus: OnceLock<Arc<dyn Consensus>>,
    dropped_malformed: AtomicU64,
}

impl<S: StorageAdapter + 'static> Replicator<S> {
    pub fn new(
        locator: Arc<Locator>,
        local_index: usize,
        replication_factor: usize,
        storage: Arc<S>,
    ) -> Arc<Replicator<S>> {
        Self::with_batching(
            locator,
            local_index,
            replication_factor,
            storage,
            DEFAULT_MAX_BATCH_SIZE,
            DEFAULT_FLUSH_DEADLINE,
        )
    }

    pub fn with_batching(
        locator: Arc<Locator>,
        local_index: usize,
        replication_factor: usize,
        storage: Arc<S>,
        max_batch_size: usize,
        flush_deadline: Duration,
    ) -> Arc<Replicator<S>> {
        Arc::new(Replicator {
            locator,
            local_index,
            replication_factor,
            storage,
            max_batch_size,
            flush_deadline,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consensus: OnceLock::new(),
            dropped_malformed: AtomicU64::new(0),
        })
    }

    /// Count of consensus payloads dropped for failing to decode. A
    /// malformed payload should never reach a sink in a healthy cluster,
    /// so this staying off zero is itself the signal worth watching.
    pub fn dropped_malformed(&self) -> u64 {
        self.dropped_malformed.load(Ordering::Relaxed)
    }

    /// Binds the consensus handle this replicator proposes through. Must be
    /// called exactly once, after `self` has already been registered as the
    /// consensus module's sink.
    pub fn bind_consensus(&self, consensus: Arc<dyn Consensus>) {
        self.consensus
            .set(consensus)
            .map_err(|_| ())
            .expect("bind_consensus called more than once");
    }

    /// Submits a write for cluster-wide ordering. Fire-and-forget: the
    /// caller does not wait for consensus delivery, only for the proposal
    /// to be accepted.
    pub fn propose(&self, key: impl Into<String>, value: Vec<u8>) -> Result<()> {
        let cmd = WriteCommand {
            key: key.into(),
            value,
        };
        let consensus = self
            .consensus
            .get()
            .expect("propose called before bind_consensus");
        consensus.propose(cmd.encode())
    }

    /// Spawns the single long-lived batch flusher task. Must be called once
    /// per replicator, after construction.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_flusher().await })
    }

    async fn run_flusher(self: Arc<Self>) {
        loop {
            let woke_on_notify = tokio::select! {
                _ = tokio::time::sleep(self.flush_deadline) => false,
                _ = self.notify.notified() => true,
            };

            let should_flush = if woke_on_notify {
                self.queue.lock().unwrap().len() >= self.max_batch_size
            } else {
                true
            };

            if !should_flush {
                continue;
            }

            self.flush_once().await;
        }
    }

    async fn flush_once(self: &Arc<Self>) {
        let batch: Vec<WriteCommand> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        let items: Vec<(Vec<u8>, Vec<u8>)> = batch
            .iter()
            .map(|c| (c.key.clone().into_bytes(), c.value.clone()))
            .collect();

        let storage = Arc::clone(&self.storage);
        let result = tokio::task::spawn_blocking(move || storage.write_batch(&items)).await;

        let flush_failed = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::error!(target: "kvstore", "batch flush failed, retrying: {e}");
                true
            }
            Err(join_err) => {
                tracing::error!(target: "kvstore", "batch flush task panicked: {join_err}");
                true
            }
        };

        if flush_failed {
            // Restore to the front so order is preserved and newer writes
            // for the same key (queued after this failed attempt) still
            // win when the batch is retried.
            let mut queue = self.queue.lock().unwrap();
            for cmd in batch.into_iter().rev() {
                queue.push_front(cmd);
            }
        }
    }
}

impl<S: StorageAdapter + 'static> ConsensusSink for Replicator<S> {
    fn determine_conflict(&self, a: &[u8], b: &[u8]) -> bool {
        match (WriteCommand::decode(a), WriteCommand::decode(b)) {
            (Some(x), Some(y)) => x.key == y.key,
            // A malformed payload cannot have come from a well-behaved
            // proposer; treat it as conflicting with nothing.
            _ => false,
        }
    }

    fn execute(&self, payload: Vec<u8>) {
        let Some(cmd) = WriteCommand::decode(&payload) else {
            self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target: "kvstore", "dropping malformed consensus payload");
            return;
        };

        let owners = match self
            .locator
            .closest(cmd.key.as_bytes(), self.replication_factor)
        {
            Ok(owners) => owners,
            Err(e) => {
                tracing::error!(target: "kvstore", "could not resolve replica set: {e}");
                return;
            }
        };

        if !owners.contains(&self.local_index) {
            return;
        }

        self.queue.lock().unwrap().push_back(cmd);
        self.notify.notify_one();
    }
}


/// Model-checks convergence: whatever order two coordinators' writes to
/// the same key are proposed in, every replica ends up agreeing on the
/// same value, because `LocalSequencer::propose` delivers to every
/// registered sink synchronously, in a single call order (see
/// `kvstore-consensus`). Rather than asserting this for one interleaving,
/// `stateright` explores both.
#[cfg(test)]
mod convergence_model {
    use stateright::{Checker, Model, Property};

    #[derive(Clone, Debug, Eq, PartialEq, Hash)]
    enum Proposal {
        FromCoordinatorA,
        FromCoordinatorB,
    }

    #[derive(Clone, Debug, Eq, PartialEq, Hash)]
    struct ConvergenceState {
        remaining: Vec<Proposal>,
        replica_one_last: Option<Proposal>,
        replica_two_last: Option<Proposal>,
    }

    struct ConvergenceModel;

    impl Model for ConvergenceModel {
        type State = ConvergenceState;
        type Action = Proposal;

        fn init_states(&self) -> Vec<Self::State> {
            vec![ConvergenceState {
                remaining: vec![Proposal::FromCoordinatorA, Proposal::FromCoordinatorB],
                replica_one_last: None,
                replica_two_last: None,
            }]
        }

        fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
            actions.extend(state.remaining.iter().cloned());
        }

        fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
            if !state.remaining.contains(&action) {
                return None;
            }
            let mut next = state.clone();
            next.remaining.retain(|p| p != &action);
            // `LocalSequencer::propose` iterates every registered sink in
            // one synchronous loop, so whichever proposal is delivered
            // next is delivered to both replicas in that same step --
            // there is no interleaving *within* a single delivery.
            next.replica_one_last = Some(action.clone());
            next.replica_two_last = Some(action);
            Some(next)
        }

        fn properties(&self) -> Vec<Property<Self>> {
            vec![Property::always("replicas converge", |_, state: &ConvergenceState| {
                state.replica_one_last == state.replica_two_last
            })]
        }
    }

    #[test]
    fn replicas_converge_under_any_proposal_interleaving() {
        ConvergenceModel.checker().spawn_bfs().join().assert_properties();
    }
}

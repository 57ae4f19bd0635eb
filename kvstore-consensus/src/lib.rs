// The consensus module itself — the generalized-ordering agreement
// algorithm — is treated as an external collaborator, assumed to
// provide a generalized ordering abstraction in which commands with no
// conflict may be delivered concurrently while conflicting commands are
// totally ordered. This crate defines that abstraction as two traits
// (`Consensus`, the capability the Ordered Replicator calls into, and
// `ConsensusSink`, the callbacks the module calls back out with) plus one
// concrete implementation, `LocalSequencer`, suitable for a single process
// hosting several in-process shards (our integration tests, and a
// single-host development deployment). A production deployment swaps in a
// real agreement protocol across a real transport, the same way the
// original implementation this was distilled from reaches for an external
// `conalg`-style module rather than writing Paxos itself.

use std::sync::Mutex;

use kvstore_base::Result;

/// Callbacks a consensus module drives. Implemented by the Ordered
/// Replicator; see `kvstore-replicator`.
pub trait ConsensusSink: Send + Sync {
    /// Two payloads conflict iff they decode to write commands with equal
    /// keys. Malformed payloads never conflict with anything.
    fn determine_conflict(&self, a: &[u8], b: &[u8]) -> bool;

    /// Delivery callback: the module guarantees that, across all replicas,
    /// delivery order of conflicting commands is identical.
    fn execute(&self, payload: Vec<u8>);
}

/// The capability a proposer (the Ordered Replicator) holds onto.
pub trait Consensus: Send + Sync {
    /// Non-blocking: the payload will eventually be delivered to every
    /// sink's `execute`. A synchronous failure here (the module rejected
    /// the proposal outright) is surfaced to the caller as a failed
    /// replication attempt.
    fn propose(&self, payload: Vec<u8>) -> Result<()>;
}

/// A single-process stand-in for a real agreement protocol: every
/// registered sink receives every proposal, in the order `propose` was
/// called. This is strictly *more* ordered than the contract requires
/// (fully serial rather than "concurrent when non-conflicting"), which is
/// a valid — if non-concurrent — instance of the abstraction, and is
/// enough to drive the single-process multi-shard deployments this crate
/// is tested against.
pub struct LocalSequencer {
    sinks: Mutex<Vec<std::sync::Arc<dyn ConsensusSink>>>,
}

impl Default for LocalSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSequencer {
    pub fn new() -> Self {
        LocalSequencer {
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a replica's sink. Order of registration is the delivery
    /// order every proposal is replayed in.
    pub fn register(&self, sink: std::sync::Arc<dyn ConsensusSink>) {
        self.sinks.lock().unwrap().push(sink);
    }
}

impl Consensus for LocalSequencer {
    fn propose(&self, payload: Vec<u8>) -> Result<()> {
        let sinks = self.sinks.lock().unwrap().clone();
        for sink in sinks {
            sink.execute(payload.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use test_log::test;

    struct RecordingSink {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl ConsensusSink for RecordingSink {
        fn determine_conflict(&self, a: &[u8], b: &[u8]) -> bool {
            a == b
        }
        fn execute(&self, payload: Vec<u8>) {
            self.seen.lock().unwrap().push(payload);
        }
    }

    #[test]
    fn delivers_to_every_registered_sink_in_order() {
        let seq = LocalSequencer::new();
        let a = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        let b = Arc::new(RecordingSink {
            seen: Mutex::new(Vec::new()),
        });
        seq.register(a.clone());
        seq.register(b.clone());

        seq.propose(vec![1]).unwrap();
        seq.propose(vec![2]).unwrap();

        assert_eq!(*a.seen.lock().unwrap(), vec![vec![1], vec![2]]);
        assert_eq!(*b.seen.lock().unwrap(), vec![vec![1], vec![2]]);
    }
}

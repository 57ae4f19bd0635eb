use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redb::{Database, TableDefinition};

use kvstore_base::Result;

use crate::{Maintainable, StorageAdapter};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

/// Deletions are chunked at this many keys per transaction. `redb` has no
/// "transaction too large" error the way badger does, so instead of
/// reacting to one we chunk preemptively — same effect, no surprise
/// multi-gigabyte write transactions.
const DELETE_CHUNK: usize = 10_000;

/// Maintenance tick: run compaction every 5 minutes while there is work
/// to do.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// Storage adapter backed by `redb`, an embedded, mmap'd, copy-on-write
/// B-tree. `redb::Database` allows concurrent readers and a single writer
/// across `&self`, but `compact()` needs `&mut self`, so it lives behind a
/// `Mutex`; foreground calls briefly contend with a running compaction,
/// which is an acceptable, bounded write pause.
pub struct RedbAdapter {
    db: Mutex<Database>,
}

impl RedbAdapter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        {
            let txn = db.begin_write()?;
            {
                let _ = txn.open_table(TABLE)?;
            }
            txn.commit()?;
        }
        Ok(RedbAdapter { db: Mutex::new(db) })
    }
}

impl StorageAdapter for RedbAdapter {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().unwrap();
        let txn = db.begin_read()?;
        let table = txn.open_table(TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.db.lock().unwrap();
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn write_batch(&self, items: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let db = self.db.lock().unwrap();
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            for (key, value) in items {
                table.insert(key.as_slice(), value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn scan_and_delete(&self, predicate: &dyn Fn(&[u8]) -> bool) -> Result<()> {
        let db = self.db.lock().unwrap();

        let matching: Vec<Vec<u8>> = {
            let txn = db.begin_read()?;
            let table = txn.open_table(TABLE)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, _value) = entry?;
                if predicate(key.value()) {
                    keys.push(key.value().to_vec());
                }
            }
            keys
        };

        for chunk in matching.chunks(DELETE_CHUNK) {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TABLE)?;
                for key in chunk {
                    table.remove(key.as_slice())?;
                }
            }
            txn.commit()?;
        }
        Ok(())
    }
}

impl Maintainable for RedbAdapter {
    fn spawn_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                ticker.tick().await;
                let this = Arc::clone(&self);
                let result =
                    tokio::task::spawn_blocking(move || this.compact_while_productive()).await;
                if let Err(join_err) = result {
                    tracing::error!(target: "kvstore", "maintenance task panicked: {join_err}");
                }
            }
        })
    }
}

impl RedbAdapter {
    fn compact_while_productive(&self) {
        loop {
            let made_progress = {
                let mut db = self.db.lock().unwrap();
                match db.compact() {
                    Ok(progress) => progress,
                    Err(e) => {
                        tracing::error!(target: "kvstore", "compaction failed: {e}");
                        false
                    }
                }
            };
            if !made_progress {
                break;
            }
        }
    }
}

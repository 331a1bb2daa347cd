//! Persistence of verified record files and published ledgers

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use fjall::{Database, Keyspace, PersistMode};
use mirror_common::{Ledger, RecordFile};
use tracing::info;

const RECORD_FILES_KEYSPACE: &str = "record-files";
const LEDGERS_KEYSPACE: &str = "ledgers";

pub trait RecordFileRepository: Send + Sync {
    /// Oldest stored record file
    fn find_first(&self) -> Result<Option<RecordFile>>;

    /// Newest stored record file
    fn find_latest(&self) -> Result<Option<RecordFile>>;

    fn save(&self, record_file: &RecordFile) -> Result<()>;

    /// Most recently saved ledger
    fn find_latest_ledger(&self) -> Result<Option<Ledger>>;

    fn save_ledger(&self, ledger: &Ledger) -> Result<()>;
}

pub struct FjallRecordFileRepository {
    database: Database,
    record_files: Keyspace,
    ledgers: Keyspace,
}

impl FjallRecordFileRepository {
    pub fn new(path: &Path, clear: bool) -> Result<Self> {
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }
        let database = Database::builder(path).open()?;
        let record_files =
            database.keyspace(RECORD_FILES_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let ledgers = database.keyspace(LEDGERS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        info!("Opened record file store at {}", path.display());
        Ok(Self {
            database,
            record_files,
            ledgers,
        })
    }
}

impl RecordFileRepository for FjallRecordFileRepository {
    fn find_first(&self) -> Result<Option<RecordFile>> {
        let Some(res) = self.record_files.iter().next() else {
            return Ok(None);
        };
        let value = res.value()?;
        Ok(Some(serde_json::from_slice(&value)?))
    }

    fn find_latest(&self) -> Result<Option<RecordFile>> {
        let Some(res) = self.record_files.last_key_value() else {
            return Ok(None);
        };
        let value = res.value()?;
        Ok(Some(serde_json::from_slice(&value)?))
    }

    fn save(&self, record_file: &RecordFile) -> Result<()> {
        let encoded = serde_json::to_vec(record_file)?;
        self.record_files.insert(record_file.index.to_be_bytes(), encoded)?;
        self.database.persist(PersistMode::Buffer)?;
        Ok(())
    }

    fn find_latest_ledger(&self) -> Result<Option<Ledger>> {
        let Some(res) = self.ledgers.last_key_value() else {
            return Ok(None);
        };
        let value = res.value()?;
        Ok(Some(serde_json::from_slice(&value)?))
    }

    fn save_ledger(&self, ledger: &Ledger) -> Result<()> {
        // Keyed by save order, publications may lack a consensus timestamp
        let sequence = self
            .ledgers
            .last_key_value()
            .and_then(|res| {
                res.key().ok().and_then(|key| key.as_ref().try_into().ok().map(u64::from_be_bytes))
            })
            .map_or(0, |last| last + 1);
        let encoded = serde_json::to_vec(ledger)?;
        self.ledgers.insert(sequence.to_be_bytes(), encoded)?;
        self.database.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRecordFileRepository {
    record_files: Mutex<BTreeMap<u64, RecordFile>>,
    ledgers: Mutex<Vec<Ledger>>,
}

impl InMemoryRecordFileRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl RecordFileRepository for InMemoryRecordFileRepository {
    fn find_first(&self) -> Result<Option<RecordFile>> {
        let record_files = self.record_files.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(record_files.values().next().cloned())
    }

    fn find_latest(&self) -> Result<Option<RecordFile>> {
        let record_files = self.record_files.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(record_files.values().next_back().cloned())
    }

    fn save(&self, record_file: &RecordFile) -> Result<()> {
        let mut record_files = self.record_files.lock().map_err(|_| anyhow!("poisoned"))?;
        record_files.insert(record_file.index, record_file.clone());
        Ok(())
    }

    fn find_latest_ledger(&self) -> Result<Option<Ledger>> {
        let ledgers = self.ledgers.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(ledgers.last().cloned())
    }

    fn save_ledger(&self, ledger: &Ledger) -> Result<()> {
        let mut ledgers = self.ledgers.lock().map_err(|_| anyhow!("poisoned"))?;
        ledgers.push(ledger.clone());
        Ok(())
    }
}

use redb::{Database, ReadableTable, TableDefinition};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
}

// ============================================================================
// PERSISTED RECORDS
// ============================================================================

/// Persisted per-target browsing-context snapshot tied to one identity.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct SessionRecord {
    pub identity_id: u64,
    /// Cookie name/value pairs captured from the last fetch.
    pub cookies: Vec<(String, String)>,
    /// Opaque storage snapshot (e.g. localStorage export) keyed by name.
    pub storage: Vec<(String, String)>,
    /// True once a fetch on this session classified as success; a later
    /// transport failure on a known-good session reads as a block signal.
    pub had_success: bool,
    pub created_at_secs: u64,
    pub last_used_at_secs: u64,
}

/// One weighted scheduling window.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct WindowRecord {
    pub start_offset_secs: u64,
    pub duration_secs: u64,
    pub weight: f64,
}

/// Per-target scheduling state: window set, last fetch, and hit history.
#[derive(Debug, Clone, Default, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct ScheduleRecord {
    pub windows: Vec<WindowRecord>,
    pub last_fetch_secs: u64,
    /// Timestamps when new content was observed, oldest first, bounded.
    pub hits: Vec<u64>,
}

/// Recovery state machine snapshot for one target.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum RecoveryStateRecord {
    Healthy,
    Backoff { attempt: u32, until_secs: u64 },
    Suspended { reason: String },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct RecoveryRecord {
    pub state: RecoveryStateRecord,
    pub consecutive_failures: u32,
    pub consecutive_empty: u32,
}

impl Default for RecoveryRecord {
    fn default() -> Self {
        Self {
            state: RecoveryStateRecord::Healthy,
            consecutive_failures: 0,
            consecutive_empty: 0,
        }
    }
}

/// Immutable record of one block-classified fetch attempt.
#[derive(Debug, Clone, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct BlockEventRecord {
    pub at_secs: u64,
    /// "blocked" or "empty" - kept as text for the operator dump.
    pub classification: String,
    pub evidence: String,
}

/// Identity use counters, index-aligned with the pool catalog.
#[derive(Debug, Clone, Default, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct PoolStatsRecord {
    pub counters: Vec<(u64, u64)>,
}

// ============================================================================
// STORE
// ============================================================================

/// Unified controller persistence using redb so all components share one
/// durable store: sessions, identity stats, schedule windows, recovery
/// state, and the bounded block-event log.
pub struct ControllerStore {
    db: Arc<Database>,
}

impl ControllerStore {
    const SESSIONS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("sessions");
    const SCHEDULES: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("schedules");
    const RECOVERY: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("recovery");
    const BLOCK_EVENTS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("block_events");
    const POOL_STATS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("pool_stats");

    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_path)?;

        let db_path = data_path.join("controller_state.redb");
        let db = Database::create(&db_path)?;

        // Open each table once so the database creates them before use.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(Self::SESSIONS)?;
            let _ = write_txn.open_table(Self::SCHEDULES)?;
            let _ = write_txn.open_table(Self::RECOVERY)?;
            let _ = write_txn.open_table(Self::BLOCK_EVENTS)?;
            let _ = write_txn.open_table(Self::POOL_STATS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    // ========================================================================
    // GENERIC RECORD ACCESS
    // ========================================================================

    fn put<T>(
        &self,
        table: TableDefinition<'_, &str, &[u8]>,
        key: &str,
        record: &T,
    ) -> Result<(), StoreError>
    where
        T: rkyv::Serialize<rkyv::ser::serializers::AllocSerializer<2048>>,
    {
        let serialized = rkyv::to_bytes::<_, 2048>(record)
            .map_err(|e| StoreError::Serialization(format!("Serialize failed: {}", e)))?;

        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(table)?;
            t.insert(key, serialized.as_ref())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get<T>(
        &self,
        table: TableDefinition<'_, &str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError>
    where
        T: Archive,
        T::Archived: rkyv::Deserialize<T, rkyv::de::deserializers::SharedDeserializeMap>,
    {
        let read_txn = self.db.begin_read()?;
        let t = read_txn.open_table(table)?;

        if let Some(bytes) = t.get(key)? {
            let mut aligned = AlignedVec::new();
            aligned.extend_from_slice(bytes.value());
            let record: T = unsafe { rkyv::from_bytes_unchecked(&aligned) }
                .map_err(|e| StoreError::Serialization(format!("Deserialize failed: {}", e)))?;
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    fn delete(
        &self,
        table: TableDefinition<'_, &str, &[u8]>,
        key: &str,
    ) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(table)?;
            t.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ========================================================================
    // SESSIONS (last-write-wins, no merge)
    // ========================================================================

    pub fn save_session(&self, target: &str, session: &SessionRecord) -> Result<(), StoreError> {
        self.put(Self::SESSIONS, target, session)
    }

    pub fn load_session(&self, target: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.get(Self::SESSIONS, target)
    }

    pub fn delete_session(&self, target: &str) -> Result<(), StoreError> {
        self.delete(Self::SESSIONS, target)
    }

    // ========================================================================
    // SCHEDULES
    // ========================================================================

    pub fn save_schedule(&self, target: &str, record: &ScheduleRecord) -> Result<(), StoreError> {
        self.put(Self::SCHEDULES, target, record)
    }

    pub fn load_schedule(&self, target: &str) -> Result<Option<ScheduleRecord>, StoreError> {
        self.get(Self::SCHEDULES, target)
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    pub fn save_recovery(&self, target: &str, record: &RecoveryRecord) -> Result<(), StoreError> {
        self.put(Self::RECOVERY, target, record)
    }

    pub fn load_recovery(&self, target: &str) -> Result<Option<RecoveryRecord>, StoreError> {
        self.get(Self::RECOVERY, target)
    }

    // ========================================================================
    // BLOCK EVENT LOG (bounded, oldest dropped first)
    // ========================================================================

    pub fn append_block_event(
        &self,
        target: &str,
        event: BlockEventRecord,
        cap: usize,
    ) -> Result<(), StoreError> {
        let mut log: Vec<BlockEventRecord> =
            self.get(Self::BLOCK_EVENTS, target)?.unwrap_or_default();
        log.push(event);
        if log.len() > cap {
            let overflow = log.len() - cap;
            log.drain(0..overflow);
        }
        self.put(Self::BLOCK_EVENTS, target, &log)
    }

    pub fn load_block_events(&self, target: &str) -> Result<Vec<BlockEventRecord>, StoreError> {
        Ok(self.get(Self::BLOCK_EVENTS, target)?.unwrap_or_default())
    }

    // ========================================================================
    // IDENTITY POOL STATS
    // ========================================================================

    pub fn save_pool_stats(&self, record: &PoolStatsRecord) -> Result<(), StoreError> {
        self.put(Self::POOL_STATS, "pool", record)
    }

    pub fn load_pool_stats(&self) -> Result<Option<PoolStatsRecord>, StoreError> {
        self.get(Self::POOL_STATS, "pool")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ControllerStore) {
        let dir = TempDir::new().unwrap();
        let store = ControllerStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn session(identity_id: u64) -> SessionRecord {
        SessionRecord {
            identity_id,
            cookies: vec![("JSESSIONID".to_string(), "abc123".to_string())],
            storage: Vec::new(),
            had_success: true,
            created_at_secs: 1_000,
            last_used_at_secs: 1_000,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let (_dir, store) = store();

        assert!(store.load_session("board-a").unwrap().is_none());
        store.save_session("board-a", &session(2)).unwrap();

        let loaded = store.load_session("board-a").unwrap().unwrap();
        assert_eq!(loaded.identity_id, 2);
        assert_eq!(loaded.cookies[0].0, "JSESSIONID");
        assert!(loaded.had_success);
    }

    #[test]
    fn test_session_last_write_wins() {
        let (_dir, store) = store();

        store.save_session("board-a", &session(1)).unwrap();
        store.save_session("board-a", &session(7)).unwrap();

        let loaded = store.load_session("board-a").unwrap().unwrap();
        assert_eq!(loaded.identity_id, 7);
    }

    #[test]
    fn test_session_delete() {
        let (_dir, store) = store();

        store.save_session("board-a", &session(1)).unwrap();
        store.delete_session("board-a").unwrap();
        assert!(store.load_session("board-a").unwrap().is_none());
    }

    #[test]
    fn test_recovery_round_trip() {
        let (_dir, store) = store();

        let record = RecoveryRecord {
            state: RecoveryStateRecord::Backoff {
                attempt: 3,
                until_secs: 9_999,
            },
            consecutive_failures: 3,
            consecutive_empty: 0,
        };
        store.save_recovery("board-a", &record).unwrap();

        let loaded = store.load_recovery("board-a").unwrap().unwrap();
        assert_eq!(loaded.consecutive_failures, 3);
        assert_eq!(
            loaded.state,
            RecoveryStateRecord::Backoff {
                attempt: 3,
                until_secs: 9_999
            }
        );
    }

    #[test]
    fn test_block_event_log_is_bounded() {
        let (_dir, store) = store();

        for i in 0..10 {
            store
                .append_block_event(
                    "board-a",
                    BlockEventRecord {
                        at_secs: i,
                        classification: "blocked".to_string(),
                        evidence: format!("status 403 #{}", i),
                    },
                    4,
                )
                .unwrap();
        }

        let log = store.load_block_events("board-a").unwrap();
        assert_eq!(log.len(), 4);
        // Oldest entries dropped first.
        assert_eq!(log[0].at_secs, 6);
        assert_eq!(log[3].at_secs, 9);
    }

    #[test]
    fn test_pool_stats_round_trip() {
        let (_dir, store) = store();

        store
            .save_pool_stats(&PoolStatsRecord {
                counters: vec![(10, 2), (5, 0)],
            })
            .unwrap();

        let loaded = store.load_pool_stats().unwrap().unwrap();
        assert_eq!(loaded.counters, vec![(10, 2), (5, 0)]);
    }

    #[test]
    fn test_schedule_round_trip() {
        let (_dir, store) = store();

        let record = ScheduleRecord {
            windows: vec![WindowRecord {
                start_offset_secs: 3_600,
                duration_secs: 7_200,
                weight: 1.0,
            }],
            last_fetch_secs: 42,
            hits: vec![40],
        };
        store.save_schedule("board-a", &record).unwrap();

        let loaded = store.load_schedule("board-a").unwrap().unwrap();
        assert_eq!(loaded.windows.len(), 1);
        assert_eq!(loaded.last_fetch_secs, 42);
    }
}

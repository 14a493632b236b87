//! Persisted observer state.
//!
//! Everything that should survive a restart lives in one versioned JSON
//! record under a single key. Loading never fails: a missing record, a
//! malformed payload or a version mismatch yields `PersistedState::default()`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ControlPreferences;
use crate::history::DayBucket;
use crate::model::{AgentSummary, DecisionHistoryRecord, GameEvent, Proposal, SystemState, VoteAnalysis};

/// Bumped whenever the record layout changes incompatibly.
pub const STATE_VERSION: u32 = 1;

/// Key of the single record.
pub const STATE_KEY: &str = "observer_state";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub version: u32,
    pub system_state: SystemState,
    pub agents: Vec<AgentSummary>,
    pub proposals: Vec<Proposal>,
    pub events: Vec<GameEvent>,
    pub vote_analyses: Vec<VoteAnalysis>,
    pub day_buckets: BTreeMap<u32, DayBucket>,
    pub agent_history: BTreeMap<String, Vec<DecisionHistoryRecord>>,
    pub preferences: ControlPreferences,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            system_state: SystemState::default(),
            agents: Vec::new(),
            proposals: Vec::new(),
            events: Vec::new(),
            vote_analyses: Vec::new(),
            day_buckets: BTreeMap::new(),
            agent_history: BTreeMap::new(),
            preferences: ControlPreferences::default(),
        }
    }
}

impl PersistedState {
    /// Decodes a stored record, falling back to the default state.
    pub fn decode(bytes: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("persisted state is malformed ({}); starting fresh", e);
                return Self::default();
            }
        };
        let version = value.get("version").and_then(Value::as_u64);
        if version != Some(u64::from(STATE_VERSION)) {
            warn!(
                "persisted state version {:?} != {}; starting fresh",
                version, STATE_VERSION
            );
            return Self::default();
        }
        match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                warn!("persisted state does not decode ({}); starting fresh", e);
                Self::default()
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

// ============================================================================
// STATE STORE
// ============================================================================

/// Storage for the single persisted record.
pub trait StateStore: Send + Sync {
    /// Raw record bytes, `None` when nothing was saved yet.
    fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError>;

    fn save_raw(&self, bytes: &[u8]) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Loads the record, degrading every failure to the default state.
    fn load(&self) -> PersistedState {
        match self.load_raw() {
            Ok(Some(bytes)) => PersistedState::decode(&bytes),
            Ok(None) => {
                debug!("no persisted state");
                PersistedState::default()
            }
            Err(e) => {
                warn!("failed to read persisted state: {}", e);
                PersistedState::default()
            }
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        self.save_raw(&state.encode()?)
    }
}

/// Sled-backed store.
pub struct SledStateStore {
    db: sled::Db,
}

impl SledStateStore {
    /// Opens (or creates) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store (for testing)
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl StateStore for SledStateStore {
    fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(STATE_KEY)
            .map(|value| value.map(|ivec| ivec.to_vec()))
            .map_err(|e| StoreError::Storage(format!("Read failed: {}", e)))
    }

    fn save_raw(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(STATE_KEY, bytes)
            .map_err(|e| StoreError::Storage(format!("Insert failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.db
            .remove(STATE_KEY)
            .map_err(|e| StoreError::Storage(format!("Remove failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// In-memory store for the simulator and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    record: Mutex<Option<Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the raw record, bypassing encoding.
    pub fn put_raw(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.save_raw(bytes)
    }
}

impl StateStore for MemoryStateStore {
    fn load_raw(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let record = self
            .record
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(record.clone())
    }

    fn save_raw(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        *record = Some(bytes.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        *record = None;
        Ok(())
    }
}

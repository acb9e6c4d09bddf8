//! Persistent controller state
//!
//! A single JSON document in a key-value store records which schedule
//! handles are installed on the device and when prices/forecasts were last
//! fetched. The dispatcher's commit step is the only writer during normal
//! operation; the watchdog clears it after sweeping; the control loop reads
//! it at startup for crash recovery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, SpotheatError};

/// Key the state document lives under.
pub const STATE_KEY: &str = "spotheat.state";

/// Current state document schema.
pub const SCHEMA_VERSION: u32 = 1;

/// Durable controller state.
///
/// `installed_handles` always reflects the last *acknowledged* set of
/// device-side entries, never a desired-but-unconfirmed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub installed_handles: Vec<u32>,
    pub last_price_ts: Option<i64>,
    pub last_forecast_ts: Option<i64>,
    pub schema_version: u32,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            installed_handles: Vec::new(),
            last_price_ts: None,
            last_forecast_ts: None,
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl PersistedState {
    /// State with nothing installed and no fetch history.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_installed(&self) -> bool {
        !self.installed_handles.is_empty()
    }
}

/// String-keyed store with JSON-serializable values.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Load the persisted state, treating an absent document as a fresh start.
///
/// A document written by a newer schema is refused rather than guessed at.
pub async fn load_state(store: &dyn KvStore) -> Result<PersistedState> {
    let value = match store.get(STATE_KEY).await? {
        Some(value) => value,
        None => return Ok(PersistedState::empty()),
    };
    let state: PersistedState = serde_json::from_value(value)
        .map_err(|e| SpotheatError::Store(format!("state document unreadable: {e}")))?;
    if state.schema_version > SCHEMA_VERSION {
        return Err(SpotheatError::Store(format!(
            "state schema {} is newer than supported {}",
            state.schema_version, SCHEMA_VERSION
        )));
    }
    Ok(state)
}

/// Persist the state document.
pub async fn save_state(store: &dyn KvStore, state: &PersistedState) -> Result<()> {
    let value = serde_json::to_value(state)?;
    store.set(STATE_KEY, value).await
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryKvs {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryKvs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvs {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.map.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_state_is_fresh() {
        let store = MemoryKvs::new();
        let state = load_state(&store).await.unwrap();
        assert_eq!(state, PersistedState::empty());
        assert!(!state.has_installed());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let store = MemoryKvs::new();
        let state = PersistedState {
            installed_handles: vec![7, 8, 9],
            last_price_ts: Some(1_735_689_600),
            last_forecast_ts: None,
            schema_version: SCHEMA_VERSION,
        };
        save_state(&store, &state).await.unwrap();
        let loaded = load_state(&store).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let store = MemoryKvs::new();
        let mut state = PersistedState::empty();
        state.schema_version = SCHEMA_VERSION + 1;
        save_state(&store, &state).await.unwrap();
        match load_state(&store).await {
            Err(SpotheatError::Store(msg)) => assert!(msg.contains("newer")),
            other => panic!("expected Store error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreadable_document_is_store_error() {
        let store = MemoryKvs::new();
        store
            .set(STATE_KEY, Value::String("not an object".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            load_state(&store).await,
            Err(SpotheatError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_fields_fall_back_to_defaults() {
        let store = MemoryKvs::new();
        store
            .set(STATE_KEY, serde_json::json!({"installed_handles": [4]}))
            .await
            .unwrap();
        let state = load_state(&store).await.unwrap();
        assert_eq!(state.installed_handles, vec![4]);
        assert_eq!(state.last_price_ts, None);
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let store = MemoryKvs::new();
        store.set("k", Value::Bool(true)).await.unwrap();
        assert_eq!(store.len(), 1);
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}

//! In-process sink with primary-key conflict semantics matching the Postgres sink.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use odi_core::{Batch, ConflictPolicy, LoadTarget, Record, WriteOptions};

use crate::{Sink, SinkError, SinkSession};

#[derive(Debug, Default)]
struct MemoryTable {
    rows: Vec<Record>,
    by_key: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    appends: usize,
    fail_on_append: Option<usize>,
    open_sessions: usize,
    sessions_opened: usize,
}

/// Cloneable handle; all clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rows of `target` in first-insert order.
    pub fn rows(&self, target: &LoadTarget) -> Vec<Record> {
        self.lock()
            .tables
            .get(&target.qualified_name())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, target: &LoadTarget) -> usize {
        self.lock()
            .tables
            .get(&target.qualified_name())
            .map_or(0, |t| t.rows.len())
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Makes the `nth` append (1-based, across all sessions) fail without writing anything.
    #[cfg(test)]
    pub(crate) fn fail_on_append(&self, nth: usize) {
        self.lock().fail_on_append = Some(nth);
    }
}

#[async_trait]
impl Sink for MemorySink {
    type Session = MemorySession;

    async fn open(&self) -> Result<Self::Session, SinkError> {
        let mut state = self.lock();
        state.open_sessions += 1;
        state.sessions_opened += 1;
        Ok(MemorySession {
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

#[async_trait]
impl SinkSession for MemorySession {
    async fn append(
        &mut self,
        target: &LoadTarget,
        batch: &Batch,
        options: &WriteOptions,
    ) -> Result<u64, SinkError> {
        let mut state = self.lock();
        state.appends += 1;
        if state.fail_on_append == Some(state.appends) {
            return Err(SinkError::Rejected(format!(
                "injected failure on append {}",
                state.appends
            )));
        }

        let keys = (0..batch.num_rows())
            .map(|row| {
                if target.primary_key.is_empty() {
                    return Ok(None);
                }
                batch.key_of(row, &target.primary_key).map(Some).ok_or_else(|| {
                    SinkError::Rejected(format!(
                        "batch for {} lacks primary key columns {:?}",
                        target.qualified_name(),
                        target.primary_key
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Matches the Postgres fallback to DO NOTHING when only key columns arrive.
        let has_updatable = batch
            .column_names()
            .any(|column| !target.primary_key.iter().any(|key| key == column));
        let table = state.tables.entry(target.qualified_name()).or_default();
        let mut affected = 0u64;
        for (row, key) in keys.into_iter().enumerate() {
            let Some(record) = batch.row(row) else {
                continue;
            };
            let Some(key) = key else {
                table.rows.push(record);
                affected += 1;
                continue;
            };
            match (table.by_key.get(&key).copied(), options.conflict_policy) {
                (None, _) => {
                    table.by_key.insert(key, table.rows.len());
                    table.rows.push(record);
                    affected += 1;
                }
                (Some(_), ConflictPolicy::Skip) => {}
                (Some(_), ConflictPolicy::Update) if !has_updatable => {}
                (Some(idx), ConflictPolicy::Update) => {
                    let existing = &mut table.rows[idx];
                    for (column, value) in record {
                        if !target.primary_key.contains(&column) {
                            existing.insert(column, value);
                        }
                    }
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(values: Vec<serde_json::Value>) -> Batch {
        let records: Vec<Record> = values
            .into_iter()
            .map(|v| v.as_object().cloned().expect("object"))
            .collect();
        Batch::from_records(&records)
    }

    #[tokio::test]
    async fn update_with_only_key_columns_affects_nothing() {
        let sink = MemorySink::new();
        let target = LoadTarget::new("open_data", "stations").with_primary_key(["id"]);
        let options = WriteOptions {
            conflict_policy: ConflictPolicy::Update,
            ..Default::default()
        };
        let mut session = sink.open().await.expect("session");

        let first = session
            .append(&target, &batch(vec![json!({"id": "1"})]), &options)
            .await
            .expect("insert");
        let again = session
            .append(&target, &batch(vec![json!({"id": "1"})]), &options)
            .await
            .expect("key-only update");
        let with_value = session
            .append(&target, &batch(vec![json!({"id": "1", "v": "x"})]), &options)
            .await
            .expect("update");

        assert_eq!((first, again, with_value), (1, 0, 1));
        assert_eq!(sink.rows(&target)[0]["v"], json!("x"));
    }
}

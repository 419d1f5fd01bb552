//! Persistence contract for engine state, with in-memory and JSON-file backends.
//!
//! Rows are JSON values addressed by `(table, key)`. A transaction is applied
//! to a scratch copy and published only if every operation succeeds.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_vector_store::read_versioned_json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

pub const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Patterns,
    Prototypes,
    Processing,
    MovementLog,
}

impl Table {
    pub const ALL: [Self; 4] = [
        Self::Patterns,
        Self::Prototypes,
        Self::Processing,
        Self::MovementLog,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patterns => "patterns",
            Self::Prototypes => "prototypes",
            Self::Processing => "processing",
            Self::MovementLog => "movement_log",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        value: Value,
    },
    Delete {
        table: Table,
        key: String,
    },
}

impl WriteOp {
    pub fn put(table: Table, key: impl Into<String>, value: Value) -> Self {
        Self::Put {
            table,
            key: key.into(),
            value,
        }
    }

    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        Self::Delete {
            table,
            key: key.into(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, table: Table, key: &str) -> Result<Option<Value>>;

    /// Every row of `table`, ordered by key.
    async fn scan(&self, table: Table) -> Result<Vec<(String, Value)>>;

    /// Applies all of `ops` or none of them.
    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()>;

    async fn write(&self, table: Table, key: &str, value: Value) -> Result<()> {
        self.transaction(vec![WriteOp::put(table, key, value)]).await
    }

    /// Deletes one row. Deleting a prototype also deletes the patterns labelled with it.
    async fn delete(&self, table: Table, key: &str) -> Result<bool> {
        let existed = self.read(table, key).await?.is_some();
        if existed {
            self.transaction(vec![WriteOp::delete(table, key)]).await?;
        }
        Ok(existed)
    }
}

type Tables = BTreeMap<Table, BTreeMap<String, Value>>;

/// Applies `ops` to `tables` and returns the tables that changed.
fn apply_ops(tables: &mut Tables, ops: Vec<WriteOp>) -> Result<BTreeSet<Table>> {
    let mut touched = BTreeSet::new();
    for op in ops {
        match op {
            WriteOp::Put { table, key, value } => {
                if key.is_empty() {
                    return Err(EngineError::Store(format!("empty key in {table}")));
                }
                tables.entry(table).or_default().insert(key, value);
                touched.insert(table);
            }
            WriteOp::Delete { table, key } => {
                let removed = tables.get_mut(&table).and_then(|rows| rows.remove(&key));
                touched.insert(table);
                if table == Table::Prototypes {
                    let category = removed
                        .as_ref()
                        .and_then(|row| row.get("category_path"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if let Some(category) = category {
                        let cascaded = cascade_patterns(tables, &category);
                        if cascaded > 0 {
                            log::debug!("Deleted {cascaded} patterns labelled '{category}'");
                            touched.insert(Table::Patterns);
                        }
                    }
                }
            }
        }
    }
    Ok(touched)
}

fn cascade_patterns(tables: &mut Tables, category: &str) -> usize {
    let Some(patterns) = tables.get_mut(&Table::Patterns) else {
        return 0;
    };
    let before = patterns.len();
    patterns.retain(|_, row| row.get("label").and_then(Value::as_str) != Some(category));
    before - patterns.len()
}

/// Volatile store for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, table: Table, key: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, Value)>> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut guard = self.tables.write().await;
        let mut scratch = guard.clone();
        apply_ops(&mut scratch, ops)?;
        *guard = scratch;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedTable {
    rows: BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct TableEnvelope<'a> {
    schema_version: u32,
    rows: &'a BTreeMap<String, Value>,
}

/// One `<table>.json` file per table under a directory.
///
/// A commit writes every changed table to a temp file first and renames
/// them into place only once all writes succeeded.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut tables = Tables::new();
        for table in Table::ALL {
            let path = Self::table_path(&dir, table);
            if !path.exists() {
                continue;
            }
            let persisted: PersistedTable =
                read_versioned_json(&path, "store table", STORE_SCHEMA_VERSION).await?;
            log::debug!("Loaded {} rows from {}", persisted.rows.len(), path.display());
            tables.insert(table, persisted.rows);
        }
        Ok(Self {
            dir,
            tables: Mutex::new(tables),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(dir: &Path, table: Table) -> PathBuf {
        dir.join(format!("{}.json", table.as_str()))
    }

    async fn commit(&self, tables: &Tables, touched: &BTreeSet<Table>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let empty = BTreeMap::new();
        let mut staged = Vec::with_capacity(touched.len());
        for table in touched {
            let path = Self::table_path(&self.dir, *table);
            let tmp = path.with_extension("json.tmp");
            let bytes = serde_json::to_vec_pretty(&TableEnvelope {
                schema_version: STORE_SCHEMA_VERSION,
                rows: tables.get(table).unwrap_or(&empty),
            })?;
            if let Err(err) = tokio::fs::write(&tmp, bytes).await {
                for (staged_tmp, _) in &staged {
                    let _ = tokio::fs::remove_file(staged_tmp).await;
                }
                return Err(err.into());
            }
            staged.push((tmp, path));
        }
        for (tmp, path) in staged {
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn read(&self, table: Table, key: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .lock()
            .await
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, Value)>> {
        Ok(self
            .tables
            .lock()
            .await
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        let mut guard = self.tables.lock().await;
        let mut scratch = guard.clone();
        let touched = apply_ops(&mut scratch, ops)?;
        if touched.is_empty() {
            return Ok(());
        }
        self.commit(&scratch, &touched).await?;
        *guard = scratch;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn seed(store: &dyn Store) {
        store
            .transaction(vec![
                WriteOp::put(Table::Prototypes, "k1", json!({"category_path": "Work"})),
                WriteOp::put(Table::Prototypes, "k2", json!({"category_path": "Home"})),
                WriteOp::put(Table::Patterns, "c1", json!({"label": "Work"})),
                WriteOp::put(Table::Patterns, "c2", json!({"label": "Work"})),
                WriteOp::put(Table::Patterns, "c3", json!({"label": "Home"})),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleting_a_prototype_cascades_to_its_patterns() {
        let store = MemoryStore::new();
        seed(&store).await;
        assert!(store.delete(Table::Prototypes, "k1").await.unwrap());
        let remaining: Vec<String> = store
            .scan(Table::Patterns)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(remaining, vec!["c3".to_string()]);
        assert!(!store.delete(Table::Prototypes, "k1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_transaction_changes_nothing() {
        let store = MemoryStore::new();
        seed(&store).await;
        let err = store
            .transaction(vec![
                WriteOp::delete(Table::Patterns, "c3"),
                WriteOp::put(Table::Processing, "", json!({})),
            ])
            .await;
        assert!(matches!(err, Err(EngineError::Store(_))));
        assert!(store.read(Table::Patterns, "c3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            seed(&store).await;
            store
                .write(Table::MovementLog, "op-1", json!({"batch_id": "b"}))
                .await
                .unwrap();
            store.delete(Table::Prototypes, "k2").await.unwrap();
        }
        assert!(dir.path().join("prototypes.json").exists());
        assert!(dir.path().join("movement_log.json").exists());

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.scan(Table::Prototypes).await.unwrap().len(), 1);
        assert_eq!(reopened.scan(Table::Patterns).await.unwrap().len(), 2);
        assert_eq!(
            reopened.read(Table::MovementLog, "op-1").await.unwrap(),
            Some(json!({"batch_id": "b"}))
        );
    }
}

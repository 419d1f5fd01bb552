use crate::error::{Result, VectorStoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    #[serde(flatten)]
    body: T,
}

/// Writes `body` wrapped with a schema version via temp file + rename.
pub async fn write_versioned_json<T: Serialize>(
    path: &Path,
    schema_version: u32,
    body: &T,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(&Envelope {
        schema_version,
        body,
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn read_versioned_json<T: DeserializeOwned>(
    path: &Path,
    what: &'static str,
    expected: u32,
) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
    if envelope.schema_version != expected {
        return Err(VectorStoreError::SchemaVersion {
            what,
            found: envelope.schema_version,
            expected,
        });
    }
    Ok(envelope.body)
}

#[must_use]
pub fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

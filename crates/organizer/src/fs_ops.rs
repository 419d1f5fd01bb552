//! Single-file apply and revert primitives.

use crate::config::OrganizeMode;
use crate::error::{is_cross_device, FailureKind, OperationFailure};
use crate::movement_log::{MovementLogEntry, PriorFileState};
use crate::plan::SafeOrganizationOperation;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub(crate) struct OpSettings {
    pub no_delete: bool,
    /// Where replaced destinations are parked so undo can bring them back.
    pub displaced_dir: PathBuf,
}

pub(crate) type OpResult<T> = std::result::Result<T, OperationFailure>;

pub(crate) async fn apply_operation(
    op: &SafeOrganizationOperation,
    operation_id: Uuid,
    settings: &OpSettings,
) -> OpResult<PriorFileState> {
    let fail = |context: &str, err: &std::io::Error| {
        OperationFailure::from_io(&op.source, &op.destination, context, err)
    };

    let meta = tokio::fs::metadata(&op.source)
        .await
        .map_err(|err| fail("read source", &err))?;
    if meta.is_dir() {
        return Err(OperationFailure::new(
            &op.source,
            &op.destination,
            FailureKind::Other,
            "source is a directory",
        ));
    }
    let modified_at_unix_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

    let parent = op.destination.parent().unwrap_or_else(|| Path::new(""));
    let created_dirs = missing_dirs(parent).await;
    if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| fail("create destination folder", &err))?;
    }

    let mut displaced = None;
    if path_exists(&op.destination).await {
        if !op.replace {
            remove_empty_dirs(&created_dirs).await;
            return Err(OperationFailure::new(
                &op.source,
                &op.destination,
                FailureKind::AlreadyExists,
                "destination appeared after planning; refusing to overwrite",
            ));
        }
        let parked = settings.displaced_dir.join(operation_id.to_string());
        tokio::fs::create_dir_all(&settings.displaced_dir)
            .await
            .map_err(|err| fail("prepare displaced folder", &err))?;
        tokio::fs::rename(&op.destination, &parked)
            .await
            .map_err(|err| fail("park replaced destination", &err))?;
        displaced = Some(parked);
    }

    if let Err(failure) = transfer(op, settings.no_delete).await {
        if let Some(parked) = &displaced {
            if let Err(err) = tokio::fs::rename(parked, &op.destination).await {
                log::warn!(
                    "could not restore replaced {} from {}: {err}",
                    op.destination.display(),
                    parked.display()
                );
            }
        }
        remove_empty_dirs(&created_dirs).await;
        return Err(failure);
    }

    Ok(PriorFileState {
        path: op.source.clone(),
        size: meta.len(),
        modified_at_unix_ms,
        created_dirs,
        displaced,
    })
}

async fn transfer(op: &SafeOrganizationOperation, no_delete: bool) -> OpResult<()> {
    let fail = |context: &str, err: &std::io::Error| {
        OperationFailure::from_io(&op.source, &op.destination, context, err)
    };
    match op.mode {
        OrganizeMode::Move => match tokio::fs::rename(&op.source, &op.destination).await {
            Ok(()) => Ok(()),
            Err(err) if is_cross_device(&err) => {
                if no_delete {
                    return Err(OperationFailure::new(
                        &op.source,
                        &op.destination,
                        FailureKind::Other,
                        "cross-volume move needs copy and delete, which no_delete forbids",
                    ));
                }
                copy_then_delete(&op.source, &op.destination)
                    .await
                    .map_err(|err| fail("cross-volume move", &err))
            }
            Err(err) => Err(fail("move", &err)),
        },
        OrganizeMode::Copy => tokio::fs::copy(&op.source, &op.destination)
            .await
            .map(|_| ())
            .map_err(|err| fail("copy", &err)),
        OrganizeMode::Symlink => make_symlink(&op.source, &op.destination)
            .await
            .map_err(|err| fail("symlink", &err)),
    }
}

/// Puts the filesystem back the way `entry.prior` describes.
pub(crate) async fn revert_entry(entry: &MovementLogEntry) -> OpResult<()> {
    let op = &entry.operation;
    let original = &entry.prior.path;
    let fail = |context: &str, err: &std::io::Error| {
        OperationFailure::from_io(&op.destination, original, context, err)
    };

    match op.mode {
        OrganizeMode::Move => {
            if path_exists(original).await {
                return Err(OperationFailure::new(
                    &op.destination,
                    original,
                    FailureKind::AlreadyExists,
                    "original path is occupied; refusing to overwrite",
                ));
            }
            if let Some(parent) = original.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| fail("recreate original folder", &err))?;
            }
            match tokio::fs::rename(&op.destination, original).await {
                Ok(()) => {}
                Err(err) if is_cross_device(&err) => copy_then_delete(&op.destination, original)
                    .await
                    .map_err(|err| fail("cross-volume restore", &err))?,
                Err(err) => return Err(fail("restore", &err)),
            }
        }
        OrganizeMode::Copy => match tokio::fs::remove_file(&op.destination).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("copy {} already gone", op.destination.display());
            }
            Err(err) => return Err(fail("remove copy", &err)),
        },
        OrganizeMode::Symlink => match tokio::fs::symlink_metadata(&op.destination).await {
            Ok(meta) if meta.file_type().is_symlink() => tokio::fs::remove_file(&op.destination)
                .await
                .map_err(|err| fail("remove symlink", &err))?,
            Ok(_) => {
                return Err(OperationFailure::new(
                    &op.destination,
                    original,
                    FailureKind::Other,
                    "destination is no longer a symlink; leaving it in place",
                ))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(fail("inspect symlink", &err)),
        },
    }

    if let Some(parked) = &entry.prior.displaced {
        tokio::fs::rename(parked, &op.destination)
            .await
            .map_err(|err| fail("restore replaced file", &err))?;
    }
    remove_empty_dirs(&entry.prior.created_dirs).await;
    Ok(())
}

async fn copy_then_delete(from: &Path, to: &Path) -> std::io::Result<()> {
    tokio::fs::copy(from, to).await?;
    if let Err(err) = tokio::fs::remove_file(from).await {
        let _ = tokio::fs::remove_file(to).await;
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
async fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_file(target, link).await
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Ancestors of `dir` (inclusive) that do not exist yet, deepest first.
async fn missing_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(candidate) = current {
        if candidate.as_os_str().is_empty() || path_exists(candidate).await {
            break;
        }
        missing.push(candidate.to_path_buf());
        current = candidate.parent();
    }
    missing
}

/// Best effort; a folder that gained other files stays.
async fn remove_empty_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        if tokio::fs::remove_dir(dir).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sift_protocol::FileId;
    use tempfile::TempDir;

    fn op(source: PathBuf, destination: PathBuf, mode: OrganizeMode) -> SafeOrganizationOperation {
        SafeOrganizationOperation {
            file_id: FileId::new(source.to_string_lossy()),
            source,
            destination,
            mode,
            category: Some("A/B".to_string()),
            confidence: 0.9,
            collision: None,
            replace: false,
        }
    }

    fn settings(tmp: &TempDir) -> OpSettings {
        OpSettings {
            no_delete: false,
            displaced_dir: tmp.path().join(".sift").join("displaced"),
        }
    }

    #[tokio::test]
    async fn move_records_created_dirs_and_revert_cleans_them() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("in.txt");
        tokio::fs::write(&source, b"hello").await.unwrap();
        let destination = tmp.path().join("out/A/B/in.txt");
        let op = op(source.clone(), destination.clone(), OrganizeMode::Move);

        let id = Uuid::new_v4();
        let prior = apply_operation(&op, id, &settings(&tmp)).await.unwrap();
        assert_eq!(prior.size, 5);
        assert_eq!(prior.created_dirs.len(), 3);
        assert!(!source.exists());
        assert!(destination.exists());

        let entry = MovementLogEntry {
            operation_id: id,
            batch_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: op,
            prior,
        };
        revert_entry(&entry).await.unwrap();
        assert_eq!(tokio::fs::read(&source).await.unwrap(), b"hello");
        assert!(!tmp.path().join("out").exists());
    }

    #[tokio::test]
    async fn replace_parks_the_old_file_and_revert_restores_it() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("new.txt");
        let destination = tmp.path().join("keep.txt");
        tokio::fs::write(&source, b"new").await.unwrap();
        tokio::fs::write(&destination, b"old").await.unwrap();
        let mut op = op(source.clone(), destination.clone(), OrganizeMode::Copy);
        op.replace = true;

        let id = Uuid::new_v4();
        let prior = apply_operation(&op, id, &settings(&tmp)).await.unwrap();
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"new");
        assert!(prior.displaced.is_some());

        let entry = MovementLogEntry {
            operation_id: id,
            batch_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: op,
            prior,
        };
        revert_entry(&entry).await.unwrap();
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"old");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn existing_destination_is_never_overwritten_without_replace() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("a.txt");
        let destination = tmp.path().join("b.txt");
        tokio::fs::write(&source, b"a").await.unwrap();
        tokio::fs::write(&destination, b"b").await.unwrap();
        let op = op(source.clone(), destination.clone(), OrganizeMode::Move);
        let failure = apply_operation(&op, Uuid::new_v4(), &settings(&tmp))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::AlreadyExists);
        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"b");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn vanished_source_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let op = op(
            tmp.path().join("ghost.txt"),
            tmp.path().join("out/ghost.txt"),
            OrganizeMode::Move,
        );
        let failure = apply_operation(&op, Uuid::new_v4(), &settings(&tmp))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::NotFound);
        assert!(!tmp.path().join("out").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_mode_links_and_revert_unlinks() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("photo.jpg");
        tokio::fs::write(&source, b"jpg").await.unwrap();
        let destination = tmp.path().join("Photos/photo.jpg");
        let op = op(source.clone(), destination.clone(), OrganizeMode::Symlink);
        let id = Uuid::new_v4();
        let prior = apply_operation(&op, id, &settings(&tmp)).await.unwrap();
        let meta = tokio::fs::symlink_metadata(&destination).await.unwrap();
        assert!(meta.file_type().is_symlink());

        let entry = MovementLogEntry {
            operation_id: id,
            batch_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation: op,
            prior,
        };
        revert_entry(&entry).await.unwrap();
        assert!(!destination.exists());
        assert!(source.exists());
    }
}

use crate::error::{OrganizerError, Result};
use fs2::FileExt;
use sift_vector_store::paths::organize_lock_path_for_root;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);

static ORGANIZE_LOCK_WAIT_MS_LAST: AtomicU64 = AtomicU64::new(0);
static ORGANIZE_LOCK_WAIT_MS_MAX: AtomicU64 = AtomicU64::new(0);

pub fn organize_lock_wait_ms_last() -> u64 {
    ORGANIZE_LOCK_WAIT_MS_LAST.load(Ordering::Relaxed)
}

pub fn organize_lock_wait_ms_max() -> u64 {
    ORGANIZE_LOCK_WAIT_MS_MAX.load(Ordering::Relaxed)
}

fn update_lock_wait_ms(wait_ms: u64) {
    ORGANIZE_LOCK_WAIT_MS_LAST.store(wait_ms, Ordering::Relaxed);
    ORGANIZE_LOCK_WAIT_MS_MAX.fetch_max(wait_ms, Ordering::Relaxed);
}

/// Cross-process claim on an output root, released on drop.
#[derive(Debug)]
pub struct OrganizeLock {
    file: std::fs::File,
    path: PathBuf,
}

impl OrganizeLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OrganizeLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Takes the exclusive lock for `output_root`, retrying for at most `wait`.
///
/// Another holder past the deadline yields [`OrganizerError::Busy`].
pub async fn acquire_organize_lock(output_root: &Path, wait: Duration) -> Result<OrganizeLock> {
    let path = organize_lock_path_for_root(output_root);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let open_path = path.clone();
    let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&open_path)
            .map_err(|err| {
                OrganizerError::Other(format!("open organize lock {}: {err}", open_path.display()))
            })
    })
    .await
    .map_err(|err| OrganizerError::Other(format!("join organize lock task: {err}")))??;

    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => break,
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                if start.elapsed() >= wait {
                    return Err(OrganizerError::Busy(format!(
                        "{} is held by another process",
                        path.display()
                    )));
                }
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
            Err(err) => {
                return Err(OrganizerError::Other(format!(
                    "acquire organize lock {}: {err}",
                    path.display()
                )))
            }
        }
    }
    update_lock_wait_ms(u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
    log::debug!("organize lock acquired at {}", path.display());
    Ok(OrganizeLock { file, path })
}

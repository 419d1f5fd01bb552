use crate::error::{Result, ScannerError};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sift_protocol::ScannedFile;
use sift_vector_store::paths::is_state_dir_name;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Files above this size are not offered for classification.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub max_file_size: u64,
    pub include_hidden: bool,
    pub respect_gitignore: bool,
    pub max_depth: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE_BYTES,
            include_hidden: false,
            respect_gitignore: true,
            max_depth: None,
        }
    }
}

/// Counts of what a scan left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub files: usize,
    pub skipped_large: usize,
    pub skipped_noise: usize,
    pub errors: usize,
}

/// Walks a directory into [`ScannedFile`] records, sorted by path.
#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    options: ScanOptions,
    excluded: Vec<PathBuf>,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: canonical_or_raw(root.as_ref()),
            options: ScanOptions::default(),
            excluded: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Skips everything under `path`, typically the organizer's output root.
    #[must_use]
    pub fn exclude(mut self, path: impl AsRef<Path>) -> Self {
        self.excluded.push(canonical_or_raw(path.as_ref()));
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        self.scan_with_summary().map(|(files, _)| files)
    }

    /// Scan directory for candidate files (.gitignore aware)
    pub fn scan_with_summary(&self) -> Result<(Vec<ScannedFile>, ScanSummary)> {
        if !self.root.is_dir() {
            return Err(ScannerError::InvalidPath(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let mut files = Vec::new();
        let mut summary = ScanSummary::default();

        let root = self.root.clone();
        let excluded = self.excluded.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(!self.options.include_hidden)
            .git_ignore(self.options.respect_gitignore)
            .git_global(self.options.respect_gitignore)
            .git_exclude(self.options.respect_gitignore)
            .require_git(false)
            .max_depth(self.options.max_depth);
        builder.filter_entry(move |entry| {
            let path = entry.path();
            !Self::is_ignored_scope(path, &root) && !excluded.iter().any(|ex| path.starts_with(ex))
        });

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Failed to read entry: {e}");
                    summary.errors += 1;
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if Self::is_noise_file(path) {
                log::debug!("Skipping noise file {}", path.display());
                summary.skipped_noise += 1;
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("Failed to stat {}: {e}", path.display());
                    summary.errors += 1;
                    continue;
                }
            };
            if meta.len() > self.options.max_file_size {
                log::debug!(
                    "Skipping large file {} ({} bytes > {})",
                    path.display(),
                    meta.len(),
                    self.options.max_file_size
                );
                summary.skipped_large += 1;
                continue;
            }
            let modified_at_unix_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            files.push(ScannedFile::from_path(path).with_metadata(meta.len(), modified_at_unix_ms));
        }

        files.sort_by(|a, b| a.url.cmp(&b.url));
        summary.files = files.len();
        log::info!(
            "Found {} files under {} ({} large, {} noise skipped)",
            summary.files,
            self.root.display(),
            summary.skipped_large,
            summary.skipped_noise
        );
        Ok((files, summary))
    }

    /// Runs [`Self::scan`] on the blocking pool.
    pub async fn scan_async(&self) -> Result<Vec<ScannedFile>> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|err| ScannerError::Other(format!("join scan task: {err}")))?
    }

    fn is_ignored_scope(path: &Path, root: &Path) -> bool {
        if let Ok(relative) = path.strip_prefix(root) {
            for component in relative.components() {
                if let std::path::Component::Normal(name) = component {
                    let name = name.to_string_lossy();
                    if is_state_dir_name(&name) {
                        return true;
                    }
                    let lowered = name.to_lowercase();
                    if IGNORED_SCOPES.iter().any(|ignored| ignored == &lowered) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn is_noise_file(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        if NOISE_FILE_NAMES
            .iter()
            .any(|candidate| name.eq_ignore_ascii_case(candidate))
        {
            return true;
        }
        if name.starts_with("~$") || name.starts_with(".~lock.") {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                PARTIAL_EXTENSIONS
                    .iter()
                    .any(|candidate| ext.eq_ignore_ascii_case(candidate))
            })
    }
}

/// Splits a sorted scan into batches for downstream consumers.
#[must_use]
pub fn into_batches(files: Vec<ScannedFile>, batch_size: usize) -> Vec<Vec<ScannedFile>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(files.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for file in files {
        current.push(file);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

const IGNORED_SCOPES: &[&str] = &[
    // VCS / tooling
    ".git",
    ".hg",
    ".svn",
    // caches / dependency trees
    "node_modules",
    "__pycache__",
    ".venv",
    ".cache",
    // OS metadata folders
    ".trash",
    ".trashes",
    "$recycle.bin",
    ".spotlight-v100",
    ".fseventsd",
];

const NOISE_FILE_NAMES: &[&str] = &[".ds_store", "thumbs.db", "desktop.ini", "icon\r"];

/// Downloads and editors still writing these files.
const PARTIAL_EXTENSIONS: &[&str] = &["crdownload", "part", "partial", "download", "tmp", "swp"];

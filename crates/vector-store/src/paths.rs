use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".sift";

pub const PROTOTYPES_FILE_NAME: &str = "prototypes.json";
pub const PATTERNS_FILE_NAME: &str = "patterns.json";
pub const TAXONOMY_FILE_NAME: &str = "taxonomy.json";
pub const MOVEMENT_LOG_FILE_NAME: &str = "movement_log.jsonl";
pub const ORGANIZE_LOCK_FILE_NAME: &str = "organize.lock";
pub const CONFIG_FILE_NAME: &str = "sift.toml";

#[must_use]
pub fn state_dir_for_root(root: &Path) -> PathBuf {
    root.join(STATE_DIR_NAME)
}

#[must_use]
pub fn prototypes_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_root(root).join(PROTOTYPES_FILE_NAME)
}

#[must_use]
pub fn patterns_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_root(root).join(PATTERNS_FILE_NAME)
}

#[must_use]
pub fn taxonomy_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_root(root).join(TAXONOMY_FILE_NAME)
}

#[must_use]
pub fn movement_log_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_root(root).join(MOVEMENT_LOG_FILE_NAME)
}

#[must_use]
pub fn organize_lock_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_root(root).join(ORGANIZE_LOCK_FILE_NAME)
}

#[must_use]
pub fn config_path_for_root(root: &Path) -> PathBuf {
    state_dir_for_root(root).join(CONFIG_FILE_NAME)
}

/// Walks up from `path` to the nearest enclosing state directory.
#[must_use]
pub fn find_state_dir_from_path(path: &Path) -> Option<PathBuf> {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir
            .file_name()
            .and_then(|s| s.to_str())
            .is_some_and(is_state_dir_name)
        {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

#[must_use]
pub fn is_state_dir_name(name: &str) -> bool {
    name == STATE_DIR_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_enclosing_state_dir() {
        let path = Path::new("/data/photos/.sift/prototypes.json");
        assert_eq!(
            find_state_dir_from_path(path),
            Some(PathBuf::from("/data/photos/.sift"))
        );
        assert_eq!(find_state_dir_from_path(Path::new("/data/photos/a.jpg")), None);
    }
}

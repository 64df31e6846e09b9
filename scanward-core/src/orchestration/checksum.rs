//! Metadata-based content fingerprints for scan targets.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::planner::FileRelevance;

/// Hex SHA-256 over `relative_path:mtime:size` of every file under a target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentChecksum(String);

impl ContentChecksum {
    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Walks `target` and fingerprints file names, modification times and sizes.
///
/// Entries that cannot be read are skipped. A target that cannot be walked at
/// all hashes to a value derived from its path alone, which will not match a
/// checksum taken while the target was readable.
pub fn compute(target: &Path) -> ContentChecksum {
    compute_matching(target, |_| true)
}

/// Like [`compute`], but only files whose path relative to `target` passes
/// `include` contribute.
pub fn compute_matching(target: &Path, include: impl Fn(&Path) -> bool) -> ContentChecksum {
    let mut hasher = Sha256::new();
    let mut files = 0usize;

    if target.is_file() {
        if include(target) {
            hash_entry(&mut hasher, target, target);
            files += 1;
        }
    } else {
        let walker = WalkDir::new(target)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::trace!(error = %err, "skipping unreadable entry during checksum");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(target).unwrap_or(entry.path());
            if !include(relative) {
                continue;
            }
            hash_entry(&mut hasher, target, entry.path());
            files += 1;
        }
    }

    if files == 0 {
        hasher.update(b"empty:");
        hasher.update(target.to_string_lossy().as_bytes());
    }

    ContentChecksum(hex::encode(hasher.finalize()))
}

/// Runs the checksum on the blocking pool. With a `scope`, only the files it
/// matches are hashed.
pub async fn compute_async(target: PathBuf, scope: Option<FileRelevance>) -> ContentChecksum {
    let fallback = (target.clone(), scope.clone());
    match tokio::task::spawn_blocking(move || compute_scoped(&target, scope.as_ref())).await {
        Ok(checksum) => checksum,
        Err(err) => {
            tracing::warn!(error = %err, "checksum worker failed; hashing on caller");
            compute_scoped(&fallback.0, fallback.1.as_ref())
        }
    }
}

fn compute_scoped(target: &Path, scope: Option<&FileRelevance>) -> ContentChecksum {
    match scope {
        Some(relevance) if !relevance.any => {
            compute_matching(target, |path| relevance.matches(path))
        }
        _ => compute(target),
    }
}

fn hash_entry(hasher: &mut Sha256, root: &Path, path: &Path) {
    let Ok(metadata) = path.metadata() else {
        return;
    };
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let relative = path.strip_prefix(root).unwrap_or(path);
    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update(format!(":{mtime}:{}\n", metadata.len()).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn unchanged_tree_is_stable() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "print(1)").expect("write");
        fs::create_dir(dir.path().join("pkg")).expect("mkdir");
        fs::write(dir.path().join("pkg/b.py"), "x = 2").expect("write");

        assert_eq!(compute(dir.path()), compute(dir.path()));
    }

    #[test]
    fn size_change_alters_checksum() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("a.py");
        fs::write(&file, "print(1)").expect("write");
        let before = compute(dir.path());

        fs::write(&file, "print(1)\nprint(2)").expect("rewrite");
        assert_ne!(before, compute(dir.path()));
    }

    #[test]
    fn new_file_alters_checksum() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "1").expect("write");
        let before = compute(dir.path());

        fs::write(dir.path().join("b.py"), "2").expect("write");
        assert_ne!(before, compute(dir.path()));
    }

    #[test]
    fn scoped_checksum_ignores_unmatched_files() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("requirements.txt"), "flask==2.0").expect("write");
        fs::write(dir.path().join("app.py"), "print(1)").expect("write");
        let manifests = |path: &Path| path.file_name().is_some_and(|n| n == "requirements.txt");
        let before = compute_matching(dir.path(), manifests);

        fs::write(dir.path().join("app.py"), "print(1)\nprint(2)").expect("rewrite");
        assert_eq!(before, compute_matching(dir.path(), manifests));

        fs::write(dir.path().join("requirements.txt"), "flask==3.0.1").expect("rewrite");
        assert_ne!(before, compute_matching(dir.path(), manifests));
    }

    #[test]
    fn missing_target_hashes_without_panicking() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("nope");
        assert_eq!(compute(&missing), compute(&missing));
        assert_ne!(compute(&missing), compute(dir.path()));
    }
}

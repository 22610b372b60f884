//! Path-scoped file access inside one instance directory.
//!
//! Every operation resolves the requested path first; anything that would
//! leave the instance root is rejected with `InvalidPath` before the
//! filesystem is touched.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;

use crate::supervisor::error::{SupervisorError, SupervisorResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Forward-slash path relative to the instance root.
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<u64>,
}

/// Result of reading a path: a listing for directories, text for files.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PathContent {
    Directory { path: String, entries: Vec<FileEntry> },
    File { path: String, content: String },
}

/// Resolve `relative` under `root`, refusing absolute paths and `..` that
/// climbs above the root. The deepest part of the path that already exists
/// is canonicalised and must stay under the root, so a symlinked file or
/// parent directory cannot point outside even when the target is new.
pub fn resolve(root: &Path, relative: &str) -> SupervisorResult<PathBuf> {
    let invalid = || SupervisorError::InvalidPath(relative.to_string());

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(invalid());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| SupervisorError::io(format!("resolve {}", root.display()), e))?;
    let joined = root.join(&normalized);

    // symlink_metadata so a dangling link counts as present and gets checked.
    let existing = joined
        .ancestors()
        .take_while(|a| a.starts_with(root))
        .find(|a| std::fs::symlink_metadata(a).is_ok());
    if let Some(existing) = existing {
        let canonical = existing.canonicalize().map_err(|_| invalid())?;
        if !canonical.starts_with(&canonical_root) {
            return Err(invalid());
        }
    }
    Ok(joined)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Directory listing, directories first, then by name.
pub async fn list_dir(root: &Path, relative: &str) -> SupervisorResult<Vec<FileEntry>> {
    let dir = resolve(root, relative)?;
    let mut entries = fs::read_dir(&dir)
        .await
        .map_err(|e| SupervisorError::io(format!("list {}", dir.display()), e))?;

    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SupervisorError::io(format!("list {}", dir.display()), e))?
    {
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        out.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: relative_display(root, &entry.path()),
            is_directory: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified,
        });
    }

    out.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

pub async fn read_file(root: &Path, relative: &str) -> SupervisorResult<String> {
    let path = resolve(root, relative)?;
    fs::read_to_string(&path)
        .await
        .map_err(|e| SupervisorError::io(format!("read {}", path.display()), e))
}

pub async fn read_path(root: &Path, relative: &str) -> SupervisorResult<PathContent> {
    let path = resolve(root, relative)?;
    let meta = fs::metadata(&path)
        .await
        .map_err(|e| SupervisorError::io(format!("stat {}", path.display()), e))?;
    let display = relative_display(root, &path);
    if meta.is_dir() {
        Ok(PathContent::Directory {
            path: display,
            entries: list_dir(root, relative).await?,
        })
    } else {
        Ok(PathContent::File {
            path: display,
            content: read_file(root, relative).await?,
        })
    }
}

/// Write `content`, creating parent folders.
pub async fn write_file(root: &Path, relative: &str, content: &str) -> SupervisorResult<()> {
    let path = resolve(root, relative)?;
    if path == root {
        return Err(SupervisorError::InvalidPath(relative.to_string()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SupervisorError::io(format!("create {}", parent.display()), e))?;
    }
    fs::write(&path, content)
        .await
        .map_err(|e| SupervisorError::io(format!("write {}", path.display()), e))
}

/// Remove a file or directory tree. The instance root itself cannot be removed.
pub async fn remove(root: &Path, relative: &str) -> SupervisorResult<()> {
    let path = resolve(root, relative)?;
    if path == root {
        return Err(SupervisorError::InvalidPath(relative.to_string()));
    }
    let meta = fs::metadata(&path)
        .await
        .map_err(|e| SupervisorError::io(format!("stat {}", path.display()), e))?;
    let result = if meta.is_dir() {
        fs::remove_dir_all(&path).await
    } else {
        fs::remove_file(&path).await
    };
    result.map_err(|e| SupervisorError::io(format!("remove {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for bad in ["../../etc/passwd", "..", "mods/../../x", "/etc/passwd"] {
            let err = resolve(root, bad).unwrap_err();
            assert!(matches!(err, SupervisorError::InvalidPath(_)), "{}", bad);
        }
    }

    #[test]
    fn resolve_allows_inner_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        assert_eq!(resolve(root, "mods/../config/a.json").unwrap(), root.join("config/a.json"));
        assert_eq!(resolve(root, "./logs").unwrap(), root.join("logs"));
        assert_eq!(resolve(root, "").unwrap(), root.to_path_buf());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = resolve(dir.path(), "link").unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPath(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_through_symlinked_dir_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("ghost.txt"), root.join("dangling")).unwrap();

        for bad in ["link/pwned.txt", "link/deep/er/pwned.txt", "dangling"] {
            let err = write_file(root, bad, "x").await.unwrap_err();
            assert!(matches!(err, SupervisorError::InvalidPath(_)), "{}: {:?}", bad, err);
        }
        assert!(!outside.path().join("pwned.txt").exists());
        assert!(!outside.path().join("deep").exists());
        assert!(!outside.path().join("ghost.txt").exists());
        assert!(matches!(
            remove(root, "link/anything").await.unwrap_err(),
            SupervisorError::InvalidPath(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_inside_root_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("config")).unwrap();
        std::os::unix::fs::symlink(root.join("config"), root.join("cfg")).unwrap();
        write_file(root, "cfg/new/a.json", "{}").await.unwrap();
        assert!(root.join("config/new/a.json").is_file());
    }

    #[tokio::test]
    async fn rejected_write_touches_nothing() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("alpha");
        std::fs::create_dir_all(&root).unwrap();

        let err = write_file(&root, "../../pwned.txt", "x").await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidPath(_)));
        assert!(!parent.path().join("pwned.txt").exists());
        let err = remove(&root, "../alpha").await;
        assert!(err.is_err());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn write_read_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(root, "config/server.json", "{}").await.unwrap();
        write_file(root, "notes.txt", "hello").await.unwrap();

        assert_eq!(read_file(root, "notes.txt").await.unwrap(), "hello");

        let listing = list_dir(root, "").await.unwrap();
        assert_eq!(listing[0].name, "config");
        assert!(listing[0].is_directory);
        assert_eq!(listing[1].path, "notes.txt");
        assert_eq!(listing[1].size, 5);

        let nested = list_dir(root, "config").await.unwrap();
        assert_eq!(nested[0].path, "config/server.json");

        match read_path(root, "notes.txt").await.unwrap() {
            PathContent::File { content, .. } => assert_eq!(content, "hello"),
            other => panic!("expected file, got {:?}", other),
        }
        let listing = serde_json::to_value(read_path(root, "config").await.unwrap()).unwrap();
        assert_eq!(listing["type"], "directory");
        assert_eq!(listing["entries"][0]["name"], "server.json");

        remove(root, "config").await.unwrap();
        assert!(!root.join("config").exists());
        assert!(remove(root, "").await.is_err());
    }
}

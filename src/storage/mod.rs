//! User storage: persistent homes, ephemeral session mounts, and validated
//! file operations inside a user's home directories.

pub mod uploads;

use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::config::{EPHEMERAL_DIR_NAME, SHARED_FILES_DIR_NAME};
use crate::core::{Error, Result};
use crate::directory::is_valid_name;

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileListItem {
    /// File or directory name.
    pub name: String,
    /// Path relative to the home directory root.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: f64,
}

/// Filesystem-side manager for home directories and session mounts.
#[derive(Debug, Clone)]
pub struct StorageManager {
    storage_path: PathBuf,
}

impl StorageManager {
    /// Build a manager rooted at the storage base directory.
    #[must_use]
    pub fn new(storage_path: PathBuf) -> Self {
        Self { storage_path }
    }

    /// The ephemeral mount root.
    #[must_use]
    pub fn ephemeral_root(&self) -> PathBuf {
        self.storage_path.join(EPHEMERAL_DIR_NAME)
    }

    /// Whether a mount path lies under the ephemeral root.
    #[must_use]
    pub fn is_ephemeral(&self, path: &Path) -> bool {
        path.starts_with(self.ephemeral_root())
    }

    /// Ensure the storage layout exists (called once at startup).
    ///
    /// # Errors
    /// Returns an error when a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_path)?;
        set_mode(&self.storage_path, 0o755)?;
        let ephemeral = self.ephemeral_root();
        std::fs::create_dir_all(&ephemeral)?;
        set_mode(&ephemeral, 0o700)?;
        Ok(())
    }

    /// Home directory path for a user, without validation.
    #[must_use]
    pub fn home_path(&self, username: &str, home_name: &str) -> PathBuf {
        self.storage_path.join(username).join(home_name)
    }

    /// List a user's home directories, sorted.
    ///
    /// The shared-files sidecar is storage plumbing, not a home, and is
    /// excluded.
    #[must_use]
    pub fn home_dirs(&self, username: &str) -> Vec<String> {
        let user_root = self.storage_path.join(username);
        let Ok(entries) = std::fs::read_dir(&user_root) else {
            return Vec::new();
        };
        let mut homes: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name != SHARED_FILES_DIR_NAME)
            .collect();
        homes.sort();
        homes
    }

    /// Create a home directory with a pre-made `Desktop/files` subtree.
    ///
    /// # Errors
    /// `BadRequest` for invalid names, `Conflict` when it already exists.
    pub fn create_home(&self, username: &str, home_name: &str) -> Result<()> {
        if !is_valid_name(home_name) {
            return Err(Error::bad_request(
                "Invalid home directory name. Use only letters, numbers, underscore, or hyphen.",
            ));
        }
        let home = self.home_path(username, home_name);
        if home.exists() {
            return Err(Error::conflict(format!(
                "Home directory '{home_name}' already exists for user '{username}'."
            )));
        }
        std::fs::create_dir_all(&home)?;
        set_mode(&home, 0o755)?;
        let files = home.join("Desktop").join("files");
        std::fs::create_dir_all(&files)?;
        set_mode(&files, 0o755)?;
        tracing::info!(username, home = home_name, "created home directory");
        Ok(())
    }

    /// Delete a home directory recursively.
    ///
    /// # Errors
    /// `BadRequest` for invalid names, `NotFound` when missing.
    pub fn delete_home(&self, username: &str, home_name: &str) -> Result<()> {
        if !is_valid_name(home_name) {
            return Err(Error::bad_request("Invalid home directory name."));
        }
        let home = self.home_path(username, home_name);
        if !home.is_dir() {
            return Err(Error::not_found(format!(
                "Home directory '{home_name}' not found for user '{username}'."
            )));
        }
        std::fs::remove_dir_all(&home)?;
        tracing::info!(username, home = home_name, "deleted home directory");
        Ok(())
    }

    /// Ensure the shared-files sidecar exists for a user, returning its path.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub fn ensure_shared_files(&self, username: &str) -> Result<PathBuf> {
        let shared = self.storage_path.join(username).join(SHARED_FILES_DIR_NAME);
        std::fs::create_dir_all(&shared)?;
        set_mode(&shared, 0o755)?;
        Ok(shared)
    }

    /// Allocate a fresh ephemeral mount directory.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be created.
    pub fn create_ephemeral(&self) -> Result<PathBuf> {
        let path = self.ephemeral_root().join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&path)?;
        set_mode(&path, 0o700)?;
        Ok(path)
    }

    /// Remove a mount directory iff it lies under the ephemeral root.
    pub fn remove_ephemeral(&self, path: &Path) {
        if !self.is_ephemeral(path) {
            return;
        }
        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                tracing::error!(path = %path.display(), error = %e, "failed to remove ephemeral mount");
            } else {
                tracing::info!(path = %path.display(), "removed ephemeral storage directory");
            }
        }
    }

    /// First filename among `name`, `base-1.ext`, `base-2.ext`, ... that does
    /// not yet exist in `dir`.
    #[must_use]
    pub fn unique_filename(dir: &Path, name: &str) -> String {
        if !dir.join(name).exists() {
            return name.to_owned();
        }
        let (base, ext) = match name.rsplit_once('.') {
            Some((base, ext)) if !base.is_empty() => (base.to_owned(), format!(".{ext}")),
            _ => (name.to_owned(), String::new()),
        };
        let mut k = 1u32;
        loop {
            let candidate = format!("{base}-{k}{ext}");
            if !dir.join(&candidate).exists() {
                return candidate;
            }
            k += 1;
        }
    }

    /// Write bytes into `dir` under a deduplicated name, mode 0644.
    ///
    /// Returns the stored filename.
    ///
    /// # Errors
    /// Returns an error when the directory or file cannot be written.
    pub fn place_file(&self, dir: &Path, filename: &str, bytes: &[u8]) -> Result<String> {
        std::fs::create_dir_all(dir)?;
        set_mode(dir, 0o755)?;
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::bad_request("Invalid filename."))?;
        let stored = Self::unique_filename(dir, &safe_name);
        let dest = dir.join(&stored);
        std::fs::write(&dest, bytes)?;
        set_mode(&dest, 0o644)?;
        Ok(stored)
    }

    /// Move an already-reassembled file into `dir` under a deduplicated name,
    /// mode 0644. Falls back to copy-and-delete across filesystems.
    ///
    /// # Errors
    /// Returns an error when the move fails; the source is removed either way.
    pub fn move_file_into(&self, source: &Path, dir: &Path, filename: &str) -> Result<String> {
        std::fs::create_dir_all(dir)?;
        set_mode(dir, 0o755)?;
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::bad_request("Invalid filename."))?;
        let stored = Self::unique_filename(dir, &safe_name);
        let dest = dir.join(&stored);

        let result = match std::fs::rename(source, &dest) {
            Ok(()) => Ok(()),
            Err(_) => std::fs::copy(source, &dest).map(|_| ()),
        };
        if source.exists() {
            let _ = std::fs::remove_file(source);
        }
        result?;
        set_mode(&dest, 0o644)?;
        Ok(stored)
    }

    /// Resolve and validate a path inside one of the user's home directories.
    ///
    /// Rejects invalid home names, homes the user does not own, and any
    /// `..` traversal; the result is guaranteed to be the home root or a
    /// descendant of it.
    ///
    /// # Errors
    /// `BadRequest`/`Forbidden` for invalid input, `NotFound` when
    /// `must_exist` is set and the target is absent.
    pub fn validated_path(
        &self,
        username: &str,
        home_name: &str,
        sub_path: &str,
        must_exist: bool,
    ) -> Result<PathBuf> {
        if !is_valid_name(home_name) {
            return Err(Error::bad_request("Invalid home directory name."));
        }
        if !self.home_dirs(username).iter().any(|h| h == home_name) {
            return Err(Error::forbidden("Access to this home directory is denied."));
        }
        let base = self.home_path(username, home_name);

        let mut resolved = base.clone();
        for component in Path::new(sub_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::forbidden("Path traversal is not allowed."));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::forbidden("Absolute paths are not allowed."));
                }
            }
        }

        if !(resolved == base || resolved.starts_with(&base)) {
            return Err(Error::forbidden("Path escapes the home directory."));
        }
        if must_exist && !resolved.exists() {
            return Err(Error::not_found("Path not found."));
        }
        Ok(resolved)
    }

    /// List a directory inside a user's home.
    ///
    /// # Errors
    /// Path validation errors, or an IO error reading the directory.
    pub fn list_dir(
        &self,
        username: &str,
        home_name: &str,
        sub_path: &str,
    ) -> Result<Vec<FileListItem>> {
        let dir = self.validated_path(username, home_name, sub_path, true)?;
        if !dir.is_dir() {
            return Err(Error::bad_request("Path is not a directory."));
        }
        let base = self.home_path(username, home_name);
        let mut items = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let path = entry.path();
            let relative = path
                .strip_prefix(&base)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            items.push(FileListItem {
                name: entry.file_name().to_string_lossy().to_string(),
                path: relative,
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                mtime,
            });
        }
        items.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(items)
    }

    /// Create a folder inside a user's home.
    ///
    /// # Errors
    /// Path validation errors, `BadRequest` for bad folder names,
    /// `Conflict` when the folder exists.
    pub fn create_folder(
        &self,
        username: &str,
        home_name: &str,
        sub_path: &str,
        folder_name: &str,
    ) -> Result<()> {
        if folder_name.is_empty() || folder_name.contains('/') || folder_name.contains('\\') {
            return Err(Error::bad_request("Invalid folder name."));
        }
        let parent = self.validated_path(username, home_name, sub_path, true)?;
        let target = parent.join(folder_name);
        if target.exists() {
            return Err(Error::conflict(format!(
                "'{folder_name}' already exists."
            )));
        }
        std::fs::create_dir(&target)?;
        set_mode(&target, 0o755)?;
        Ok(())
    }

    /// Delete files or directories inside a user's home.
    ///
    /// # Errors
    /// Path validation errors; deleting the home root itself is refused.
    pub fn delete_items(
        &self,
        username: &str,
        home_name: &str,
        sub_paths: &[String],
    ) -> Result<()> {
        let base = self.home_path(username, home_name);
        for sub_path in sub_paths {
            let target = self.validated_path(username, home_name, sub_path, true)?;
            if target == base {
                return Err(Error::forbidden("Cannot delete the home directory root."));
            }
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        Ok(())
    }
}

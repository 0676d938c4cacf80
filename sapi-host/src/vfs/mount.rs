//! Mount handlers attach host resources inside an engine's filesystem

use super::{EntryType, MemFs};
use crate::error::FsError;
use crate::instance::InstanceId;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage behind a mounted subtree
///
/// Paths are the components below the mount point, already normalized.
pub trait MountBackend: Send + Sync + fmt::Debug {
    fn read(&self, path: &[String]) -> Result<Vec<u8>, FsError>;

    fn write(&self, path: &[String], data: &[u8], append: bool) -> Result<(), FsError>;

    fn mkdir(&self, path: &[String]) -> Result<(), FsError>;

    fn remove_file(&self, path: &[String]) -> Result<(), FsError>;

    fn remove_dir(&self, path: &[String], recursive: bool) -> Result<(), FsError>;

    fn list(&self, path: &[String]) -> Result<Vec<String>, FsError>;

    fn rename(&self, from: &[String], to: &[String]) -> Result<(), FsError>;

    fn entry_type(&self, path: &[String]) -> Option<EntryType>;
}

/// Releases a mount from the filesystem it was applied to
pub type Unmount = Box<dyn FnOnce(&mut MemFs) + Send>;

/// Attaches something at a path inside an instance's filesystem
///
/// Handlers registered on an instance are re-applied to the fresh
/// filesystem after every hot swap, so `mount` may run several times.
pub trait MountHandler: Send + Sync {
    fn mount(&self, instance: InstanceId, fs: &mut MemFs, path: &str) -> Result<Unmount, FsError>;
}

/// Mounts a host directory
#[derive(Debug, Clone)]
pub struct HostDirMount {
    root: PathBuf,
}

impl HostDirMount {
    /// Validate and canonicalize a host directory; `~` expands to home
    pub fn new(path: impl AsRef<str>) -> Result<Self, FsError> {
        let expanded = expand_home(path.as_ref());
        let root = expanded
            .canonicalize()
            .map_err(|source| host_error(&expanded, source))?;
        if !root.is_dir() {
            return Err(FsError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MountHandler for HostDirMount {
    fn mount(&self, instance: InstanceId, fs: &mut MemFs, path: &str) -> Result<Unmount, FsError> {
        fs.mount(path, Arc::new(HostDirBackend::new(self.root.clone())))?;
        tracing::info!(
            instance = %instance,
            path = %path,
            host = %self.root.display(),
            "Mounted host directory"
        );

        let path = path.to_string();
        Ok(Box::new(move |fs: &mut MemFs| {
            if let Err(e) = fs.unmount(&path) {
                tracing::debug!(path = %path, error = %e, "Mount already gone");
            }
        }))
    }
}

/// Delegates file operations to a host directory
#[derive(Debug)]
pub struct HostDirBackend {
    root: PathBuf,
}

impl HostDirBackend {
    /// `root` must already be canonical
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &[String]) -> Result<PathBuf, FsError> {
        let mut resolved = self.root.clone();
        for name in path {
            resolved.push(name);
        }

        // Symlinks may point outside the root; check the deepest existing
        // ancestor after resolving them. Dangling links count as existing.
        let mut existing = resolved.as_path();
        while fs::symlink_metadata(existing).is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        let canonical = existing.canonicalize().map_err(|_| {
            FsError::invalid_path(
                format!("/{}", path.join("/")),
                "does not resolve inside the mounted directory",
            )
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(FsError::invalid_path(
                format!("/{}", path.join("/")),
                "escapes the mounted directory",
            ));
        }
        Ok(resolved)
    }
}

impl MountBackend for HostDirBackend {
    fn read(&self, path: &[String]) -> Result<Vec<u8>, FsError> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(FsError::IsADirectory(target.display().to_string()));
        }
        fs::read(&target).map_err(|source| host_error(&target, source))
    }

    fn write(&self, path: &[String], data: &[u8], append: bool) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| host_error(parent, source))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&target)
            .map_err(|source| host_error(&target, source))?;
        file.write_all(data)
            .map_err(|source| host_error(&target, source))
    }

    fn mkdir(&self, path: &[String]) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        fs::create_dir_all(&target).map_err(|source| host_error(&target, source))
    }

    fn remove_file(&self, path: &[String]) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if target.is_dir() {
            return Err(FsError::IsADirectory(target.display().to_string()));
        }
        fs::remove_file(&target).map_err(|source| host_error(&target, source))
    }

    fn remove_dir(&self, path: &[String], recursive: bool) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if !target.is_dir() {
            return Err(FsError::NotADirectory(target.display().to_string()));
        }
        let result = if recursive {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_dir(&target)
        };
        result.map_err(|source| host_error(&target, source))
    }

    fn list(&self, path: &[String]) -> Result<Vec<String>, FsError> {
        let target = self.resolve(path)?;
        let entries = fs::read_dir(&target).map_err(|source| host_error(&target, source))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| host_error(&target, source))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn rename(&self, from: &[String], to: &[String]) -> Result<(), FsError> {
        let source_path = self.resolve(from)?;
        let target = self.resolve(to)?;
        fs::rename(&source_path, &target).map_err(|source| host_error(&source_path, source))
    }

    fn entry_type(&self, path: &[String]) -> Option<EntryType> {
        let target = self.resolve(path).ok()?;
        let meta = fs::metadata(target).ok()?;
        if meta.is_dir() {
            Some(EntryType::Directory)
        } else {
            Some(EntryType::File)
        }
    }
}

fn host_error(path: &Path, source: io::Error) -> FsError {
    if source.kind() == io::ErrorKind::NotFound {
        return FsError::NotFound(path.display().to_string());
    }
    FsError::Host {
        path: path.to_path_buf(),
        source,
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{copy_tree, ListFilesOptions};
    use tempfile::TempDir;

    fn mounted() -> (TempDir, MemFs, Unmount) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("host.txt"), "from host").unwrap();
        let mut fs = MemFs::new();
        let handler = HostDirMount::new(dir.path().to_str().unwrap()).unwrap();
        let unmount = handler.mount(InstanceId::next(), &mut fs, "/mnt/data").unwrap();
        (dir, fs, unmount)
    }

    #[test]
    fn test_reads_and_writes_go_to_host() {
        let (dir, mut fs, _unmount) = mounted();
        assert_eq!(fs.read_file_as_text("/mnt/data/host.txt").unwrap(), "from host");

        fs.write_file("/mnt/data/sub/new.txt", "from engine").unwrap();
        let on_host = std::fs::read_to_string(dir.path().join("sub/new.txt")).unwrap();
        assert_eq!(on_host, "from engine");

        assert!(fs.is_dir("/mnt/data"));
        assert!(fs.is_dir("/mnt/data/sub"));
        let names = fs.list_files("/mnt/data", ListFilesOptions::default()).unwrap();
        assert_eq!(names, vec!["host.txt", "sub"]);
    }

    #[test]
    fn test_unmount_restores_shadowed_directory() {
        let dir = TempDir::new().unwrap();
        let mut fs = MemFs::new();
        fs.write_file("/mnt/data/memory.txt", "mem").unwrap();

        let handler = HostDirMount::new(dir.path().to_str().unwrap()).unwrap();
        let unmount = handler.mount(InstanceId::next(), &mut fs, "/mnt/data").unwrap();
        assert!(!fs.file_exists("/mnt/data/memory.txt"));

        unmount(&mut fs);
        assert_eq!(fs.read_file_as_text("/mnt/data/memory.txt").unwrap(), "mem");
    }

    #[test]
    fn test_dotdot_cannot_leave_mount_root() {
        let (_dir, fs, _unmount) = mounted();
        // `..` folds before lookup, so this lands back in memory
        assert!(fs.read_file("/mnt/data/../../etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_cannot_escape_root() {
        let (dir, mut fs, _unmount) = mounted();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("planted.txt");
        std::os::unix::fs::symlink(&target, dir.path().join("link.txt")).unwrap();

        let err = fs.write_file("/mnt/data/link.txt", "escaped").unwrap_err();
        assert!(matches!(err, FsError::InvalidPath { .. }));
        assert!(!target.exists());
        assert!(fs.read_file("/mnt/data/link.txt").is_err());
    }

    #[test]
    fn test_copy_tree_skips_mounts() {
        let (_dir, fs, _unmount) = mounted();
        let mut target = MemFs::new();
        let copied = copy_tree(&fs, &mut target, "/mnt").unwrap();
        assert_eq!(copied, 0);
        assert!(target.is_dir("/mnt"));
        assert!(!target.file_exists("/mnt/data"));
    }

    #[test]
    fn test_missing_host_directory() {
        let err = HostDirMount::new("/definitely/not/here/sapi").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/x"), home.join("x"));
        }
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
    }
}

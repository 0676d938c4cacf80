//! In-memory virtual filesystem owned by an engine module
//!
//! Paths are `/`-separated strings. Relative paths resolve against the
//! current directory; `.` and `..` are folded before lookup, and `..` at
//! the root stays at the root.
//!
//! A subtree can be backed by something other than memory through
//! [`MemFs::mount`]. Operations beneath a mount point are delegated to its
//! [`MountBackend`]; [`copy_tree`] never follows them.

mod mount;

pub use mount::{HostDirBackend, HostDirMount, MountBackend, MountHandler, Unmount};

use crate::error::FsError;
use std::collections::{btree_map::Entry, BTreeMap};
use std::sync::Arc;

/// Type of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    /// Root of a mounted subtree
    Mount,
}

/// Options for [`MemFs::rmdir`]
#[derive(Debug, Clone, Copy)]
pub struct RmDirOptions {
    /// Remove contents as well (default: true)
    pub recursive: bool,
}

impl Default for RmDirOptions {
    fn default() -> Self {
        Self { recursive: true }
    }
}

/// Options for [`MemFs::list_files`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilesOptions {
    /// Return full paths instead of bare entry names
    pub prepend_path: bool,
}

#[derive(Debug)]
enum Node {
    File(Vec<u8>),
    Directory(BTreeMap<String, Node>),
    Mount {
        backend: Arc<dyn MountBackend>,
        /// Whatever lived at the mount point before, restored on unmount
        shadowed: Option<Box<Node>>,
    },
}

impl Node {
    fn directory() -> Self {
        Node::Directory(BTreeMap::new())
    }

    fn entry_type(&self) -> EntryType {
        match self {
            Node::File(_) => EntryType::File,
            Node::Directory(_) => EntryType::Directory,
            Node::Mount { .. } => EntryType::Mount,
        }
    }
}

/// Where a resolved path lives
enum Location {
    Local,
    Mounted {
        backend: Arc<dyn MountBackend>,
        /// Components below the mount point
        rest: Vec<String>,
    },
}

#[derive(Debug)]
pub struct MemFs {
    root: Node,
    cwd: Vec<String>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            root: Node::directory(),
            cwd: Vec::new(),
        }
    }

    /// Create directories along `path`, like `mkdir -p`
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let comps = self.components(path)?;
        self.mkdir_at(&comps)
    }

    /// Write a file, creating missing parent directories
    pub fn write_file(&mut self, path: &str, data: impl AsRef<[u8]>) -> Result<(), FsError> {
        let comps = self.components(path)?;
        self.write_at(&comps, data.as_ref(), false)
    }

    /// Append to a file, creating it if absent
    pub fn append_file(&mut self, path: &str, data: impl AsRef<[u8]>) -> Result<(), FsError> {
        let comps = self.components(path)?;
        self.write_at(&comps, data.as_ref(), true)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let comps = self.components(path)?;
        match self.locate(&comps) {
            Location::Mounted { backend, rest } => backend.read(&rest),
            Location::Local => match get_node(&self.root, &comps) {
                Some(Node::File(data)) => Ok(data.clone()),
                Some(_) => Err(FsError::IsADirectory(display(&comps))),
                None => Err(FsError::NotFound(display(&comps))),
            },
        }
    }

    /// Read a file as UTF-8, replacing invalid sequences
    pub fn read_file_as_text(&self, path: &str) -> Result<String, FsError> {
        let data = self.read_file(path)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Size of a file in bytes
    pub fn file_size(&self, path: &str) -> Result<u64, FsError> {
        let comps = self.components(path)?;
        match self.locate(&comps) {
            Location::Mounted { backend, rest } => backend.read(&rest).map(|d| d.len() as u64),
            Location::Local => match get_node(&self.root, &comps) {
                Some(Node::File(data)) => Ok(data.len() as u64),
                Some(_) => Err(FsError::IsADirectory(display(&comps))),
                None => Err(FsError::NotFound(display(&comps))),
            },
        }
    }

    /// Remove a file
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let comps = self.components(path)?;
        match self.locate(&comps) {
            Location::Mounted { rest, .. } if rest.is_empty() => {
                Err(FsError::IsADirectory(display(&comps)))
            }
            Location::Mounted { backend, rest } => backend.remove_file(&rest),
            Location::Local => {
                let (parent, name) = split_last(&comps)?;
                let children = get_node_mut(&mut self.root, parent)
                    .and_then(as_dir_mut)
                    .ok_or_else(|| FsError::NotFound(display(&comps)))?;
                match children.get(name) {
                    Some(Node::File(_)) => {
                        children.remove(name);
                        Ok(())
                    }
                    Some(_) => Err(FsError::IsADirectory(display(&comps))),
                    None => Err(FsError::NotFound(display(&comps))),
                }
            }
        }
    }

    /// Remove a directory; recursive unless told otherwise
    pub fn rmdir(&mut self, path: &str, options: RmDirOptions) -> Result<(), FsError> {
        let comps = self.components(path)?;
        match self.locate(&comps) {
            Location::Mounted { rest, .. } if rest.is_empty() => Err(FsError::invalid_path(
                display(&comps),
                "is a mount point; unmount it instead",
            )),
            Location::Mounted { backend, rest } => backend.remove_dir(&rest, options.recursive),
            Location::Local => {
                if comps.is_empty() {
                    return Err(FsError::invalid_path("/", "cannot remove the root directory"));
                }
                let (parent, name) = split_last(&comps)?;
                let children = get_node_mut(&mut self.root, parent)
                    .and_then(as_dir_mut)
                    .ok_or_else(|| FsError::NotFound(display(&comps)))?;
                match children.get(name) {
                    Some(Node::Directory(entries)) => {
                        if !options.recursive && !entries.is_empty() {
                            return Err(FsError::DirectoryNotEmpty(display(&comps)));
                        }
                        children.remove(name);
                        Ok(())
                    }
                    Some(_) => Err(FsError::NotADirectory(display(&comps))),
                    None => Err(FsError::NotFound(display(&comps))),
                }
            }
        }
    }

    /// Move a file or directory
    ///
    /// Files may move between memory and a mount by copying; directories may
    /// not cross a mount boundary.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let src = self.components(from)?;
        let dst = self.components(to)?;
        if src == dst {
            return Ok(());
        }
        if dst.starts_with(&src) {
            return Err(FsError::invalid_path(
                display(&dst),
                "cannot move a directory into itself",
            ));
        }

        match (self.locate(&src), self.locate(&dst)) {
            (Location::Local, Location::Local) => {
                let (src_parent, src_name) = split_last(&src)?;
                let (dst_parent, dst_name) = split_last(&dst)?;

                match get_node(&self.root, &dst) {
                    Some(Node::File(_)) | None => {}
                    Some(_) => return Err(FsError::AlreadyExists(display(&dst))),
                }
                if !matches!(get_node(&self.root, dst_parent), Some(Node::Directory(_))) {
                    return Err(FsError::NotFound(display(dst_parent)));
                }

                let node = get_node_mut(&mut self.root, src_parent)
                    .and_then(as_dir_mut)
                    .and_then(|children| children.remove(src_name))
                    .ok_or_else(|| FsError::NotFound(display(&src)))?;
                let children = get_node_mut(&mut self.root, dst_parent)
                    .and_then(as_dir_mut)
                    .ok_or_else(|| FsError::NotFound(display(dst_parent)))?;
                children.insert(dst_name.to_string(), node);
                Ok(())
            }
            (
                Location::Mounted {
                    backend: from_backend,
                    rest: from_rest,
                },
                Location::Mounted {
                    backend: to_backend,
                    rest: to_rest,
                },
            ) if Arc::ptr_eq(&from_backend, &to_backend) => from_backend.rename(&from_rest, &to_rest),
            _ => {
                if self.entry_type_at(&src) != Some(EntryType::File) {
                    return Err(FsError::CrossMount {
                        from: display(&src),
                        to: display(&dst),
                    });
                }
                let data = self.read_file(from)?;
                self.write_at(&dst, &data, false)?;
                self.unlink(from)
            }
        }
    }

    /// Entry names in a directory, sorted
    pub fn list_files(&self, path: &str, options: ListFilesOptions) -> Result<Vec<String>, FsError> {
        let comps = self.components(path)?;
        let names = match self.locate(&comps) {
            Location::Mounted { backend, rest } => {
                let mut names = backend.list(&rest)?;
                names.sort();
                names
            }
            Location::Local => match get_node(&self.root, &comps) {
                Some(Node::Directory(children)) => children.keys().cloned().collect(),
                Some(_) => return Err(FsError::NotADirectory(display(&comps))),
                None => return Err(FsError::NotFound(display(&comps))),
            },
        };

        if !options.prepend_path {
            return Ok(names);
        }
        let base = display(&comps);
        Ok(names
            .into_iter()
            .map(|name| {
                if base == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", base, name)
                }
            })
            .collect())
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.entry_type(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.entry_type(path),
            Some(EntryType::Directory | EntryType::Mount)
        )
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.entry_type(path) == Some(EntryType::File)
    }

    pub fn entry_type(&self, path: &str) -> Option<EntryType> {
        let comps = self.components(path).ok()?;
        self.entry_type_at(&comps)
    }

    /// Change the directory relative paths resolve against
    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        let comps = self.components(path)?;
        match self.entry_type_at(&comps) {
            Some(EntryType::Directory | EntryType::Mount) => {
                self.cwd = comps;
                Ok(())
            }
            Some(EntryType::File) => Err(FsError::NotADirectory(display(&comps))),
            None => Err(FsError::NotFound(display(&comps))),
        }
    }

    pub fn cwd(&self) -> String {
        display(&self.cwd)
    }

    /// Attach `backend` at `path`, shadowing any directory already there
    pub fn mount(&mut self, path: &str, backend: Arc<dyn MountBackend>) -> Result<(), FsError> {
        let comps = self.components(path)?;
        if comps.is_empty() {
            return Err(FsError::invalid_path("/", "cannot mount over the root directory"));
        }
        if let Location::Mounted { .. } = self.locate(&comps) {
            return Err(FsError::invalid_path(
                display(&comps),
                "already inside a mounted subtree",
            ));
        }

        let (parent, name) = split_last(&comps)?;
        let parent_dir = ensure_dir(&mut self.root, parent, &comps)?;
        let children = as_dir_mut(parent_dir).ok_or_else(|| FsError::NotADirectory(display(parent)))?;
        let shadowed = match children.remove(name) {
            Some(Node::File(data)) => {
                children.insert(name.to_string(), Node::File(data));
                return Err(FsError::NotADirectory(display(&comps)));
            }
            other => other.map(Box::new),
        };
        children.insert(name.to_string(), Node::Mount { backend, shadowed });

        tracing::debug!(path = %self::display(&comps), "Mounted subtree");
        Ok(())
    }

    /// Detach the mount at `path`, restoring whatever it shadowed
    pub fn unmount(&mut self, path: &str) -> Result<(), FsError> {
        let comps = self.components(path)?;
        let (parent, name) = split_last(&comps)?;
        let children = get_node_mut(&mut self.root, parent)
            .and_then(as_dir_mut)
            .ok_or_else(|| FsError::NotFound(display(&comps)))?;
        match children.remove(name) {
            Some(Node::Mount { shadowed, .. }) => {
                if let Some(node) = shadowed {
                    children.insert(name.to_string(), *node);
                }
                tracing::debug!(path = %self::display(&comps), "Unmounted subtree");
                Ok(())
            }
            Some(node) => {
                children.insert(name.to_string(), node);
                Err(FsError::invalid_path(display(&comps), "not a mount point"))
            }
            None => Err(FsError::NotFound(display(&comps))),
        }
    }

    fn components(&self, path: &str) -> Result<Vec<String>, FsError> {
        if path.contains('\0') {
            return Err(FsError::invalid_path(path, "contains a NUL byte"));
        }
        let mut comps = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd.clone()
        };
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    comps.pop();
                }
                name => comps.push(name.to_string()),
            }
        }
        Ok(comps)
    }

    fn locate(&self, comps: &[String]) -> Location {
        let mut node = &self.root;
        for (depth, name) in comps.iter().enumerate() {
            let Node::Directory(children) = node else {
                break;
            };
            match children.get(name) {
                Some(Node::Mount { backend, .. }) => {
                    return Location::Mounted {
                        backend: backend.clone(),
                        rest: comps[depth + 1..].to_vec(),
                    };
                }
                Some(child) => node = child,
                None => break,
            }
        }
        Location::Local
    }

    fn entry_type_at(&self, comps: &[String]) -> Option<EntryType> {
        match self.locate(comps) {
            Location::Mounted { rest, .. } if rest.is_empty() => Some(EntryType::Mount),
            Location::Mounted { backend, rest } => backend.entry_type(&rest),
            Location::Local => get_node(&self.root, comps).map(Node::entry_type),
        }
    }

    fn mkdir_at(&mut self, comps: &[String]) -> Result<(), FsError> {
        match self.locate(comps) {
            Location::Mounted { rest, .. } if rest.is_empty() => Ok(()),
            Location::Mounted { backend, rest } => backend.mkdir(&rest),
            Location::Local => ensure_dir(&mut self.root, comps, comps).map(|_| ()),
        }
    }

    fn write_at(&mut self, comps: &[String], data: &[u8], append: bool) -> Result<(), FsError> {
        match self.locate(comps) {
            Location::Mounted { rest, .. } if rest.is_empty() => {
                Err(FsError::IsADirectory(display(comps)))
            }
            Location::Mounted { backend, rest } => backend.write(&rest, data, append),
            Location::Local => {
                let (parent, name) = split_last(comps)?;
                let parent_dir = ensure_dir(&mut self.root, parent, comps)?;
                let children =
                    as_dir_mut(parent_dir).ok_or_else(|| FsError::NotADirectory(display(parent)))?;
                match children.entry(name.to_string()) {
                    Entry::Occupied(mut entry) => match entry.get_mut() {
                        Node::File(contents) => {
                            if !append {
                                contents.clear();
                            }
                            contents.extend_from_slice(data);
                            Ok(())
                        }
                        _ => Err(FsError::IsADirectory(display(comps))),
                    },
                    Entry::Vacant(entry) => {
                        entry.insert(Node::File(data.to_vec()));
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Copy the memory-backed subtree at `path` from `source` into `target`
///
/// Directories are created before their contents and traversal is depth
/// first. Mounted subtrees on either side are skipped. Files overwrite
/// whatever file the target already has at the same path and directories
/// merge; an entry whose type conflicts with the target is skipped.
///
/// Returns the number of files copied.
pub fn copy_tree(source: &MemFs, target: &mut MemFs, path: &str) -> Result<usize, FsError> {
    let mut comps = source.components(path)?;
    if let Location::Mounted { .. } = source.locate(&comps) {
        tracing::debug!(path = %self::display(&comps), "Preserve path is mounted; nothing to copy");
        return Ok(0);
    }
    let Some(node) = get_node(&source.root, &comps) else {
        tracing::debug!(path = %self::display(&comps), "Preserve path absent; nothing to copy");
        return Ok(0);
    };

    let mut copied = 0;
    copy_node(node, target, &mut comps, &mut copied);
    Ok(copied)
}

fn copy_node(node: &Node, target: &mut MemFs, comps: &mut Vec<String>, copied: &mut usize) {
    match node {
        Node::Mount { .. } => {}
        Node::File(data) => {
            if let Location::Mounted { .. } = target.locate(comps) {
                return;
            }
            match target.write_at(comps, data, false) {
                Ok(()) => *copied += 1,
                Err(e) => {
                    tracing::warn!(path = %self::display(comps), error = %e, "Skipped preserved file")
                }
            }
        }
        Node::Directory(children) => {
            if let Location::Mounted { .. } = target.locate(comps) {
                return;
            }
            if let Err(e) = target.mkdir_at(comps) {
                tracing::warn!(path = %self::display(comps), error = %e, "Skipped preserved directory");
                return;
            }
            for (name, child) in children {
                comps.push(name.clone());
                copy_node(child, target, comps, copied);
                comps.pop();
            }
        }
    }
}

fn display(comps: &[String]) -> String {
    format!("/{}", comps.join("/"))
}

fn split_last(comps: &[String]) -> Result<(&[String], &str), FsError> {
    match comps.split_last() {
        Some((name, parent)) => Ok((parent, name.as_str())),
        None => Err(FsError::IsADirectory("/".to_string())),
    }
}

fn get_node<'a>(node: &'a Node, comps: &[String]) -> Option<&'a Node> {
    let mut current = node;
    for name in comps {
        match current {
            Node::Directory(children) => current = children.get(name)?,
            _ => return None,
        }
    }
    Some(current)
}

fn get_node_mut<'a>(node: &'a mut Node, comps: &[String]) -> Option<&'a mut Node> {
    let mut current = node;
    for name in comps {
        match current {
            Node::Directory(children) => current = children.get_mut(name)?,
            _ => return None,
        }
    }
    Some(current)
}

fn as_dir_mut(node: &mut Node) -> Option<&mut BTreeMap<String, Node>> {
    match node {
        Node::Directory(children) => Some(children),
        _ => None,
    }
}

/// Walk `comps`, creating directories as needed
///
/// `full` is only used to render errors.
fn ensure_dir<'a>(
    root: &'a mut Node,
    comps: &[String],
    full: &[String],
) -> Result<&'a mut Node, FsError> {
    let mut current = root;
    for (depth, name) in comps.iter().enumerate() {
        let children = match current {
            Node::Directory(children) => children,
            _ => return Err(FsError::NotADirectory(display(&full[..depth]))),
        };
        current = children.entry(name.clone()).or_insert_with(Node::directory);
        if !matches!(current, Node::Directory(_)) {
            return Err(FsError::NotADirectory(display(&comps[..=depth])));
        }
    }
    Ok(current)
}

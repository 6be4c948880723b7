//! Change detection between two directory trees.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use super::{ArchiveError, ArchiveResult};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// Kind of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Modify => "C",
            ChangeKind::Add => "A",
            ChangeKind::Delete => "D",
        };
        write!(f, "{}", s)
    }
}

/// A changed path, absolute within the layer (e.g. `/etc/hosts`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self { path: path.into(), kind }
    }

    /// Location of this change under `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(self.path.trim_start_matches('/'))
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

#[derive(Debug)]
struct FileInfo {
    mode: u32,
    uid: u32,
    gid: u32,
    rdev: u64,
    size: u64,
    mtime: (i64, i64),
    link_target: Option<PathBuf>,
}

impl FileInfo {
    fn read(path: &Path, meta: &fs::Metadata) -> io::Result<Self> {
        let link_target =
            if meta.file_type().is_symlink() { Some(fs::read_link(path)?) } else { None };
        Ok(Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            link_target,
        })
    }

    fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Whether `other` is a modified version of `self`.
    ///
    /// Directory size and mtime are ignored: they change whenever an entry
    /// inside does, and those entries are reported on their own.
    fn differs(&self, other: &FileInfo) -> bool {
        if self.mode != other.mode
            || self.uid != other.uid
            || self.gid != other.gid
            || self.rdev != other.rdev
            || self.link_target != other.link_target
        {
            return true;
        }
        !self.is_dir() && (self.size != other.size || !same_fs_time(self.mtime, other.mtime))
    }
}

/// Archives only carry whole seconds, so a zero nanosecond part on either side
/// matches any nanoseconds within the same second.
fn same_fs_time(a: (i64, i64), b: (i64, i64)) -> bool {
    a.0 == b.0 && (a.1 == b.1 || a.1 == 0 || b.1 == 0)
}

fn collect_tree(root: &Path) -> ArchiveResult<BTreeMap<String, FileInfo>> {
    let meta = fs::metadata(root)?;
    if !meta.is_dir() {
        return Err(ArchiveError::NotDirectory(root.to_path_buf()));
    }

    let mut tree = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
        let rel = rel.to_str().ok_or_else(|| {
            ArchiveError::InvalidEntry(format!("non UTF-8 path {}", entry.path().display()))
        })?;
        let meta = entry.path().symlink_metadata()?;
        tree.insert(format!("/{}", rel), FileInfo::read(entry.path(), &meta)?);
    }
    Ok(tree)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Compute the changes that turn `parent` into `layer`.
///
/// With no parent every entry of `layer` is an addition. Deletions are only
/// reported for the top-most removed path, and a directory present in both
/// trees is reported as modified whenever something inside it changed. The
/// result is ordered by path, so directories precede their content.
pub fn changes_dirs(layer: &Path, parent: Option<&Path>) -> ArchiveResult<Vec<Change>> {
    let new = collect_tree(layer)?;
    let old = match parent {
        Some(parent) => collect_tree(parent)?,
        None => BTreeMap::new(),
    };

    let mut changes: BTreeMap<String, ChangeKind> = BTreeMap::new();
    for (path, info) in &new {
        match old.get(path) {
            None => {
                changes.insert(path.clone(), ChangeKind::Add);
            }
            Some(previous) if previous.differs(info) => {
                changes.insert(path.clone(), ChangeKind::Modify);
            }
            Some(_) => {}
        }
    }

    for path in old.keys() {
        if new.contains_key(path) {
            continue;
        }
        let dir = parent_of(path);
        if dir == "/" || new.get(dir).is_some_and(FileInfo::is_dir) {
            changes.insert(path.clone(), ChangeKind::Delete);
        }
    }

    let changed: Vec<String> = changes.keys().cloned().collect();
    for path in changed {
        let mut dir = parent_of(&path);
        while dir != "/" && !changes.contains_key(dir) {
            changes.insert(dir.to_string(), ChangeKind::Modify);
            dir = parent_of(dir);
        }
    }

    debug!(layer = %layer.display(), changes = changes.len(), "Computed layer changes");
    Ok(changes.into_iter().map(|(path, kind)| Change { path, kind }).collect())
}

/// Bytes of content referenced by the added and modified entries of
/// `changes`, measured under `root`.
///
/// Directories count as zero, hardlinked inodes are counted once and paths
/// that no longer exist are skipped.
pub fn changes_size(root: &Path, changes: &[Change]) -> ArchiveResult<u64> {
    let mut seen = HashSet::new();
    let mut size = 0u64;

    for change in changes.iter().filter(|c| c.kind != ChangeKind::Delete) {
        let path = change.resolve(root);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Changed path vanished, not sized");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            continue;
        }
        if meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        size += meta.len();
    }
    Ok(size)
}

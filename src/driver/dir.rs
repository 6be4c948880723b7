//! Directory-backed layer driver.
//!
//! Every layer is a plain directory under the driver root. Creating a layer
//! with a parent copies the parent's content, so each layer holds its full
//! filesystem. Mounting only counts references; the directory itself is the
//! mount point.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, lchown, symlink};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use filetime::{FileTime, set_file_times, set_symlink_file_times};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{DriverError, DriverResult, ProtoDriver};

pub struct DirDriver {
    root: PathBuf,
    mounts: Mutex<HashMap<String, usize>>,
}

impl DirDriver {
    /// Open (creating if needed) a driver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> DriverResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, mounts: Mutex::new(HashMap::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layer_dir(&self, id: &str) -> DriverResult<PathBuf> {
        if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
            return Err(DriverError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    /// Create layer `id`, copying the content of `parent` if given.
    pub fn create(&self, id: &str, parent: Option<&str>) -> DriverResult<()> {
        let dir = self.layer_dir(id)?;
        let source = match parent {
            Some(parent) => {
                let source = self.layer_dir(parent)?;
                if !source.is_dir() {
                    return Err(DriverError::LayerNotFound(parent.to_string()));
                }
                Some(source)
            }
            None => None,
        };

        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DriverError::LayerExists(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(source) = source {
            if let Err(e) = copy_tree(&source, &dir) {
                // Don't leave a half-populated layer behind.
                let _ = fs::remove_dir_all(&dir);
                return Err(e.into());
            }
        }

        info!(layer = %id, parent = ?parent, "Created layer");
        Ok(())
    }

    /// Remove layer `id` and its content. Fails while the layer is mounted.
    pub fn remove(&self, id: &str) -> DriverResult<()> {
        let dir = self.layer_dir(id)?;
        if self.mount_count(id) > 0 {
            return Err(DriverError::Busy(id.to_string()));
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(layer = %id, "Removed layer");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(DriverError::LayerNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of outstanding `get` references for `id`.
    pub fn mount_count(&self, id: &str) -> usize {
        let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        mounts.get(id).copied().unwrap_or(0)
    }
}

impl ProtoDriver for DirDriver {
    fn name(&self) -> String {
        "dir".to_string()
    }

    fn get(&self, id: &str, _mount_label: &str) -> DriverResult<PathBuf> {
        let dir = self.layer_dir(id)?;
        if !dir.is_dir() {
            return Err(DriverError::LayerNotFound(id.to_string()));
        }

        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = mounts.entry(id.to_string()).or_insert(0);
        *count += 1;
        debug!(layer = %id, references = *count, "Layer mount acquired");
        Ok(dir)
    }

    fn put(&self, id: &str) -> DriverResult<()> {
        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = mounts.get_mut(id) else {
            return Err(DriverError::NotMounted(id.to_string()));
        };
        *count -= 1;
        debug!(layer = %id, references = *count, "Layer mount released");
        if *count == 0 {
            mounts.remove(id);
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.layer_dir(id).map(|dir| dir.is_dir()).unwrap_or(false)
    }
}

/// Copy `src` into the existing directory `dst`, preserving modes,
/// timestamps, symlinks, hardlinks and (where permitted) ownership.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut links: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            fs::set_permissions(&target, meta.permissions())?;
            dirs.push((target.clone(), meta.clone()));
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            let key = (meta.dev(), meta.ino());
            if meta.nlink() > 1
                && let Some(first) = links.get(&key)
            {
                fs::hard_link(first, &target)?;
                continue;
            }
            fs::copy(entry.path(), &target)?;
            if meta.nlink() > 1 {
                links.insert(key, target.clone());
            }
        } else {
            debug!(path = %entry.path().display(), "Skipping special file while copying layer");
            continue;
        }

        copy_owner(&target, &meta);
        let accessed = FileTime::from_last_access_time(&meta);
        let modified = FileTime::from_last_modification_time(&meta);
        if file_type.is_symlink() {
            set_symlink_file_times(&target, accessed, modified)?;
        } else if !file_type.is_dir() {
            set_file_times(&target, accessed, modified)?;
        }
    }

    let root_meta = fs::metadata(src)?;
    fs::set_permissions(dst, root_meta.permissions())?;
    copy_owner(dst, &root_meta);
    dirs.push((dst.to_path_buf(), root_meta));

    // Children touch their parent's mtime, so directories go last, deepest first.
    for (dir, meta) in dirs.iter().rev() {
        set_file_times(
            dir,
            FileTime::from_last_access_time(meta),
            FileTime::from_last_modification_time(meta),
        )?;
    }
    Ok(())
}

fn copy_owner(target: &Path, meta: &fs::Metadata) {
    let current = match target.symlink_metadata() {
        Ok(current) => current,
        Err(_) => return,
    };
    if current.uid() == meta.uid() && current.gid() == meta.gid() {
        return;
    }
    if let Err(e) = lchown(target, Some(meta.uid()), Some(meta.gid())) {
        debug!(path = %target.display(), "Could not preserve ownership: {}", e);
    }
}

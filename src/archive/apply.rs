//! Layer extraction.
//!
//! Unpacks a layer archive on top of an existing tree: whiteouts delete,
//! opaque markers hide the previous content of a directory, everything else
//! replaces what was there. Ownership in the archive is expressed in container
//! IDs and translated to host IDs on the way out.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt, lchown};
use std::path::{Component, Path, PathBuf};

use filetime::{FileTime, set_file_mtime};
use tar::{Archive, EntryType};
use tracing::debug;

use super::export::{WHITEOUT_META_PREFIX, WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX};
use super::{ArchiveError, ArchiveResult};
use crate::idtools::{IdMappings, IdPair};

/// Options for [`apply_layer`].
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Translation from archive (container) IDs to host IDs.
    pub id_mappings: IdMappings,
    /// Carry on when ownership cannot be changed, e.g. when running
    /// unprivileged.
    pub ignore_chown_errors: bool,
}

/// Extract the layer archive read from `layer` into `dest`.
///
/// Returns the number of content bytes written.
pub fn apply_layer(dest: &Path, layer: &mut dyn Read, options: &ApplyOptions) -> ArchiveResult<u64> {
    if !fs::metadata(dest)?.is_dir() {
        return Err(ArchiveError::NotDirectory(dest.to_path_buf()));
    }
    let mut archive = Archive::new(layer);
    let mut size = 0u64;
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut dirs: Vec<(PathBuf, u64)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(rel) = clean_entry_path(&entry.path()?)? else {
            continue;
        };
        let base = rel.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();

        if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
            let dir = rel.parent().unwrap_or(Path::new(""));
            if base.starts_with(WHITEOUT_META_PREFIX) && base != WHITEOUT_OPAQUE_DIR {
                debug!(entry = %rel.display(), "Ignoring whiteout metadata entry");
                continue;
            }
            if hidden.is_empty() {
                return Err(ArchiveError::InvalidEntry(rel.display().to_string()));
            }
            // Nothing to hide when the directory does not exist.
            let Some(host_dir) = real_dir(dest, dir)? else {
                continue;
            };
            if base == WHITEOUT_OPAQUE_DIR {
                clear_opaque_dir(&host_dir, dir, &unpacked)?;
            } else {
                remove_path(&host_dir.join(hidden))?;
            }
            continue;
        }

        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode()?;
        let mtime = header.mtime()?;
        let entry_size = header.size()?;
        let owner = IdPair::new(header_id(header.uid()?)?, header_id(header.gid()?)?);
        let host = options.id_mappings.to_host(owner)?;

        let target = dest.join(&rel);
        if let Some(parent) = rel.parent() {
            create_parent_dirs(dest, parent, options)?;
        }
        if let Ok(existing) = fs::symlink_metadata(&target)
            && !(existing.is_dir() && kind == EntryType::Directory)
        {
            remove_path(&target)?;
        }

        entry.set_preserve_permissions(true);
        entry.set_preserve_mtime(true);
        entry.set_unpack_xattrs(false);
        if !entry.unpack_in(dest)? {
            return Err(ArchiveError::Breakout(rel.display().to_string()));
        }

        chown(&target, host, options)?;
        // chown drops setuid/setgid bits
        if kind != EntryType::Symlink && mode & 0o6000 != 0 {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        if kind == EntryType::Directory {
            dirs.push((target, mtime));
        }
        size += entry_size;
        unpacked.insert(rel);
    }

    // Unpacking entries touched their parents; restore directory mtimes last.
    for (dir, mtime) in dirs.iter().rev() {
        set_file_mtime(dir, FileTime::from_unix_time(i64::try_from(*mtime).unwrap_or(0), 0))?;
    }

    debug!(dest = %dest.display(), bytes = size, entries = unpacked.len(), "Applied layer");
    Ok(size)
}

fn header_id(id: u64) -> ArchiveResult<u32> {
    u32::try_from(id).map_err(|_| ArchiveError::InvalidEntry(format!("owner id {} out of range", id)))
}

/// Normalize an entry path to a relative path inside the destination.
/// Returns `None` for the root entry itself.
fn clean_entry_path(path: &Path) -> ArchiveResult<Option<PathBuf>> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ArchiveError::Breakout(path.display().to_string()));
            }
        }
    }
    Ok(if clean.as_os_str().is_empty() { None } else { Some(clean) })
}

/// Create missing directories of `rel` under `dest`, owned by the
/// container's root.
fn create_parent_dirs(dest: &Path, rel: &Path, options: &ApplyOptions) -> ArchiveResult<()> {
    let mut current = dest.to_path_buf();
    for component in rel.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => return Err(ArchiveError::NotDirectory(current)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&current)?;
                fs::set_permissions(&current, fs::Permissions::from_mode(0o755))?;
                chown(&current, options.id_mappings.root_pair()?, options)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Resolve directory `rel` under `dest` without following symlinks.
///
/// Returns `None` if some component does not exist. A symlink anywhere on the
/// way is a breakout, any other non-directory is an error.
fn real_dir(dest: &Path, rel: &Path) -> ArchiveResult<Option<PathBuf>> {
    let mut current = dest.to_path_buf();
    for component in rel.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ArchiveError::Breakout(rel.display().to_string()));
            }
            Ok(_) => return Err(ArchiveError::NotDirectory(current)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(current))
}

/// Remove the children of `dir` (at `rel` in the archive) not unpacked yet.
fn clear_opaque_dir(dir: &Path, rel: &Path, unpacked: &HashSet<PathBuf>) -> ArchiveResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !unpacked.contains(&rel.join(entry.file_name())) {
            remove_path(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> ArchiveResult<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn chown(path: &Path, owner: IdPair, options: &ApplyOptions) -> ArchiveResult<()> {
    let current = fs::symlink_metadata(path)?;
    if current.uid() == owner.uid && current.gid() == owner.gid {
        return Ok(());
    }
    match lchown(path, Some(owner.uid), Some(owner.gid)) {
        Ok(()) => Ok(()),
        Err(e) if options.ignore_chown_errors => {
            debug!(path = %path.display(), uid = owner.uid, gid = owner.gid, "Ignoring chown failure: {}", e);
            Ok(())
        }
        Err(source) => Err(ArchiveError::Chown { path: path.to_path_buf(), source }),
    }
}

//! Tar export of whole trees and change lists.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::pipe::PipeReader;
use super::{ArchiveError, ArchiveResult, Change, ChangeKind};
use crate::idtools::{IdMappings, IdPair};

/// Prefix marking a deleted entry: `.wh.<name>` removes `<name>`.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Prefix reserved for whiteout metadata entries.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";
/// Marks a directory whose previous content is hidden.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

/// Stream the complete content of `root`, ownership unchanged.
pub fn tar_tree(root: &Path) -> ArchiveResult<PipeReader> {
    ensure_dir(root)?;
    let root = root.to_path_buf();

    PipeReader::spawn("layer-tar", move |out| {
        let mut appender = TarAppender::new(out, IdMappings::default());
        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let name = entry.path().strip_prefix(&root).map_err(io::Error::other)?;
            appender.append_path(entry.path(), name)?;
        }
        appender.finish()
    })
}

/// Stream the entries named by `changes` from `root`.
///
/// Deleted paths become whiteout entries. Ownership is written as container
/// IDs according to `id_mappings`.
pub fn export_changes(
    root: &Path,
    changes: &[Change],
    id_mappings: &IdMappings,
) -> ArchiveResult<PipeReader> {
    ensure_dir(root)?;
    let root = root.to_path_buf();
    let changes = changes.to_vec();
    let id_mappings = id_mappings.clone();

    PipeReader::spawn("layer-export", move |out| {
        let mut appender = TarAppender::new(out, id_mappings);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        for change in &changes {
            let name = Path::new(change.path.trim_start_matches('/'));
            if name.as_os_str().is_empty() {
                continue;
            }
            if change.kind == ChangeKind::Delete {
                appender.append_whiteout(name, now)?;
                continue;
            }

            let path = root.join(name);
            match appender.append_path(&path, name) {
                Ok(()) => {}
                Err(ArchiveError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %change.path, "Changed path vanished during export");
                }
                Err(e) => return Err(e),
            }
        }
        appender.finish()
    })
}

fn ensure_dir(root: &Path) -> ArchiveResult<()> {
    if !fs::metadata(root)?.is_dir() {
        return Err(ArchiveError::NotDirectory(root.to_path_buf()));
    }
    Ok(())
}

struct TarAppender<'a> {
    builder: Builder<&'a mut dyn Write>,
    id_mappings: IdMappings,
    // (dev, ino) -> first archived name, for hardlinks
    seen: HashMap<(u64, u64), PathBuf>,
}

impl<'a> TarAppender<'a> {
    fn new(out: &'a mut dyn Write, id_mappings: IdMappings) -> Self {
        Self { builder: Builder::new(out), id_mappings, seen: HashMap::new() }
    }

    fn append_path(&mut self, path: &Path, name: &Path) -> ArchiveResult<()> {
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();

        let owner = self.id_mappings.to_container(IdPair::new(meta.uid(), meta.gid()))?;
        let mut header = Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(u64::from(owner.uid));
        header.set_gid(u64::from(owner.gid));
        header.set_mtime(u64::try_from(meta.mtime()).unwrap_or(0));
        header.set_size(0);

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            self.builder.append_data(&mut header, name, io::empty())?;
        } else if file_type.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            self.builder.append_link(&mut header, name, fs::read_link(path)?)?;
        } else if file_type.is_file() {
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.seen.get(&key) {
                    header.set_entry_type(EntryType::Link);
                    self.builder.append_link(&mut header, name, first)?;
                    return Ok(());
                }
                self.seen.insert(key, name.to_path_buf());
            }
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let file = File::open(path)?;
            let body = ExactReader::new(file, meta.len(), path);
            self.builder.append_data(&mut header, name, body)?;
        } else if file_type.is_fifo() {
            header.set_entry_type(EntryType::Fifo);
            self.builder.append_data(&mut header, name, io::empty())?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            let kind =
                if file_type.is_char_device() { EntryType::Char } else { EntryType::Block };
            header.set_entry_type(kind);
            header.set_device_major(major(meta.rdev()))?;
            header.set_device_minor(minor(meta.rdev()))?;
            self.builder.append_data(&mut header, name, io::empty())?;
        } else {
            debug!(path = %path.display(), "Skipping socket");
        }
        Ok(())
    }

    fn append_whiteout(&mut self, name: &Path, mtime: u64) -> ArchiveResult<()> {
        let base = name
            .file_name()
            .ok_or_else(|| ArchiveError::InvalidEntry(format!("cannot whiteout {}", name.display())))?;
        let mut whiteout = std::ffi::OsString::from(WHITEOUT_PREFIX);
        whiteout.push(base);
        let path = match name.parent() {
            Some(parent) => parent.join(whiteout),
            None => PathBuf::from(whiteout),
        };

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o600);
        header.set_size(0);
        header.set_mtime(mtime);
        self.builder.append_data(&mut header, path, io::empty())?;
        Ok(())
    }

    fn finish(self) -> ArchiveResult<()> {
        self.builder.into_inner()?.flush()?;
        Ok(())
    }
}

/// Reads exactly `len` bytes from a file whose size was taken from an
/// earlier stat. A file that shrank in between fails with `UnexpectedEof`
/// instead of leaving a short entry in the archive; growth is cut off.
struct ExactReader<'p, R> {
    inner: io::Take<R>,
    remaining: u64,
    path: &'p Path,
}

impl<'p, R: Read> ExactReader<'p, R> {
    fn new(inner: R, len: u64, path: &'p Path) -> Self {
        Self { inner: inner.take(len), remaining: len, path }
    }
}

impl<R: Read> Read for ExactReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank by {} bytes while archiving", self.path.display(), self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn major(rdev: u64) -> u32 {
    (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as u32
}

fn minor(rdev: u64) -> u32 {
    ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as u32
}

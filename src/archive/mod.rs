//! Archive engine: tree comparison and tar streaming for layers.
//!
//! This module provides:
//! - Change detection between two directory trees
//! - Streaming tar export of a whole tree or of a change list
//! - Layer extraction with whiteout handling and ownership remapping
//! - Sizing of a change list

mod apply;
mod changes;
mod export;
mod pipe;

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::idtools::{IdMapError, IdMappings};

pub use apply::{ApplyOptions, apply_layer};
pub use changes::{Change, ChangeKind, changes_dirs, changes_size};
pub use export::{
    WHITEOUT_META_PREFIX, WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX, export_changes, tar_tree,
};
pub use pipe::PipeReader;

/// Errors produced by the archive engine.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to walk directory tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Id mapping error: {0}")]
    IdMap(#[from] IdMapError),

    #[error("Failed to change ownership of {path}: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Archive entry escapes the destination: {0}")]
    Breakout(String),

    #[error("Invalid archive entry: {0}")]
    InvalidEntry(String),

    #[error("Not a directory: {0}")]
    NotDirectory(PathBuf),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// A tar byte stream that must be closed once the reader is done with it.
pub trait ArchiveStream: Read + Send {
    /// Stop producing and release the producer. Calling it more than once is a
    /// no-op.
    fn close(&mut self) -> io::Result<()>;
}

/// The archive capabilities the diff driver composes.
pub trait ArchiveEngine: Send + Sync {
    /// Stream the whole tree under `root`.
    fn tar(&self, root: &Path) -> ArchiveResult<Box<dyn ArchiveStream>>;

    /// Changes turning `parent` into `layer`. `None` stands for an empty tree.
    fn changes(&self, layer: &Path, parent: Option<&Path>) -> ArchiveResult<Vec<Change>>;

    /// Stream only the entries named by `changes`, owned by container IDs.
    fn export_changes(
        &self,
        root: &Path,
        changes: &[Change],
        id_mappings: &IdMappings,
    ) -> ArchiveResult<Box<dyn ArchiveStream>>;

    /// Extract `layer` into `dest`, returning the number of bytes written.
    fn apply_layer(
        &self,
        dest: &Path,
        layer: &mut dyn Read,
        options: &ApplyOptions,
    ) -> ArchiveResult<u64>;

    /// Size of the content `changes` refers to under `root`.
    fn changes_size(&self, root: &Path, changes: &[Change]) -> ArchiveResult<u64>;
}

/// Uncompressed tar implementation of [`ArchiveEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TarEngine;

impl TarEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveEngine for TarEngine {
    fn tar(&self, root: &Path) -> ArchiveResult<Box<dyn ArchiveStream>> {
        Ok(Box::new(tar_tree(root)?))
    }

    fn changes(&self, layer: &Path, parent: Option<&Path>) -> ArchiveResult<Vec<Change>> {
        changes_dirs(layer, parent)
    }

    fn export_changes(
        &self,
        root: &Path,
        changes: &[Change],
        id_mappings: &IdMappings,
    ) -> ArchiveResult<Box<dyn ArchiveStream>> {
        Ok(Box::new(export_changes(root, changes, id_mappings)?))
    }

    fn apply_layer(
        &self,
        dest: &Path,
        layer: &mut dyn Read,
        options: &ApplyOptions,
    ) -> ArchiveResult<u64> {
        apply_layer(dest, layer, options)
    }

    fn changes_size(&self, root: &Path, changes: &[Change]) -> ArchiveResult<u64> {
        changes_size(root, changes)
    }
}

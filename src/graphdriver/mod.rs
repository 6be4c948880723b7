//! Diff-capable layer drivers.
//!
//! [`DiffDriver`] is the wide capability: a [`ProtoDriver`] that can also
//! describe, export, apply and size the differences between layers.
//! [`NaiveDiffDriver`] provides it for any mount-only driver by comparing
//! mounted trees.

mod naive;
mod stream;

use std::io::Read;

use thiserror::Error;

use crate::archive::{ArchiveError, Change};
use crate::driver::{DriverError, ProtoDriver};

pub use naive::NaiveDiffDriver;
pub use stream::DiffStream;

/// Errors reported by diff operations.
#[derive(Error, Debug)]
pub enum GraphDriverError {
    #[error("Failed to mount layer {id}: {source}")]
    Mount {
        id: String,
        #[source]
        source: DriverError,
    },

    #[error("Failed to compute changes for layer {id}: {source}")]
    Changes {
        id: String,
        #[source]
        source: ArchiveError,
    },

    #[error("Failed to export layer {id}: {source}")]
    Export {
        id: String,
        #[source]
        source: ArchiveError,
    },

    /// Extraction failures are passed through unchanged.
    #[error(transparent)]
    Extract(ArchiveError),

    #[error("Failed to size changes of layer {id}: {source}")]
    Size {
        id: String,
        #[source]
        source: ArchiveError,
    },
}

pub type GraphDriverResult<T> = Result<T, GraphDriverError>;

/// A layer driver that can produce and consume layer diffs.
///
/// `parent` names the layer `id` was derived from. `None` or an empty string
/// means `id` is a base layer and is compared against an empty tree.
pub trait DiffDriver: ProtoDriver {
    /// Stream the differences between `parent` and `id` as a tar archive.
    ///
    /// The layer stays mounted until the returned stream is closed.
    fn diff(&self, id: &str, parent: Option<&str>) -> GraphDriverResult<DiffStream>;

    /// List the paths that differ between `parent` and `id`.
    fn changes(&self, id: &str, parent: Option<&str>) -> GraphDriverResult<Vec<Change>>;

    /// Extract `diff` into layer `id`, returning the number of bytes written.
    ///
    /// `parent` is informational only and is never mounted.
    fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
    ) -> GraphDriverResult<u64>;

    /// Size in bytes of the content that differs between `parent` and `id`.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> GraphDriverResult<u64>;
}

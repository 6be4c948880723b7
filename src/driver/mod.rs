// Layer driver abstraction
//
// The narrow capability the diff driver is built on: a backend that can
// mount and unmount identified layers and nothing else.

mod dir;
mod mount;

use std::path::PathBuf;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use thiserror::Error;

pub use dir::DirDriver;
pub use mount::MountGuard;

/// Errors reported by a layer driver.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Layer already exists: {0}")]
    LayerExists(String),

    #[error("Layer is not mounted: {0}")]
    NotMounted(String),

    #[error("Layer is still mounted: {0}")]
    Busy(String),

    #[error("Invalid layer id: {0:?}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Mount-only layer driver.
///
/// `get` and `put` are reference counted per layer id: every successful `get`
/// must be matched by exactly one `put`. Implementations must be safe to call
/// concurrently for the same or different ids.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait ProtoDriver: Send + Sync {
    /// Backend name, used in log output.
    fn name(&self) -> String;

    /// Mount the layer and return the directory holding its content.
    fn get(&self, id: &str, mount_label: &str) -> DriverResult<PathBuf>;

    /// Release one reference acquired with `get`.
    fn put(&self, id: &str) -> DriverResult<()>;

    fn exists(&self, id: &str) -> bool;
}

//! Scoped mount handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{DriverResult, ProtoDriver};

/// A mounted layer, released exactly once.
///
/// The mount is released by [`MountGuard::release`], or on drop if it was
/// never released explicitly. Moving the guard into another owner (such as a
/// returned stream) hands the release over with it.
pub struct MountGuard {
    driver: Arc<dyn ProtoDriver>,
    id: String,
    path: PathBuf,
    released: bool,
}

impl MountGuard {
    /// Mount `id` through `driver`.
    pub fn acquire(driver: Arc<dyn ProtoDriver>, id: &str, mount_label: &str) -> DriverResult<Self> {
        let path = driver.get(id, mount_label)?;
        debug!(layer = %id, path = %path.display(), "Mounted layer");
        Ok(Self { driver, id: id.to_string(), path, released: false })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory holding the layer's content.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the mount now, reporting the driver's result.
    pub fn release(mut self) -> DriverResult<()> {
        self.released = true;
        self.put()
    }

    fn put(&self) -> DriverResult<()> {
        let result = self.driver.put(&self.id);
        if result.is_ok() {
            debug!(layer = %self.id, "Released layer");
        }
        result
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.put() {
            warn!(layer = %self.id, driver = %self.driver.name(), "Failed to release layer: {}", e);
        }
    }
}

impl std::fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGuard")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("released", &self.released)
            .finish()
    }
}

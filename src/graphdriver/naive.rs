//! Diff support for drivers that can only mount layers.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, info};

use super::stream::settle_deadline;
use super::{DiffDriver, DiffStream, GraphDriverError, GraphDriverResult};
use crate::archive::{ApplyOptions, ArchiveEngine, Change, TarEngine};
use crate::driver::{DriverResult, MountGuard, ProtoDriver};
use crate::idtools::IdMappings;

/// Adds [`DiffDriver`] to any [`ProtoDriver`] by mounting layers and
/// comparing their trees.
///
/// Every mount taken by an operation is released before it returns, except
/// for [`DiffDriver::diff`], whose layer is released when the returned stream
/// is closed.
pub struct NaiveDiffDriver {
    driver: Arc<dyn ProtoDriver>,
    engine: Arc<dyn ArchiveEngine>,
    mount_label: String,
    apply_options: ApplyOptions,
}

impl NaiveDiffDriver {
    pub fn new(driver: Arc<dyn ProtoDriver>, id_mappings: IdMappings) -> Self {
        Self::with_engine(driver, Arc::new(TarEngine::new()), id_mappings)
    }

    pub fn with_engine(
        driver: Arc<dyn ProtoDriver>,
        engine: Arc<dyn ArchiveEngine>,
        id_mappings: IdMappings,
    ) -> Self {
        Self {
            driver,
            engine,
            mount_label: String::new(),
            apply_options: ApplyOptions { id_mappings, ignore_chown_errors: false },
        }
    }

    /// Label passed through to every mount.
    pub fn with_mount_label(mut self, mount_label: impl Into<String>) -> Self {
        self.mount_label = mount_label.into();
        self
    }

    /// Keep extracting when ownership of an entry cannot be changed.
    pub fn with_ignore_chown_errors(mut self, ignore: bool) -> Self {
        self.apply_options.ignore_chown_errors = ignore;
        self
    }

    pub fn id_mappings(&self) -> &IdMappings {
        &self.apply_options.id_mappings
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &Arc<dyn ProtoDriver> {
        &self.driver
    }

    fn mount(&self, id: &str) -> GraphDriverResult<MountGuard> {
        MountGuard::acquire(self.driver.clone(), id, &self.mount_label)
            .map_err(|source| GraphDriverError::Mount { id: id.to_string(), source })
    }
}

fn non_empty(parent: Option<&str>) -> Option<&str> {
    parent.filter(|p| !p.is_empty())
}

impl ProtoDriver for NaiveDiffDriver {
    fn name(&self) -> String {
        self.driver.name()
    }

    fn get(&self, id: &str, mount_label: &str) -> DriverResult<PathBuf> {
        self.driver.get(id, mount_label)
    }

    fn put(&self, id: &str) -> DriverResult<()> {
        self.driver.put(id)
    }

    fn exists(&self, id: &str) -> bool {
        self.driver.exists(id)
    }
}

impl DiffDriver for NaiveDiffDriver {
    fn diff(&self, id: &str, parent: Option<&str>) -> GraphDriverResult<DiffStream> {
        let started = SystemTime::now();
        let layer = self.mount(id)?;

        let Some(parent) = non_empty(parent) else {
            debug!(layer = %id, "Exporting full layer");
            let archive = self
                .engine
                .tar(layer.path())
                .map_err(|source| GraphDriverError::Export { id: id.to_string(), source })?;
            return Ok(DiffStream::new(archive, layer, None));
        };

        let changes = {
            let parent_layer = self.mount(parent)?;
            self.engine
                .changes(layer.path(), Some(parent_layer.path()))
                .map_err(|source| GraphDriverError::Changes { id: id.to_string(), source })?
        };
        debug!(layer = %id, parent = %parent, changes = changes.len(), "Exporting layer changes");

        let archive = self
            .engine
            .export_changes(layer.path(), &changes, self.id_mappings())
            .map_err(|source| GraphDriverError::Export { id: id.to_string(), source })?;
        Ok(DiffStream::new(archive, layer, Some(settle_deadline(started))))
    }

    fn changes(&self, id: &str, parent: Option<&str>) -> GraphDriverResult<Vec<Change>> {
        let layer = self.mount(id)?;
        let parent_layer = non_empty(parent).map(|p| self.mount(p)).transpose()?;

        self.engine
            .changes(layer.path(), parent_layer.as_ref().map(|p| p.path()))
            .map_err(|source| GraphDriverError::Changes { id: id.to_string(), source })
    }

    fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
    ) -> GraphDriverResult<u64> {
        let layer = self.mount(id)?;

        let start = Instant::now();
        debug!(layer = %id, parent = ?non_empty(parent), "Start untar layer");
        let size = self
            .engine
            .apply_layer(layer.path(), diff, &self.apply_options)
            .map_err(GraphDriverError::Extract)?;
        debug!(layer = %id, size, elapsed_ms = start.elapsed().as_millis() as u64, "Untar finished");

        Ok(size)
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> GraphDriverResult<u64> {
        let changes = self.changes(id, parent)?;

        let layer = self.mount(id)?;
        let size = self
            .engine
            .changes_size(layer.path(), &changes)
            .map_err(|source| GraphDriverError::Size { id: id.to_string(), source })?;
        info!(layer = %id, size, "Computed diff size");
        Ok(size)
    }
}

//! Archive stream that owns the mount it reads from.

use std::io::{self, Read};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::archive::ArchiveStream;
use crate::driver::MountGuard;

/// A diff archive being read out of a mounted layer.
///
/// The layer stays mounted until [`DiffStream::close`] is called. Closing
/// stops the archive producer, releases the mount and, for diffs taken
/// against a parent, waits for the whole-second boundary following the start
/// of the diff. Dropping an unclosed stream still releases the mount but does
/// not wait.
pub struct DiffStream {
    id: String,
    archive: Box<dyn ArchiveStream>,
    mount: Option<MountGuard>,
    settle_until: Option<SystemTime>,
    closed: bool,
}

impl DiffStream {
    pub(crate) fn new(
        archive: Box<dyn ArchiveStream>,
        mount: MountGuard,
        settle_until: Option<SystemTime>,
    ) -> Self {
        Self {
            id: mount.id().to_string(),
            archive,
            mount: Some(mount),
            settle_until,
            closed: false,
        }
    }

    /// Layer the archive is read from.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether close waits for a whole-second boundary.
    pub fn settles(&self) -> bool {
        self.settle_until.is_some()
    }

    /// Finish the stream and release the layer.
    ///
    /// Returns the archive's close error, if any. Release failures are logged.
    /// Only the first call does anything.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self.archive.close();

        if let Some(mount) = self.mount.take()
            && let Err(e) = mount.release()
        {
            warn!(layer = %self.id, "Failed to release layer after diff: {}", e);
        }

        if let Some(deadline) = self.settle_until.take() {
            sleep_until(deadline);
        }

        result
    }
}

impl Read for DiffStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other(format!("diff stream for {} is closed", self.id)));
        }
        self.archive.read(buf)
    }
}

impl Drop for DiffStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(layer = %self.id, "Diff stream dropped without close");
        self.settle_until = None;
        if let Err(e) = self.close() {
            warn!(layer = %self.id, "Failed to close diff archive: {}", e);
        }
    }
}

impl std::fmt::Debug for DiffStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffStream")
            .field("id", &self.id)
            .field("mount", &self.mount)
            .field("settle_until", &self.settle_until)
            .field("closed", &self.closed)
            .finish()
    }
}

/// First whole second after `start`.
pub(crate) fn settle_deadline(start: SystemTime) -> SystemTime {
    let secs = start.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs + 1)
}

fn sleep_until(deadline: SystemTime) {
    // Re-check after waking: sleep may return early and the clock may step.
    while let Ok(remaining) = deadline.duration_since(SystemTime::now()) {
        if remaining.is_zero() {
            break;
        }
        debug!(remaining_ms = remaining.as_millis() as u64, "Waiting for timestamp boundary");
        thread::sleep(remaining);
    }
}

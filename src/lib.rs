//! Naive diff driver for layered storage.
//!
//! Wraps a layer driver that can only mount and unmount layers and adds the
//! ability to:
//! - compute the changes between a layer and its parent
//! - export those changes as a streaming tar archive
//! - apply a received archive onto a layer
//! - size the changes of a layer
//!
//! The entry point is [`graphdriver::NaiveDiffDriver`].

pub mod archive;
pub mod config;
pub mod driver;
pub mod graphdriver;
pub mod idtools;

pub use archive::{ArchiveEngine, ArchiveError, ArchiveStream, Change, ChangeKind, TarEngine};
pub use driver::{DirDriver, DriverError, MountGuard, ProtoDriver};
pub use graphdriver::{DiffDriver, DiffStream, GraphDriverError, NaiveDiffDriver};
pub use idtools::{IdMap, IdMappings, IdPair};

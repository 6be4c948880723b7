//! User and group ID mapping between a container's ID space and the host's.
//!
//! A mapping table is an ordered list of ranges per ID kind. An empty table
//! means identity mapping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing or applying ID mappings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdMapError {
    #[error("Invalid id map '{0}': expected container:host:size")]
    InvalidFormat(String),

    #[error("Invalid id map '{spec}': {reason}")]
    InvalidValue { spec: String, reason: String },

    #[error("Id {0} is not covered by any mapping")]
    Unmapped(u32),
}

pub type IdMapResult<T> = Result<T, IdMapError>;

/// A single contiguous range: `size` IDs starting at `container_id` map to
/// `size` IDs starting at `host_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self { container_id, host_id, size }
    }

    fn to_host(&self, id: u32) -> Option<u32> {
        shift(id, self.container_id, self.host_id, self.size)
    }

    fn to_container(&self, id: u32) -> Option<u32> {
        shift(id, self.host_id, self.container_id, self.size)
    }
}

fn shift(id: u32, from: u32, to: u32, size: u32) -> Option<u32> {
    let offset = u64::from(id).checked_sub(u64::from(from))?;
    if offset >= u64::from(size) {
        return None;
    }
    u32::try_from(u64::from(to) + offset).ok()
}

impl FromStr for IdMap {
    type Err = IdMapError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.trim().split(':').collect();
        let [container, host, size] = parts.as_slice() else {
            return Err(IdMapError::InvalidFormat(spec.to_string()));
        };

        let parse = |value: &str| {
            value.parse::<u32>().map_err(|e| IdMapError::InvalidValue {
                spec: spec.to_string(),
                reason: format!("'{}': {}", value, e),
            })
        };

        let map = IdMap::new(parse(*container)?, parse(*host)?, parse(*size)?);
        if map.size == 0 {
            return Err(IdMapError::InvalidValue {
                spec: spec.to_string(),
                reason: "size must be greater than zero".to_string(),
            });
        }
        Ok(map)
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

/// A uid/gid pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IdPair {
    pub uid: u32,
    pub gid: u32,
}

impl IdPair {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// UID and GID mapping tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappings {
    uids: Vec<IdMap>,
    gids: Vec<IdMap>,
}

impl IdMappings {
    pub fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        Self { uids, gids }
    }

    /// Parse `container:host:size` specs for both tables.
    pub fn from_specs<S: AsRef<str>>(uid_specs: &[S], gid_specs: &[S]) -> IdMapResult<Self> {
        let parse_all = |specs: &[S]| -> IdMapResult<Vec<IdMap>> {
            specs.iter().map(|s| s.as_ref().parse()).collect()
        };
        Ok(Self::new(parse_all(uid_specs)?, parse_all(gid_specs)?))
    }

    pub fn uids(&self) -> &[IdMap] {
        &self.uids
    }

    pub fn gids(&self) -> &[IdMap] {
        &self.gids
    }

    /// True when both tables are empty (identity mapping).
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    /// Translate container IDs to host IDs.
    pub fn to_host(&self, pair: IdPair) -> IdMapResult<IdPair> {
        Ok(IdPair {
            uid: translate(&self.uids, pair.uid, IdMap::to_host)?,
            gid: translate(&self.gids, pair.gid, IdMap::to_host)?,
        })
    }

    /// Translate host IDs to container IDs.
    pub fn to_container(&self, pair: IdPair) -> IdMapResult<IdPair> {
        Ok(IdPair {
            uid: translate(&self.uids, pair.uid, IdMap::to_container)?,
            gid: translate(&self.gids, pair.gid, IdMap::to_container)?,
        })
    }

    /// Host IDs owning the container's root (container uid/gid 0).
    pub fn root_pair(&self) -> IdMapResult<IdPair> {
        self.to_host(IdPair::default())
    }
}

fn translate(maps: &[IdMap], id: u32, direction: fn(&IdMap, u32) -> Option<u32>) -> IdMapResult<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter().find_map(|m| direction(m, id)).ok_or(IdMapError::Unmapped(id))
}

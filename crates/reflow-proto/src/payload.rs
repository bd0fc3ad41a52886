//! Out-of-band payload transfer between pool and worker processes.
//!
//! Payloads and results are written to region files in a spool directory
//! shared by both sides; only a [`PayloadRef`] handle crosses the control
//! queue. A region is written exactly once (write-then-rename, so a region
//! name is never observable half-written) and consumed at most once. After
//! publishing, the writer never touches the region again - ownership moves
//! to whoever holds the ref.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use reflow_core::RegionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from the shared payload channel.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// Filesystem error while publishing or consuming a region.
    #[error("payload channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The referenced region does not exist (never published, already
    /// consumed, or released).
    #[error("payload region not found: {0}")]
    Missing(RegionId),
}

/// Handle to a published payload region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Region identifier (file name inside the spool directory).
    pub region: RegionId,

    /// Payload length in bytes.
    pub len: u64,
}

impl PayloadRef {
    /// Create a new PayloadRef.
    pub fn new(region: RegionId, len: u64) -> Self {
        Self { region, len }
    }
}

/// File-backed payload channel rooted at a spool directory.
///
/// Both the pool and its worker processes construct one over the same
/// directory; the directory path travels to workers as a CLI argument.
#[derive(Debug, Clone)]
pub struct SharedPayloadChannel {
    dir: PathBuf,
}

impl SharedPayloadChannel {
    /// Open a channel over `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PayloadError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The spool directory backing this channel.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish a payload, returning the handle to hand off.
    ///
    /// The bytes are written to a staging file and renamed into place, so
    /// the region id only ever resolves to a complete payload.
    pub fn publish(&self, bytes: &[u8]) -> Result<PayloadRef, PayloadError> {
        let region = RegionId::generate();
        let staging = self.dir.join(format!("{region}.staging"));
        let target = self.region_path(&region);

        {
            let mut file = fs::File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_data()?;
        }
        fs::rename(&staging, &target)?;

        debug!(region = %region, len = bytes.len(), "Published payload region");
        Ok(PayloadRef::new(region, bytes.len() as u64))
    }

    /// Consume a payload: read it and delete the region. At most once.
    pub fn consume(&self, payload: &PayloadRef) -> Result<Vec<u8>, PayloadError> {
        let path = self.region_path(&payload.region);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PayloadError::Missing(payload.region.clone())
            } else {
                PayloadError::Io(e)
            }
        })?;
        fs::remove_file(&path)?;

        debug!(region = %payload.region, len = bytes.len(), "Consumed payload region");
        Ok(bytes)
    }

    /// Best-effort release of an unconsumed region (e.g. the awaiter went
    /// away before the result was read). Missing regions are ignored.
    pub fn release(&self, payload: &PayloadRef) {
        let path = self.region_path(&payload.region);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(region = %payload.region, error = %e, "Failed to release payload region");
            }
        }
    }

    fn region_path(&self, region: &RegionId) -> PathBuf {
        self.dir.join(format!("{region}.payload"))
    }
}

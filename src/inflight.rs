//! Inflight region
//!
//! Shared-memory buffer recording in-flight descriptor state so a frontend
//! can restore virtqueue progress across a backend reconnect. Created on
//! GET_INFLIGHT_FD as an anonymous memfd and handed to the frontend, or
//! re-mapped from a frontend-supplied fd on SET_INFLIGHT_FD.

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd;
use vm_memory::{FileOffset, MmapRegion};

use crate::error::{Error, MemoryError};

/// Per-queue header: features, version, desc_num, last_batch_head, used_idx
pub const REGION_HDR_SIZE: usize = 16;

/// Per-descriptor inflight slot
pub const DESC_SLOT_SIZE: usize = 16;

/// Bytes one queue contributes to the inflight buffer
pub fn queue_region_size(queue_size: u16) -> u64 {
    (REGION_HDR_SIZE + queue_size as usize * DESC_SLOT_SIZE) as u64
}

/// A shared mapping of inflight descriptor state
pub struct InflightRegion {
    mapping: MmapRegion<()>,
    size: u64,
}

impl InflightRegion {
    /// Allocate a fresh memfd-backed region sized for `num_queues` queues of
    /// `queue_size` entries, zero it and stamp each per-queue header.
    pub fn create(num_queues: u16, queue_size: u16) -> Result<Self, Error> {
        let size = queue_region_size(queue_size) * num_queues as u64;

        let fd = memfd_create(c"vhost-inflight", MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = File::from(fd);
        unistd::ftruncate(&file, size as i64)?;

        let mapping = MmapRegion::from_file(FileOffset::new(file, 0), size as usize)
            .map_err(MemoryError::from)?;

        let mut region = Self { mapping, size };
        region.initialize(num_queues, queue_size);

        tracing::debug!(size, num_queues, queue_size, "inflight region created");
        Ok(region)
    }

    /// Map a frontend-supplied inflight fd. The fd is closed on failure.
    pub fn from_fd(fd: OwnedFd, size: u64) -> Result<Self, Error> {
        let file = File::from(fd);
        let mapping = MmapRegion::from_file(FileOffset::new(file, 0), size as usize)
            .map_err(MemoryError::from)?;

        tracing::debug!(size, "inflight region restored from fd");
        Ok(Self { mapping, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Backing fd, for passing back to the frontend
    pub fn fd(&self) -> Option<RawFd> {
        self.mapping
            .file_offset()
            .map(|fo| fo.file().as_raw_fd())
    }

    fn bytes(&mut self) -> &mut [u8] {
        // the mapping is shared and lives as long as self
        unsafe { std::slice::from_raw_parts_mut(self.mapping.as_ptr(), self.size as usize) }
    }

    fn initialize(&mut self, num_queues: u16, queue_size: u16) {
        let per_queue = queue_region_size(queue_size) as usize;
        let buf = self.bytes();
        buf.fill(0);

        for queue in 0..num_queues as usize {
            let base = queue * per_queue;
            buf[base + 8..base + 10].copy_from_slice(&1u16.to_le_bytes());
            buf[base + 10..base + 12].copy_from_slice(&queue_size.to_le_bytes());
        }
    }
}

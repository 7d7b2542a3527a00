//! Error Types

use std::io;

use nix::errno::Errno;

/// Errors raised while decoding a vhost-user message payload
#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("not enough data for payload, got = {got}, expected = {expected}")]
    NotEnoughData { got: usize, expected: usize },

    #[error("payload size {got} exceeds maximum {max}")]
    TooLarge { got: usize, max: usize },

    #[error("message requires a file descriptor but none was passed")]
    MissingFd,

    #[error("region count does not match passed file descriptors ({regions} != {fds})")]
    FdCountMismatch { regions: usize, fds: usize },
}

/// Errors raised by the guest memory map
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("memory region index {0} out of range")]
    BadIndex(u32),

    #[error("memory region size/offset 0x{0:x} is not page aligned")]
    BadAlignment(u64),

    #[error("memory region {0} is already mapped to a different range")]
    SlotBusy(u32),

    #[error("no memory has been mapped")]
    NoMappedMemory,

    #[error("mmap region: {0}")]
    MmapRegion(#[from] vm_memory::mmap::MmapRegionError),

    #[error("guest memory: {0}")]
    Mmap(#[from] vm_memory::mmap::Error),

    #[error("guest address: {0}")]
    Guest(#[from] vm_memory::GuestMemoryError),
}

/// Errors raised by a virtqueue implementation
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("virtio queue: {0}")]
    Virtio(#[from] virtio_queue::Error),

    #[error("queue layout does not describe a valid ring")]
    BadLayout,

    #[error("queue is not attached to guest memory")]
    NotAttached,
}

/// Crate-level error for the vhost-user control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("error: {0}")]
    Errno(#[from] Errno),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("request {0} is not supported")]
    NotSupported(u32),

    #[error("request {0} is not defined")]
    UnknownRequest(u32),

    #[error("vring index {0} out of bounds")]
    BadVringIndex(u32),

    #[error("vring {0} is enabled")]
    VringEnabled(u32),

    #[error("vring is missing {0}")]
    VringNotReady(&'static str),

    #[error("address 0x{0:x} does not resolve to mapped guest memory")]
    BadAddress(u64),

    #[error("socket path exists and is not a socket")]
    BadSocketPath,

    #[error("invalid state transition from {0} to {1}")]
    BadTransition(&'static str, &'static str),

    #[error("invalid argument: {0}")]
    InvalidParam(&'static str),

    #[error("event loop: {0}")]
    EventLoop(io::Error),

    #[error("device: {0}")]
    Device(String),
}

impl Error {
    /// True when the error means the connection itself is broken and must be
    /// torn down, as opposed to a request that merely failed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Disconnected)
    }

    /// Error code carried in a REPLY_ACK payload.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Errno(e) => *e,
            Error::Io(_) | Error::Disconnected | Error::EventLoop(_) => Errno::EIO,
            Error::NotSupported(_) => Errno::ENOTSUP,
            Error::Memory(MemoryError::SlotBusy(_)) => Errno::EBUSY,
            Error::Memory(MemoryError::MmapRegion(_)) | Error::Memory(MemoryError::Mmap(_)) => {
                Errno::EFAULT
            }
            Error::Device(_) => Errno::EIO,
            _ => Errno::EINVAL,
        }
    }
}

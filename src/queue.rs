//! Virtqueue handling
//!
//! The control plane only needs a narrow capability from a queue: attach it
//! to guest memory, release it, point it at a notify fd and report the next
//! available index. That seam is the [`VirtQueue`] trait; [`SplitQueue`] is
//! the split-ring implementation device backends normally use.

use std::ops::Deref;
use std::os::fd::OwnedFd;

use nix::unistd;
use virtio_queue::{Descriptor, Queue, QueueOwnedT, QueueT};
use vm_memory::{GuestAddress, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap};

use crate::error::QueueError;

/// Largest ring size the backend will accept
pub const VIRTQ_MAX_SIZE: u16 = 1024;

/// Resolved ring placement handed to [`VirtQueue::attach`]
#[derive(Clone, Copy, Debug)]
pub struct QueueLayout {
    pub desc: GuestAddress,
    pub avail: GuestAddress,
    pub used: GuestAddress,
    pub size: u16,
    pub base: u16,
}

/// Capability the control plane requires from a virtqueue implementation
pub trait VirtQueue: Send + 'static {
    fn new(max_size: u16) -> Result<Self, QueueError>
    where
        Self: Sized;

    /// Bind the ring to guest memory at the given layout
    fn attach(
        &mut self,
        mem: GuestMemoryAtomic<GuestMemoryMmap<()>>,
        layout: QueueLayout,
    ) -> Result<(), QueueError>;

    /// Drop the guest memory binding and reset ring state
    fn release(&mut self);

    /// Install the eventfd used to notify the driver of completions
    fn set_notify_fd(&mut self, fd: OwnedFd);

    /// Next available index, reported at GET_VRING_BASE
    fn last_avail(&self) -> u16;
}

/// One available descriptor chain pulled off the ring
#[derive(Debug)]
pub struct Chain {
    pub head: u16,
    pub descriptors: Vec<Descriptor>,
}

/// Split-ring virtqueue backed by `virtio-queue`
#[derive(Debug)]
pub struct SplitQueue {
    queue: Queue,
    mem: Option<GuestMemoryAtomic<GuestMemoryMmap<()>>>,
    notify: Option<OwnedFd>,
}

impl SplitQueue {
    /// Guest memory the queue is attached to, if any
    pub fn memory(&self) -> Option<&GuestMemoryAtomic<GuestMemoryMmap<()>>> {
        self.mem.as_ref()
    }

    /// Collect every pending available chain, advancing the ring
    pub fn drain(&mut self) -> Result<Vec<Chain>, QueueError> {
        let mem = self.mem.as_ref().ok_or(QueueError::NotAttached)?.memory();

        let mut chains = Vec::new();
        for chain in self.queue.iter(mem.deref())? {
            let head = chain.head_index();
            let descriptors = chain.collect();
            chains.push(Chain { head, descriptors });
        }

        Ok(chains)
    }

    /// Put a chain on the used ring and notify the driver if it asked for it
    pub fn complete(&mut self, head: u16, len: u32) -> Result<(), QueueError> {
        let mem = self.mem.as_ref().ok_or(QueueError::NotAttached)?.memory();

        self.queue.add_used(mem.deref(), head, len)?;
        if self.queue.needs_notification(mem.deref())? {
            self.notify();
        }

        Ok(())
    }

    /// Signal the driver's call eventfd
    pub fn notify(&self) {
        if let Some(fd) = self.notify.as_ref() {
            if let Err(errno) = unistd::write(fd, &1u64.to_le_bytes()) {
                tracing::warn!(?errno, "unable to signal notify fd");
            }
        }
    }
}

impl VirtQueue for SplitQueue {
    fn new(max_size: u16) -> Result<Self, QueueError> {
        Ok(Self {
            queue: Queue::new(max_size)?,
            mem: None,
            notify: None,
        })
    }

    fn attach(
        &mut self,
        mem: GuestMemoryAtomic<GuestMemoryMmap<()>>,
        layout: QueueLayout,
    ) -> Result<(), QueueError> {
        self.queue.set_size(layout.size);

        let desc = layout.desc.0;
        self.queue.set_desc_table_address(
            Some((desc & 0xffff_ffff) as u32),
            Some((desc >> 32) as u32),
        );

        let avail = layout.avail.0;
        self.queue.set_avail_ring_address(
            Some((avail & 0xffff_ffff) as u32),
            Some((avail >> 32) as u32),
        );

        let used = layout.used.0;
        self.queue.set_used_ring_address(
            Some((used & 0xffff_ffff) as u32),
            Some((used >> 32) as u32),
        );

        self.queue.set_next_avail(layout.base);
        self.queue.set_ready(true);

        {
            let guard = mem.memory();
            if !self.queue.is_valid(guard.deref()) {
                self.queue.reset();
                return Err(QueueError::BadLayout);
            }
        }

        self.mem = Some(mem);
        Ok(())
    }

    fn release(&mut self) {
        self.queue.reset();
        self.mem = None;
        self.notify = None;
    }

    fn set_notify_fd(&mut self, fd: OwnedFd) {
        self.notify = Some(fd);
    }

    fn last_avail(&self) -> u16 {
        self.queue.next_avail()
    }
}

//! Vring state
//!
//! A vring collects its client-supplied configuration while disabled, on the
//! control thread. Enabling attaches the virtqueue and hands the kick fd to
//! the request queue worker; from then on the queue is driven from the
//! worker thread, and the two sides share it behind a mutex. Disabling
//! detaches the kick fd synchronously before releasing queue state.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd;
use parking_lot::Mutex;
use vm_memory::{GuestAddress, GuestMemoryAtomic, GuestMemoryMmap};

use crate::error::Error;
use crate::queue::{QueueLayout, VirtQueue};
use crate::rq::{KickHandler, RequestQueue};
use crate::vdev::Device;

/// Ring placement collected from the client across several messages
#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct RingInfo {
    pub num: u16,
    pub base: u16,
    pub desc: Option<GuestAddress>,
    pub avail: Option<GuestAddress>,
    pub used: Option<GuestAddress>,
}

impl RingInfo {
    fn layout(&self) -> Result<QueueLayout, Error> {
        match (self.desc, self.avail, self.used) {
            (Some(desc), Some(avail), Some(used)) => Ok(QueueLayout {
                desc,
                avail,
                used,
                size: self.num,
                base: self.base,
            }),
            _ => Err(Error::VringNotReady("ring addresses")),
        }
    }
}

struct Shared<Q> {
    queue: Q,
    enabled: bool,
}

/// Per-queue state owned by the device
pub struct Vring<Q: VirtQueue> {
    id: u16,
    kick: Option<OwnedFd>,
    call: Option<OwnedFd>,
    err: Option<OwnedFd>,
    info: RingInfo,
    shared: Arc<Mutex<Shared<Q>>>,
}

impl<Q: VirtQueue> Vring<Q> {
    pub fn new(id: u16, max_size: u16) -> Result<Self, Error> {
        Ok(Self {
            id,
            kick: None,
            call: None,
            err: None,
            info: RingInfo::default(),
            shared: Arc::new(Mutex::new(Shared {
                queue: Q::new(max_size)?,
                enabled: false,
            })),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    /// Next available index, reported at GET_VRING_BASE
    pub fn last_avail(&self) -> u16 {
        self.shared.lock().queue.last_avail()
    }

    pub fn set_num(&mut self, num: u16) {
        self.info.num = num;
    }

    pub fn set_base(&mut self, base: u16) {
        self.info.base = base;
    }

    pub fn set_addr(&mut self, desc: GuestAddress, avail: GuestAddress, used: GuestAddress) {
        self.info.desc = Some(desc);
        self.info.avail = Some(avail);
        self.info.used = Some(used);
    }

    pub fn set_kick(&mut self, fd: OwnedFd) {
        self.kick = Some(fd);
    }

    /// Store the call fd; an enabled vring starts notifying through it
    /// right away.
    pub fn set_call(&mut self, fd: OwnedFd) -> Result<(), Error> {
        {
            let mut shared = self.shared.lock();
            if shared.enabled {
                shared.queue.set_notify_fd(fd.try_clone().map_err(Error::Io)?);
            }
        }

        self.call = Some(fd);
        Ok(())
    }

    pub fn set_err(&mut self, fd: OwnedFd) {
        self.err = Some(fd);
    }

    /// Attach the queue and register the kick fd with the request queue.
    ///
    /// Requires the ring addresses and kick fd to be in place. A redundant
    /// enable is a warning, not an error.
    pub fn enable<D>(
        &mut self,
        device: &Arc<D>,
        rq: &RequestQueue,
        mem: GuestMemoryAtomic<GuestMemoryMmap<()>>,
    ) -> Result<(), Error>
    where
        D: Device<Queue = Q>,
    {
        if self.is_enabled() {
            tracing::warn!("[vring][{:02x}] enable on already-enabled vring", self.id);
            return Ok(());
        }

        let kick = self
            .kick
            .as_ref()
            .ok_or(Error::VringNotReady("kick fd"))?
            .as_raw_fd();
        let layout = self.info.layout()?;

        self.shared.lock().queue.attach(mem, layout)?;

        let wired = (|| -> Result<(), Error> {
            if let Some(call) = self.call.as_ref() {
                let dup = call.try_clone().map_err(Error::Io)?;
                self.shared.lock().queue.set_notify_fd(dup);
            }

            let handler = kick_handler(
                self.id,
                kick,
                Arc::clone(device),
                Arc::clone(&self.shared),
                rq.clone(),
            );
            rq.attach(kick, handler)
        })();

        if let Err(error) = wired {
            self.shared.lock().queue.release();
            return Err(error);
        }

        self.shared.lock().enabled = true;
        tracing::debug!("[vring][{:02x}] enabled", self.id);
        Ok(())
    }

    /// Detach the kick fd and release queue state. A redundant disable is a
    /// warning, not an error.
    pub fn disable(&mut self, rq: &RequestQueue) {
        if !self.is_enabled() {
            tracing::warn!("[vring][{:02x}] disable on already-disabled vring", self.id);
            return;
        }

        if let Some(kick) = self.kick.as_ref() {
            rq.detach(kick.as_raw_fd());
        }

        let mut shared = self.shared.lock();
        shared.queue.release();
        shared.enabled = false;
        tracing::debug!("[vring][{:02x}] disabled", self.id);
    }

    /// Disable if needed and drop all client-supplied state, closing the
    /// kick/call/err fds.
    pub fn uninit(&mut self, rq: &RequestQueue) {
        if self.is_enabled() {
            self.disable(rq);
        }

        self.kick = None;
        self.call = None;
        self.err = None;
        self.info = RingInfo::default();
    }
}

fn kick_handler<D>(
    id: u16,
    kick: RawFd,
    device: Arc<D>,
    shared: Arc<Mutex<Shared<D::Queue>>>,
    rq: RequestQueue,
) -> KickHandler
where
    D: Device,
{
    Box::new(move || {
        // Drain the eventfd before touching the ring: a kick raised while
        // we dispatch must leave the fd readable again.
        let mut buf = [0u8; 8];
        match unistd::read(kick, &mut buf) {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(errno) => {
                tracing::warn!(?errno, "[vring][{id:02x}] unable to drain kick fd")
            }
        }

        let mut shared = shared.lock();
        if !shared.enabled {
            tracing::error!("[vring][{id:02x}] kick event on disabled vring");
            return Err(Error::Errno(Errno::EINVAL));
        }

        device.dispatch_requests(id, &mut shared.queue, &rq)
    })
}

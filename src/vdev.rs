//! Vhost device
//!
//! A [`Vdev`] is one vhost-user backend instance: it owns the listening
//! socket, at most one frontend connection, the guest memory map, the vring
//! array and the negotiated feature state. The control plane runs
//! single-threaded on the device's own poll loop; enabled vrings hand their
//! kick fds to the shared [`RequestQueue`] worker.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::sync::Arc;

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use vm_memory::GuestAddress;

use crate::error::{Error, MemoryError, PayloadError};
use crate::inflight::InflightRegion;
use crate::memory::{MemoryMap, MEM_REGIONS_MAX};
use crate::message::{
    self, ConfigSpace, InflightDesc, MemTable, Message, ProtocolFeatures, VringAddr, VringState,
    CONFIG_SPACE_MAX, VHOST_USER_CLOSE_CRYPTO_SESSION, VHOST_USER_CREATE_CRYPTO_SESSION,
    VHOST_USER_F_PROTOCOL_FEATURES, VHOST_USER_GET_CONFIG, VHOST_USER_GET_FEATURES,
    VHOST_USER_GET_INFLIGHT_FD, VHOST_USER_GET_PROTOCOL_FEATURES, VHOST_USER_GET_QUEUE_NUM,
    VHOST_USER_GET_VRING_BASE, VHOST_USER_IOTLB_MSG, VHOST_USER_NET_SET_MTU,
    VHOST_USER_POSTCOPY_ADVISE, VHOST_USER_POSTCOPY_END, VHOST_USER_POSTCOPY_LISTEN,
    VHOST_USER_RESET_OWNER, VHOST_USER_SEND_RARP, VHOST_USER_SET_CONFIG, VHOST_USER_SET_FEATURES,
    VHOST_USER_SET_INFLIGHT_FD, VHOST_USER_SET_LOG_BASE, VHOST_USER_SET_LOG_FD,
    VHOST_USER_SET_MEM_TABLE, VHOST_USER_SET_OWNER, VHOST_USER_SET_PROTOCOL_FEATURES,
    VHOST_USER_SET_SLAVE_REQ_FD, VHOST_USER_SET_VRING_ADDR, VHOST_USER_SET_VRING_BASE,
    VHOST_USER_SET_VRING_CALL, VHOST_USER_SET_VRING_ENABLE, VHOST_USER_SET_VRING_ENDIAN,
    VHOST_USER_SET_VRING_ERR, VHOST_USER_SET_VRING_KICK, VHOST_USER_SET_VRING_NUM,
    VHOST_VRING_IDX_MASK, VHOST_VRING_INVALID_FD,
};
use crate::queue::{VirtQueue, VIRTQ_MAX_SIZE};
use crate::rq::RequestQueue;
use crate::vring::Vring;

const LISTENER: Token = Token(0);
const CONN: Token = Token(1);

/// Feature bits every backend offers regardless of device type
const DEFAULT_FEATURES: u64 = VHOST_USER_F_PROTOCOL_FEATURES;

fn default_protocol_features() -> ProtocolFeatures {
    ProtocolFeatures::MQ
        | ProtocolFeatures::LOG_SHMFD
        | ProtocolFeatures::REPLY_ACK
        | ProtocolFeatures::CONFIG
}

/// Capability set implemented per device variant.
///
/// The core drives negotiation and queue plumbing and never inspects the
/// device beyond these operations. `dispatch_requests` runs on the request
/// queue thread, everything else on the control thread.
pub trait Device: Send + Sync + 'static {
    type Queue: VirtQueue;

    /// Virtio feature bits offered by the device, merged into the backend
    /// defaults at GET_FEATURES
    fn features(&self) -> u64;

    /// Invoked with the negotiated (masked) feature set
    fn set_features(&self, features: u64) -> Result<(), Error>;

    /// Fill `buf` from the device config space, returning the bytes used
    fn config(&self, buf: &mut [u8]) -> usize;

    /// Service pending requests on an enabled vring. The kick eventfd has
    /// already been drained when this runs.
    fn dispatch_requests(
        &self,
        vring: u16,
        queue: &mut Self::Queue,
        rq: &RequestQueue,
    ) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VdevState {
    Initialized,
    Listening,
    Connected,
}

impl VdevState {
    fn name(self) -> &'static str {
        match self {
            VdevState::Initialized => "initialized",
            VdevState::Listening => "listening",
            VdevState::Connected => "connected",
        }
    }
}

/// One vhost-user backend device in server mode
pub struct Vdev<D: Device> {
    device: Arc<D>,
    poll: Poll,
    listener: UnixListener,
    conn: Option<UnixStream>,
    state: VdevState,
    owned: bool,
    supported_features: u64,
    negotiated_features: u64,
    supported_protocol_features: ProtocolFeatures,
    negotiated_protocol_features: ProtocolFeatures,
    max_queues: u16,
    num_queues: u16,
    vrings: Vec<Vring<D::Queue>>,
    memmap: MemoryMap,
    inflight: Option<InflightRegion>,
    rq: RequestQueue,
}

impl<D: Device> Vdev<D> {
    /// Create a backend listening on `socket_path` and move it to the
    /// listening state.
    pub fn new<P: AsRef<Path>>(
        socket_path: P,
        device: Arc<D>,
        max_queues: u16,
        rq: RequestQueue,
    ) -> Result<Self, Error> {
        if max_queues == 0 {
            return Err(Error::InvalidParam("max_queues must be greater than zero"));
        }

        let listener = create_server_socket(socket_path.as_ref())?;
        let poll = Poll::new().map_err(Error::EventLoop)?;

        let mut vrings = Vec::with_capacity(max_queues as usize);
        for id in 0..max_queues {
            vrings.push(Vring::new(id, VIRTQ_MAX_SIZE)?);
        }

        let mut vdev = Self {
            device,
            poll,
            listener,
            conn: None,
            state: VdevState::Initialized,
            owned: false,
            supported_features: 0,
            negotiated_features: 0,
            supported_protocol_features: default_protocol_features(),
            negotiated_protocol_features: ProtocolFeatures::empty(),
            max_queues,
            num_queues: max_queues,
            vrings,
            memmap: MemoryMap::new(),
            inflight: None,
            rq,
        };

        vdev.to_listening()?;
        tracing::info!(path = ?socket_path.as_ref(), "vhost server listening");
        Ok(vdev)
    }

    pub fn state(&self) -> VdevState {
        self.state
    }

    /// Run the control loop, accepting one frontend at a time and servicing
    /// its messages until the process is torn down.
    pub fn run(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(16);

        loop {
            if let Err(error) = self.poll.poll(&mut events, None) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::EventLoop(error));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.handle_accept()?,
                    CONN => {
                        if let Err(error) = self.handle_conn() {
                            tracing::warn!(?error, "connection lost, returning to listening");
                            self.to_listening()?;
                        }
                    }
                    token => tracing::debug!(?token, "event for unknown token"),
                }
            }
        }
    }

    fn handle_accept(&mut self) -> Result<(), Error> {
        let (stream, _peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(error) => {
                tracing::error!(?error, "accept failed");
                return Ok(());
            }
        };

        tracing::info!(fd = stream.as_raw_fd(), "connection established");
        if let Err(error) = self.to_connected(stream) {
            tracing::error!(?error, "unable to enter connected state");
        }

        Ok(())
    }

    fn to_connected(&mut self, mut stream: UnixStream) -> Result<(), Error> {
        if self.state != VdevState::Listening {
            return Err(Error::BadTransition(self.state.name(), "connected"));
        }

        self.poll
            .registry()
            .register(&mut stream, CONN, Interest::READABLE)
            .map_err(Error::EventLoop)?;

        // only one frontend at a time: stop accepting while connected
        self.poll
            .registry()
            .deregister(&mut self.listener)
            .map_err(Error::EventLoop)?;

        self.conn = Some(stream);
        self.state = VdevState::Connected;
        tracing::debug!("device state changed to connected");
        Ok(())
    }

    fn to_listening(&mut self) -> Result<(), Error> {
        match self.state {
            VdevState::Connected => {
                // tear the session down before listening again
                if let Some(conn) = self.conn.as_mut() {
                    self.poll.registry().deregister(conn).ok();
                }

                self.memmap.unmap_all();
                self.owned = false;

                for vring in self.vrings.iter_mut() {
                    vring.uninit(&self.rq);
                }

                self.conn = None;
                self.register_listener()?;
            }
            VdevState::Initialized => self.register_listener()?,
            VdevState::Listening => {
                return Err(Error::BadTransition(self.state.name(), "listening"))
            }
        }

        self.state = VdevState::Listening;
        tracing::debug!("device state changed to listening");
        Ok(())
    }

    fn register_listener(&mut self) -> Result<(), Error> {
        self.poll
            .registry()
            .register(&mut self.listener, LISTENER, Interest::READABLE)
            .map_err(Error::EventLoop)
    }

    fn conn_fd(&self) -> Result<RawFd, Error> {
        self.conn
            .as_ref()
            .map(|conn| conn.as_raw_fd())
            .ok_or(Error::Disconnected)
    }

    /// Drain and handle every message pending on the connection
    fn handle_conn(&mut self) -> Result<(), Error> {
        loop {
            let sock = self.conn_fd()?;
            match message::recv_msg(sock)? {
                Some(msg) => self.handle_request(msg)?,
                None => return Ok(()),
            }
        }
    }

    fn handle_request(&mut self, mut msg: Message) -> Result<(), Error> {
        tracing::debug!(
            req = msg.req,
            flags = format_args!("0x{:x}", msg.flags),
            size = msg.payload.len(),
            "handling request"
        );

        let ret = self.dispatch(&mut msg);

        if matches!(&ret, Err(error) if error.is_fatal()) {
            return ret;
        }

        if let Err(error) = &ret {
            tracing::error!(req = msg.req, ?error, "request failed");
        }

        self.ack_if_needed(&msg, ret)
    }

    /// Send the REPLY_ACK return code when the frontend asked for one and
    /// the request did not already produce its own reply.
    fn ack_if_needed(&mut self, msg: &Message, ret: Result<(), Error>) -> Result<(), Error> {
        if !self
            .negotiated_protocol_features
            .contains(ProtocolFeatures::REPLY_ACK)
        {
            return Ok(());
        }

        if !msg.ack_required() {
            return Ok(());
        }

        if ret.is_ok() {
            match msg.req {
                VHOST_USER_GET_FEATURES
                | VHOST_USER_GET_PROTOCOL_FEATURES
                | VHOST_USER_GET_CONFIG
                | VHOST_USER_GET_QUEUE_NUM
                | VHOST_USER_GET_VRING_BASE => return Ok(()),
                _ => {}
            }
        }

        let code = match &ret {
            Ok(()) => 0u64,
            Err(error) => error.errno() as i32 as u64,
        };

        self.send_u64(msg.req, code)
    }

    fn send_u64(&self, req: u32, value: u64) -> Result<(), Error> {
        message::send_reply(self.conn_fd()?, req, &value.to_le_bytes())
    }

    fn dispatch(&mut self, msg: &mut Message) -> Result<(), Error> {
        match msg.req {
            VHOST_USER_GET_FEATURES => self.get_features(msg),
            VHOST_USER_SET_FEATURES => self.set_features(msg),
            VHOST_USER_SET_OWNER => self.set_owner(),
            VHOST_USER_RESET_OWNER => {
                tracing::warn!("RESET_OWNER is no longer part of the protocol");
                Err(Error::NotSupported(msg.req))
            }
            VHOST_USER_GET_PROTOCOL_FEATURES => self.get_protocol_features(msg),
            VHOST_USER_SET_PROTOCOL_FEATURES => self.set_protocol_features(msg),
            VHOST_USER_GET_CONFIG => self.get_config(msg),
            VHOST_USER_SET_CONFIG => {
                tracing::warn!("SET_CONFIG is not supported");
                Err(Error::NotSupported(msg.req))
            }
            VHOST_USER_SET_MEM_TABLE => self.set_mem_table(msg),
            VHOST_USER_GET_QUEUE_NUM => self.get_queue_num(msg),
            VHOST_USER_SET_VRING_CALL => self.set_vring_call(msg),
            VHOST_USER_SET_VRING_KICK => self.set_vring_kick(msg),
            VHOST_USER_SET_VRING_ERR => self.set_vring_err(msg),
            VHOST_USER_SET_VRING_NUM => self.set_vring_num(msg),
            VHOST_USER_SET_VRING_BASE => self.set_vring_base(msg),
            VHOST_USER_GET_VRING_BASE => self.get_vring_base(msg),
            VHOST_USER_SET_VRING_ADDR => self.set_vring_addr(msg),
            VHOST_USER_SET_VRING_ENABLE => self.set_vring_enable(msg),
            VHOST_USER_GET_INFLIGHT_FD => self.get_inflight_fd(msg),
            VHOST_USER_SET_INFLIGHT_FD => self.set_inflight_fd(msg),
            VHOST_USER_SET_LOG_BASE
            | VHOST_USER_SET_LOG_FD
            | VHOST_USER_SEND_RARP
            | VHOST_USER_NET_SET_MTU
            | VHOST_USER_SET_SLAVE_REQ_FD
            | VHOST_USER_IOTLB_MSG
            | VHOST_USER_SET_VRING_ENDIAN
            | VHOST_USER_CREATE_CRYPTO_SESSION
            | VHOST_USER_CLOSE_CRYPTO_SESSION
            | VHOST_USER_POSTCOPY_ADVISE
            | VHOST_USER_POSTCOPY_LISTEN
            | VHOST_USER_POSTCOPY_END => {
                tracing::warn!(req = msg.req, "request not supported");
                Err(Error::NotSupported(msg.req))
            }
            req => {
                tracing::error!(req, "request not defined");
                Err(Error::UnknownRequest(req))
            }
        }
    }

    fn get_features(&mut self, msg: &Message) -> Result<(), Error> {
        self.supported_features = DEFAULT_FEATURES | self.device.features();
        tracing::trace!(
            features = format_args!("0x{:x}", self.supported_features),
            "get features"
        );
        self.send_u64(msg.req, self.supported_features)
    }

    fn set_features(&mut self, msg: &Message) -> Result<(), Error> {
        let requested: u64 = msg.payload()?;
        let negotiated = requested & self.supported_features;

        if requested & !self.supported_features != 0 {
            tracing::warn!(
                supported = format_args!("0x{:x}", self.supported_features),
                requested = format_args!("0x{requested:x}"),
                negotiated = format_args!("0x{negotiated:x}"),
                "frontend requested device features we do not support"
            );
        }

        self.negotiated_features = negotiated;
        self.device.set_features(negotiated)?;
        tracing::debug!(
            features = format_args!("0x{negotiated:x}"),
            "negotiated device features"
        );
        Ok(())
    }

    fn get_protocol_features(&self, msg: &Message) -> Result<(), Error> {
        tracing::trace!(
            features = format_args!("0x{:x}", self.supported_protocol_features.bits()),
            "get protocol features"
        );
        self.send_u64(msg.req, self.supported_protocol_features.bits())
    }

    fn set_protocol_features(&mut self, msg: &Message) -> Result<(), Error> {
        let requested: u64 = msg.payload()?;
        let supported = self.supported_protocol_features.bits();

        if requested & !supported != 0 {
            tracing::warn!(
                supported = format_args!("0x{supported:x}"),
                requested = format_args!("0x{requested:x}"),
                "frontend ignored our supported protocol features"
            );
        }

        self.negotiated_protocol_features = ProtocolFeatures::from_bits_truncate(requested & supported);
        tracing::debug!(
            features = format_args!("0x{:x}", self.negotiated_protocol_features.bits()),
            "negotiated protocol features"
        );
        Ok(())
    }

    fn set_owner(&mut self) -> Result<(), Error> {
        if self.owned {
            tracing::warn!("frontend attempted to set owner a second time, ignoring");
        }

        self.owned = true;
        Ok(())
    }

    fn get_config(&mut self, msg: &Message) -> Result<(), Error> {
        let space: ConfigSpace = msg.payload()?;
        let cap = (space.size as usize).min(CONFIG_SPACE_MAX);

        let mut buf = [0u8; CONFIG_SPACE_MAX];
        let used = self.device.config(&mut buf[..cap]).min(cap);

        let mut payload = Vec::with_capacity(message::CONFIG_SPACE_HDR_SIZE + used);
        payload.extend_from_slice(&space.offset.to_le_bytes());
        payload.extend_from_slice(&(used as u32).to_le_bytes());
        payload.extend_from_slice(&space.flags.to_le_bytes());
        payload.extend_from_slice(&buf[..used]);

        message::send_reply(self.conn_fd()?, msg.req, &payload)
    }

    fn set_mem_table(&mut self, msg: &mut Message) -> Result<(), Error> {
        if let Some(enabled) = self.vrings.iter().position(|vring| vring.is_enabled()) {
            tracing::error!(vring = enabled, "memory table update while a vring is enabled");
            return Err(Error::VringEnabled(enabled as u32));
        }

        let table: MemTable = msg.payload()?;
        if table.regions.len() > MEM_REGIONS_MAX {
            tracing::error!(nregions = table.regions.len(), "too many memory regions");
            return Err(Error::Memory(MemoryError::BadIndex(
                table.regions.len() as u32
            )));
        }

        let fds = msg.take_fds();
        if fds.len() != table.regions.len() {
            return Err(Error::Payload(PayloadError::FdCountMismatch {
                regions: table.regions.len(),
                fds: fds.len(),
            }));
        }

        for (index, (region, fd)) in table.regions.iter().zip(fds).enumerate() {
            if let Err(error) = self.memmap.map_region(
                index as u32,
                region.guest_addr,
                region.user_addr,
                region.size,
                region.mmap_offset,
                fd,
            ) {
                // roll back accepted regions; unprocessed fds close when the
                // iterator drops
                self.memmap.unmap_all();
                return Err(error.into());
            }
        }

        Ok(())
    }

    fn get_queue_num(&self, msg: &Message) -> Result<(), Error> {
        self.send_u64(msg.req, self.max_queues as u64)
    }

    fn set_vring_kick(&mut self, msg: &mut Message) -> Result<(), Error> {
        let (index, fd) = vring_fd_payload(msg)?;
        tracing::debug!(fd = fd.as_raw_fd(), "[vring][{index:02x}] set kick fd");

        lookup(&mut self.vrings, self.num_queues, index)?.set_kick(fd);

        // without the protocol-features handshake the kick fd doubles as
        // the enable signal
        if self.negotiated_features & VHOST_USER_F_PROTOCOL_FEATURES == 0 {
            let mem = self.memmap.guest_memory()?;
            let vring = lookup(&mut self.vrings, self.num_queues, index)?;
            return vring.enable(&self.device, &self.rq, mem);
        }

        Ok(())
    }

    fn set_vring_call(&mut self, msg: &mut Message) -> Result<(), Error> {
        let (index, fd) = vring_fd_payload(msg)?;
        tracing::debug!(fd = fd.as_raw_fd(), "[vring][{index:02x}] set call fd");
        lookup(&mut self.vrings, self.num_queues, index)?.set_call(fd)
    }

    fn set_vring_err(&mut self, msg: &mut Message) -> Result<(), Error> {
        let (index, fd) = vring_fd_payload(msg)?;
        tracing::debug!(fd = fd.as_raw_fd(), "[vring][{index:02x}] set err fd");
        lookup(&mut self.vrings, self.num_queues, index)?.set_err(fd);
        Ok(())
    }

    fn set_vring_num(&mut self, msg: &Message) -> Result<(), Error> {
        let state: VringState = msg.payload()?;
        tracing::trace!(size = state.num, "[vring][{:02x}] set queue size", state.index);
        lookup_disabled(&mut self.vrings, self.num_queues, state.index)?
            .set_num(state.num as u16);
        Ok(())
    }

    fn set_vring_base(&mut self, msg: &Message) -> Result<(), Error> {
        let state: VringState = msg.payload()?;
        tracing::trace!(base = state.num, "[vring][{:02x}] set base index", state.index);
        lookup_disabled(&mut self.vrings, self.num_queues, state.index)?
            .set_base(state.num as u16);
        Ok(())
    }

    fn get_vring_base(&mut self, msg: &Message) -> Result<(), Error> {
        let state: VringState = msg.payload()?;

        let base = lookup(&mut self.vrings, self.num_queues, state.index)?.last_avail();

        // without the protocol-features handshake GET_VRING_BASE is also
        // the stop signal
        if self.negotiated_features & VHOST_USER_F_PROTOCOL_FEATURES == 0 {
            lookup(&mut self.vrings, self.num_queues, state.index)?.disable(&self.rq);
        }

        tracing::debug!(base, "[vring][{:02x}] report base index", state.index);
        self.send_u64(msg.req, base as u64)
    }

    fn set_vring_addr(&mut self, msg: &Message) -> Result<(), Error> {
        let addr: VringAddr = msg.payload()?;

        lookup_disabled(&mut self.vrings, self.num_queues, addr.index)?;

        let desc = self.resolve_ring_addr(addr.descriptor)?;
        let used = self.resolve_ring_addr(addr.used)?;
        let avail = self.resolve_ring_addr(addr.available)?;

        tracing::debug!(
            desc = format_args!("0x{:x}", desc.0),
            avail = format_args!("0x{:x}", avail.0),
            used = format_args!("0x{:x}", used.0),
            "[vring][{:02x}] set ring addresses",
            addr.index
        );

        lookup(&mut self.vrings, self.num_queues, addr.index)?.set_addr(desc, avail, used);
        Ok(())
    }

    /// A ring component address is valid only if it resolves through the
    /// current memory map.
    fn resolve_ring_addr(&self, uva: u64) -> Result<GuestAddress, Error> {
        if self.memmap.translate_uva(uva).is_none() {
            tracing::error!(uva = format_args!("0x{uva:x}"), "ring address does not resolve");
            return Err(Error::BadAddress(uva));
        }

        self.memmap
            .uva_to_gpa(uva)
            .map(GuestAddress)
            .ok_or(Error::BadAddress(uva))
    }

    fn set_vring_enable(&mut self, msg: &Message) -> Result<(), Error> {
        let state: VringState = msg.payload()?;

        if state.num == 1 {
            let mem = self.memmap.guest_memory()?;
            let vring = lookup(&mut self.vrings, self.num_queues, state.index)?;
            vring.enable(&self.device, &self.rq, mem)
        } else {
            lookup(&mut self.vrings, self.num_queues, state.index)?.disable(&self.rq);
            Ok(())
        }
    }

    fn get_inflight_fd(&mut self, msg: &Message) -> Result<(), Error> {
        let desc: InflightDesc = msg.payload()?;

        if desc.num_queues == 0 || desc.queue_size == 0 {
            return Err(Error::InvalidParam("inflight queue geometry"));
        }

        // a repeated request replaces any earlier region
        self.inflight = None;

        let region = InflightRegion::create(desc.num_queues, desc.queue_size)?;
        let fd = region
            .fd()
            .ok_or(Error::InvalidParam("inflight region has no backing fd"))?;

        let reply = InflightDesc {
            mmap_size: region.size(),
            mmap_offset: 0,
            num_queues: desc.num_queues,
            queue_size: desc.queue_size,
        };

        if let Err(error) =
            message::send_reply_fds(self.conn_fd()?, msg.req, &reply.to_bytes(), &[fd])
        {
            // region drops here, unmapping and closing the memfd
            tracing::error!(?error, "unable to send inflight fd reply");
            return Err(error);
        }

        self.inflight = Some(region);
        Ok(())
    }

    fn set_inflight_fd(&mut self, msg: &mut Message) -> Result<(), Error> {
        let desc: InflightDesc = msg.payload()?;
        let fd = msg.take_fd()?;

        self.inflight = None;
        self.inflight = Some(InflightRegion::from_fd(fd, desc.mmap_size)?);
        Ok(())
    }
}

impl<D: Device> Drop for Vdev<D> {
    fn drop(&mut self) {
        for vring in self.vrings.iter_mut() {
            vring.uninit(&self.rq);
        }
    }
}

fn lookup<'a, Q: VirtQueue>(
    vrings: &'a mut [Vring<Q>],
    num_queues: u16,
    index: u32,
) -> Result<&'a mut Vring<Q>, Error> {
    if index >= num_queues as u32 {
        tracing::error!(index, num_queues, "vring index out of bounds");
        return Err(Error::BadVringIndex(index));
    }

    Ok(&mut vrings[index as usize])
}

fn lookup_disabled<'a, Q: VirtQueue>(
    vrings: &'a mut [Vring<Q>],
    num_queues: u16,
    index: u32,
) -> Result<&'a mut Vring<Q>, Error> {
    let vring = lookup(vrings, num_queues, index)?;
    if vring.is_enabled() {
        tracing::error!(index, "vring is enabled");
        return Err(Error::VringEnabled(index));
    }

    Ok(vring)
}

/// Decode the common vring-fd payload: low bits carry the index, and the
/// invalid-fd bit means polling mode, which is unsupported.
fn vring_fd_payload(msg: &mut Message) -> Result<(u32, OwnedFd), Error> {
    let payload: u64 = msg.payload()?;

    if payload & VHOST_VRING_INVALID_FD != 0 {
        tracing::error!("vring polling mode is not supported");
        return Err(Error::NotSupported(msg.req));
    }

    let fd = msg.take_fd()?;
    Ok(((payload & VHOST_VRING_IDX_MASK) as u32, fd))
}

/// Stat the socket path: absent is fine, a stale socket is unlinked,
/// anything else is refused.
fn prepare_socket_path(path: &Path) -> Result<(), Error> {
    match std::fs::metadata(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(Error::Io(error)),
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path).map_err(Error::Io)
        }
        Ok(_) => Err(Error::BadSocketPath),
    }
}

fn create_server_socket(path: &Path) -> Result<UnixListener, Error> {
    prepare_socket_path(path)?;

    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;

    let addr = UnixAddr::new(path)?;
    socket::bind(fd.as_raw_fd(), &addr)?;

    // single frontend at a time
    socket::listen(&fd, Backlog::new(1)?)?;

    Ok(UnixListener::from_std(StdUnixListener::from(fd)))
}

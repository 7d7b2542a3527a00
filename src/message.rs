//! vhost-user wire protocol
//!
//! Messages are a fixed 12-byte header (request id, flags, payload size)
//! followed by `size` bytes of payload, with up to [`VHOST_USER_MAX_FDS`]
//! file descriptors carried in SCM_RIGHTS ancillary data.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::unistd;

use crate::error::{Error, PayloadError};

pub const VHOST_USER_HDR_SIZE: usize = 12;

/// Maximum file descriptors in a single message's ancillary data
pub const VHOST_USER_MAX_FDS: usize = 8;

/// Generous upper bound over the largest defined payload (config space)
pub const VHOST_USER_MAX_PAYLOAD_SIZE: usize = 512;

pub const VHOST_USER_GET_FEATURES: u32 = 1;
pub const VHOST_USER_SET_FEATURES: u32 = 2;
pub const VHOST_USER_SET_OWNER: u32 = 3;
pub const VHOST_USER_RESET_OWNER: u32 = 4;
pub const VHOST_USER_SET_MEM_TABLE: u32 = 5;
pub const VHOST_USER_SET_LOG_BASE: u32 = 6;
pub const VHOST_USER_SET_LOG_FD: u32 = 7;
pub const VHOST_USER_SET_VRING_NUM: u32 = 8;
pub const VHOST_USER_SET_VRING_ADDR: u32 = 9;
pub const VHOST_USER_SET_VRING_BASE: u32 = 10;
pub const VHOST_USER_GET_VRING_BASE: u32 = 11;
pub const VHOST_USER_SET_VRING_KICK: u32 = 12;
pub const VHOST_USER_SET_VRING_CALL: u32 = 13;
pub const VHOST_USER_SET_VRING_ERR: u32 = 14;
pub const VHOST_USER_GET_PROTOCOL_FEATURES: u32 = 15;
pub const VHOST_USER_SET_PROTOCOL_FEATURES: u32 = 16;
pub const VHOST_USER_GET_QUEUE_NUM: u32 = 17;
pub const VHOST_USER_SET_VRING_ENABLE: u32 = 18;
pub const VHOST_USER_SEND_RARP: u32 = 19;
pub const VHOST_USER_NET_SET_MTU: u32 = 20;
pub const VHOST_USER_SET_SLAVE_REQ_FD: u32 = 21;
pub const VHOST_USER_IOTLB_MSG: u32 = 22;
pub const VHOST_USER_SET_VRING_ENDIAN: u32 = 23;
pub const VHOST_USER_GET_CONFIG: u32 = 24;
pub const VHOST_USER_SET_CONFIG: u32 = 25;
pub const VHOST_USER_CREATE_CRYPTO_SESSION: u32 = 26;
pub const VHOST_USER_CLOSE_CRYPTO_SESSION: u32 = 27;
pub const VHOST_USER_POSTCOPY_ADVISE: u32 = 28;
pub const VHOST_USER_POSTCOPY_LISTEN: u32 = 29;
pub const VHOST_USER_POSTCOPY_END: u32 = 30;
pub const VHOST_USER_GET_INFLIGHT_FD: u32 = 31;
pub const VHOST_USER_SET_INFLIGHT_FD: u32 = 32;

pub const VHOST_USER_FLAG_VERSION_1: u32 = 0x01;
pub const VHOST_USER_FLAG_REPLY: u32 = 0x04;
pub const VHOST_USER_FLAG_REPLY_ACK: u32 = 0x08;

/// Low bits of a vring fd payload carry the vring index
pub const VHOST_VRING_IDX_MASK: u64 = 0xff;

/// Set when no fd accompanies a vring fd message (polling mode)
pub const VHOST_VRING_INVALID_FD: u64 = 0x100;

/// Virtio feature bit signalling support for the protocol-features handshake
pub const VHOST_USER_F_PROTOCOL_FEATURES: u64 = 1 << 30;

bitflags::bitflags! {
    /// vhost-user protocol feature bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolFeatures: u64 {
        const MQ = 1 << 0;
        const LOG_SHMFD = 1 << 1;
        const RARP = 1 << 2;
        const REPLY_ACK = 1 << 3;
        const NET_MTU = 1 << 4;
        const BACKEND_REQ = 1 << 5;
        const CROSS_ENDIAN = 1 << 6;
        const CRYPTO_SESSION = 1 << 7;
        const PAGEFAULT = 1 << 8;
        const CONFIG = 1 << 9;
    }
}

/// Helper trait to convert from a slice of bytes into a vhost-user payload type
pub trait TryFromPayload: Sized {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError>;
}

fn le_u16(pkt: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&pkt[off..off + 2]);
    u16::from_le_bytes(b)
}

fn le_u32(pkt: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&pkt[off..off + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(pkt: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&pkt[off..off + 8]);
    u64::from_le_bytes(b)
}

fn check_len(pkt: &[u8], expected: usize) -> Result<(), PayloadError> {
    if pkt.len() < expected {
        return Err(PayloadError::NotEnoughData {
            got: pkt.len(),
            expected,
        });
    }
    Ok(())
}

impl TryFromPayload for u64 {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        check_len(pkt, 8)?;
        Ok(le_u64(pkt, 0))
    }
}

/// Vring state description: index plus a request-specific value
#[derive(Clone, Copy, Debug)]
pub struct VringState {
    pub index: u32,
    pub num: u32,
}

impl TryFromPayload for VringState {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        check_len(pkt, 8)?;
        Ok(Self {
            index: le_u32(pkt, 0),
            num: le_u32(pkt, 4),
        })
    }
}

/// Vring address description, all ring addresses in frontend userspace
#[derive(Clone, Copy, Debug)]
pub struct VringAddr {
    pub index: u32,
    pub flags: u32,
    pub descriptor: u64,
    pub used: u64,
    pub available: u64,
    pub log: u64,
}

impl TryFromPayload for VringAddr {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        check_len(pkt, 40)?;
        Ok(Self {
            index: le_u32(pkt, 0),
            flags: le_u32(pkt, 4),
            descriptor: le_u64(pkt, 8),
            used: le_u64(pkt, 16),
            available: le_u64(pkt, 24),
            log: le_u64(pkt, 32),
        })
    }
}

/// A single guest memory region description
#[derive(Clone, Copy, Debug)]
pub struct MemRegion {
    pub guest_addr: u64,
    pub size: u64,
    pub user_addr: u64,
    pub mmap_offset: u64,
}

const MEM_REGION_SIZE: usize = 32;

/// SET_MEM_TABLE payload: region count plus region descriptions
#[derive(Clone, Debug)]
pub struct MemTable {
    pub regions: Vec<MemRegion>,
}

impl TryFromPayload for MemTable {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        check_len(pkt, 8)?;
        let nregions = le_u32(pkt, 0) as usize;
        check_len(pkt, 8 + nregions * MEM_REGION_SIZE)?;

        let mut regions = Vec::with_capacity(nregions);
        for i in 0..nregions {
            let off = 8 + i * MEM_REGION_SIZE;
            regions.push(MemRegion {
                guest_addr: le_u64(pkt, off),
                size: le_u64(pkt, off + 8),
                user_addr: le_u64(pkt, off + 16),
                mmap_offset: le_u64(pkt, off + 24),
            });
        }

        Ok(Self { regions })
    }
}

/// Inflight buffer description exchanged by GET/SET_INFLIGHT_FD
#[derive(Clone, Copy, Debug)]
pub struct InflightDesc {
    pub mmap_size: u64,
    pub mmap_offset: u64,
    pub num_queues: u16,
    pub queue_size: u16,
}

impl TryFromPayload for InflightDesc {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        check_len(pkt, 20)?;
        Ok(Self {
            mmap_size: le_u64(pkt, 0),
            mmap_offset: le_u64(pkt, 8),
            num_queues: le_u16(pkt, 16),
            queue_size: le_u16(pkt, 18),
        })
    }
}

impl InflightDesc {
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.mmap_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.mmap_offset.to_le_bytes());
        buf[16..18].copy_from_slice(&self.num_queues.to_le_bytes());
        buf[18..20].copy_from_slice(&self.queue_size.to_le_bytes());
        buf
    }
}

/// Leading fields of a GET_CONFIG payload, ahead of the config bytes
#[derive(Clone, Copy, Debug)]
pub struct ConfigSpace {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

pub const CONFIG_SPACE_HDR_SIZE: usize = 12;
pub const CONFIG_SPACE_MAX: usize = 256;

impl TryFromPayload for ConfigSpace {
    fn try_from_payload(pkt: &[u8]) -> Result<Self, PayloadError> {
        check_len(pkt, CONFIG_SPACE_HDR_SIZE)?;
        Ok(Self {
            offset: le_u32(pkt, 0),
            size: le_u32(pkt, 4),
            flags: le_u32(pkt, 8),
        })
    }
}

/// One received vhost-user message with any fds passed alongside it
#[derive(Debug)]
pub struct Message {
    pub req: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl Message {
    /// True when the frontend asked for a REPLY_ACK on this message
    pub fn ack_required(&self) -> bool {
        self.flags & VHOST_USER_FLAG_REPLY_ACK != 0
    }

    /// Decode the payload as `T`
    pub fn payload<T: TryFromPayload>(&self) -> Result<T, PayloadError> {
        T::try_from_payload(&self.payload)
    }

    /// Take ownership of the next passed file descriptor
    pub fn take_fd(&mut self) -> Result<OwnedFd, PayloadError> {
        self.fds.pop_front().ok_or(PayloadError::MissingFd)
    }

    /// Take ownership of every passed file descriptor
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds).into()
    }
}

fn io_err(errno: Errno) -> Error {
    Error::Io(io::Error::from_raw_os_error(errno as i32))
}

/// Receive one message from the connection socket.
///
/// Returns `Ok(None)` when the socket has no pending data. The header is
/// read with `recvmsg` so ancillary fds are captured; the payload follows
/// with a plain read. Short reads are protocol errors, not retried.
pub fn recv_msg(sock: RawFd) -> Result<Option<Message>, Error> {
    let mut hdr = [0u8; VHOST_USER_HDR_SIZE];

    let (bytes, fds) = {
        let mut cmsgs = nix::cmsg_space!([RawFd; VHOST_USER_MAX_FDS]);
        let mut iovs = [IoSliceMut::new(&mut hdr)];
        let rmsg =
            match socket::recvmsg::<()>(sock, &mut iovs, Some(&mut cmsgs), MsgFlags::MSG_DONTWAIT)
            {
                Ok(rmsg) => rmsg,
                Err(Errno::EWOULDBLOCK) => return Ok(None),
                Err(errno) => return Err(io_err(errno)),
            };

        let mut fds = VecDeque::new();
        for cmsg in rmsg.cmsgs() {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // adopt passed fds immediately so every error path closes them
                fds.extend(
                    raw.into_iter()
                        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                );
            }
        }

        (rmsg.bytes, fds)
    };

    if bytes == 0 {
        return Err(Error::Disconnected);
    }

    if bytes != VHOST_USER_HDR_SIZE {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short header read: {bytes} of {VHOST_USER_HDR_SIZE} bytes"),
        )));
    }

    let req = le_u32(&hdr, 0);
    let flags = le_u32(&hdr, 4);
    let size = le_u32(&hdr, 8) as usize;

    if size > VHOST_USER_MAX_PAYLOAD_SIZE {
        return Err(Error::Payload(PayloadError::TooLarge {
            got: size,
            max: VHOST_USER_MAX_PAYLOAD_SIZE,
        }));
    }

    let mut payload = vec![0u8; size];
    if size > 0 {
        let read = unistd::read(sock, &mut payload).map_err(io_err)?;
        if read != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short payload read: {read} of {size} bytes"),
            )));
        }
    }

    tracing::trace!(req, flags, size, nfds = fds.len(), "received message");

    Ok(Some(Message {
        req,
        flags,
        payload,
        fds,
    }))
}

/// Send one message, optionally carrying fds in ancillary data.
///
/// Header and payload go out in a single `sendmsg`; a short write is a
/// protocol error.
pub fn send_msg(
    sock: RawFd,
    req: u32,
    flags: u32,
    payload: &[u8],
    fds: &[RawFd],
) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(VHOST_USER_HDR_SIZE + payload.len());
    buf.extend_from_slice(&req.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);

    let iov = [IoSlice::new(&buf)];
    let cmsg = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &cmsg };

    let sent = socket::sendmsg::<()>(sock, &iov, cmsgs, MsgFlags::empty(), None).map_err(io_err)?;
    if sent != buf.len() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {sent} of {} bytes", buf.len()),
        )));
    }

    Ok(())
}

/// Send a backend-originated reply to `req`
pub fn send_reply(sock: RawFd, req: u32, payload: &[u8]) -> Result<(), Error> {
    send_msg(
        sock,
        req,
        VHOST_USER_FLAG_VERSION_1 | VHOST_USER_FLAG_REPLY,
        payload,
        &[],
    )
}

/// Send a backend-originated reply carrying fds
pub fn send_reply_fds(sock: RawFd, req: u32, payload: &[u8], fds: &[RawFd]) -> Result<(), Error> {
    send_msg(
        sock,
        req,
        VHOST_USER_FLAG_VERSION_1 | VHOST_USER_FLAG_REPLY,
        payload,
        fds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_u64_payload() {
        let pkt = 0xdead_beef_u64.to_le_bytes();
        assert_eq!(u64::try_from_payload(&pkt).unwrap(), 0xdead_beef);
        assert!(u64::try_from_payload(&pkt[..4]).is_err());
    }

    #[test]
    fn parse_vring_state() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&3u32.to_le_bytes());
        pkt.extend_from_slice(&256u32.to_le_bytes());

        let state = VringState::try_from_payload(&pkt).unwrap();
        assert_eq!(state.index, 3);
        assert_eq!(state.num, 256);
    }

    #[test]
    fn parse_vring_addr() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&0u32.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes());
        pkt.extend_from_slice(&0x1000u64.to_le_bytes());
        pkt.extend_from_slice(&0x3000u64.to_le_bytes());
        pkt.extend_from_slice(&0x2000u64.to_le_bytes());
        pkt.extend_from_slice(&0u64.to_le_bytes());

        let addr = VringAddr::try_from_payload(&pkt).unwrap();
        assert_eq!(addr.descriptor, 0x1000);
        assert_eq!(addr.used, 0x3000);
        assert_eq!(addr.available, 0x2000);
    }

    #[test]
    fn parse_mem_table() {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&2u32.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes());
        for i in 0..2u64 {
            pkt.extend_from_slice(&(i * 0x10000).to_le_bytes());
            pkt.extend_from_slice(&0x10000u64.to_le_bytes());
            pkt.extend_from_slice(&(0x7f00_0000_0000 + i * 0x10000).to_le_bytes());
            pkt.extend_from_slice(&0u64.to_le_bytes());
        }

        let table = MemTable::try_from_payload(&pkt).unwrap();
        assert_eq!(table.regions.len(), 2);
        assert_eq!(table.regions[1].guest_addr, 0x10000);
        assert_eq!(table.regions[1].user_addr, 0x7f00_0001_0000);

        // region count pointing past the payload is rejected
        pkt[0] = 3;
        assert!(MemTable::try_from_payload(&pkt).is_err());
    }

    #[test]
    fn inflight_desc_round_trip() {
        let desc = InflightDesc {
            mmap_size: 4096,
            mmap_offset: 0,
            num_queues: 2,
            queue_size: 128,
        };

        let parsed = InflightDesc::try_from_payload(&desc.to_bytes()).unwrap();
        assert_eq!(parsed.mmap_size, 4096);
        assert_eq!(parsed.num_queues, 2);
        assert_eq!(parsed.queue_size, 128);
    }

    #[test]
    fn ack_flag_detection() {
        let msg = Message {
            req: VHOST_USER_SET_OWNER,
            flags: VHOST_USER_FLAG_VERSION_1 | VHOST_USER_FLAG_REPLY_ACK,
            payload: Vec::new(),
            fds: VecDeque::new(),
        };
        assert!(msg.ack_required());

        let msg = Message {
            req: VHOST_USER_SET_OWNER,
            flags: VHOST_USER_FLAG_VERSION_1,
            payload: Vec::new(),
            fds: VecDeque::new(),
        };
        assert!(!msg.ack_required());
    }
}

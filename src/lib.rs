//! vhost-user backend server
//!
//! Serves virtio device queues on behalf of a frontend (a VMM such as qemu)
//! over a unix domain socket. The crate owns the control plane: accepting
//! the frontend connection, negotiating features, mapping guest memory from
//! passed fds and wiring eventfd kicks to a request-queue worker. Device
//! behavior plugs in through the [`Device`] trait.

pub mod config;
pub mod error;
pub mod inflight;
pub mod memory;
pub mod message;
pub mod queue;
pub mod rq;
pub mod vdev;
pub mod vring;

pub use error::Error;
pub use queue::{Chain, QueueLayout, SplitQueue, VirtQueue};
pub use rq::RequestQueue;
pub use vdev::{Device, Vdev, VdevState};
pub use vring::Vring;

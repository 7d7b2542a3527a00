use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::Level;

use vhost_server::config::Config;
use vhost_server::{Device, Error, RequestQueue, SplitQueue, Vdev};

const VIRTIO_F_VERSION_1: u64 = 1 << 32;

#[derive(Parser)]
struct Opts {
    /// Path to configuration file, overrides the other options
    config: Option<PathBuf>,

    /// Path to the unix socket qemu's vhost-user device connects to
    #[arg(short, long, default_value = "/tmp/vhost-server.sock")]
    socket: PathBuf,

    /// Number of virtqueues to expose
    #[arg(short, long, default_value_t = 1)]
    queues: u16,

    /// Control the level of output to stdout (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Backend that completes every request without touching the data, for
/// driving the protocol during bring-up.
struct NullDevice;

impl Device for NullDevice {
    type Queue = SplitQueue;

    fn features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    fn set_features(&self, features: u64) -> Result<(), Error> {
        tracing::debug!(features = format_args!("0x{features:x}"), "features set");
        Ok(())
    }

    fn config(&self, _buf: &mut [u8]) -> usize {
        0
    }

    fn dispatch_requests(
        &self,
        vring: u16,
        queue: &mut SplitQueue,
        _rq: &RequestQueue,
    ) -> Result<(), Error> {
        let chains = queue.drain()?;
        tracing::debug!(count = chains.len(), "[vring][{vring:02x}] completing requests");

        for chain in chains {
            queue.complete(chain.head, 0)?;
        }

        Ok(())
    }
}

fn run(opts: Opts) -> Result<()> {
    let (socket, queues) = match opts.config {
        Some(path) => {
            let cfg = Config::load(path)?;
            tracing::debug!(?cfg, "configuration");
            (cfg.socket, cfg.device.queues)
        }
        None => (opts.socket, opts.queues),
    };

    let rq = RequestQueue::new()?;
    let mut vdev = Vdev::new(socket, Arc::new(NullDevice), queues, rq)?;
    vdev.run()?;

    Ok(())
}

fn main() {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .init();

    if let Err(error) = run(opts) {
        tracing::error!(?error, "unable to run vhost-server");
    }
}

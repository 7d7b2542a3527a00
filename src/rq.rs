//! Request queue
//!
//! Data-plane side of the backend: a dedicated worker thread polling kick
//! eventfds and running their handlers. The control thread attaches and
//! detaches fds through a command channel; detach is synchronous so the
//! caller can safely release queue state once it returns (the worker has
//! finished any in-flight handler and dropped the callback by then).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};

use crate::error::Error;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Callback invoked when an attached fd becomes readable
pub type KickHandler = Box<dyn FnMut() -> Result<(), Error> + Send>;

enum Command {
    Attach {
        fd: RawFd,
        handler: KickHandler,
        done: flume::Sender<io::Result<()>>,
    },
    Detach {
        fd: RawFd,
        done: flume::Sender<()>,
    },
    Shutdown,
}

struct Inner {
    cmds: flume::Sender<Command>,
    waker: Waker,
    worker: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cmds.send(Command::Shutdown).ok();
        self.waker.wake().ok();

        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

/// Handle to the request queue worker thread
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    /// Spawn the worker thread with its own poll instance
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (cmds, rx) = flume::unbounded();

        let worker = std::thread::Builder::new()
            .name(String::from("vhost-rq"))
            .spawn(move || worker_loop(poll, rx))?;

        Ok(Self {
            inner: Arc::new(Inner {
                cmds,
                waker,
                worker: Some(worker),
            }),
        })
    }

    /// Register `fd` with the worker; `handler` runs on the worker thread
    /// whenever the fd is readable. Waits for the registration result.
    pub fn attach(&self, fd: RawFd, handler: KickHandler) -> Result<(), Error> {
        let (done, result) = flume::bounded(1);

        self.inner
            .cmds
            .send(Command::Attach { fd, handler, done })
            .map_err(|_| Error::EventLoop(worker_gone()))?;
        self.inner.waker.wake().map_err(Error::EventLoop)?;

        match result.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Error::EventLoop(error)),
            Err(_) => Err(Error::EventLoop(worker_gone())),
        }
    }

    /// Remove `fd` from the worker, blocking until its handler is dropped
    pub fn detach(&self, fd: RawFd) {
        let (done, detached) = flume::bounded(1);

        if self
            .inner
            .cmds
            .send(Command::Detach { fd, done })
            .is_err()
        {
            tracing::warn!(fd, "request queue worker is gone, nothing to detach");
            return;
        }

        if let Err(error) = self.inner.waker.wake() {
            tracing::warn!(?error, "unable to wake request queue worker");
        }

        if detached.recv_timeout(Duration::from_secs(5)).is_err() {
            tracing::warn!(fd, "timed out waiting for detach");
        }
    }
}

fn worker_gone() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "request queue worker is gone")
}

fn worker_loop(mut poll: Poll, rx: flume::Receiver<Command>) {
    let mut handlers: HashMap<Token, KickHandler> = HashMap::new();
    let mut events = Events::with_capacity(16);

    'run: loop {
        if let Err(error) = poll.poll(&mut events, None) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }

            tracing::error!(?error, "request queue poll failed");
            break;
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    while let Ok(cmd) = rx.try_recv() {
                        match cmd {
                            Command::Attach { fd, handler, done } => {
                                let token = Token(fd as usize);
                                let res = poll.registry().register(
                                    &mut SourceFd(&fd),
                                    token,
                                    Interest::READABLE,
                                );

                                if res.is_ok() {
                                    handlers.insert(token, handler);
                                }
                                done.send(res).ok();
                            }
                            Command::Detach { fd, done } => {
                                let token = Token(fd as usize);
                                if handlers.remove(&token).is_some() {
                                    poll.registry().deregister(&mut SourceFd(&fd)).ok();
                                }
                                done.send(()).ok();
                            }
                            Command::Shutdown => break 'run,
                        }
                    }
                }
                token => match handlers.get_mut(&token) {
                    Some(handler) => {
                        if let Err(error) = handler() {
                            tracing::warn!(?error, "kick handler failed");
                        }
                    }
                    None => tracing::debug!(?token, "event for unknown fd"),
                },
            }
        }
    }

    tracing::debug!("request queue worker stopped");
}

// src/core/multiplexer/epoll.rs

//! Linux `epoll` implementation of [`Multiplexer`].

use super::{EventKind, Multiplexer, ReadinessHandler};
use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLONESHOT, epoll_event,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Number of events claimed from the kernel per `epoll_wait`.
const MAX_EVENTS: usize = 64;

/// `epoll_wait` timeout; bounds how long `shutdown` waits for the poller.
const WAIT_TIMEOUT_MS: i32 = 100;

struct Interest {
    handler: ReadinessHandler,
    persistent: bool,
}

#[derive(Default)]
struct Entry {
    read: Option<Interest>,
    error: Option<Interest>,
}

impl Entry {
    fn mask(&self) -> u32 {
        let mut mask = 0u32;
        if self.read.is_some() {
            mask |= EPOLLIN as u32;
        }
        // EPOLLERR and EPOLLHUP are always reported; listing them is harmless.
        if self.error.is_some() {
            mask |= (EPOLLERR | EPOLLHUP) as u32;
        }
        // The kernel disables the descriptor after each report until the
        // owner re-arms it, so a pending dispatch is never reported again.
        if mask != 0 {
            mask |= EPOLLONESHOT as u32;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.error.is_none()
    }

    /// Picks the handler to run for `flags`, consuming it if it is one-shot.
    ///
    /// A failure goes to the error handler while it is registered and falls
    /// back to the read handler afterwards, so the owner gets to observe the
    /// failure through its next read.
    fn take_ready(&mut self, flags: u32) -> Option<(EventKind, ReadinessHandler)> {
        let failed = flags & (EPOLLERR | EPOLLHUP) as u32 != 0;
        if failed && self.error.is_some() {
            return fire(&mut self.error, EventKind::Error);
        }
        if flags & EPOLLIN as u32 != 0 || failed {
            return fire(&mut self.read, EventKind::Read);
        }
        None
    }
}

fn fire(slot: &mut Option<Interest>, kind: EventKind) -> Option<(EventKind, ReadinessHandler)> {
    let interest = slot.as_ref()?;
    let handler = interest.handler.clone();
    if !interest.persistent {
        *slot = None;
    }
    Some((kind, handler))
}

struct Inner {
    epfd: RawFd,
    entries: Mutex<HashMap<RawFd, Entry>>,
    running: AtomicBool,
}

impl Inner {
    fn ctl(&self, op: i32, descriptor: RawFd, events: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events,
            u64: descriptor as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.epfd, op, descriptor, &mut event) };
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

/// A level-triggered, one-shot `epoll` multiplexer with its own polling thread.
///
/// Handlers are invoked on the polling thread, outside the registration lock.
/// Each report disarms the descriptor; [`Multiplexer::rearm`] turns it back on
/// with whatever interest is still registered.
pub struct EpollMultiplexer {
    inner: Arc<Inner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl EpollMultiplexer {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                epfd,
                entries: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            poller: Mutex::new(None),
        })
    }

    /// Starts the polling thread. Calling it again is a no-op.
    pub fn start(&self) -> io::Result<()> {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("epoll-poller".to_string())
            .spawn(move || poll_loop(inner))?;
        *poller = Some(handle);
        info!("Epoll multiplexer started.");
        Ok(())
    }

    /// Stops and joins the polling thread.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.poller.lock().take() {
            if handle.join().is_err() {
                error!("Epoll polling thread panicked.");
            }
            info!("Epoll multiplexer stopped.");
        }
    }

    /// Number of descriptors with at least one live registration.
    pub fn registered(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

impl Drop for EpollMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Multiplexer for EpollMultiplexer {
    fn register_interest(
        &self,
        descriptor: RawFd,
        kind: EventKind,
        handler: ReadinessHandler,
        persistent: bool,
    ) -> io::Result<()> {
        let mut entries = self.inner.entries.lock();
        let existed = entries.contains_key(&descriptor);
        let entry = entries.entry(descriptor).or_default();
        let interest = Some(Interest {
            handler,
            persistent,
        });
        match kind {
            EventKind::Read => entry.read = interest,
            EventKind::Error => entry.error = interest,
        }

        let op = if existed { EPOLL_CTL_MOD } else { EPOLL_CTL_ADD };
        if let Err(e) = self.inner.ctl(op, descriptor, entry.mask()) {
            if !existed {
                entries.remove(&descriptor);
            }
            return Err(e);
        }
        Ok(())
    }

    fn deregister(&self, descriptor: RawFd) -> io::Result<()> {
        if self.inner.entries.lock().remove(&descriptor).is_none() {
            return Ok(());
        }
        match self.inner.ctl(EPOLL_CTL_DEL, descriptor, 0) {
            Ok(()) => Ok(()),
            // The socket may already be closed, which removes it from the set.
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn rearm(&self, descriptor: RawFd) -> io::Result<()> {
        let entries = self.inner.entries.lock();
        match entries.get(&descriptor) {
            Some(entry) => self.inner.ctl(EPOLL_CTL_MOD, descriptor, entry.mask()),
            None => Ok(()),
        }
    }
}

fn poll_loop(inner: Arc<Inner>) {
    let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    while inner.running.load(Ordering::Acquire) {
        let n = unsafe {
            libc::epoll_wait(
                inner.epfd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                WAIT_TIMEOUT_MS,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("epoll_wait failed, stopping the poller: {}", err);
            break;
        }

        let mut ready = Vec::with_capacity(n as usize);
        {
            let mut entries = inner.entries.lock();
            for event in &events[..n as usize] {
                let descriptor = event.u64 as RawFd;
                let flags = event.events;
                let Some(entry) = entries.get_mut(&descriptor) else {
                    continue;
                };
                let fired = entry.take_ready(flags);
                if entry.is_empty() {
                    entries.remove(&descriptor);
                    if let Err(e) = inner.ctl(EPOLL_CTL_DEL, descriptor, 0) {
                        debug!("Dropping exhausted descriptor {} failed: {}", descriptor, e);
                    }
                } else if fired.is_none() {
                    // Nobody will handle this report, so nobody would re-arm.
                    if let Err(e) = inner.ctl(EPOLL_CTL_MOD, descriptor, entry.mask()) {
                        debug!("Re-arming descriptor {} failed: {}", descriptor, e);
                    }
                }
                if let Some(fired) = fired {
                    ready.push(fired);
                }
            }
        }

        for (kind, handler) in ready {
            handler(kind);
        }
    }
    debug!("Epoll polling loop exited.");
}

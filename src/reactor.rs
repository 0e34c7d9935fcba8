// src/reactor.rs
use crate::task::TaskId;
use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use std::{io, os::unix::io::RawFd, time::Duration};

/// Which readiness a parked task is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    Read,
    Write,
}

impl IoDir {
    #[inline]
    fn interest(self) -> Interest {
        match self {
            IoDir::Read => Interest::READABLE,
            IoDir::Write => Interest::WRITABLE,
        }
    }
}

/// One readiness report out of a multiplexing call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoEvent {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// The descriptor wait table plus the OS multiplexer behind it.
///
/// Entries live in parallel arrays and are compacted by swap-with-last
/// removal, so positions are unstable and never handed out. The same fd may
/// appear in several entries (one task reading, another writing); the mio
/// registration always carries the union of the remaining interests.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    fds: Vec<RawFd>,
    dirs: Vec<IoDir>,
    owners: Vec<TaskId>,
}

impl Reactor {
    /// Panics when the OS multiplexer cannot be created: a process without
    /// one cannot run this scheduler at all.
    pub(crate) fn new() -> Self {
        Self {
            poll: Poll::new().expect("create OS poll instance"),
            events: Events::with_capacity(1024),
            fds: Vec::new(),
            dirs: Vec::new(),
            owners: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.fds.len()
    }

    #[inline]
    pub(crate) fn fd(&self, i: usize) -> RawFd {
        self.fds[i]
    }

    #[inline]
    pub(crate) fn dir(&self, i: usize) -> IoDir {
        self.dirs[i]
    }

    #[inline]
    pub(crate) fn owner(&self, i: usize) -> TaskId {
        self.owners[i]
    }

    fn combined_interest(&self, fd: RawFd) -> Option<Interest> {
        let mut acc: Option<Interest> = None;
        for i in 0..self.fds.len() {
            if self.fds[i] == fd {
                let int = self.dirs[i].interest();
                acc = Some(match acc {
                    Some(prev) => prev | int,
                    None => int,
                });
            }
        }
        acc
    }

    /// Append a wait entry. The descriptor must be non-blocking and
    /// poll-compatible; registering one that isn't is a caller contract
    /// violation and aborts.
    pub(crate) fn add(&mut self, fd: RawFd, dir: IoDir, owner: TaskId) {
        let already = self.combined_interest(fd);
        self.fds.push(fd);
        self.dirs.push(dir);
        self.owners.push(owner);

        let interest = match already {
            Some(prev) => prev | dir.interest(),
            None => dir.interest(),
        };
        let registry = self.poll.registry();
        let res = if already.is_some() {
            registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        } else {
            registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
        };
        res.unwrap_or_else(|e| panic!("register fd {fd} with the multiplexer: {e}"));
    }

    /// Swap-with-last removal of entry `i`, fixing up the OS registration
    /// for any remaining entries on the same fd. Deregistration failures
    /// are ignored: the descriptor may already be closed.
    pub(crate) fn remove(&mut self, i: usize) -> (RawFd, TaskId) {
        let fd = self.fds.swap_remove(i);
        self.dirs.swap_remove(i);
        let owner = self.owners.swap_remove(i);

        match self.combined_interest(fd) {
            Some(interest) => {
                let _ = self
                    .poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest);
            }
            None => {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
        (fd, owner)
    }

    /// Remove and return the tail entry, if any.
    pub(crate) fn pop(&mut self) -> Option<(RawFd, TaskId)> {
        if self.fds.is_empty() {
            None
        } else {
            Some(self.remove(self.fds.len() - 1))
        }
    }

    /// One multiplexing call over the whole table. EINTR reads as an empty
    /// wakeup; any other failure propagates.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<IoEvent>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|ev| IoEvent {
                fd: ev.token().0 as RawFd,
                // Errors and half-closes surface as readiness so parked
                // tasks retry and observe the failure themselves.
                readable: ev.is_readable() || ev.is_read_closed() || ev.is_error(),
                writable: ev.is_writable() || ev.is_write_closed() || ev.is_error(),
            })
            .collect())
    }
}

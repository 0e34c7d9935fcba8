// src/sock.rs
use crate::task::Cx;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

/// Outcome of driving a transfer one step.
#[derive(Debug)]
pub enum Drive {
    /// Interest registered, caller should yield and drive again on resume.
    Pending,
    /// Transfer complete; the full requested byte count.
    Done(usize),
    /// Peer closed before the transfer completed; bytes consumed so far.
    Closed(usize),
    /// Hard I/O failure (including an elapsed wait deadline, surfaced as
    /// `TimedOut`). The caller owns connection teardown.
    Fatal(io::Error),
}

/// Errors worth re-arming for instead of failing the transfer. A TLS layer
/// surfaces its renegotiation wants the same way, as `WouldBlock` on the
/// direction it needs.
#[inline]
pub fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Accumulates exactly `want` bytes from a non-blocking source, parking on
/// readability between bursts. One driver instance covers one transfer;
/// `reset` re-arms it for the next.
pub struct ReadDriver {
    want: usize,
    got: usize,
    resumes: u32,
}

impl ReadDriver {
    pub fn new(want: usize) -> Self {
        Self { want, got: 0, resumes: 0 }
    }

    pub fn reset(&mut self, want: usize) {
        self.want = want;
        self.got = 0;
    }

    /// How many times this transfer parked and resumed.
    #[inline]
    pub fn resumes(&self) -> u32 {
        self.resumes
    }

    pub fn drive<R, S>(&mut self, cx: &mut Cx<'_, '_, R>, sock: &mut S, buf: &mut [u8]) -> Drive
    where
        S: Read + AsRawFd,
    {
        if cx.interrupted() {
            return Drive::Fatal(io::ErrorKind::TimedOut.into());
        }
        loop {
            if self.got >= self.want {
                cx.stats_mut().reads_done += 1;
                return Drive::Done(self.got);
            }
            match sock.read(&mut buf[self.got..self.want]) {
                Ok(0) => return Drive::Closed(self.got),
                Ok(n) => {
                    self.got += n;
                    cx.stats_mut().bytes_in += n as u64;
                }
                Err(e) if retryable(&e) => {
                    self.resumes += 1;
                    cx.wait_readable(sock.as_raw_fd());
                    return Drive::Pending;
                }
                Err(e) => return Drive::Fatal(e),
            }
        }
    }
}

/// Writes an entire buffer to a non-blocking sink, parking on writability
/// when the kernel pushes back. Completes with exactly the full length or
/// fails; a partial count is never surfaced.
pub struct WriteDriver {
    sent: usize,
    resumes: u32,
}

impl WriteDriver {
    pub fn new() -> Self {
        Self { sent: 0, resumes: 0 }
    }

    pub fn reset(&mut self) {
        self.sent = 0;
    }

    #[inline]
    pub fn resumes(&self) -> u32 {
        self.resumes
    }

    pub fn drive<R, S>(&mut self, cx: &mut Cx<'_, '_, R>, sock: &mut S, buf: &[u8]) -> Drive
    where
        S: Write + AsRawFd,
    {
        if cx.interrupted() {
            return Drive::Fatal(io::ErrorKind::TimedOut.into());
        }
        loop {
            if self.sent >= buf.len() {
                cx.stats_mut().writes_done += 1;
                return Drive::Done(self.sent);
            }
            match sock.write(&buf[self.sent..]) {
                Ok(0) => return Drive::Fatal(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.sent += n;
                    cx.stats_mut().bytes_out += n as u64;
                }
                Err(e) if retryable(&e) => {
                    self.resumes += 1;
                    cx.wait_writable(sock.as_raw_fd());
                    return Drive::Pending;
                }
                Err(e) => return Drive::Fatal(e),
            }
        }
    }
}

impl Default for WriteDriver {
    fn default() -> Self {
        Self::new()
    }
}

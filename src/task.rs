// src/task.rs
use std::{
    collections::VecDeque,
    os::unix::io::RawFd,
    pin::Pin,
    time::{Duration, Instant},
};

use crate::{
    reactor::IoDir,
    sched::Stats,
    wake::{WakeMsg, WakeTx},
};

pub type TaskId = usize;

/// Sentinel `from` id for wakeups that don't originate in a task (timers,
/// channel puts from outside the loop, forced wakeups).
pub const EXTERNAL_WAKE: TaskId = usize::MAX;

/// What a task body reports back to the scheduler after a resume.
///
/// `Yield` carries no scheduling meaning by itself: where the task wakes up
/// next is entirely determined by what it armed through [`Cx`] before
/// returning (a timer, descriptor interest, a channel wait, or an explicit
/// self-wake). `Done` finishes the task; its body is dropped, which is the
/// single cleanup path for everything the task owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Yield,
    Done,
}

/// Terminate state of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermState {
    Run,
    Kill,
    Terminated,
}

/// How a task reached `Terminated`, for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Done,
    Killed,
    Panicked,
}

/// A cooperatively scheduled task body.
///
/// The implementing struct *is* the continuation: its fields are the locals
/// that survive across yields, and `resume` re-enters at whatever point the
/// encoded state says. Bodies may borrow the shared resources `R` via
/// `'env`.
pub trait TaskBody<'env, R>: 'env {
    fn resume(self: Pin<&mut Self>, cx: &mut Cx<'_, 'env, R>) -> Progress;
}

pub(crate) struct SpawnReq<'env, R> {
    pub(crate) parent: TaskId,
    pub(crate) name: String,
    pub(crate) body: Pin<Box<dyn TaskBody<'env, R> + 'env>>,
}

/// Wait conditions a task armed during one resume. Applied by the scheduler
/// after the body returns `Yield`. Timer and descriptor interest may be
/// armed together; whichever fires first wins and the loser is disarmed.
#[derive(Default)]
pub(crate) struct Park {
    pub(crate) timer: Option<Instant>,
    pub(crate) io: Option<(RawFd, IoDir)>,
}

/// The resume context handed to task bodies.
pub struct Cx<'run, 'env, R> {
    /// Shared mutable state, exclusively accessible while this body runs.
    pub resources: &'run mut R,

    pub(crate) id: TaskId,
    pub(crate) killed: bool,
    pub(crate) interrupted: bool,
    pub(crate) wake: WakeTx,
    pub(crate) stats: &'run mut Stats,
    pub(crate) park: &'run mut Park,
    pub(crate) spawns: &'run mut VecDeque<SpawnReq<'env, R>>,
    pub(crate) kills: &'run mut Vec<TaskId>,
}

impl<'run, 'env, R> Cx<'run, 'env, R> {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// True when this task has been asked to terminate. Cancellation is
    /// cooperative: the body is expected to release its resources and
    /// return `Done` promptly once it observes this.
    #[inline]
    pub fn killed(&self) -> bool {
        self.killed
    }

    /// True when the current wakeup was deadline-driven rather than
    /// readiness-driven (a descriptor wait whose timeout elapsed).
    #[inline]
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    #[inline]
    pub fn wake(&self, to: TaskId) {
        self.wake.send(WakeMsg { from: self.id, to });
    }

    #[inline]
    pub fn wake_self(&self) {
        self.wake(self.id);
    }

    /// Reschedule immediately and hand control back.
    #[inline]
    pub fn yield_now(&self) -> Progress {
        self.wake_self();
        Progress::Yield
    }

    /// Park this task until an absolute deadline.
    #[inline]
    pub fn sleep_until(&mut self, when: Instant) {
        self.park.timer = Some(when);
    }

    #[inline]
    pub fn sleep_for(&mut self, dur: Duration) {
        self.sleep_until(Instant::now() + dur);
    }

    /// Park this task until `fd` becomes readable. The descriptor must
    /// already be non-blocking.
    #[inline]
    pub fn wait_readable(&mut self, fd: RawFd) {
        self.park.io = Some((fd, IoDir::Read));
    }

    /// Park this task until `fd` becomes writable.
    #[inline]
    pub fn wait_writable(&mut self, fd: RawFd) {
        self.park.io = Some((fd, IoDir::Write));
    }

    /// Request cooperative termination of another task (or of self).
    #[inline]
    pub fn kill(&mut self, target: TaskId) {
        self.kills.push(target);
    }

    /// Spawn a new task once the current resume finishes.
    pub fn spawn_later<T>(&mut self, name: impl Into<String>, body: T)
    where
        T: TaskBody<'env, R> + 'env,
    {
        self.spawns.push_back(SpawnReq {
            parent: self.id,
            name: name.into(),
            body: Box::pin(body),
        });
    }

    #[inline]
    pub fn stats_mut(&mut self) -> &mut Stats {
        self.stats
    }
}

/// Yields once, then completes.
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        Self { yielded: false }
    }
}

impl Default for YieldNow {
    fn default() -> Self {
        Self::new()
    }
}

impl<'env, R> TaskBody<'env, R> for YieldNow {
    fn resume(mut self: Pin<&mut Self>, cx: &mut Cx<'_, 'env, R>) -> Progress {
        if !self.yielded {
            self.yielded = true;
            return cx.yield_now();
        }
        Progress::Done
    }
}

// src/trace.rs
use crate::reactor::IoDir;
use crate::task::{FinishKind, TaskId};
use std::os::unix::io::RawFd;

/// Hooks into scheduler lifecycle events. All methods default to no-ops so
/// implementations pick what they care about.
pub trait Tracer {
    fn on_spawn(&mut self, _id: TaskId, _name: &str) {}
    fn on_defer_spawn(&mut self, _parent: TaskId, _child_name: &str) {}
    fn on_wake(&mut self, _from: TaskId, _to: TaskId) {}
    fn on_resume(&mut self, _seq: u64, _id: TaskId, _name: &str) {}
    fn on_finish(&mut self, _id: TaskId, _name: &str, _kind: FinishKind) {}

    fn on_park_timer(&mut self, _id: TaskId, _micros_from_now: u128) {}
    fn on_park_io(&mut self, _id: TaskId, _fd: RawFd, _dir: IoDir) {}

    fn on_io_ready(&mut self, _fd: RawFd, _id: TaskId) {}
    fn on_io_interrupt(&mut self, _fd: RawFd, _id: TaskId) {}
    fn on_io_closed(&mut self, _fd: RawFd, _id: TaskId) {}

    fn on_kill(&mut self, _id: TaskId) {}
    fn on_terminate_all(&mut self, _live: usize) {}
    fn on_timers_fired(&mut self, _count: usize) {}
}

/// Forwards every event to the `tracing` ecosystem.
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn on_spawn(&mut self, id: TaskId, name: &str) {
        tracing::debug!(id, name, "spawn");
    }
    fn on_defer_spawn(&mut self, parent: TaskId, child_name: &str) {
        tracing::trace!(parent, child_name, "deferred spawn");
    }
    fn on_wake(&mut self, from: TaskId, to: TaskId) {
        tracing::trace!(from, to, "wake");
    }
    fn on_resume(&mut self, seq: u64, id: TaskId, name: &str) {
        tracing::trace!(seq, id, name, "resume");
    }
    fn on_finish(&mut self, id: TaskId, name: &str, kind: FinishKind) {
        tracing::debug!(id, name, ?kind, "finish");
    }
    fn on_park_timer(&mut self, id: TaskId, micros: u128) {
        tracing::trace!(id, micros, "park timer");
    }
    fn on_park_io(&mut self, id: TaskId, fd: RawFd, dir: IoDir) {
        tracing::trace!(id, fd, ?dir, "park io");
    }
    fn on_io_ready(&mut self, fd: RawFd, id: TaskId) {
        tracing::trace!(fd, id, "io ready");
    }
    fn on_io_interrupt(&mut self, fd: RawFd, id: TaskId) {
        tracing::debug!(fd, id, "io wait interrupted by deadline");
    }
    fn on_io_closed(&mut self, fd: RawFd, id: TaskId) {
        tracing::debug!(fd, id, "io wait removed, descriptor gone");
    }
    fn on_kill(&mut self, id: TaskId) {
        tracing::debug!(id, "kill requested");
    }
    fn on_terminate_all(&mut self, live: usize) {
        tracing::debug!(live, "terminate all");
    }
    fn on_timers_fired(&mut self, count: usize) {
        tracing::trace!(count, "timers fired");
    }
}

/// Stores trace lines in memory for deterministic assertions in tests.
/// Clones share the buffer, so a handle kept outside the scheduler reads
/// what the installed copy recorded.
#[derive(Clone)]
pub struct BufferTracer {
    lines: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
}

impl BufferTracer {
    pub fn new() -> Self {
        Self { lines: std::rc::Rc::new(std::cell::RefCell::new(Vec::new())) }
    }

    fn push(&mut self, s: String) {
        self.lines.borrow_mut().push(s);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl Default for BufferTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for BufferTracer {
    fn on_spawn(&mut self, id: TaskId, name: &str) {
        self.push(format!("[spawn] {id} {name}"));
    }
    fn on_wake(&mut self, from: TaskId, to: TaskId) {
        self.push(format!("[wake] {from} -> {to}"));
    }
    fn on_resume(&mut self, seq: u64, id: TaskId, name: &str) {
        self.push(format!("[resume#{seq}] {id} {name}"));
    }
    fn on_finish(&mut self, id: TaskId, name: &str, kind: FinishKind) {
        self.push(format!("[finish] {id} {name} => {kind:?}"));
    }
    fn on_park_io(&mut self, id: TaskId, fd: RawFd, dir: IoDir) {
        self.push(format!("[park-io] {id} fd={fd} {dir:?}"));
    }
    fn on_io_ready(&mut self, fd: RawFd, id: TaskId) {
        self.push(format!("[io-ready] fd={fd} -> {id}"));
    }
    fn on_io_interrupt(&mut self, fd: RawFd, id: TaskId) {
        self.push(format!("[io-interrupt] fd={fd} -> {id}"));
    }
    fn on_kill(&mut self, id: TaskId) {
        self.push(format!("[kill] {id}"));
    }
    fn on_terminate_all(&mut self, live: usize) {
        self.push(format!("[terminate-all] live={live}"));
    }
    fn on_timers_fired(&mut self, count: usize) {
        self.push(format!("[timers] fired {count}"));
    }
}

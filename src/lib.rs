//! # COSCHED
//! Cooperative, single-threaded task runtime: green threads over one
//! `poll()` loop.
//!
//! Tasks are state-machine bodies resumed one at a time by a scheduler that
//! owns a ready list, a timer min-heap, and a descriptor wait table. A task
//! runs until it yields; where it wakes next is whatever it armed before
//! yielding: an absolute deadline, descriptor readiness, a channel wait,
//! or an immediate self-wake.
//!
//! ## Architectural principles
//! * **No preemption:** a body runs to its next yield atomically with
//!   respect to every other task; scheduler state needs no locking.
//! * **Explicit ownership:** task slots are arena indices with manual
//!   reference counts; wait structures pin the slots they point at, so a
//!   recycled slot can never be reached through a stale wait.
//! * **Bounded blocking:** the loop never sleeps past the nearest timer
//!   deadline, and never longer than one poll slice.

pub mod channel;
pub mod reactor;
pub mod sched;
pub mod sock;
pub mod task;
pub mod timer;
pub mod trace;
pub mod wake;

pub use channel::Channel;
pub use reactor::IoDir;
pub use sched::{with_runtime, Config, Exit, RunError, Scheduler, Stats, Tick};
pub use sock::{retryable, Drive, ReadDriver, WriteDriver};
pub use task::{Cx, FinishKind, Progress, TaskBody, TaskId, TermState, YieldNow, EXTERNAL_WAKE};
pub use timer::DelayUntil;
pub use trace::{BufferTracer, Tracer, TracingTracer};
pub use wake::{wake_channel, WakeMsg, WakeTx};

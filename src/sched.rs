// src/sched.rs
use crate::{
    channel::Channel,
    reactor::{IoDir, Reactor},
    task::{Cx, FinishKind, Park, Progress, SpawnReq, TaskBody, TaskId, TermState},
    timer::TimerHeap,
    trace::Tracer,
    wake::{wake_channel, WakeRx, WakeTx},
};
use std::{
    collections::VecDeque,
    io,
    os::unix::io::RawFd,
    panic::{catch_unwind, AssertUnwindSafe},
    pin::Pin,
    time::{Duration, Instant},
};
use thiserror::Error;

// ----------------------------- results -----------------------------

/// Why the outer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Every task terminated and was reclaimed.
    Drained,
    /// The should-exit predicate fired; live tasks may remain.
    Stopped,
}

/// Outcome of a single non-blocking scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Progress,
    Idle,
    Done,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("multiplexer poll failed: {0}")]
    Poll(#[from] io::Error),
}

// ----------------------------- config / stats -----------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on any single blocking multiplexer call. Even an
    /// "indefinite" wait blocks in slices of this length so timer checks
    /// never go stale for longer.
    pub poll_slice: Duration,
    /// Zero-timeout multiplexer probes to attempt before paying for a
    /// blocking call when a timer deadline is near.
    pub busy_spins: u32,
    /// Slot capacity reserved up front.
    pub initial_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_slice: Duration::from_millis(1000),
            busy_spins: 3,
            initial_capacity: 16,
        }
    }
}

/// Observability counters, updated as the loop and the I/O drivers run.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub resumes: u64,
    pub wakes: u64,
    pub timer_fires: u64,
    pub io_wakeups: u64,
    pub io_timeouts: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reads_done: u64,
    pub writes_done: u64,
}

// ----------------------------- task slots -----------------------------

struct TaskEntry<'env, R> {
    name: String,
    term: TermState,
    body: Option<Pin<Box<dyn TaskBody<'env, R> + 'env>>>,
}

const NO_FD: RawFd = -1;

// ----------------------------- scheduler -----------------------------

/// Single-threaded cooperative scheduler.
///
/// Exactly one task body executes at a time; a body runs until it yields.
/// All scheduler state is owned here, so independent instances coexist and
/// tests drive one deterministically with [`tick`](Scheduler::tick).
pub struct Scheduler<'env, R> {
    resources: &'env mut R,
    cfg: Config,

    entries: Vec<TaskEntry<'env, R>>,
    free: Vec<TaskId>,
    live: usize,

    ready: VecDeque<TaskId>,
    queued: Vec<bool>,
    refs: Vec<u32>,

    // Timer parking: heap position 0 means "not in the heap".
    timers: TimerHeap,
    heap_pos: Vec<usize>,
    deadline: Vec<Option<Instant>>,

    // Descriptor parking.
    reactor: Reactor,
    wait_fd: Vec<RawFd>,
    interrupted: Vec<bool>,

    wake_tx: WakeTx,
    wake_rx: WakeRx,
    spawns: VecDeque<SpawnReq<'env, R>>,
    kills: Vec<TaskId>,

    resume_seq: u64,
    stats: Stats,
    tracer: Option<Box<dyn Tracer>>,
}

/// Build a scheduler around `resources`, run `f`, tear everything down.
pub fn with_runtime<'env, R, Ret>(
    resources: &'env mut R,
    f: impl FnOnce(&mut Scheduler<'env, R>) -> Ret,
) -> Ret {
    let mut sched = Scheduler::new(resources);
    f(&mut sched)
}

impl<'env, R> Scheduler<'env, R> {
    pub fn new(resources: &'env mut R) -> Self {
        Self::with_config(resources, Config::default())
    }

    pub fn with_config(resources: &'env mut R, cfg: Config) -> Self {
        let cap = cfg.initial_capacity;
        let (wake_tx, wake_rx) = wake_channel();
        Self {
            resources,
            cfg,
            entries: Vec::with_capacity(cap),
            free: Vec::new(),
            live: 0,
            ready: VecDeque::new(),
            queued: Vec::with_capacity(cap),
            refs: Vec::with_capacity(cap),
            timers: TimerHeap::new(),
            heap_pos: Vec::with_capacity(cap),
            deadline: Vec::with_capacity(cap),
            reactor: Reactor::new(),
            wait_fd: Vec::with_capacity(cap),
            interrupted: Vec::with_capacity(cap),
            wake_tx,
            wake_rx,
            spawns: VecDeque::new(),
            kills: Vec::new(),
            resume_seq: 0,
            stats: Stats::default(),
            tracer: None,
        }
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracer = Some(tracer);
    }

    #[inline]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of tasks that have not terminated.
    #[inline]
    pub fn live_tasks(&self) -> usize {
        self.live
    }

    /// Sender half of the wake queue, for wiring up channels.
    #[inline]
    pub fn wake_handle(&self) -> WakeTx {
        self.wake_tx.clone()
    }

    /// Terminate state of a slot, `None` once it has been freed or was
    /// never allocated.
    pub fn term_state(&self, id: TaskId) -> Option<TermState> {
        if id < self.entries.len() && self.refs[id] > 0 {
            Some(self.entries[id].term)
        } else {
            None
        }
    }

    /// A channel whose puts wake consumers on this scheduler.
    pub fn channel<T>(&self) -> Channel<T> {
        Channel::new(self.wake_tx.clone())
    }

    // ---------------- lifecycle ----------------

    /// Allocate a slot (recycling a freed one when possible), place the
    /// task on the ready list, and hand back its id. The scheduler holds
    /// the initial reference.
    pub fn spawn<T>(&mut self, name: impl Into<String>, body: T) -> TaskId
    where
        T: TaskBody<'env, R> + 'env,
    {
        self.spawn_boxed(name.into(), Box::pin(body))
    }

    fn spawn_boxed(&mut self, name: String, body: Pin<Box<dyn TaskBody<'env, R> + 'env>>) -> TaskId {
        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id] = TaskEntry { name, term: TermState::Run, body: Some(body) };
                self.queued[id] = false;
                self.heap_pos[id] = 0;
                self.deadline[id] = None;
                self.wait_fd[id] = NO_FD;
                self.interrupted[id] = false;
                id
            }
            None => {
                let id = self.entries.len();
                self.entries.push(TaskEntry { name, term: TermState::Run, body: Some(body) });
                self.queued.push(false);
                self.refs.push(0);
                self.heap_pos.push(0);
                self.deadline.push(None);
                self.wait_fd.push(NO_FD);
                self.interrupted.push(false);
                id
            }
        };
        self.refs[id] = 1;
        self.live += 1;

        if let Some(t) = self.tracer.as_mut() {
            t.on_spawn(id, &self.entries[id].name);
        }
        self.enqueue_ready(id);
        id
    }

    /// Add a manual reference to a slot, pinning it against recycling.
    pub fn retain(&mut self, id: TaskId) {
        assert!(self.refs[id] > 0, "retain of freed task slot {id}");
        self.refs[id] += 1;
    }

    /// Drop a reference; the slot is recycled when the count hits zero.
    /// The count reaches zero exactly once per tenancy.
    pub fn release(&mut self, id: TaskId) {
        assert!(self.refs[id] > 0, "release of freed task slot {id}");
        self.refs[id] -= 1;
        if self.refs[id] == 0 {
            assert!(
                self.entries[id].term == TermState::Terminated,
                "refcount of live task {id} dropped to zero"
            );
            self.entries[id].body = None;
            self.free.push(id);
        }
    }

    /// Make a task ready, disarming its timer if one is pending. Idempotent
    /// on already-ready, terminated, or stale ids.
    pub fn activate(&mut self, id: TaskId) {
        if !self.is_current(id) {
            return;
        }
        let hp = self.heap_pos[id];
        if hp != 0 {
            self.timers.remove(hp, &mut self.heap_pos);
        }
        self.deadline[id] = None;
        self.enqueue_ready(id);
    }

    /// Unlink a task from the ready list (a stale entry in the run queue is
    /// skipped, not resumed).
    pub fn deactivate(&mut self, id: TaskId) {
        if id < self.queued.len() {
            self.queued[id] = false;
        }
    }

    /// Request cooperative termination: flag the task and make it ready so
    /// it observes the flag on its next resume.
    pub fn terminate(&mut self, id: TaskId) {
        if !self.is_current(id) {
            return;
        }
        if self.entries[id].term == TermState::Run {
            self.entries[id].term = TermState::Kill;
            if let Some(t) = self.tracer.as_mut() {
                t.on_kill(id);
            }
        }
        self.activate(id);
    }

    /// Force every parked task awake, then flag every live task for
    /// termination. Guarantees the loop converges to zero live tasks as
    /// long as bodies honor the kill flag.
    pub fn terminate_all(&mut self) {
        if let Some(t) = self.tracer.as_mut() {
            t.on_terminate_all(self.live);
        }
        while let Some((_, id)) = self.timers.pop_min(&mut self.heap_pos) {
            self.deadline[id] = None;
            self.enqueue_ready(id);
        }
        while let Some((fd, owner)) = self.reactor.pop() {
            self.interrupted[owner] = true;
            self.wait_fd[owner] = NO_FD;
            if let Some(t) = self.tracer.as_mut() {
                t.on_io_interrupt(fd, owner);
            }
            self.enqueue_ready(owner);
            self.release(owner);
        }
        for id in 0..self.entries.len() {
            if self.refs[id] > 0 && self.entries[id].term != TermState::Terminated {
                self.terminate(id);
            }
        }
    }

    /// Force-wake every task parked on `fd`. For descriptors closed
    /// out-of-band (transport errors): the woken task retries its
    /// operation and observes the failure itself.
    pub fn remove_and_wakeup(&mut self, fd: RawFd) -> bool {
        let mut woke = false;
        let mut i = 0;
        while i < self.reactor.len() {
            if self.reactor.fd(i) != fd {
                i += 1;
                continue;
            }
            let (_, owner) = self.reactor.remove(i);
            self.wait_fd[owner] = NO_FD;
            if let Some(t) = self.tracer.as_mut() {
                t.on_io_closed(fd, owner);
            }
            self.activate(owner);
            self.release(owner);
            woke = true;
        }
        woke
    }

    // ---------------- driving ----------------

    /// Run until the predicate fires or every task has terminated. The
    /// predicate is polled once per outer pass and must be fast and
    /// side-effect-free.
    pub fn run<F>(&mut self, mut should_exit: F) -> Result<Exit, RunError>
    where
        F: FnMut() -> bool,
    {
        loop {
            if should_exit() {
                return Ok(Exit::Stopped);
            }

            self.drain_spawns();
            self.drain_wakes();
            // Resume everything ready at the top of this pass. Tasks woken
            // (or self-woken) meanwhile run next pass, so a busy task can't
            // starve the exit predicate or the timer checks.
            let batch = self.ready.len();
            for _ in 0..batch {
                let Some(id) = self.ready.pop_front() else {
                    break;
                };
                if !self.take_queued(id) {
                    continue;
                }
                self.resume_one(id);
                self.drain_spawns();
                self.drain_wakes();
            }

            if self.live == 0 {
                return Ok(Exit::Drained);
            }

            if !self.ready.is_empty() {
                // More work queued: probe the multiplexer without blocking
                // so descriptor wakeups keep flowing under load.
                self.poll_wait(Some(Duration::ZERO))?;
                self.fire_expired_timers();
                continue;
            }

            match self.timers.peek() {
                Some(next) => {
                    let now = Instant::now();
                    if next <= now {
                        self.fire_expired_timers();
                        continue;
                    }
                    let mut woke = false;
                    for _ in 0..self.cfg.busy_spins {
                        if self.poll_wait(Some(Duration::ZERO))? {
                            woke = true;
                            break;
                        }
                        if Instant::now() >= next {
                            break;
                        }
                    }
                    if !woke {
                        let now = Instant::now();
                        if next > now {
                            self.poll_wait(Some(next - now))?;
                        }
                    }
                    self.fire_expired_timers();
                }
                None => {
                    self.poll_wait(None)?;
                }
            }
        }
    }

    /// One non-blocking step: fire due timers, then resume at most one
    /// ready task. Never touches the multiplexer, so descriptor wakeups
    /// only happen under [`run`](Scheduler::run).
    pub fn tick(&mut self) -> Tick {
        if self.live == 0 {
            return Tick::Done;
        }
        self.fire_expired_timers();
        self.drain_spawns();
        self.drain_wakes();

        let Some(id) = self.ready.pop_front() else {
            return Tick::Idle;
        };
        if !self.take_queued(id) {
            return Tick::Progress;
        }
        self.resume_one(id);
        Tick::Progress
    }

    /// Tick until nothing is ready.
    pub fn run_until_idle(&mut self) -> Tick {
        loop {
            match self.tick() {
                Tick::Progress => continue,
                t => return t,
            }
        }
    }

    // ---------------- internals ----------------

    /// A slot currently holds a task (live or awaiting reclaim), as opposed
    /// to freed, recycled-away, or never allocated.
    #[inline]
    fn is_current(&self, id: TaskId) -> bool {
        id < self.entries.len()
            && self.refs[id] > 0
            && self.entries[id].term != TermState::Terminated
    }

    fn enqueue_ready(&mut self, id: TaskId) {
        if !self.is_current(id) || self.queued[id] {
            return;
        }
        self.queued[id] = true;
        self.ready.push_back(id);
    }

    #[inline]
    fn take_queued(&mut self, id: TaskId) -> bool {
        if id < self.queued.len() && self.queued[id] {
            self.queued[id] = false;
            true
        } else {
            false
        }
    }

    fn drain_wakes(&mut self) {
        while let Some(msg) = self.wake_rx.try_recv() {
            self.stats.wakes += 1;
            if let Some(t) = self.tracer.as_mut() {
                t.on_wake(msg.from, msg.to);
            }
            self.enqueue_ready(msg.to);
        }
    }

    fn drain_spawns(&mut self) {
        while let Some(req) = self.spawns.pop_front() {
            if let Some(t) = self.tracer.as_mut() {
                t.on_defer_spawn(req.parent, &req.name);
            }
            self.spawn_boxed(req.name, req.body);
        }
    }

    fn resume_one(&mut self, id: TaskId) {
        let Some(mut body) = self.entries[id].body.take() else {
            return;
        };
        self.resume_seq += 1;
        self.stats.resumes += 1;
        let name = self.entries[id].name.clone();
        let killed = self.entries[id].term == TermState::Kill;
        let interrupted = std::mem::take(&mut self.interrupted[id]);

        if let Some(t) = self.tracer.as_mut() {
            t.on_resume(self.resume_seq, id, &name);
        }

        let mut park = Park::default();
        let res = {
            let mut cx = Cx {
                resources: &mut *self.resources,
                id,
                killed,
                interrupted,
                wake: self.wake_tx.clone(),
                stats: &mut self.stats,
                park: &mut park,
                spawns: &mut self.spawns,
                kills: &mut self.kills,
            };
            catch_unwind(AssertUnwindSafe(|| body.as_mut().resume(&mut cx)))
        };

        match res {
            Ok(Progress::Yield) => {
                self.entries[id].body = Some(body);
                self.apply_park(id, park);
            }
            Ok(Progress::Done) => {
                drop(body);
                let kind = if killed { FinishKind::Killed } else { FinishKind::Done };
                self.finish(id, kind);
            }
            Err(_) => {
                drop(body);
                self.finish(id, FinishKind::Panicked);
            }
        }

        if !self.kills.is_empty() {
            let kills = std::mem::take(&mut self.kills);
            for target in kills {
                self.terminate(target);
            }
        }
    }

    fn apply_park(&mut self, id: TaskId, park: Park) {
        if let Some(when) = park.timer {
            self.park_timer(id, when);
        }
        if let Some((fd, dir)) = park.io {
            self.park_io(id, fd, dir);
        }
    }

    fn park_timer(&mut self, id: TaskId, when: Instant) {
        self.deactivate(id);
        let hp = self.heap_pos[id];
        if hp != 0 {
            self.timers.remove(hp, &mut self.heap_pos);
        }
        self.deadline[id] = Some(when);
        self.timers.insert(when, id, &mut self.heap_pos);
        if let Some(t) = self.tracer.as_mut() {
            let micros = when.saturating_duration_since(Instant::now()).as_micros();
            t.on_park_timer(id, micros);
        }
    }

    /// Park a task on descriptor readiness: unlink it from the ready list,
    /// pin its slot with an extra reference, and append a wait-table entry.
    fn park_io(&mut self, id: TaskId, fd: RawFd, dir: IoDir) {
        self.deactivate(id);
        self.retain(id);
        self.reactor.add(fd, dir, id);
        self.wait_fd[id] = fd;
        if let Some(t) = self.tracer.as_mut() {
            t.on_park_io(id, fd, dir);
        }
    }

    /// Remove every wait-table entry owned by `id`, dropping the pin each
    /// entry held.
    fn unpark_io(&mut self, id: TaskId) -> bool {
        let mut removed = false;
        let mut i = 0;
        while i < self.reactor.len() {
            if self.reactor.owner(i) == id {
                self.reactor.remove(i);
                self.release(id);
                removed = true;
            } else {
                i += 1;
            }
        }
        if removed {
            self.wait_fd[id] = NO_FD;
        }
        removed
    }

    fn finish(&mut self, id: TaskId, kind: FinishKind) {
        let hp = self.heap_pos[id];
        if hp != 0 {
            self.timers.remove(hp, &mut self.heap_pos);
        }
        self.deadline[id] = None;
        self.unpark_io(id);
        self.queued[id] = false;
        self.interrupted[id] = false;

        self.entries[id].term = TermState::Terminated;
        self.entries[id].body = None;
        self.live -= 1;

        if let Some(t) = self.tracer.as_mut() {
            let name = &self.entries[id].name;
            t.on_finish(id, name, kind);
        }
        self.release(id);
    }

    /// One multiplexing call over the wait table, bounded by the poll
    /// slice. Entries are examined in table order: readiness wakes the
    /// owner plainly, an elapsed owner deadline wakes it with the
    /// interrupt flag set; either way the entry is compacted out. Returns
    /// whether anything woke.
    fn poll_wait(&mut self, timeout: Option<Duration>) -> Result<bool, RunError> {
        let slice = self.cfg.poll_slice;
        let timeout = timeout.map_or(slice, |t| t.min(slice));
        let events = self.reactor.poll(Some(timeout)).map_err(RunError::Poll)?;

        let now = Instant::now();
        let mut woke = false;
        let mut i = 0;
        while i < self.reactor.len() {
            let fd = self.reactor.fd(i);
            let dir = self.reactor.dir(i);
            let owner = self.reactor.owner(i);

            let ready = events.iter().any(|ev| {
                ev.fd == fd
                    && match dir {
                        IoDir::Read => ev.readable,
                        IoDir::Write => ev.writable,
                    }
            });
            let expired = self.deadline[owner].is_some_and(|d| d <= now);
            if !(ready || expired) {
                i += 1;
                continue;
            }

            self.reactor.remove(i);
            self.wait_fd[owner] = NO_FD;
            if ready {
                self.stats.io_wakeups += 1;
                if let Some(t) = self.tracer.as_mut() {
                    t.on_io_ready(fd, owner);
                }
            } else {
                self.interrupted[owner] = true;
                self.stats.io_timeouts += 1;
                if let Some(t) = self.tracer.as_mut() {
                    t.on_io_interrupt(fd, owner);
                }
            }
            self.activate(owner);
            self.release(owner);
            woke = true;
        }
        Ok(woke)
    }

    fn fire_expired_timers(&mut self) {
        let now = Instant::now();
        let mut count = 0usize;
        while let Some(id) = self.timers.pop_expired(now, &mut self.heap_pos) {
            self.deadline[id] = None;
            // A task with both a deadline and a descriptor wait armed: the
            // timer won, so the descriptor wait is torn down and the wakeup
            // is flagged as an interrupt.
            if self.wait_fd[id] != NO_FD {
                self.interrupted[id] = true;
                self.stats.io_timeouts += 1;
                self.unpark_io(id);
            }
            self.stats.timer_fires += 1;
            self.enqueue_ready(id);
            count += 1;
        }
        if count > 0 {
            if let Some(t) = self.tracer.as_mut() {
                t.on_timers_fired(count);
            }
        }
    }
}

// src/wake.rs
use crate::task::TaskId;
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

/// A wake request: `from` is recorded for tracing only, `to` is the task
/// that becomes ready.
#[derive(Debug, Clone, Copy)]
pub struct WakeMsg {
    pub from: TaskId,
    pub to: TaskId,
}

#[derive(Clone)]
pub struct WakeTx {
    q: Rc<RefCell<VecDeque<WakeMsg>>>,
}

pub struct WakeRx {
    q: Rc<RefCell<VecDeque<WakeMsg>>>,
}

/// Single-threaded wake queue. Everything that can make a task ready again
/// (channels, timers, another task) funnels through here; the scheduler
/// drains it between resumes.
pub fn wake_channel() -> (WakeTx, WakeRx) {
    let q = Rc::new(RefCell::new(VecDeque::new()));
    (WakeTx { q: q.clone() }, WakeRx { q })
}

impl WakeTx {
    #[inline]
    pub fn send(&self, msg: WakeMsg) {
        self.q.borrow_mut().push_back(msg);
    }
}

impl WakeRx {
    #[inline]
    pub fn try_recv(&self) -> Option<WakeMsg> {
        self.q.borrow_mut().pop_front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.borrow().is_empty()
    }
}

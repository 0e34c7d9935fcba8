// src/channel.rs
use crate::task::{Cx, TaskId, EXTERNAL_WAKE};
use crate::wake::{WakeMsg, WakeTx};
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<TaskId>,
    wake: WakeTx,
}

/// FIFO of items plus a FIFO of blocked consumers.
///
/// `put` wakes at most one waiter (the queue head); consumers always
/// re-check the item queue on resume, so a wakeup is a hint, never a
/// delivery. Handles are cheap clones sharing one queue.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Channel<T> {
    pub fn new(wake: WakeTx) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                wake,
            })),
        }
    }

    /// Append an item and wake the head waiter, if any.
    pub fn put(&self, item: T) {
        let mut inner = self.inner.borrow_mut();
        inner.items.push_back(item);
        Self::wake_one(&mut inner);
    }

    /// Prepend an item, jumping ahead of everything already queued. Used to
    /// get control signals in front of buffered data.
    pub fn put_front(&self, item: T) {
        let mut inner = self.inner.borrow_mut();
        inner.items.push_front(item);
        Self::wake_one(&mut inner);
    }

    fn wake_one(inner: &mut Inner<T>) {
        if let Some(w) = inner.waiters.pop_front() {
            inner.wake.send(WakeMsg { from: EXTERNAL_WAKE, to: w });
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<T> {
        self.inner.borrow_mut().items.pop_front()
    }

    /// Consumer side: returns an item, or parks the calling task in the
    /// waiter queue and returns `None`, in which case the body should
    /// yield and re-check on resume. A task is enqueued at most once no
    /// matter how often it re-checks.
    pub fn recv<R>(&self, cx: &mut Cx<'_, '_, R>) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        if let Some(v) = inner.items.pop_front() {
            return Some(v);
        }
        let id = cx.id();
        if !inner.waiters.contains(&id) {
            inner.waiters.push_back(id);
        }
        None
    }

    /// Drop a task from the waiter queue. Consumers that stop receiving
    /// (killed, or switching wait conditions) call this so a later `put`
    /// doesn't spend its single wakeup on them.
    pub fn forget_waiter(&self, id: TaskId) {
        self.inner.borrow_mut().waiters.retain(|&w| w != id);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }
}

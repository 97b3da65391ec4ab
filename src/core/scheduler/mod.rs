//! Cooperative task scheduler shared by the session's worker threads.

mod task;
mod worker;

pub(crate) use task::{CustomTaskFn, Task, TaskKind};
pub(crate) use worker::thread_proc;

use crate::core::filter::Filter;
use crate::core::obj_pool::ObjPool;
use crate::core::pid::Pid;
use crate::util::sync::lock;
use crossbeam_channel::{unbounded, Receiver, RecvError, Sender};
use log::trace;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const STATUS_INIT: usize = 0;
pub(crate) const STATUS_RUN: usize = 1;
pub(crate) const STATUS_END: usize = 2;

pub(crate) struct SchedState {
    pub(crate) tasks: VecDeque<Box<Task>>,
    /// Tasks currently being run by a worker.
    pub(crate) in_flight: usize,
}

pub(crate) struct Scheduler {
    /// Task queue; the filters' in-process flags are only changed under it.
    pub(crate) state: Mutex<SchedState>,
    sema_tx: Sender<()>,
    sema_rx: Receiver<()>,
    pub(crate) task_pool: ObjPool<Box<Task>>,
    status: AtomicUsize,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let (sema_tx, sema_rx) = unbounded();
        Self {
            state: Mutex::new(SchedState {
                tasks: VecDeque::new(),
                in_flight: 0,
            }),
            sema_tx,
            sema_rx,
            task_pool: ObjPool::new(),
            status: AtomicUsize::new(STATUS_INIT),
        }
    }

    /// Queues a task and wakes one worker.
    pub(crate) fn post(&self, filter: Option<Arc<Filter>>, pid: Option<Arc<Pid>>, kind: TaskKind) {
        let mut task = self.task_pool.pop_or_else(|| Box::new(Task::default()));
        trace!(
            "Posting task {} on filter {}",
            kind.name(),
            filter.as_ref().map(|f| f.name()).unwrap_or("none")
        );
        task.filter = filter;
        task.pid = pid;
        task.kind = Some(kind);
        lock(&self.state).tasks.push_back(task);
        self.notify();
    }

    pub(crate) fn notify(&self) {
        // the receiver lives as long as the scheduler, send cannot fail
        let _ = self.sema_tx.send(());
    }

    pub(crate) fn wait(&self) -> Result<(), RecvError> {
        self.sema_rx.recv()
    }

    pub(crate) fn status(&self) -> usize {
        self.status.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: usize) {
        self.status.store(status, Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status() == STATUS_END
    }

    /// Marks the session done and starts waking every worker.
    pub(crate) fn finish(&self) {
        self.status.store(STATUS_END, Ordering::Release);
        self.notify();
    }

    pub(crate) fn nb_queued(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    /// Drops every queued task and idle task shell.
    pub(crate) fn clear(&self) {
        let tasks: Vec<Box<Task>> = lock(&self.state).tasks.drain(..).collect();
        drop(tasks);
        self.task_pool.clear();
        while self.sema_rx.try_recv().is_ok() {}
    }
}

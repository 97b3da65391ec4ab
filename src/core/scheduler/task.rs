use crate::core::filter::Filter;
use crate::core::pid::Pid;
use crate::core::session::SessionInner;
use log::warn;
use std::sync::Arc;

/// Closure run by a custom task; returns `true` to be run again.
pub(crate) type CustomTaskFn = Box<dyn FnMut(&Arc<Filter>) -> bool + Send>;

pub(crate) enum TaskKind {
    /// Calls the filter's `process`.
    Process,
    /// Offers a new output pid of the filter to the rest of the graph.
    PidInit,
    /// Connects the pid into the target filter.
    PidConnect,
    /// Disconnects the pid from the target filter.
    PidDisconnect,
    Custom(CustomTaskFn),
}

impl TaskKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TaskKind::Process => "process",
            TaskKind::PidInit => "pid_init",
            TaskKind::PidConnect => "pid_connect",
            TaskKind::PidDisconnect => "pid_disconnect",
            TaskKind::Custom(_) => "custom",
        }
    }
}

/// Unit of work of the scheduler. Shells are recycled through the task pool.
#[derive(Default)]
pub(crate) struct Task {
    pub(crate) filter: Option<Arc<Filter>>,
    pub(crate) pid: Option<Arc<Pid>>,
    pub(crate) kind: Option<TaskKind>,
}

impl Task {
    pub(crate) fn name(&self) -> &'static str {
        self.kind.as_ref().map_or("none", TaskKind::name)
    }

    /// Runs the task.
    ///
    /// # Returns
    /// `true` if the task must be queued again.
    pub(crate) fn run(&mut self, session: &SessionInner) -> bool {
        match (&mut self.kind, &self.filter, &self.pid) {
            (Some(TaskKind::Process), Some(filter), _) => filter.process_task(session),
            (Some(TaskKind::PidInit), Some(filter), Some(pid)) => {
                session.offer_pid(filter, pid);
                false
            }
            (Some(TaskKind::PidConnect), Some(filter), Some(pid)) => {
                session.connect_pid(filter, pid);
                false
            }
            (Some(TaskKind::PidDisconnect), Some(filter), Some(pid)) => {
                filter.disconnect_pid(pid);
                false
            }
            (Some(TaskKind::Custom(f)), Some(filter), _) => f(filter) && !session.is_done(),
            (kind, _, _) => {
                warn!(
                    "Discarding task {} without target",
                    kind.as_ref().map_or("none", TaskKind::name)
                );
                false
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.filter = None;
        self.pid = None;
        self.kind = None;
    }
}

//! Minimal filters and graphs used by the unit tests.

use crate::core::filter::{Filter, FilterImpl, FilterRegister};
use crate::core::pid::Pid;
use crate::core::pid_inst::PidInstance;
use crate::core::session::{Session, SessionBuilder};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Source that never produces anything on its own: tests drive its pid.
pub(crate) struct Passive;

impl FilterImpl for Passive {
    fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        Err(Error::EndOfStream)
    }
}

/// Sink that accepts any pid and leaves packets queued.
pub(crate) struct Collector {
    full_block: bool,
}

impl FilterImpl for Collector {
    fn configure_pid(
        &mut self,
        _filter: &Arc<Filter>,
        pid: &Arc<PidInstance>,
        is_remove: bool,
    ) -> Result<()> {
        if !is_remove {
            pid.set_framing_mode(self.full_block);
        }
        Ok(())
    }

    fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct Graph {
    pub(crate) session: Session,
    pub(crate) source: Arc<Filter>,
    pub(crate) pid: Arc<Pid>,
    pub(crate) sinks: Vec<Arc<Filter>>,
}

impl Graph {
    pub(crate) fn input(&self, sink: usize) -> Arc<PidInstance> {
        self.sinks[sink].input_pid(0).unwrap()
    }
}

/// Registers `passive`, `collector` (framing per `full_block`) and
/// `blockcollector` (always full blocks).
pub(crate) fn builder(full_block: bool) -> SessionBuilder {
    Session::builder()
        .register(FilterRegister::new("passive", || Box::new(Passive)).max_input_pids(0))
        .register(FilterRegister::new("collector", move || {
            Box::new(Collector { full_block })
        }))
        .register(FilterRegister::new("blockcollector", || {
            Box::new(Collector { full_block: true })
        }))
}

pub(crate) fn session(full_block: bool) -> Session {
    builder(full_block).build()
}

/// One passive source with one output pid connected to `nb_sinks`
/// collectors. Connection tasks have run; no process task has.
pub(crate) fn graph(nb_sinks: usize, full_block: bool) -> Graph {
    graph_with(builder(full_block), &vec!["collector"; nb_sinks])
}

/// Same as [`graph`] with one sink per register name, loaded in order.
pub(crate) fn graph_with(builder: SessionBuilder, sinks: &[&str]) -> Graph {
    let session = builder.build();
    let source = session.load_filter("passive").unwrap();
    let sinks = sinks
        .iter()
        .map(|name| session.load_filter(name).unwrap())
        .collect();
    let pid = source.new_output_pid().unwrap();
    session.run().unwrap();
    Graph {
        session,
        source,
        pid,
        sinks,
    }
}

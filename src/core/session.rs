// src/core/session.rs - Filter session
//
// Core features:
// - Registry of filter registers and `name:key=value` load strings
// - Scheduler driven by N pool threads plus the thread calling `run`
// - Automatic end of session once no task is queued or running
// - Last process/connect errors, per filter and per thread statistics
// - Teardown on drop: filters destroyed once, graph links broken

use crate::core::args::{parse_load_string, FilterArgs};
use crate::core::filter::{Filter, FilterPools, FilterRegister};
use crate::core::pid::Pid;
use crate::core::scheduler::{
    thread_proc, CustomTaskFn, Scheduler, TaskKind, STATUS_END, STATUS_INIT, STATUS_RUN,
};
use crate::core::stats::{SessionStats, ThreadStats};
use crate::error::{Error, Result};
use crate::util::sync::{lock, read, write};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Default number of recycled owned packets kept per filter before buffers
/// are grown in place instead of allocated.
const DEFAULT_PACKET_RESERVOIR: usize = 50;

/// Scheduler state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Not started yet.
    Init,
    Running,
    /// Stopped, or every task is done.
    Done,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) nb_threads: usize,
    pub(crate) packet_reservoir: usize,
    pub(crate) pool_max_len: Option<usize>,
    pub(crate) max_packet_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nb_threads: 0,
            packet_reservoir: DEFAULT_PACKET_RESERVOIR,
            pool_max_len: None,
            max_packet_size: None,
        }
    }
}

/// Builder of a [`Session`].
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    registers: Vec<FilterRegister>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads besides the thread calling `Session::run`.
    pub fn threads(mut self, nb_threads: usize) -> Self {
        self.config.nb_threads = nb_threads;
        self
    }

    /// Number of recycled owned packets a filter keeps before growing
    /// buffers in place.
    pub fn packet_reservoir(mut self, packet_reservoir: usize) -> Self {
        self.config.packet_reservoir = packet_reservoir;
        self
    }

    /// Caps the number of idle items in each filter pool.
    pub fn pool_max_len(mut self, max_len: usize) -> Self {
        self.config.pool_max_len = Some(max_len);
        self
    }

    /// Largest owned packet a filter may allocate; bigger allocations,
    /// reassembled blocks included, fail with `Error::OutOfMemory`.
    pub fn max_packet_size(mut self, max_size: usize) -> Self {
        self.config.max_packet_size = Some(max_size);
        self
    }

    pub fn register(mut self, register: FilterRegister) -> Self {
        self.registers.push(register);
        self
    }

    pub fn build(self) -> Session {
        info!(
            "Creating filter session with {} worker threads and {} registers",
            self.config.nb_threads,
            self.registers.len()
        );
        Session {
            inner: Arc::new(SessionInner {
                config: self.config,
                registry: RwLock::new(self.registers),
                filters: RwLock::new(Vec::new()),
                scheduler: Scheduler::new(),
                running: AtomicBool::new(false),
                last_process_error: Mutex::new(None),
                last_connect_error: Mutex::new(None),
                thread_stats: Mutex::new(Vec::new()),
                run_time_us: AtomicU64::new(0),
            }),
        }
    }
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    registry: RwLock<Vec<FilterRegister>>,
    filters: RwLock<Vec<Arc<Filter>>>,
    pub(crate) scheduler: Scheduler,
    running: AtomicBool,
    last_process_error: Mutex<Option<Error>>,
    last_connect_error: Mutex<Option<Error>>,
    thread_stats: Mutex<Vec<ThreadStats>>,
    run_time_us: AtomicU64,
}

impl SessionInner {
    pub(crate) fn post_task(&self, filter: Option<Arc<Filter>>, pid: Option<Arc<Pid>>, kind: TaskKind) {
        self.scheduler.post(filter, pid, kind);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.scheduler.is_done()
    }

    pub(crate) fn set_last_process_error(&self, e: Error) {
        *lock(&self.last_process_error) = Some(e);
    }

    fn set_last_connect_error(&self, e: Error) {
        *lock(&self.last_connect_error) = Some(e);
    }

    /// Posts a connection task towards every filter that may consume `pid`.
    pub(crate) fn offer_pid(&self, src: &Arc<Filter>, pid: &Arc<Pid>) {
        if !pid.is_removed() && !src.is_finalized() {
            let filters = read(&self.filters).clone();
            let mut nb_offers = 0;
            for dst in filters {
                if Arc::ptr_eq(&dst, src) || dst.is_finalized() {
                    continue;
                }
                if !dst.accepts_source(src) || !dst.accepts_more_inputs() {
                    continue;
                }
                if pid.destination_for(&dst).is_some() {
                    continue;
                }
                debug!(
                    "Offering filter {} PID {} to filter {}",
                    src.name(),
                    pid.name(),
                    dst.name()
                );
                nb_offers += 1;
                src.connection_started();
                self.post_task(Some(dst), Some(pid.clone()), TaskKind::PidConnect);
            }
            if nb_offers == 0 {
                warn!(
                    "No filter can consume filter {} PID {}",
                    src.name(),
                    pid.name()
                );
            }
        }
        src.connection_done();
    }

    pub(crate) fn connect_pid(&self, dst: &Arc<Filter>, pid: &Arc<Pid>) {
        if pid.is_removed() || dst.is_finalized() {
            debug!("Skipping connection of PID {} to filter {}", pid.name(), dst.name());
        } else if pid.destination_for(dst).is_none() && !dst.accepts_more_inputs() {
            debug!(
                "Filter {} has no free input left for PID {}",
                dst.name(),
                pid.name()
            );
        } else if let Err(e) = dst.connect_pid(pid) {
            self.set_last_connect_error(e);
        }
        if let Some(src) = pid.filter() {
            src.connection_done();
        }
    }

    fn find_register(&self, name: &str) -> Option<FilterRegister> {
        read(&self.registry)
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    fn teardown(&self) {
        self.scheduler.finish();
        self.scheduler.clear();
        let filters = std::mem::take(&mut *write(&self.filters));
        for filter in &filters {
            filter.finalize();
        }
        debug!("Session destroyed {} filters", filters.len());
    }
}

/// A filter graph and the scheduler running it.
///
/// Dropping the session destroys every filter and releases every queued
/// packet.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Session without worker threads: everything runs on the thread calling
    /// [`Session::run`].
    pub fn new() -> Self {
        SessionBuilder::new().build()
    }

    pub fn nb_threads(&self) -> usize {
        self.inner.config.nb_threads
    }

    pub fn register(&self, register: FilterRegister) {
        let mut registry = write(&self.inner.registry);
        registry.retain(|r| r.name() != register.name());
        registry.push(register);
    }

    pub fn register_names(&self) -> Vec<String> {
        read(&self.inner.registry)
            .iter()
            .map(|r| r.name().to_string())
            .collect()
    }

    /// Instantiates a filter from a load string `name[:FID=id][:SID=ids][:key=value...]`.
    ///
    /// `FID` and `SID` set the filter id and source ids; every other argument
    /// is handed to the filter's `update_args` after `construct`.
    ///
    /// # Returns
    /// `Error::FilterNotFound` for an unknown register name, or the error of
    /// the filter's `construct`/`update_args`, in which case the filter is
    /// not added to the session.
    pub fn load_filter(&self, load_string: &str) -> Result<Arc<Filter>> {
        let (name, mut args) = parse_load_string(load_string);
        let register = self
            .inner
            .find_register(&name)
            .ok_or_else(|| Error::FilterNotFound(name.clone()))?;

        let config = &self.inner.config;
        let pools = FilterPools::new(
            config.packet_reservoir,
            config.pool_max_len,
            config.max_packet_size,
        );
        let filter = Arc::new(Filter::new(&self.inner, register, pools));
        if let Some(fid) = args.take("FID") {
            filter.set_id(fid.as_deref());
        }
        if let Some(sid) = args.take("SID") {
            filter.set_source_ids(sid.as_deref());
        }

        if let Err(e) = self.init_filter(&filter, &args) {
            error!("Failed to load filter {}: {}", name, e);
            filter.finalize();
            return Err(e);
        }
        write(&self.inner.filters).push(filter.clone());
        info!(
            "Loaded filter {}{}",
            name,
            filter.id().map(|id| format!(" (FID {id})")).unwrap_or_default()
        );

        if filter.register().get_max_input_pids() == 0 {
            filter.post_process_task();
        }
        Ok(filter)
    }

    fn init_filter(&self, filter: &Arc<Filter>, args: &FilterArgs) -> Result<()> {
        filter.with_impl(|imp, f| imp.construct(f))?;
        if !args.is_empty() {
            filter.with_impl(|imp, f| imp.update_args(f, args))?;
        }
        Ok(())
    }

    pub fn filters(&self) -> Vec<Arc<Filter>> {
        read(&self.inner.filters).clone()
    }

    pub fn filter_by_id(&self, id: &str) -> Option<Arc<Filter>> {
        read(&self.inner.filters)
            .iter()
            .find(|f| f.id().as_deref() == Some(id))
            .cloned()
    }

    /// Runs `f` on `filter` from a scheduler task, never concurrently with
    /// the filter's other tasks. `f` returns `true` to be run again.
    pub fn post_filter_task<F>(&self, filter: &Arc<Filter>, f: F)
    where
        F: FnMut(&Arc<Filter>) -> bool + Send + 'static,
    {
        let task: CustomTaskFn = Box::new(f);
        self.inner
            .post_task(Some(filter.clone()), None, TaskKind::Custom(task));
    }

    /// Runs the session until every task is done or [`Session::stop`] is
    /// called.
    ///
    /// The calling thread works as one of the scheduler threads.
    pub fn run(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::BadParam("session is already running".into()));
        }
        let run_start = Instant::now();
        inner.scheduler.set_status(STATUS_RUN);
        info!(
            "Session running {} filters on {} threads",
            read(&inner.filters).len(),
            inner.config.nb_threads + 1
        );

        let mut handles = Vec::with_capacity(inner.config.nb_threads);
        let mut result = Ok(());
        for i in 1..=inner.config.nb_threads {
            let session = inner.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("filter-session-worker{i}"))
                .spawn(move || thread_proc(&session, i));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("Thread[filter-session-worker{i}] exited with error: {e}");
                    inner.scheduler.finish();
                    result = Err(Error::SessionThreadExited);
                    break;
                }
            }
        }

        let mut all_stats = Vec::with_capacity(handles.len() + 1);
        if result.is_ok() {
            inner.scheduler.notify();
            all_stats.push(thread_proc(inner, 0));
        }
        for handle in handles {
            match handle.join() {
                Ok(stats) => all_stats.push(stats),
                Err(_) => {
                    error!("Session worker thread panicked");
                    result = Err(Error::SessionThreadExited);
                }
            }
        }

        *lock(&inner.thread_stats) = all_stats;
        inner
            .run_time_us
            .store(run_start.elapsed().as_micros() as u64, Ordering::Release);
        inner.running.store(false, Ordering::Release);
        info!("Session done");
        result
    }

    /// Requests the end of the session; `run` returns once running tasks are
    /// done. Callable from any thread, including from a filter.
    pub fn stop(&self) {
        info!("Session stop requested");
        self.inner.scheduler.finish();
    }

    pub fn run_status(&self) -> RunStatus {
        match self.inner.scheduler.status() {
            STATUS_INIT => RunStatus::Init,
            STATUS_END => RunStatus::Done,
            _ => RunStatus::Running,
        }
    }

    /// Number of tasks waiting to be run.
    pub fn nb_queued_tasks(&self) -> usize {
        self.inner.scheduler.nb_queued()
    }

    /// Takes the last error returned by a filter's `process`.
    pub fn take_last_process_error(&self) -> Option<Error> {
        lock(&self.inner.last_process_error).take()
    }

    /// Takes the last error of a pid connection.
    pub fn take_last_connect_error(&self) -> Option<Error> {
        lock(&self.inner.last_connect_error).take()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            filters: self.filters().iter().map(|f| f.filter_stats()).collect(),
            threads: lock(&self.inner.thread_stats).clone(),
            run_time_us: self.inner.run_time_us.load(Ordering::Acquire),
        }
    }

    /// Logs the statistics report.
    pub fn print_stats(&self) {
        self.stats().log();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::FilterImpl;
    use crate::core::test_util::{graph, session};
    use std::sync::atomic::AtomicUsize;

    /// Records the arguments it receives.
    struct ArgsRecorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl FilterImpl for ArgsRecorder {
        fn update_args(&mut self, _filter: &Arc<Filter>, args: &FilterArgs) -> Result<()> {
            if args.contains("fail") {
                return Err(Error::BadParam("fail requested".into()));
            }
            lock(&self.seen).extend(args.iter().map(|(k, _)| k.to_string()));
            Ok(())
        }

        fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
            Err(Error::EndOfStream)
        }
    }

    fn args_session(seen: &Arc<Mutex<Vec<String>>>) -> Session {
        let seen = seen.clone();
        Session::builder()
            .register(FilterRegister::new("recorder", move || {
                Box::new(ArgsRecorder { seen: seen.clone() })
            }))
            .build()
    }

    #[test]
    fn test_unknown_filter_not_found() {
        let s = session(false);
        assert!(matches!(
            s.load_filter("nope:x=1"),
            Err(Error::FilterNotFound(name)) if name == "nope"
        ));
        assert!(s.filters().is_empty());
    }

    #[test]
    fn test_session_args_not_forwarded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = args_session(&seen);
        let f = s.load_filter("recorder:FID=p1:SID=up:rate=44100:mono").unwrap();
        assert_eq!(f.id().as_deref(), Some("p1"));
        assert_eq!(f.source_ids().as_deref(), Some("up"));
        assert_eq!(*lock(&seen), vec!["rate".to_string(), "mono".to_string()]);
        assert!(s.filter_by_id("p1").is_some());
    }

    #[test]
    fn test_failed_load_not_added() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = args_session(&seen);
        assert!(matches!(s.load_filter("recorder:fail"), Err(Error::BadParam(_))));
        assert!(s.filters().is_empty());
        assert_eq!(s.nb_queued_tasks(), 0);
    }

    #[test]
    fn test_register_replaces_same_name() {
        let s = session(false);
        s.register(FilterRegister::new("collector", || {
            Box::new(crate::core::test_util::Passive)
        })
        .description("replaced"));
        assert_eq!(s.register_names(), vec!["passive", "collector"]);
    }

    #[test]
    fn test_run_status_and_rerun() {
        let g = graph(1, false);
        assert_eq!(g.session.run_status(), RunStatus::Done);
        g.pid.new_packet_alloc(1).unwrap().send().unwrap();
        assert_eq!(g.session.nb_queued_tasks(), 1);
        g.session.run().unwrap();
        assert_eq!(g.session.nb_queued_tasks(), 0);
        assert_eq!(g.session.run_status(), RunStatus::Done);

        let s = session(false);
        assert_eq!(s.run_status(), RunStatus::Init);
    }

    #[test]
    fn test_custom_task_repeats_until_false() {
        let s = session(false);
        let sink = s.load_filter("collector").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        s.post_filter_task(&sink, move |_| counter.fetch_add(1, Ordering::SeqCst) < 4);
        s.run().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_stop_from_task_ends_run() {
        let s = Arc::new(session(false));
        let sink = s.load_filter("collector").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = Arc::downgrade(&s);
        s.post_filter_task(&sink, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                if let Some(s) = handle.upgrade() {
                    s.stop();
                }
            }
            true
        });
        s.run().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(s.run_status(), RunStatus::Done);
    }

    #[test]
    fn test_process_error_recorded() {
        struct Failing;
        impl FilterImpl for Failing {
            fn configure_pid(
                &mut self,
                _filter: &Arc<Filter>,
                _pid: &Arc<crate::core::pid_inst::PidInstance>,
                _is_remove: bool,
            ) -> Result<()> {
                Ok(())
            }

            fn process(&mut self, _filter: &Arc<Filter>) -> Result<()> {
                Err(Error::NonCompliantBitstream("bad sync byte".into()))
            }
        }
        let s = session(false);
        s.register(FilterRegister::new("failing", || Box::new(Failing)));
        let f = s.load_filter("failing").unwrap();
        f.post_process_task();
        s.run().unwrap();
        assert!(matches!(
            s.take_last_process_error(),
            Some(Error::NonCompliantBitstream(_))
        ));
        assert!(s.take_last_process_error().is_none());
    }

    #[test]
    fn test_stats_after_run() {
        let s = Session::builder().threads(2).build();
        s.register(FilterRegister::new("passive", || {
            Box::new(crate::core::test_util::Passive)
        })
        .max_input_pids(0));
        let f = s.load_filter("passive:FID=p").unwrap();
        s.run().unwrap();

        let stats = s.stats();
        assert_eq!(stats.threads.len(), 3);
        assert_eq!(stats.filters.len(), 1);
        assert_eq!(stats.filters[0].id.as_deref(), Some("p"));
        assert_eq!(stats.total_tasks(), 1);
        assert!(f.is_eos());
        s.print_stats();
    }

    #[test]
    fn test_drop_releases_queued_packets() {
        let g = graph(1, false);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        g.pid
            .new_packet_shared(
                bytes::Bytes::from_static(b"abc"),
                Some(Box::new(move |_: bytes::Bytes| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .send()
            .unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(g);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}

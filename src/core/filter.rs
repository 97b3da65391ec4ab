// src/core/filter.rs - Processing nodes of the graph
//
// Core features:
// - `FilterImpl` trait implemented by concrete filters, `FilterRegister`
//   descriptor used by the session registry
// - Per-filter packet and property pools
// - Pid connection/disconnection with full unwinding on failure
// - Process task logic: postponed packet flush, source re-scheduling,
//   no lost wake-up for posts arriving during a run

use crate::core::args::FilterArgs;
use crate::core::obj_pool::ObjPool;
use crate::core::packet::{Packet, PacketInner};
use crate::core::pid::Pid;
use crate::core::pid_inst::PidInstance;
use crate::core::props::PropertyTablePool;
use crate::core::scheduler::TaskKind;
use crate::core::session::SessionInner;
use crate::core::stats::{FilterCounters, FilterStats};
use crate::error::{Error, Result};
use crate::util::sync::{lock, read, write};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Behaviour of a concrete filter.
///
/// A filter is never entered by two threads at once: every method runs
/// either before the session starts or from a task holding the filter's
/// in-process guard.
pub trait FilterImpl: Send {
    /// Called once when the filter is loaded. Output pids may be declared here.
    fn construct(&mut self, _filter: &Arc<Filter>) -> Result<()> {
        Ok(())
    }

    /// Called once when the session is torn down.
    fn destruct(&mut self, _filter: &Arc<Filter>) {}

    /// Receives the load-string arguments not consumed by the session.
    fn update_args(&mut self, _filter: &Arc<Filter>, _args: &FilterArgs) -> Result<()> {
        Ok(())
    }

    /// Accepts, reconfigures or releases an input pid.
    ///
    /// Must be idempotent. An incompatible pid is rejected with
    /// `Error::NotSupported` and leaves the filter unchanged.
    fn configure_pid(
        &mut self,
        filter: &Arc<Filter>,
        _pid: &Arc<PidInstance>,
        _is_remove: bool,
    ) -> Result<()> {
        Err(Error::NotSupported(format!(
            "filter {} does not accept input pids",
            filter.name()
        )))
    }

    /// Consumes queued packets and produces new ones.
    ///
    /// Returns `Error::EndOfStream` once the filter has nothing more to do.
    fn process(&mut self, filter: &Arc<Filter>) -> Result<()>;
}

pub type FilterFactory = dyn Fn() -> Box<dyn FilterImpl> + Send + Sync;

/// Registration descriptor of a filter type.
#[derive(Clone)]
pub struct FilterRegister {
    name: String,
    description: String,
    max_input_pids: usize,
    factory: Arc<FilterFactory>,
}

impl FilterRegister {
    /// Creates a register accepting one input pid.
    pub fn new<F>(name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FilterImpl> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            description: String::new(),
            max_input_pids: 1,
            factory: Arc::new(factory),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Maximum number of input pids; 0 for a source filter.
    pub fn max_input_pids(mut self, max_input_pids: usize) -> Self {
        self.max_input_pids = max_input_pids;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_description(&self) -> &str {
        &self.description
    }

    pub fn get_max_input_pids(&self) -> usize {
        self.max_input_pids
    }

    pub(crate) fn instantiate(&self) -> Box<dyn FilterImpl> {
        (self.factory)()
    }
}

impl fmt::Debug for FilterRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegister")
            .field("name", &self.name)
            .field("max_input_pids", &self.max_input_pids)
            .finish()
    }
}

// ============================================================================
// Pools
// ============================================================================

/// Number of idle items in each pool of a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub alloc_packets: usize,
    pub shared_packets: usize,
    pub property_maps: usize,
}

pub(crate) struct FilterPools {
    pck_alloc: ObjPool<Box<PacketInner>>,
    pck_shared: ObjPool<Box<PacketInner>>,
    pub(crate) prop_tables: Arc<PropertyTablePool>,
    alloc_reservoir: usize,
    max_packet_size: Option<usize>,
}

/// Above this size the closest buffer is the largest one, not the smallest.
const SMALL_PACKET_SIZE: usize = 1000;

impl FilterPools {
    pub(crate) fn new(
        alloc_reservoir: usize,
        max_len: Option<usize>,
        max_packet_size: Option<usize>,
    ) -> Self {
        let pool = || match max_len {
            Some(max) => ObjPool::with_max_len(max),
            None => ObjPool::new(),
        };
        Self {
            pck_alloc: pool(),
            pck_shared: pool(),
            prop_tables: Arc::new(match max_len {
                Some(max) => ObjPool::with_max_len(max),
                None => ObjPool::new(),
            }),
            alloc_reservoir: alloc_reservoir.max(1),
            max_packet_size,
        }
    }

    /// Takes an owned packet body sized to `size` bytes.
    ///
    /// Picks the recycled buffer with the smallest capacity that fits. When
    /// none fits and the reservoir is full, the closest buffer is grown
    /// instead of allocating another one.
    ///
    /// # Returns
    /// `Error::OutOfMemory` above the session's maximum packet size, or when
    /// the buffer cannot be grown.
    pub(crate) fn take_alloc(&self, size: usize, has_destinations: bool) -> Result<Box<PacketInner>> {
        if let Some(max) = self.max_packet_size.filter(|max| size > *max) {
            warn!("Refusing {} bytes packet allocation, maximum is {}", size, max);
            return Err(Error::OutOfMemory);
        }
        let reservoir = if has_destinations { self.alloc_reservoir } else { 1 };

        let mut candidates = Vec::new();
        while let Some(item) = self.pck_alloc.pop() {
            candidates.push(item);
        }
        let nb_candidates = candidates.len();

        let best_fit = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.capacity() >= size)
            .min_by_key(|(_, c)| c.capacity())
            .map(|(i, _)| i);
        let chosen = match best_fit {
            Some(i) => Some(i),
            None if nb_candidates >= reservoir => {
                let by_capacity = candidates.iter().enumerate().map(|(i, c)| (i, c.capacity()));
                if size < SMALL_PACKET_SIZE {
                    by_capacity.min_by_key(|(_, cap)| *cap).map(|(i, _)| i)
                } else {
                    by_capacity.max_by_key(|(_, cap)| *cap).map(|(i, _)| i)
                }
            }
            None => None,
        };

        let mut inner = match chosen {
            Some(i) => candidates.swap_remove(i),
            None => Box::new(PacketInner::new()),
        };
        for item in candidates {
            self.pck_alloc.push(item);
        }
        inner.prepare_owned(size)?;
        Ok(inner)
    }

    pub(crate) fn take_shared(&self) -> Box<PacketInner> {
        self.pck_shared
            .pop_or_else(|| Box::new(PacketInner::new()))
    }

    pub(crate) fn recycle_alloc(&self, inner: Box<PacketInner>) {
        self.pck_alloc.push(inner);
    }

    pub(crate) fn recycle_shared(&self, inner: Box<PacketInner>) {
        self.pck_shared.push(inner);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            alloc_packets: self.pck_alloc.len(),
            shared_packets: self.pck_shared.len(),
            property_maps: self.prop_tables.len(),
        }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// A processing node of the session graph.
pub struct Filter {
    name: String,
    register: FilterRegister,
    session: Weak<SessionInner>,
    id: RwLock<Option<String>>,
    source_ids: RwLock<Option<String>>,
    imp: Mutex<Box<dyn FilterImpl>>,
    pools: Arc<FilterPools>,
    input_pids: RwLock<Vec<Arc<PidInstance>>>,
    output_pids: RwLock<Vec<Arc<Pid>>>,
    pid_counter: AtomicUsize,
    /// Guarded by the session task lock.
    pub(crate) in_process: AtomicBool,
    process_task_queued: AtomicUsize,
    pending_packets: AtomicUsize,
    connections_pending: AtomicUsize,
    postponed: Mutex<Vec<(Arc<Pid>, Packet)>>,
    eos_reached: AtomicBool,
    finalized: AtomicBool,
    stats: FilterCounters,
}

impl Filter {
    pub(crate) fn new(
        session: &Arc<SessionInner>,
        register: FilterRegister,
        pools: FilterPools,
    ) -> Self {
        Self {
            name: register.name().to_string(),
            imp: Mutex::new(register.instantiate()),
            register,
            session: Arc::downgrade(session),
            id: RwLock::new(None),
            source_ids: RwLock::new(None),
            pools: Arc::new(pools),
            input_pids: RwLock::new(Vec::new()),
            output_pids: RwLock::new(Vec::new()),
            pid_counter: AtomicUsize::new(0),
            in_process: AtomicBool::new(false),
            process_task_queued: AtomicUsize::new(0),
            pending_packets: AtomicUsize::new(0),
            connections_pending: AtomicUsize::new(0),
            postponed: Mutex::new(Vec::new()),
            eos_reached: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            stats: FilterCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self) -> &FilterRegister {
        &self.register
    }

    /// Filter id, matched against the source ids of downstream filters.
    pub fn id(&self) -> Option<String> {
        read(&self.id).clone()
    }

    pub fn set_id(&self, id: Option<&str>) {
        *write(&self.id) = id.map(str::to_string);
    }

    /// Comma-separated ids of the filters allowed to feed this one; `None`
    /// or empty accepts any source.
    pub fn source_ids(&self) -> Option<String> {
        read(&self.source_ids).clone()
    }

    pub fn set_source_ids(&self, source_ids: Option<&str>) {
        *write(&self.source_ids) = source_ids.map(str::to_string);
    }

    pub(crate) fn pools(&self) -> &Arc<FilterPools> {
        &self.pools
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pools.stats()
    }

    pub(crate) fn stats(&self) -> &FilterCounters {
        &self.stats
    }

    pub fn filter_stats(&self) -> FilterStats {
        FilterStats {
            name: self.name.clone(),
            id: self.id(),
            nb_input_pids: self.nb_input_pids(),
            nb_output_pids: self.nb_output_pids(),
            ..self.stats.snapshot()
        }
    }

    pub(crate) fn session(&self) -> Option<Arc<SessionInner>> {
        self.session.upgrade()
    }

    pub(crate) fn with_impl<R>(self: &Arc<Self>, f: impl FnOnce(&mut dyn FilterImpl, &Arc<Filter>) -> R) -> R {
        let mut imp = lock(&self.imp);
        f(&mut **imp, self)
    }

    // ========================================================================
    // Pids
    // ========================================================================

    /// Declares a new output pid, named `PID<n>`.
    ///
    /// The pid is offered to every other filter of the session whose source
    /// ids match this filter. Packets sent before those connections are
    /// established are held back and delivered once they are.
    pub fn new_output_pid(self: &Arc<Self>) -> Result<Arc<Pid>> {
        let session = self
            .session()
            .ok_or_else(|| Error::BadParam(format!("filter {} has no session", self.name)))?;
        let index = self.pid_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let pid = Arc::new(Pid::new(self, format!("PID{index}")));

        let inputs = self.input_pids();
        if inputs.len() == 1 {
            pid.copy_properties_from(&inputs[0])?;
        }
        write(&self.output_pids).push(pid.clone());
        info!("Filter {} new output PID {}", self.name, pid.name());

        self.connection_started();
        session.post_task(Some(self.clone()), Some(pid.clone()), TaskKind::PidInit);
        Ok(pid)
    }

    pub fn input_pids(&self) -> Vec<Arc<PidInstance>> {
        read(&self.input_pids).clone()
    }

    pub fn output_pids(&self) -> Vec<Arc<Pid>> {
        read(&self.output_pids).clone()
    }

    pub fn input_pid(&self, index: usize) -> Option<Arc<PidInstance>> {
        read(&self.input_pids).get(index).cloned()
    }

    pub fn output_pid(&self, index: usize) -> Option<Arc<Pid>> {
        read(&self.output_pids).get(index).cloned()
    }

    pub fn nb_input_pids(&self) -> usize {
        read(&self.input_pids).len()
    }

    pub fn nb_output_pids(&self) -> usize {
        read(&self.output_pids).len()
    }

    pub(crate) fn detach_output_pid(&self, pid: &Arc<Pid>) {
        write(&self.output_pids).retain(|p| !Arc::ptr_eq(p, pid));
    }

    /// Source filters have no input and at least one output.
    pub fn is_source(&self) -> bool {
        self.nb_input_pids() == 0 && self.nb_output_pids() > 0
    }

    pub(crate) fn accepts_more_inputs(&self) -> bool {
        self.nb_input_pids() < self.register.max_input_pids
    }

    /// `true` if this filter may be fed by `src`.
    pub(crate) fn accepts_source(&self, src: &Filter) -> bool {
        let source_ids = read(&self.source_ids);
        match source_ids.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(ids) => match read(&src.id).as_deref() {
                Some(src_id) => ids.split(',').map(str::trim).any(|id| id == src_id),
                None => false,
            },
        }
    }

    /// Connects `pid` into this filter.
    ///
    /// Reuses the existing connection if there is one. On failure nothing
    /// stays linked: an existing connection is torn down as well.
    pub(crate) fn connect_pid(self: &Arc<Self>, pid: &Arc<Pid>) -> Result<Arc<PidInstance>> {
        let existing = pid.destination_for(self);
        let is_new = existing.is_none();
        if is_new && !self.accepts_more_inputs() {
            return Err(Error::NotSupported(format!(
                "filter {} cannot accept more input pids",
                self.name
            )));
        }
        let pidi = existing.unwrap_or_else(|| Arc::new(PidInstance::new(pid.clone(), self)));

        match self.with_impl(|imp, filter| imp.configure_pid(filter, &pidi, false)) {
            Ok(()) => {
                if is_new {
                    write(&self.input_pids).push(pidi.clone());
                    pid.add_destination(pidi.clone());
                } else {
                    pid.recompute_framing();
                }
                info!(
                    "Filter {} PID {} connected to filter {}",
                    pid.filter_name(),
                    pid.name(),
                    self.name
                );
                Ok(pidi)
            }
            Err(e) => {
                warn!(
                    "Failed to connect filter {} PID {} to filter {}: {}",
                    pid.filter_name(),
                    pid.name(),
                    self.name,
                    e
                );
                if !is_new {
                    self.unlink_input(&pidi);
                }
                Err(e)
            }
        }
    }

    /// Releases `pid` from this filter.
    pub(crate) fn disconnect_pid(self: &Arc<Self>, pid: &Arc<Pid>) {
        let Some(pidi) = pid.destination_for(self) else {
            debug!(
                "Filter {} PID {} already disconnected from filter {}",
                pid.filter_name(),
                pid.name(),
                self.name
            );
            return;
        };
        if let Err(e) = self.with_impl(|imp, filter| imp.configure_pid(filter, &pidi, true)) {
            warn!(
                "Filter {} error while removing PID {}: {}",
                self.name,
                pid.name(),
                e
            );
        }
        self.unlink_input(&pidi);
        info!(
            "Filter {} PID {} disconnected from filter {}",
            pid.filter_name(),
            pid.name(),
            self.name
        );
    }

    fn unlink_input(&self, pidi: &Arc<PidInstance>) {
        write(&self.input_pids).retain(|p| !Arc::ptr_eq(p, pidi));
        pidi.pid().remove_destination(pidi);
        pidi.reset();
    }

    // ========================================================================
    // Connection tracking and postponed packets
    // ========================================================================

    pub(crate) fn connection_started(&self) {
        self.connections_pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks one connection task as done; once none is left, packets held
    /// back meanwhile are flushed by a new process task.
    pub(crate) fn connection_done(self: &Arc<Self>) {
        let previous = self
            .connections_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 && !lock(&self.postponed).is_empty() {
            self.post_process_task();
        }
    }

    pub(crate) fn has_connection_pending(&self) -> bool {
        self.connections_pending.load(Ordering::Acquire) > 0
    }

    pub(crate) fn postpone_packet(&self, pid: Arc<Pid>, packet: Packet) {
        lock(&self.postponed).push((pid, packet));
    }

    fn flush_postponed(&self) -> Result<()> {
        if self.has_connection_pending() {
            return Ok(());
        }
        let packets = std::mem::take(&mut *lock(&self.postponed));
        if !packets.is_empty() {
            debug!("Filter {} flushing {} postponed packets", self.name, packets.len());
        }
        for (pid, packet) in packets {
            pid.dispatch(packet)?;
        }
        Ok(())
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub(crate) fn on_packet_queued(&self) {
        self.pending_packets.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn on_packet_dequeued(&self) {
        let _ = self
            .pending_packets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Packets queued on all input pids, not yet dropped.
    pub fn pending_packets(&self) -> usize {
        self.pending_packets.load(Ordering::Acquire)
    }

    /// Requests a `process` call. Posts made while a process task is already
    /// queued or running are coalesced into it.
    pub fn post_process_task(self: &Arc<Self>) {
        if self.finalized.load(Ordering::Acquire) {
            return;
        }
        if self.process_task_queued.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Some(session) = self.session() {
                session.post_task(Some(self.clone()), None, TaskKind::Process);
            }
        }
    }

    /// `true` once `process` returned end of stream.
    pub fn is_eos(&self) -> bool {
        self.eos_reached.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Body of the process task.
    ///
    /// # Returns
    /// `true` if the task must be queued again.
    pub(crate) fn process_task(self: &Arc<Self>, session: &SessionInner) -> bool {
        if self.is_finalized() {
            return false;
        }
        if self.has_connection_pending() {
            debug!("Filter {} has connections pending, delaying process", self.name);
            return !session.is_done();
        }
        if let Err(e) = self.flush_postponed() {
            error!("Filter {} failed to flush postponed packets: {}", self.name, e);
        }

        let queued = self.process_task_queued.load(Ordering::Acquire);
        let processed_before = self.stats.packets_processed();

        let result = self.with_impl(|imp, filter| imp.process(filter));
        match result {
            Err(Error::EndOfStream) => {
                debug!("Filter {} reached end of stream", self.name);
                self.eos_reached.store(true, Ordering::Release);
                self.process_task_queued.store(0, Ordering::Release);
                return false;
            }
            Err(e) if self.is_source() => {
                debug!("Source filter {} process returned {}, trying again later", self.name, e);
                return !session.is_done();
            }
            Err(e) => {
                error!("Filter {} process failed: {}", self.name, e);
                session.set_last_process_error(e);
            }
            Ok(()) => {
                self.eos_reached.store(false, Ordering::Release);
                if self.is_source() {
                    return !session.is_done();
                }
            }
        }
        if session.is_done() {
            self.process_task_queued.store(0, Ordering::Release);
            return false;
        }

        let progressed = self.stats.packets_processed() != processed_before;
        if progressed && self.pending_packets() > 0 {
            return true;
        }
        // a post made while running bumped the counter: run again
        self.process_task_queued
            .compare_exchange(queued, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }

    /// Destroys the filter: `destruct` is called and every link to other
    /// filters is broken, releasing queued packets.
    pub(crate) fn finalize(self: &Arc<Self>) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.with_impl(|imp, filter| imp.destruct(filter));

        let outputs = std::mem::take(&mut *write(&self.output_pids));
        for pid in outputs {
            for pidi in pid.clear_destinations() {
                pidi.reset();
            }
        }
        let inputs = std::mem::take(&mut *write(&self.input_pids));
        for pidi in inputs {
            pidi.pid().remove_destination(&pidi);
            pidi.reset();
        }
        lock(&self.postponed).clear();
        debug!("Filter {} destroyed", self.name);
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("inputs", &self.nb_input_pids())
            .field("outputs", &self.nb_output_pids())
            .finish()
    }
}

// src/core/pid.rs - Output ports
//
// Core features:
// - Copy-on-write property maps with history (only the last map is current)
// - Packet creation (owned, shared, alias) capturing the current map
// - Fan-out dispatch to every connected PidInstance
// - Advisory buffer occupancy, end-of-stream signaling, removal

use crate::core::filter::{Filter, FilterPools};
use crate::core::packet::{OutputPacket, Packet, PacketDestructor, PacketInfo};
use crate::core::pid_inst::PidInstance;
use crate::core::props::{PropertyMap, PropertyRef, PropertyValue, WeakPropertyMap};
use crate::core::scheduler::TaskKind;
use crate::error::{Error, Result};
use crate::util::sync::{lock, read, write};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

struct PidState {
    current: Option<PropertyMap>,
    /// Maps replaced while packets still held them, oldest first; dead maps
    /// are pruned. `current` is never in here.
    history: Vec<WeakPropertyMap>,
    /// Set once a packet captured `current`: the next write must start a new map.
    request_property_map: bool,
    last_timestamps: Option<(Option<u64>, Option<u64>)>,
    min_pck_duration: u32,
}

/// Queue state of a pid over its destinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferOccupancy {
    pub nb_destinations: usize,
    /// Largest number of packets queued on one destination.
    pub max_packets: usize,
    /// Largest buffered duration on one destination, in microseconds.
    pub max_duration_us: u64,
}

/// Output port of a filter.
pub struct Pid {
    name: RwLock<String>,
    filter: Weak<Filter>,
    pools: Arc<FilterPools>,
    state: Mutex<PidState>,
    destinations: RwLock<Vec<Arc<PidInstance>>>,
    requires_full_blocks: AtomicBool,
    has_seen_eos: AtomicBool,
    removed: AtomicBool,
    nb_pck_sent: AtomicU64,
}

impl Pid {
    pub(crate) fn new(filter: &Arc<Filter>, name: String) -> Self {
        Self {
            name: RwLock::new(name),
            filter: Arc::downgrade(filter),
            pools: filter.pools().clone(),
            state: Mutex::new(PidState {
                current: None,
                history: Vec::new(),
                request_property_map: true,
                last_timestamps: None,
                min_pck_duration: 0,
            }),
            destinations: RwLock::new(Vec::new()),
            requires_full_blocks: AtomicBool::new(false),
            has_seen_eos: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            nb_pck_sent: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> String {
        read(&self.name).clone()
    }

    pub fn set_name(&self, name: &str) {
        *write(&self.name) = name.to_string();
    }

    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.upgrade()
    }

    pub(crate) fn filter_name(&self) -> String {
        self.filter
            .upgrade()
            .map(|f| f.name().to_string())
            .unwrap_or_default()
    }

    // ========================================================================
    // Properties
    // ========================================================================

    fn with_writable_map<R>(&self, f: impl FnOnce(&mut PropertyMap) -> Result<R>) -> Result<R> {
        let mut state = lock(&self.state);
        let needs_new = state.request_property_map
            || state.current.as_ref().map_or(true, PropertyMap::is_shared);
        if needs_new {
            // the current map never has weak handles, so it stays writable
            let map = match state.current.take() {
                Some(old) => {
                    let map = old.fork();
                    state.history.retain(WeakPropertyMap::is_alive);
                    state.history.push(old.downgrade());
                    map
                }
                None => PropertyMap::with_pool(&self.pools.prop_tables),
            };
            state.current = Some(map);
            state.request_property_map = false;
        }
        match state.current.as_mut() {
            Some(map) => f(map),
            None => Err(Error::BadParam("pid has no property map".into())),
        }
    }

    /// Sets a property on the pid.
    ///
    /// Packets already created keep the map they captured; the change is seen
    /// by packets created after this call.
    pub fn set_property(&self, code: u32, value: impl Into<PropertyValue>) -> Result<()> {
        self.with_writable_map(|map| map.set(code, value))
    }

    pub fn set_property_str(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        self.with_writable_map(|map| map.set_str(name, value))
    }

    pub fn remove_property(&self, code: u32) -> Result<()> {
        self.with_writable_map(|map| map.remove(code).map(|_| ()))
    }

    pub fn remove_property_str(&self, name: &str) -> Result<()> {
        self.with_writable_map(|map| map.remove_str(name).map(|_| ()))
    }

    /// Removes every property; the previous map stays with the packets that
    /// captured it.
    pub fn reset_properties(&self) -> Result<()> {
        self.with_writable_map(PropertyMap::reset)
    }

    /// Shares every property of an input pid into this one.
    pub fn copy_properties_from(&self, src: &PidInstance) -> Result<()> {
        match src.properties() {
            Some(src_map) => self.with_writable_map(|map| map.copy_all_from(&src_map)),
            None => Ok(()),
        }
    }

    pub fn get_property(&self, code: u32) -> Option<PropertyRef> {
        lock(&self.state)
            .current
            .as_ref()
            .and_then(|map| map.get_entry(code))
    }

    pub fn get_property_str(&self, name: &str) -> Option<PropertyRef> {
        lock(&self.state)
            .current
            .as_ref()
            .and_then(|map| map.get_entry_str(name))
    }

    /// Looks `code` up in the oldest live map: the maps still held by
    /// packets first, then the current one.
    pub fn get_property_first(&self, code: u32) -> Option<PropertyRef> {
        let state = lock(&self.state);
        state
            .history
            .iter()
            .filter_map(WeakPropertyMap::upgrade)
            .find_map(|map| map.get_entry(code))
            .or_else(|| state.current.as_ref().and_then(|map| map.get_entry(code)))
    }

    /// Current property map, shared.
    pub fn current_properties(&self) -> Option<PropertyMap> {
        lock(&self.state).current.clone()
    }

    /// Captures the current map for a new packet and flags the next write.
    fn capture_properties(&self) -> (Option<PropertyMap>, bool) {
        let mut state = lock(&self.state);
        let changed = !state.request_property_map;
        state.request_property_map = true;
        (state.current.clone(), changed)
    }

    // ========================================================================
    // Packet creation
    // ========================================================================

    /// Allocates a writable packet of `size` bytes.
    ///
    /// The buffer is taken from the filter's allocation pool when a recycled
    /// buffer fits.
    ///
    /// # Returns
    /// `Error::OutOfMemory` if the buffer cannot be allocated.
    pub fn new_packet_alloc(self: &Arc<Self>, size: usize) -> Result<OutputPacket> {
        let mut pck = self.alloc_internal(size)?;
        let (props, changed) = self.capture_properties();
        pck.set_pid_properties(props, changed);
        Ok(pck)
    }

    /// Wraps caller-owned memory into a packet.
    ///
    /// `destructor`, if any, is called once with `data` when the packet is
    /// destroyed, before the packet shell is recycled.
    pub fn new_packet_shared(
        self: &Arc<Self>,
        data: Bytes,
        destructor: Option<PacketDestructor>,
    ) -> OutputPacket {
        let mut pck = OutputPacket::from_parts(self.pools.take_shared(), self.pools.clone(), self.clone());
        pck.set_shared(data, destructor);
        let (props, changed) = self.capture_properties();
        pck.set_pid_properties(props, changed);
        pck
    }

    /// Creates a packet aliasing `range` of `reference` (the whole packet if
    /// `None`). The alias keeps `reference` alive until it is destroyed.
    pub fn new_packet_ref(
        self: &Arc<Self>,
        reference: &Packet,
        range: Option<Range<usize>>,
    ) -> Result<OutputPacket> {
        let range = range.unwrap_or(0..reference.len());
        if range.start > range.end || range.end > reference.len() {
            return Err(Error::BadParam(format!(
                "range {}..{} exceeds packet size {}",
                range.start,
                range.end,
                reference.len()
            )));
        }
        let mut pck = OutputPacket::from_parts(self.pools.take_shared(), self.pools.clone(), self.clone());
        pck.set_alias(reference.clone(), range);
        let (props, changed) = self.capture_properties();
        pck.set_pid_properties(props, changed);
        Ok(pck)
    }

    /// Sends an alias of `reference` with its framing, timing and private
    /// properties.
    pub fn forward(self: &Arc<Self>, reference: &Packet) -> Result<()> {
        let mut pck = self.new_packet_ref(reference, None)?;
        let (start, end) = reference.framing();
        pck.set_framing(start, end);
        pck.merge_properties_from(reference)?;
        pck.send()
    }

    /// Owned packet without captured pid properties, used for reassembly.
    pub(crate) fn alloc_internal(self: &Arc<Self>, size: usize) -> Result<OutputPacket> {
        let inner = self
            .pools
            .take_alloc(size, self.destination_count() > 0)?;
        Ok(OutputPacket::from_parts(inner, self.pools.clone(), self.clone()))
    }

    /// Owned copy of `src`, memory and metadata.
    pub(crate) fn copy_packet(self: &Arc<Self>, src: &Packet) -> Result<Packet> {
        let mut copy = self.alloc_internal(src.len())?;
        copy.data_mut()?.copy_from_slice(src.data());
        copy.copy_metadata_from(src);
        Ok(copy.into_packet())
    }

    /// Signals end of stream to every destination.
    pub fn set_eos(self: &Arc<Self>) -> Result<()> {
        info!("EOS signaled on PID {} in filter {}", self.name(), self.filter_name());
        let mut pck = self.new_packet_shared(Bytes::new(), None);
        pck.mark_eos();
        pck.send()
    }

    pub fn has_seen_eos(&self) -> bool {
        self.has_seen_eos.load(Ordering::Acquire)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub(crate) fn update_timing(&self, info: &mut PacketInfo) {
        let mut state = lock(&self.state);
        let mut duration = 0u64;
        match state.last_timestamps {
            None => state.last_timestamps = Some((info.dts, info.cts)),
            Some((last_dts, last_cts)) if info.duration == 0 => {
                if let (Some(dts), Some(last)) = (info.dts, last_dts) {
                    duration = dts.saturating_sub(last);
                } else if let (Some(cts), Some(last)) = (info.cts, last_cts) {
                    duration = cts.abs_diff(last);
                }
                state.last_timestamps = Some((info.dts, info.cts));
            }
            Some(_) => duration = info.duration as u64,
        }
        let duration = u32::try_from(duration).unwrap_or(u32::MAX);
        if duration > 0 && (state.min_pck_duration == 0 || duration < state.min_pck_duration) {
            state.min_pck_duration = duration;
        }
        if info.duration == 0 && state.min_pck_duration > 0 {
            info.duration = duration;
        }
    }

    /// Smallest packet duration observed on this pid, 0 if unknown.
    pub fn min_packet_duration(&self) -> u32 {
        lock(&self.state).min_pck_duration
    }

    pub(crate) fn dispatch(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let filter = match self.filter.upgrade() {
            Some(filter) => filter,
            None => {
                debug!("PID {} has no filter anymore, discarding packet", self.name());
                return Ok(());
            }
        };
        self.has_seen_eos
            .store(packet.is_eos_marker(), Ordering::Release);

        if filter.has_connection_pending() {
            debug!(
                "Filter {} PID {} connection pending, queuing packet",
                filter.name(),
                self.name()
            );
            filter.postpone_packet(self.clone(), packet);
            return Ok(());
        }

        self.nb_pck_sent.fetch_add(1, Ordering::Relaxed);
        filter.stats().on_packet_sent(packet.len());
        debug!(
            "Filter {} PID {} sent packet DTS {:?} CTS {:?} SAP {} duration {}",
            filter.name(),
            self.name(),
            packet.dts(),
            packet.cts(),
            packet.info().sap,
            packet.duration()
        );

        let destinations = read(&self.destinations).clone();
        let mut nb_dispatch = 0;
        for dst in &destinations {
            let Some(dst_filter) = dst.filter() else {
                continue;
            };
            nb_dispatch += 1;
            // a failing destination does not stop the others
            match dst.enqueue(packet.clone()) {
                Ok(true) => {
                    debug!(
                        "Dispatched packet from filter {} PID {} to filter {} - {} packets in PID buffer",
                        filter.name(),
                        self.name(),
                        dst_filter.name(),
                        dst.packet_count()
                    );
                    dst_filter.post_process_task();
                }
                Ok(false) => {}
                Err(e) => error!(
                    "Filter {} PID {}: failed to dispatch packet to filter {}: {}",
                    filter.name(),
                    self.name(),
                    dst_filter.name(),
                    e
                ),
            }
        }
        if nb_dispatch == 0 {
            warn!(
                "No PID destination on filter {} PID {} for packet - discarding",
                filter.name(),
                self.name()
            );
        }
        Ok(())
    }

    // ========================================================================
    // Destinations
    // ========================================================================

    pub fn destination_count(&self) -> usize {
        read(&self.destinations).len()
    }

    pub fn destinations(&self) -> Vec<Arc<PidInstance>> {
        read(&self.destinations).clone()
    }

    pub(crate) fn destination_for(&self, filter: &Arc<Filter>) -> Option<Arc<PidInstance>> {
        read(&self.destinations)
            .iter()
            .find(|d| d.filter().is_some_and(|f| Arc::ptr_eq(&f, filter)))
            .cloned()
    }

    pub(crate) fn add_destination(&self, pidi: Arc<PidInstance>) {
        {
            let mut dests = write(&self.destinations);
            if !dests.iter().any(|d| Arc::ptr_eq(d, &pidi)) {
                dests.push(pidi);
            }
        }
        self.recompute_framing();
    }

    pub(crate) fn remove_destination(&self, pidi: &Arc<PidInstance>) {
        write(&self.destinations).retain(|d| !Arc::ptr_eq(d, pidi));
        self.recompute_framing();
    }

    pub(crate) fn clear_destinations(&self) -> Vec<Arc<PidInstance>> {
        let dests = std::mem::take(&mut *write(&self.destinations));
        self.requires_full_blocks.store(false, Ordering::Release);
        dests
    }

    /// `true` when every destination requires complete blocks.
    pub fn requires_full_blocks_dispatch(&self) -> bool {
        self.requires_full_blocks.load(Ordering::Acquire)
    }

    pub(crate) fn recompute_framing(&self) {
        let dests = read(&self.destinations);
        let all_full = !dests.is_empty() && dests.iter().all(|d| d.requires_full_block());
        self.requires_full_blocks.store(all_full, Ordering::Release);
    }

    /// Advisory view of how much data waits in the destination queues.
    pub fn buffer_occupancy(&self) -> BufferOccupancy {
        let dests = read(&self.destinations);
        let mut occupancy = BufferOccupancy {
            nb_destinations: dests.len(),
            ..Default::default()
        };
        for dst in dests.iter() {
            occupancy.max_packets = occupancy.max_packets.max(dst.packet_count());
            occupancy.max_duration_us = occupancy.max_duration_us.max(dst.buffer_duration_us());
        }
        occupancy
    }

    pub fn nb_packets_sent(&self) -> u64 {
        self.nb_pck_sent.load(Ordering::Relaxed)
    }

    /// Disconnects the pid from every destination and removes it from its
    /// filter. Destinations see `configure_pid(.., true)` from their own
    /// task; packets still queued for them are released.
    pub fn remove(self: &Arc<Self>) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(filter) = self.filter() else {
            return;
        };
        info!("Filter {} removing PID {}", filter.name(), self.name());
        filter.detach_output_pid(self);
        let Some(session) = filter.session() else {
            return;
        };
        for dst in self.destinations() {
            if let Some(dst_filter) = dst.filter() {
                session.post_task(Some(dst_filter), Some(self.clone()), TaskKind::PidDisconnect);
            }
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pid")
            .field("name", &self.name())
            .field("filter", &self.filter_name())
            .field("destinations", &self.destination_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::props::{PROP_PID_TIMESCALE, PROP_PID_WIDTH};
    use crate::core::test_util::{builder, graph, graph_with, session};

    fn width(props: Option<&PropertyMap>) -> Option<u32> {
        props
            .and_then(|p| p.get(PROP_PID_WIDTH))
            .and_then(PropertyValue::as_uint)
    }

    #[test]
    fn test_pid_names() {
        let g = graph(0, false);
        assert_eq!(g.pid.name(), "PID1");
        let second = g.source.new_output_pid().unwrap();
        assert_eq!(second.name(), "PID2");
        second.set_name("video");
        assert_eq!(second.name(), "video");
    }

    #[test]
    fn test_packets_keep_captured_properties() {
        let g = graph(1, false);
        g.pid.set_property(PROP_PID_WIDTH, 320u32).unwrap();
        let first = g.pid.new_packet_alloc(1).unwrap();
        let second = g.pid.new_packet_alloc(1).unwrap();
        g.pid.set_property(PROP_PID_WIDTH, 640u32).unwrap();
        let third = g.pid.new_packet_alloc(1).unwrap();

        assert_eq!(width(first.pid_properties()), Some(320));
        assert_eq!(width(second.pid_properties()), Some(320));
        assert_eq!(width(third.pid_properties()), Some(640));
        assert!(first.pid_properties().unwrap().ptr_eq(second.pid_properties().unwrap()));

        first.send().unwrap();
        second.send().unwrap();
        third.send().unwrap();
        let input = g.input(0);
        let flags: Vec<bool> = (0..3)
            .map(|_| {
                let p = input.get_packet().unwrap();
                input.drop_packet();
                p.pid_props_changed()
            })
            .collect();
        assert_eq!(flags, vec![true, false, true]);
    }

    #[test]
    fn test_writes_without_packets_reuse_the_map() {
        let g = graph(0, false);
        g.pid.set_property(PROP_PID_WIDTH, 1u32).unwrap();
        let map = g.pid.current_properties().unwrap();
        drop(map);
        g.pid.set_property_str("codec", "raw").unwrap();

        let state = lock(&g.pid.state);
        assert!(state.history.is_empty());
        let current = state.current.as_ref().unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(current.reference_count(), 1);
    }

    #[test]
    fn test_write_after_capture_leaves_packet_map_alone() {
        let g = graph(0, false);
        g.pid.set_property(PROP_PID_WIDTH, 320u32).unwrap();
        let pck = g.pid.new_packet_alloc(1).unwrap();
        let captured = pck.pid_properties().unwrap();
        // held by the pid and by the packet
        assert_eq!(captured.reference_count(), 2);

        g.pid.set_property(PROP_PID_WIDTH, 640u32).unwrap();
        assert_eq!(captured.reference_count(), 1);
        assert_eq!(width(Some(captured)), Some(320));

        let state = lock(&g.pid.state);
        let current = state.current.as_ref().unwrap();
        assert_eq!(current.reference_count(), 1);
        assert!(!current.ptr_eq(captured));
        assert_eq!(width(Some(current)), Some(640));
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn test_property_history_first_and_current() {
        let g = graph(0, false);
        g.pid.set_property(PROP_PID_WIDTH, 100u32).unwrap();
        let pck = g.pid.new_packet_alloc(1).unwrap();
        g.pid.set_property(PROP_PID_WIDTH, 200u32).unwrap();

        let first = g.pid.get_property_first(PROP_PID_WIDTH).unwrap();
        assert_eq!(first.value().as_uint(), Some(100));
        let current = g.pid.get_property(PROP_PID_WIDTH).unwrap();
        assert_eq!(current.value().as_uint(), Some(200));

        // once no packet holds the old map, it leaves the history
        drop(pck);
        let first = g.pid.get_property_first(PROP_PID_WIDTH).unwrap();
        assert_eq!(first.value().as_uint(), Some(200));

        g.pid.remove_property(PROP_PID_WIDTH).unwrap();
        assert!(g.pid.get_property(PROP_PID_WIDTH).is_none());
    }

    #[test]
    fn test_reset_properties() {
        let g = graph(0, false);
        g.pid.set_property(PROP_PID_WIDTH, 100u32).unwrap();
        g.pid.set_property_str("lang", "en").unwrap();
        g.pid.reset_properties().unwrap();
        assert!(g.pid.current_properties().unwrap().is_empty());
    }

    #[test]
    fn test_full_block_dispatch_requires_every_destination() {
        let g = graph(2, false);
        assert!(!g.pid.requires_full_blocks_dispatch());
        g.input(0).set_framing_mode(true);
        assert!(!g.pid.requires_full_blocks_dispatch());
        g.input(1).set_framing_mode(true);
        assert!(g.pid.requires_full_blocks_dispatch());
    }

    #[test]
    fn test_failing_destination_does_not_stop_fan_out() {
        let g = graph_with(builder(false).max_packet_size(4), &["blockcollector", "collector"]);
        // the full-block destination must copy the shared fragment and cannot
        let mut pck = g.pid.new_packet_shared(Bytes::from_static(b"fragment"), None);
        pck.set_framing(true, false);
        pck.send().unwrap();

        assert_eq!(g.input(0).packet_count(), 0);
        assert_eq!(g.input(1).packet_count(), 1);
        assert_eq!(g.input(1).get_packet().unwrap().data(), b"fragment");
        assert_eq!(g.pid.nb_packets_sent(), 1);
    }

    #[test]
    fn test_send_without_destination_discards() {
        let g = graph(0, false);
        assert_eq!(g.pid.destination_count(), 0);
        g.pid.new_packet_alloc(10).unwrap().send().unwrap();
        assert_eq!(g.source.pool_stats().alloc_packets, 1);
        assert_eq!(g.pid.nb_packets_sent(), 1);
    }

    #[test]
    fn test_buffer_occupancy_uses_timescale() {
        let g = graph(2, false);
        g.pid.set_property(PROP_PID_TIMESCALE, 1000u32).unwrap();
        for _ in 0..3 {
            let mut pck = g.pid.new_packet_alloc(4).unwrap();
            pck.set_duration(40);
            pck.send().unwrap();
        }
        g.input(1).drop_packet();

        let occupancy = g.pid.buffer_occupancy();
        assert_eq!(occupancy.nb_destinations, 2);
        assert_eq!(occupancy.max_packets, 3);
        assert_eq!(occupancy.max_duration_us, 120_000);
        assert_eq!(g.input(1).buffer_duration_us(), 80_000);
    }

    #[test]
    fn test_duration_estimated_from_dts() {
        let g = graph(1, false);
        for dts in [0u64, 3000, 6000] {
            let mut pck = g.pid.new_packet_alloc(1).unwrap();
            pck.set_dts(dts);
            pck.send().unwrap();
        }
        assert_eq!(g.pid.min_packet_duration(), 3000);
        let input = g.input(0);
        input.drop_packet();
        assert_eq!(input.get_packet().unwrap().duration(), 3000);
    }

    #[test]
    fn test_eos_reaches_destinations() {
        let g = graph(1, false);
        g.pid.new_packet_alloc(2).unwrap().send().unwrap();
        g.pid.set_eos().unwrap();
        assert!(g.pid.has_seen_eos());

        let input = g.input(0);
        assert!(!input.is_eos());
        assert!(input.get_packet().is_some());
        input.drop_packet();
        assert!(input.get_packet().is_none());
        assert!(input.is_eos());
        assert_eq!(g.sinks[0].pending_packets(), 0);
    }

    #[test]
    fn test_forward_aliases_input() {
        let g = graph(1, false);
        let mut pck = g.pid.new_packet_alloc(3).unwrap();
        pck.data_mut().unwrap().copy_from_slice(b"xyz");
        pck.set_framing(true, false);
        pck.set_cts(7);
        pck.send().unwrap();
        let input = g.input(0);
        let original = input.get_packet().unwrap();
        input.drop_packet();

        g.pid.forward(&original).unwrap();
        let forwarded = input.get_packet().unwrap();
        assert_eq!(forwarded.alloc_kind(), crate::core::packet::AllocKind::Alias);
        assert_eq!(forwarded.data(), b"xyz");
        assert_eq!(forwarded.framing(), (true, false));
        assert_eq!(forwarded.cts(), Some(7));
        assert_eq!(original.reference_count(), 1);
    }

    #[test]
    fn test_packets_postponed_until_connected() {
        let s = session(false);
        let source = s.load_filter("passive").unwrap();
        let sink = s.load_filter("collector").unwrap();
        let pid = source.new_output_pid().unwrap();

        pid.new_packet_alloc(5).unwrap().send().unwrap();
        pid.new_packet_alloc(6).unwrap().send().unwrap();
        assert_eq!(pid.destination_count(), 0);
        assert_eq!(pid.nb_packets_sent(), 0);

        s.run().unwrap();
        let input = sink.input_pid(0).unwrap();
        assert_eq!(input.packet_count(), 2);
        assert_eq!(input.get_packet().unwrap().len(), 5);
    }

    #[test]
    fn test_remove_disconnects_destinations() {
        let g = graph(2, false);
        g.pid.new_packet_alloc(1).unwrap().send().unwrap();
        g.pid.remove();
        assert!(g.pid.is_removed());
        assert_eq!(g.source.nb_output_pids(), 0);

        g.session.run().unwrap();
        assert_eq!(g.pid.destination_count(), 0);
        assert_eq!(g.sinks[0].nb_input_pids(), 0);
        assert_eq!(g.sinks[1].pending_packets(), 0);
        assert_eq!(g.source.pool_stats().alloc_packets, 1);
    }
}

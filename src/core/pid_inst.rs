// src/core/pid_inst.rs - Input side of a pid connection
//
// Core features:
// - One FIFO of packet instances per (pid, destination filter) pair
// - Full-block framing policy with fragment reassembly
// - Property view switched in-band when a packet flags a pid property change
// - End-of-stream detection from in-band command packets

use crate::core::filter::Filter;
use crate::core::packet::{AllocKind, Packet};
use crate::core::pid::Pid;
use crate::core::props::{PropertyMap, PropertyRef};
use crate::error::Result;
use crate::util::sync::lock;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct PacketInstance {
    packet: Packet,
    props_change_done: bool,
}

struct BlockState {
    /// Fragments of the block being reassembled, oldest first.
    reassembly: Vec<Packet>,
    last_block_ended: bool,
}

/// Connection of a pid into a consuming filter.
pub struct PidInstance {
    pid: Arc<Pid>,
    filter: Weak<Filter>,
    queue: Mutex<VecDeque<PacketInstance>>,
    block: Mutex<BlockState>,
    requires_full_block: AtomicBool,
    is_end_of_stream: AtomicBool,
    props: Mutex<Option<PropertyMap>>,
    buffer_duration_us: AtomicU64,
}

impl PidInstance {
    pub(crate) fn new(pid: Arc<Pid>, filter: &Arc<Filter>) -> Self {
        let props = pid.current_properties();
        Self {
            pid,
            filter: Arc::downgrade(filter),
            queue: Mutex::new(VecDeque::new()),
            block: Mutex::new(BlockState {
                reassembly: Vec::new(),
                last_block_ended: true,
            }),
            requires_full_block: AtomicBool::new(false),
            is_end_of_stream: AtomicBool::new(false),
            props: Mutex::new(props),
            buffer_duration_us: AtomicU64::new(0),
        }
    }

    /// Source pid of this connection.
    pub fn pid(&self) -> &Arc<Pid> {
        &self.pid
    }

    /// Consuming filter.
    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.upgrade()
    }

    pub fn name(&self) -> String {
        self.pid.name()
    }

    fn filter_name(&self) -> String {
        self.filter
            .upgrade()
            .map(|f| f.name().to_string())
            .unwrap_or_default()
    }

    // ========================================================================
    // Framing
    // ========================================================================

    /// Selects whether this destination wants complete blocks only.
    ///
    /// With `requires_full_block`, fragments are held back and delivered as a
    /// single packet once the block end is seen.
    pub fn set_framing_mode(&self, requires_full_block: bool) {
        self.requires_full_block
            .store(requires_full_block, Ordering::Release);
        self.pid.recompute_framing();
    }

    pub fn requires_full_block(&self) -> bool {
        self.requires_full_block.load(Ordering::Acquire)
    }

    /// Queues a packet dispatched by the source pid.
    ///
    /// # Returns
    /// `true` when a complete packet became available and the consuming
    /// filter should be scheduled.
    pub(crate) fn enqueue(&self, packet: Packet) -> Result<bool> {
        if !self.requires_full_block() {
            self.push_ready(packet);
            return Ok(true);
        }

        let mut block = lock(&self.block);
        let (start, end) = packet.framing();
        let mut post_task = false;

        if start && !block.last_block_ended {
            warn!(
                "Filter {} PID {}: missed end of block signaling but got start of block - reaggregating packet",
                self.filter_name(),
                self.name()
            );
            post_task = self.aggregate(&mut block)?;
            block.last_block_ended = true;
        }

        if end {
            if start {
                self.push_ready(packet);
            } else {
                block.reassembly.push(packet);
                self.aggregate(&mut block)?;
            }
            block.last_block_ended = true;
            post_task = true;
        } else {
            // keep producer memory free until the block completes
            let fragment = match packet.alloc_kind() {
                AllocKind::Owned => packet,
                AllocKind::Shared | AllocKind::Alias => self.pid.copy_packet(&packet)?,
            };
            block.reassembly.push(fragment);
            block.last_block_ended = false;
        }
        Ok(post_task)
    }

    /// Rebuilds one packet from the pending fragments.
    ///
    /// Fragments are only stored after a block start, so the oldest one
    /// opens the block. On allocation failure the fragments stay pending.
    fn aggregate(&self, block: &mut BlockState) -> Result<bool> {
        let Some(first) = block.reassembly.first() else {
            return Ok(false);
        };
        if !first.framing().0 {
            warn!(
                "Filter {} PID {}: no start of block found, reaggregating from oldest fragment",
                self.filter_name(),
                self.name()
            );
        }
        let size = block.reassembly.iter().map(Packet::len).sum();
        let mut aggregated = self.pid.alloc_internal(size)?;
        let fragments = std::mem::take(&mut block.reassembly);

        let mut byte_offset = fragments[0].info().byte_offset;
        let mut expected_offset = byte_offset;
        let mut pid_props = None;
        let mut props_changed = false;
        let mut pos = 0;
        {
            for fragment in &fragments {
                let len = fragment.len();
                aggregated.data_mut()?[pos..pos + len].copy_from_slice(fragment.data());
                pos += len;

                match (expected_offset, fragment.info().byte_offset) {
                    (Some(expected), Some(offset)) if expected == offset => {
                        expected_offset = Some(offset + len as u64);
                    }
                    _ => {
                        byte_offset = None;
                        expected_offset = None;
                    }
                }
                aggregated.merge_properties_from(fragment)?;
                if let Some(props) = fragment.pid_properties() {
                    pid_props = Some(props.clone());
                }
                props_changed |= fragment.pid_props_changed();
            }
        }
        aggregated.set_framing(true, true);
        aggregated.set_byte_offset(byte_offset);
        aggregated.set_pid_properties(pid_props, props_changed);

        debug!(
            "Filter {} PID {}: reaggregated {} fragments into {} bytes",
            self.filter_name(),
            self.name(),
            fragments.len(),
            size
        );
        let packet = aggregated.into_packet();
        drop(fragments);
        self.push_ready(packet);
        Ok(true)
    }

    fn push_ready(&self, packet: Packet) {
        let duration_us = packet.duration_us();
        if let Some(filter) = self.filter() {
            filter.on_packet_queued();
        }
        lock(&self.queue).push_back(PacketInstance {
            packet,
            props_change_done: false,
        });
        self.buffer_duration_us
            .fetch_add(duration_us, Ordering::AcqRel);
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Returns the packet at the head of the queue without removing it.
    ///
    /// End-of-stream markers are consumed here and never returned. When the
    /// head packet flags a pid property change, the property view of this
    /// instance switches to the map captured by that packet.
    pub fn get_packet(&self) -> Option<Packet> {
        loop {
            self.consume_eos_markers();
            let mut queue = lock(&self.queue);
            let head = queue.front_mut()?;
            if head.packet.is_eos_marker() {
                // queued after the markers were consumed
                continue;
            }
            self.is_end_of_stream.store(false, Ordering::Release);
            if head.packet.pid_props_changed() && !head.props_change_done {
                head.props_change_done = true;
                let props = head.packet.pid_properties().cloned();
                *lock(&self.props) = props;
                info!(
                    "Filter {} PID {}: property change at this packet",
                    self.filter_name(),
                    self.name()
                );
            }
            return Some(head.packet.clone());
        }
    }

    /// Pops the end-of-stream markers at the head of the queue. The property
    /// view is left alone.
    fn consume_eos_markers(&self) {
        loop {
            let marker = {
                let mut queue = lock(&self.queue);
                if !queue.front().is_some_and(|head| head.packet.is_eos_marker()) {
                    return;
                }
                queue.pop_front()
            };
            self.is_end_of_stream.store(true, Ordering::Release);
            if let Some(filter) = self.filter() {
                filter.on_packet_dequeued();
            }
            info!(
                "Filter {} PID {}: end of stream reached",
                self.filter_name(),
                self.name()
            );
            drop(marker);
        }
    }

    /// Removes the packet at the head of the queue.
    pub fn drop_packet(&self) {
        let instance = {
            let mut queue = lock(&self.queue);
            let instance = queue.pop_front();
            if queue.is_empty() {
                self.buffer_duration_us.store(0, Ordering::Release);
            } else if let Some(instance) = &instance {
                let duration_us = instance.packet.duration_us();
                let _ = self.buffer_duration_us.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |d| Some(d.saturating_sub(duration_us)),
                );
            }
            instance
        };
        match instance {
            Some(instance) => {
                if let Some(filter) = self.filter() {
                    filter.stats().on_packet_processed(instance.packet.len());
                    filter.on_packet_dequeued();
                }
                // released outside the queue lock: destruction may run a
                // release callback
                drop(instance);
            }
            None => warn!(
                "Filter {} PID {}: attempt to drop a packet from an empty queue",
                self.filter_name(),
                self.name()
            ),
        }
    }

    pub fn packet_count(&self) -> usize {
        lock(&self.queue).len()
    }

    /// `true` once the end-of-stream marker reached the head of the queue
    /// and no packet follows it.
    pub fn is_eos(&self) -> bool {
        self.consume_eos_markers();
        self.is_end_of_stream.load(Ordering::Acquire) && lock(&self.queue).is_empty()
    }

    /// Buffered duration in microseconds, from packet durations and the
    /// `Timescale` pid property.
    pub fn buffer_duration_us(&self) -> u64 {
        self.buffer_duration_us.load(Ordering::Acquire)
    }

    pub fn min_packet_duration(&self) -> u32 {
        self.pid.min_packet_duration()
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Property map in effect for the packets being consumed.
    pub fn properties(&self) -> Option<PropertyMap> {
        match lock(&self.props).as_ref() {
            Some(props) => Some(props.clone()),
            None => self.pid.current_properties(),
        }
    }

    pub fn get_property(&self, code: u32) -> Option<PropertyRef> {
        self.properties().and_then(|p| p.get_entry(code))
    }

    pub fn get_property_str(&self, name: &str) -> Option<PropertyRef> {
        self.properties().and_then(|p| p.get_entry_str(name))
    }

    pub fn get_property_first(&self, code: u32) -> Option<PropertyRef> {
        self.pid.get_property_first(code)
    }

    /// Releases every queued and pending packet.
    pub(crate) fn reset(&self) {
        let queued: Vec<PacketInstance> = lock(&self.queue).drain(..).collect();
        let fragments = std::mem::take(&mut lock(&self.block).reassembly);
        if let Some(filter) = self.filter() {
            for _ in &queued {
                filter.on_packet_dequeued();
            }
        }
        self.buffer_duration_us.store(0, Ordering::Release);
        drop(queued);
        drop(fragments);
    }
}

impl fmt::Debug for PidInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidInstance")
            .field("pid", &self.name())
            .field("filter", &self.filter_name())
            .field("queued", &self.packet_count())
            .field("full_block", &self.requires_full_block())
            .finish()
    }
}

// src/core/packet.rs - Reference-counted data units
//
// Core features:
// - Three allocation kinds: owned (pooled buffer), shared (caller memory with
//   release callback) and alias (window into another packet)
// - Producer-side `OutputPacket` with writable data, consumer-side `Packet`
//   shared handle
// - Destruction returns the packet shell to exactly one pool of the producing
//   filter

use crate::core::filter::FilterPools;
use crate::core::pid::Pid;
use crate::core::props::{PropertyMap, PropertyValue};
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Range;
use std::sync::Arc;

/// Release callback of a shared packet, called once with the packet memory
/// when the last reference goes away.
pub type PacketDestructor = Box<dyn FnOnce(Bytes) + Send + Sync>;

/// How the memory of a packet was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Owned,
    Shared,
    Alias,
}

/// Timing and state information carried by a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub dts: Option<u64>,
    pub cts: Option<u64>,
    /// Duration in pid timescale units, 0 if unknown.
    pub duration: u32,
    /// Stream access point type, 0 for none.
    pub sap: u8,
    pub seek: bool,
    pub corrupted: bool,
    pub interlaced: u8,
    pub byte_offset: Option<u64>,
}

pub(crate) enum PacketStorage {
    Owned(Vec<u8>),
    Shared {
        data: Bytes,
        destructor: Option<PacketDestructor>,
    },
    Alias {
        reference: Packet,
        range: Range<usize>,
    },
}

/// Recyclable packet body.
pub(crate) struct PacketInner {
    storage: PacketStorage,
    info: PacketInfo,
    block_start: bool,
    block_end: bool,
    eos: bool,
    pid_props_changed: bool,
    pid_props: Option<PropertyMap>,
    props: Option<PropertyMap>,
}

impl PacketInner {
    pub(crate) fn new() -> Self {
        Self {
            storage: PacketStorage::Owned(Vec::new()),
            info: PacketInfo::default(),
            block_start: true,
            block_end: true,
            eos: false,
            pid_props_changed: false,
            pid_props: None,
            props: None,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match &self.storage {
            PacketStorage::Owned(buf) => buf.capacity(),
            _ => 0,
        }
    }

    /// Sizes the owned buffer to `size` zeroed bytes.
    pub(crate) fn prepare_owned(&mut self, size: usize) -> Result<()> {
        if !matches!(self.storage, PacketStorage::Owned(_)) {
            self.storage = PacketStorage::Owned(Vec::new());
        }
        if let PacketStorage::Owned(buf) = &mut self.storage {
            buf.clear();
            buf.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
            buf.resize(size, 0);
        }
        Ok(())
    }

    fn data(&self) -> &[u8] {
        match &self.storage {
            PacketStorage::Owned(buf) => buf,
            PacketStorage::Shared { data, .. } => data,
            PacketStorage::Alias { reference, range } => &reference.data()[range.clone()],
        }
    }

    fn alloc_kind(&self) -> AllocKind {
        match self.storage {
            PacketStorage::Owned(_) => AllocKind::Owned,
            PacketStorage::Shared { .. } => AllocKind::Shared,
            PacketStorage::Alias { .. } => AllocKind::Alias,
        }
    }

    fn reset_metadata(&mut self) {
        self.info = PacketInfo::default();
        self.block_start = true;
        self.block_end = true;
        self.eos = false;
        self.pid_props_changed = false;
        self.pid_props = None;
        self.props = None;
    }
}

/// Canonical packet record. Dropping it recycles the body.
pub(crate) struct PacketData {
    inner: ManuallyDrop<Box<PacketInner>>,
    pools: Arc<FilterPools>,
}

impl Drop for PacketData {
    fn drop(&mut self) {
        // SAFETY: `inner` is taken exactly once, here, and never used again.
        let mut inner = unsafe { ManuallyDrop::take(&mut self.inner) };
        inner.reset_metadata();
        let storage = std::mem::replace(&mut inner.storage, PacketStorage::Owned(Vec::new()));
        match storage {
            PacketStorage::Owned(buf) => {
                inner.storage = PacketStorage::Owned(buf);
                self.pools.recycle_alloc(inner);
            }
            PacketStorage::Shared { data, destructor } => {
                if let Some(destructor) = destructor {
                    destructor(data);
                }
                self.pools.recycle_shared(inner);
            }
            PacketStorage::Alias { reference, .. } => {
                self.pools.recycle_shared(inner);
                drop(reference);
            }
        }
    }
}

/// Consumer-side handle on a sent packet.
///
/// Cloning is cheap and shares the packet. The packet is destroyed when the
/// last handle goes, whichever destination drops it last.
#[derive(Clone)]
pub struct Packet {
    data: Arc<PacketData>,
}

impl Packet {
    fn inner(&self) -> &PacketInner {
        &self.data.inner
    }

    pub fn data(&self) -> &[u8] {
        self.inner().data()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn alloc_kind(&self) -> AllocKind {
        self.inner().alloc_kind()
    }

    /// `(block_start, block_end)` flags.
    pub fn framing(&self) -> (bool, bool) {
        (self.inner().block_start, self.inner().block_end)
    }

    pub fn info(&self) -> &PacketInfo {
        &self.inner().info
    }

    pub fn dts(&self) -> Option<u64> {
        self.inner().info.dts
    }

    pub fn cts(&self) -> Option<u64> {
        self.inner().info.cts
    }

    pub fn duration(&self) -> u32 {
        self.inner().info.duration
    }

    /// Duration in microseconds, using the `Timescale` property of the pid
    /// map captured by this packet; 0 when either is unknown.
    pub fn duration_us(&self) -> u64 {
        match self.pid_properties().and_then(PropertyMap::timescale) {
            Some(timescale) => self.duration() as u64 * 1_000_000 / timescale as u64,
            None => 0,
        }
    }

    /// Private packet properties, if any were set.
    pub fn properties(&self) -> Option<&PropertyMap> {
        self.inner().props.as_ref()
    }

    pub fn get_property(&self, code: u32) -> Option<&PropertyValue> {
        self.properties().and_then(|p| p.get(code))
    }

    pub fn get_property_str(&self, name: &str) -> Option<&PropertyValue> {
        self.properties().and_then(|p| p.get_str(name))
    }

    /// Pid property map in effect when the packet was created.
    pub fn pid_properties(&self) -> Option<&PropertyMap> {
        self.inner().pid_props.as_ref()
    }

    /// `true` on the first packet created after the pid properties changed.
    pub fn pid_props_changed(&self) -> bool {
        self.inner().pid_props_changed
    }

    /// Number of references held on this packet besides this handle: queued
    /// instances, aliasing packets and other handles.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data) - 1
    }

    pub fn ptr_eq(&self, other: &Packet) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub(crate) fn is_eos_marker(&self) -> bool {
        self.inner().eos
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("kind", &self.alloc_kind())
            .field("framing", &self.framing())
            .field("info", self.info())
            .field("eos", &self.is_eos_marker())
            .finish()
    }
}

/// Producer-side packet, writable until sent.
///
/// Dropping an `OutputPacket` without sending it discards it: the packet is
/// recycled into its pool and a shared packet's release callback runs.
pub struct OutputPacket {
    data: PacketData,
    pid: Arc<Pid>,
}

impl OutputPacket {
    pub(crate) fn from_parts(
        inner: Box<PacketInner>,
        pools: Arc<FilterPools>,
        pid: Arc<Pid>,
    ) -> Self {
        Self {
            data: PacketData {
                inner: ManuallyDrop::new(inner),
                pools,
            },
            pid,
        }
    }

    pub(crate) fn set_shared(&mut self, data: Bytes, destructor: Option<PacketDestructor>) {
        self.data.inner.storage = PacketStorage::Shared { data, destructor };
    }

    pub(crate) fn set_alias(&mut self, reference: Packet, range: Range<usize>) {
        self.data.inner.storage = PacketStorage::Alias { reference, range };
    }

    pub(crate) fn set_pid_properties(&mut self, props: Option<PropertyMap>, changed: bool) {
        self.data.inner.pid_props = props;
        self.data.inner.pid_props_changed = changed;
    }

    pub(crate) fn mark_eos(&mut self) {
        self.data.inner.eos = true;
        self.data.inner.block_start = true;
        self.data.inner.block_end = true;
    }

    pub fn pid(&self) -> &Arc<Pid> {
        &self.pid
    }

    pub fn data(&self) -> &[u8] {
        self.data.inner.data()
    }

    /// Writable view on the packet memory; only owned packets are writable.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.data.inner.storage {
            PacketStorage::Owned(buf) => Ok(buf.as_mut_slice()),
            _ => Err(Error::BadParam(
                "packet memory is not owned by the filter and cannot be written".into(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn alloc_kind(&self) -> AllocKind {
        self.data.inner.alloc_kind()
    }

    /// Sets the block framing flags: a complete block is `(true, true)`.
    pub fn set_framing(&mut self, block_start: bool, block_end: bool) {
        self.data.inner.block_start = block_start;
        self.data.inner.block_end = block_end;
    }

    pub fn framing(&self) -> (bool, bool) {
        (self.data.inner.block_start, self.data.inner.block_end)
    }

    pub fn info(&self) -> &PacketInfo {
        &self.data.inner.info
    }

    pub fn info_mut(&mut self) -> &mut PacketInfo {
        &mut self.data.inner.info
    }

    pub fn set_dts(&mut self, dts: u64) {
        self.data.inner.info.dts = Some(dts);
    }

    pub fn set_cts(&mut self, cts: u64) {
        self.data.inner.info.cts = Some(cts);
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.data.inner.info.duration = duration;
    }

    pub fn set_sap(&mut self, sap: u8) {
        self.data.inner.info.sap = sap;
    }

    pub fn set_byte_offset(&mut self, byte_offset: Option<u64>) {
        self.data.inner.info.byte_offset = byte_offset;
    }

    pub fn properties(&self) -> Option<&PropertyMap> {
        self.data.inner.props.as_ref()
    }

    pub fn pid_properties(&self) -> Option<&PropertyMap> {
        self.data.inner.pid_props.as_ref()
    }

    fn props_mut(&mut self) -> &mut PropertyMap {
        let data = &mut self.data;
        let pools = &data.pools;
        let props = data
            .inner
            .props
            .get_or_insert_with(|| PropertyMap::with_pool(&pools.prop_tables));
        if props.is_shared() {
            *props = props.fork();
        }
        props
    }

    /// Sets a private packet property, copying the map first if it is
    /// shared with another packet.
    pub fn set_property(&mut self, code: u32, value: impl Into<PropertyValue>) -> Result<()> {
        self.props_mut().set(code, value)
    }

    pub fn set_property_str(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        self.props_mut().set_str(name, value)
    }

    pub fn remove_property(&mut self, code: u32) -> Result<()> {
        if self.data.inner.props.is_some() {
            self.props_mut().remove(code)?;
        }
        Ok(())
    }

    /// Shares the private property map of `src` with this packet.
    pub fn copy_properties_from(&mut self, src: &Packet) {
        self.data.inner.props = src.properties().cloned();
    }

    /// Merges `src` into this packet: timing information is copied and the
    /// private properties of `src` are added, overriding existing keys. A
    /// source without private properties leaves the existing ones untouched.
    pub fn merge_properties_from(&mut self, src: &Packet) -> Result<()> {
        let sinfo = src.info();
        let info = &mut self.data.inner.info;
        info.dts = sinfo.dts;
        info.cts = sinfo.cts;
        info.duration = sinfo.duration;
        info.sap = sinfo.sap;
        info.seek = sinfo.seek;
        info.corrupted = sinfo.corrupted;
        info.interlaced = sinfo.interlaced;
        info.byte_offset = sinfo.byte_offset;

        if let Some(src_props) = src.properties() {
            if self.data.inner.props.is_none() {
                self.data.inner.props = Some(src_props.clone());
            } else {
                self.props_mut().copy_all_from(src_props)?;
            }
        }
        Ok(())
    }

    /// Copies everything but the memory from `src`.
    pub(crate) fn copy_metadata_from(&mut self, src: &Packet) {
        let inner = &mut self.data.inner;
        let sinner = src.inner();
        inner.info = sinner.info;
        inner.block_start = sinner.block_start;
        inner.block_end = sinner.block_end;
        inner.eos = sinner.eos;
        inner.pid_props_changed = sinner.pid_props_changed;
        inner.pid_props = sinner.pid_props.clone();
        inner.props = sinner.props.clone();
    }

    /// Sends the packet to every destination of its pid.
    ///
    /// Ownership moves to the destinations. If the pid has no destination the
    /// packet is destroyed with a warning.
    pub fn send(self) -> Result<()> {
        let OutputPacket { mut data, pid } = self;
        if !data.inner.eos {
            pid.update_timing(&mut data.inner.info);
        }
        pid.dispatch(Packet {
            data: Arc::new(data),
        })
    }

    /// Drops the packet without sending it.
    pub fn discard(self) {}

    pub(crate) fn into_packet(self) -> Packet {
        Packet {
            data: Arc::new(self.data),
        }
    }
}

impl fmt::Debug for OutputPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPacket")
            .field("len", &self.len())
            .field("kind", &self.alloc_kind())
            .field("framing", &self.framing())
            .field("info", self.info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_util::graph;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fan_out_reference_count() {
        let g = graph(2, false);
        let mut pck = g.pid.new_packet_alloc(16).unwrap();
        pck.data_mut().unwrap().copy_from_slice(&[7u8; 16]);
        pck.send().unwrap();

        let a = g.input(0);
        let b = g.input(1);
        let seen = a.get_packet().unwrap();
        assert!(seen.ptr_eq(&b.get_packet().unwrap()));
        // one instance per destination queue
        assert_eq!(seen.reference_count(), 2);
        drop(seen);

        a.drop_packet();
        let last = b.get_packet().unwrap();
        assert_eq!(last.reference_count(), 1);
        assert_eq!(last.data(), &[7u8; 16]);
        drop(last);

        assert_eq!(g.source.pool_stats().alloc_packets, 0);
        b.drop_packet();
        assert_eq!(g.source.pool_stats().alloc_packets, 1);
        assert_eq!(g.source.pool_stats().shared_packets, 0);
    }

    #[test]
    fn test_shared_release_callback_runs_once() {
        let g = graph(2, false);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let pck = g.pid.new_packet_shared(
            Bytes::from_static(b"external"),
            Some(Box::new(move |data: Bytes| {
                assert_eq!(&data[..], b"external");
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(pck.alloc_kind(), AllocKind::Shared);
        pck.send().unwrap();

        g.input(0).drop_packet();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        g.input(1).drop_packet();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(g.source.pool_stats().shared_packets, 1);
        assert_eq!(g.source.pool_stats().alloc_packets, 0);
    }

    #[test]
    fn test_alias_keeps_reference_alive() {
        let g = graph(1, false);
        let mut pck = g.pid.new_packet_alloc(8).unwrap();
        pck.data_mut().unwrap().copy_from_slice(b"abcdefgh");
        pck.send().unwrap();

        let input = g.input(0);
        let reference = input.get_packet().unwrap();
        input.drop_packet();

        let mut alias = g.pid.new_packet_ref(&reference, Some(2..5)).unwrap();
        assert_eq!(alias.alloc_kind(), AllocKind::Alias);
        assert!(alias.data_mut().is_err());
        drop(reference);
        assert_eq!(alias.data(), b"cde");
        assert_eq!(g.source.pool_stats().alloc_packets, 0);

        alias.discard();
        assert_eq!(g.source.pool_stats().shared_packets, 1);
        assert_eq!(g.source.pool_stats().alloc_packets, 1);
    }

    #[test]
    fn test_alias_range_is_checked() {
        let g = graph(1, false);
        g.pid.new_packet_alloc(4).unwrap().send().unwrap();
        let reference = g.input(0).get_packet().unwrap();
        let err = g.pid.new_packet_ref(&reference, Some(2..9)).unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
    }

    #[test]
    fn test_discard_recycles_unsent_packet() {
        let g = graph(1, false);
        let pck = g.pid.new_packet_alloc(32).unwrap();
        drop(pck);
        assert_eq!(g.source.pool_stats().alloc_packets, 1);
        // the recycled buffer is reused for the next packet
        let pck = g.pid.new_packet_alloc(16).unwrap();
        assert_eq!(g.source.pool_stats().alloc_packets, 0);
        assert_eq!(pck.len(), 16);
        assert!(pck.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_private_properties_copy_on_write() {
        let g = graph(1, false);
        let mut first = g.pid.new_packet_alloc(1).unwrap();
        first.set_property_str("layer", 1u32).unwrap();
        first.send().unwrap();
        let first = g.input(0).get_packet().unwrap();

        let mut second = g.pid.new_packet_alloc(1).unwrap();
        second.copy_properties_from(&first);
        assert!(second.properties().unwrap().ptr_eq(first.properties().unwrap()));
        second.set_property_str("layer", 2u32).unwrap();

        assert_eq!(first.get_property_str("layer"), Some(&PropertyValue::UInt(1)));
        assert_eq!(
            second.properties().and_then(|p| p.get_str("layer")),
            Some(&PropertyValue::UInt(2))
        );
    }

    #[test]
    fn test_merge_properties_keeps_existing_keys() {
        let g = graph(1, false);
        let mut src = g.pid.new_packet_alloc(1).unwrap();
        src.set_dts(90);
        src.set_sap(1);
        src.set_property_str("b", 2u32).unwrap();
        src.send().unwrap();
        let src = g.input(0).get_packet().unwrap();

        let mut dst = g.pid.new_packet_alloc(1).unwrap();
        dst.set_property_str("a", 1u32).unwrap();
        dst.merge_properties_from(&src).unwrap();
        assert_eq!(dst.info().dts, Some(90));
        assert_eq!(dst.info().sap, 1);
        let props = dst.properties().unwrap();
        assert_eq!(props.get_str("a"), Some(&PropertyValue::UInt(1)));
        assert_eq!(props.get_str("b"), Some(&PropertyValue::UInt(2)));
    }
}

//! **ez-filters** is the scheduling and data-flow core of a multimedia pipeline.
//!
//! A [`Session`] owns a graph of independent processing units ([`Filter`]s)
//! connected by output ports ([`Pid`]s). Each connection of a pid into a
//! consuming filter is a [`PidInstance`] with its own packet queue. Filters
//! exchange reference-counted [`Packet`]s tagged with copy-on-write
//! [`PropertyMap`]s, and are driven by a cooperative task scheduler running
//! over a pool of worker threads plus the caller's thread.
//!
//! The core guarantees:
//! - a filter is never entered by two threads at the same time, while
//!   independent filters run in parallel;
//! - packets shared by several destinations are destroyed exactly once, when
//!   the last destination drops them, and recycled into exactly one pool;
//! - fragmented data blocks are reassembled, in order, for destinations that
//!   require complete blocks;
//! - property maps are never mutated once shared.
//!
//! # Example
//!
//! ```rust,ignore
//! use ez_filters::{FilterImpl, FilterRegister, Session};
//!
//! let session = Session::builder()
//!     .threads(2)
//!     .register(FilterRegister::new("counter", || Box::new(Counter::default())).max_input_pids(0))
//!     .register(FilterRegister::new("dump", || Box::new(Dump::default())))
//!     .build();
//!
//! session.load_filter("counter:FID=src:count=10")?;
//! session.load_filter("dump:SID=src")?;
//! session.run()?;
//! session.print_stats();
//! ```

pub mod core;
pub mod error;
mod util;

pub use crate::core::args::FilterArgs;
pub use crate::core::filter::{Filter, FilterImpl, FilterRegister, PoolStats};
pub use crate::core::obj_pool::ObjPool;
pub use crate::core::packet::{AllocKind, OutputPacket, Packet, PacketDestructor, PacketInfo};
pub use crate::core::pid::{BufferOccupancy, Pid};
pub use crate::core::pid_inst::PidInstance;
pub use crate::core::props::{
    Fraction, PropertyEntry, PropertyKey, PropertyMap, PropertyRef, PropertyType, PropertyValue,
};
pub use crate::core::session::{RunStatus, Session, SessionBuilder};
pub use crate::core::stats::{FilterStats, SessionStats, ThreadStats};
pub use crate::error::{Error, Result};

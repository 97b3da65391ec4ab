//! Typed, copy-on-write metadata attached to pids and packets.

pub mod builtin;
mod map;
mod value;

pub use builtin::*;
pub use map::{PropertyEntry, PropertyKey, PropertyMap, PropertyRef};
pub(crate) use map::{PropertyTablePool, WeakPropertyMap};
pub use value::{Fraction, PropertyType, PropertyValue};

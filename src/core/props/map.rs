use super::builtin::{property_name, PROP_PID_TIMESCALE};
use super::value::PropertyValue;
use crate::core::obj_pool::ObjPool;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Key of a property: a built-in four character code or a free-form name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Code(u32),
    Name(String),
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Code(code) => f.write_str(&property_name(*code)),
            PropertyKey::Name(name) => f.write_str(name),
        }
    }
}

/// One key/value pair, shared between maps by reference counting.
#[derive(Debug)]
pub struct PropertyEntry {
    key: PropertyKey,
    value: PropertyValue,
}

impl PropertyEntry {
    pub fn key(&self) -> &PropertyKey {
        &self.key
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn code(&self) -> Option<u32> {
        match self.key {
            PropertyKey::Code(code) => Some(code),
            PropertyKey::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.key {
            PropertyKey::Code(_) => None,
            PropertyKey::Name(name) => Some(name),
        }
    }
}

pub type PropertyRef = Arc<PropertyEntry>;

/// Hash tables backing a map, recycled through the owning filter's pool.
#[derive(Default)]
pub(crate) struct PropertyTable {
    codes: HashMap<u32, PropertyRef>,
    names: HashMap<String, PropertyRef>,
}

impl PropertyTable {
    fn clear(&mut self) {
        self.codes.clear();
        self.names.clear();
    }

    fn insert(&mut self, entry: PropertyRef) {
        match &entry.key {
            PropertyKey::Code(code) => {
                self.codes.insert(*code, entry);
            }
            PropertyKey::Name(name) => {
                self.names.insert(name.clone(), entry);
            }
        }
    }
}

pub(crate) type PropertyTablePool = ObjPool<PropertyTable>;

struct MapInner {
    table: PropertyTable,
    pool: Option<Arc<PropertyTablePool>>,
}

impl Drop for MapInner {
    fn drop(&mut self) {
        // entries are released here, the emptied table goes back to its pool
        let mut table = std::mem::take(&mut self.table);
        table.clear();
        if let Some(pool) = self.pool.take() {
            pool.push(table);
        }
    }
}

/// Reference-counted set of properties.
///
/// Cloning a `PropertyMap` shares it. A shared map is immutable: every
/// mutating call fails with [`Error::BadParam`] while another clone is alive,
/// and owners switch to a private copy with [`PropertyMap::fork`] first.
#[derive(Clone)]
pub struct PropertyMap {
    inner: Arc<MapInner>,
}

impl PropertyMap {
    /// Creates an empty, unpooled map.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MapInner {
                table: PropertyTable::default(),
                pool: None,
            }),
        }
    }

    pub(crate) fn with_pool(pool: &Arc<PropertyTablePool>) -> Self {
        Self {
            inner: Arc::new(MapInner {
                table: pool.pop_or_else(PropertyTable::default),
                pool: Some(pool.clone()),
            }),
        }
    }

    /// Creates a new, unshared map holding every entry of this one.
    ///
    /// Entries are shared, not duplicated. The new map recycles into the
    /// same pool as this one.
    pub fn fork(&self) -> PropertyMap {
        let mut copy = match &self.inner.pool {
            Some(pool) => PropertyMap::with_pool(pool),
            None => PropertyMap::new(),
        };
        if let Some(inner) = Arc::get_mut(&mut copy.inner) {
            for entry in self.iter() {
                inner.table.insert(entry.clone());
            }
        }
        copy
    }

    fn table_mut(&mut self) -> Result<&mut PropertyTable> {
        Arc::get_mut(&mut self.inner)
            .map(|inner| &mut inner.table)
            .ok_or_else(|| Error::BadParam("property map is shared and cannot be modified".into()))
    }

    /// Sets a built-in property, replacing any previous value for `code`.
    pub fn set(&mut self, code: u32, value: impl Into<PropertyValue>) -> Result<()> {
        if code == 0 {
            return Err(Error::BadParam("property code 0 is reserved".into()));
        }
        let entry = Arc::new(PropertyEntry {
            key: PropertyKey::Code(code),
            value: value.into(),
        });
        self.table_mut()?.insert(entry);
        Ok(())
    }

    /// Sets a named property, replacing any previous value for `name`.
    pub fn set_str(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::BadParam("empty property name".into()));
        }
        let entry = Arc::new(PropertyEntry {
            key: PropertyKey::Name(name.to_string()),
            value: value.into(),
        });
        self.table_mut()?.insert(entry);
        Ok(())
    }

    /// Inserts an existing entry, sharing it with the maps already holding it.
    pub fn set_entry(&mut self, entry: PropertyRef) -> Result<()> {
        self.table_mut()?.insert(entry);
        Ok(())
    }

    pub fn remove(&mut self, code: u32) -> Result<Option<PropertyRef>> {
        Ok(self.table_mut()?.codes.remove(&code))
    }

    pub fn remove_str(&mut self, name: &str) -> Result<Option<PropertyRef>> {
        Ok(self.table_mut()?.names.remove(name))
    }

    /// Removes every entry.
    pub fn reset(&mut self) -> Result<()> {
        self.table_mut()?.clear();
        Ok(())
    }

    pub fn get(&self, code: u32) -> Option<&PropertyValue> {
        self.inner.table.codes.get(&code).map(|e| &e.value)
    }

    pub fn get_str(&self, name: &str) -> Option<&PropertyValue> {
        self.inner.table.names.get(name).map(|e| &e.value)
    }

    pub fn get_entry(&self, code: u32) -> Option<PropertyRef> {
        self.inner.table.codes.get(&code).cloned()
    }

    pub fn get_entry_str(&self, name: &str) -> Option<PropertyRef> {
        self.inner.table.names.get(name).cloned()
    }

    /// Shares every entry of `src` into this map; keys of `src` override.
    pub fn copy_all_from(&mut self, src: &PropertyMap) -> Result<()> {
        if self.ptr_eq(src) {
            return Ok(());
        }
        let table = self.table_mut()?;
        for entry in src.iter() {
            table.insert(entry.clone());
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyRef> {
        self.inner
            .table
            .codes
            .values()
            .chain(self.inner.table.names.values())
    }

    pub fn len(&self) -> usize {
        self.inner.table.codes.len() + self.inner.table.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live handles on this map, this one included.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    pub fn ptr_eq(&self, other: &PropertyMap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Value of the built-in `Timescale` property, if set and non-zero.
    pub fn timescale(&self) -> Option<u32> {
        self.get(PROP_PID_TIMESCALE)
            .and_then(PropertyValue::as_uint)
            .filter(|t| *t > 0)
    }

    pub(crate) fn downgrade(&self) -> WeakPropertyMap {
        WeakPropertyMap(Arc::downgrade(&self.inner))
    }
}

impl Default for PropertyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|e| (e.key.to_string(), e.value.to_string())))
            .finish()
    }
}

/// Non-owning handle used by the pid property history.
#[derive(Clone)]
pub(crate) struct WeakPropertyMap(Weak<MapInner>);

impl WeakPropertyMap {
    pub(crate) fn upgrade(&self) -> Option<PropertyMap> {
        self.0.upgrade().map(|inner| PropertyMap { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::props::builtin::{PROP_PID_HEIGHT, PROP_PID_WIDTH};

    #[test]
    fn test_set_replaces_and_get_is_none_for_unknown() {
        let mut map = PropertyMap::new();
        map.set(PROP_PID_WIDTH, 640u32).unwrap();
        map.set(PROP_PID_WIDTH, 1280u32).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(PROP_PID_WIDTH).and_then(|v| v.as_uint()), Some(1280));
        assert!(map.get(PROP_PID_HEIGHT).is_none());
        assert!(map.get_str("Width").is_none());
        assert!(map.set(0, 1u32).is_err());
    }

    #[test]
    fn test_shared_map_rejects_writes() {
        let mut map = PropertyMap::new();
        map.set_str("codec", "aac").unwrap();
        let other = map.clone();
        assert_eq!(map.reference_count(), 2);
        assert!(matches!(map.set_str("codec", "mp3"), Err(Error::BadParam(_))));
        drop(other);
        map.set_str("codec", "mp3").unwrap();
        assert_eq!(map.get_str("codec").and_then(|v| v.as_str()), Some("mp3"));
    }

    #[test]
    fn test_fork_shares_entries_and_isolates_writes() {
        let mut a = PropertyMap::new();
        a.set(PROP_PID_WIDTH, 320u32).unwrap();
        let shared = a.clone();

        let mut b = shared.fork();
        b.set(PROP_PID_WIDTH, 640u32).unwrap();
        b.set(PROP_PID_HEIGHT, 480u32).unwrap();

        assert_eq!(a.get(PROP_PID_WIDTH).and_then(|v| v.as_uint()), Some(320));
        assert!(a.get(PROP_PID_HEIGHT).is_none());
        assert_eq!(b.get(PROP_PID_WIDTH).and_then(|v| v.as_uint()), Some(640));
    }

    #[test]
    fn test_copy_all_shares_entries() {
        let mut src = PropertyMap::new();
        src.set_str("lang", "en").unwrap();
        let mut dst = PropertyMap::new();
        dst.set_str("lang", "fr").unwrap();
        dst.copy_all_from(&src).unwrap();

        let e1 = src.get_entry_str("lang").unwrap();
        let e2 = dst.get_entry_str("lang").unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
        // src, dst, e1, e2
        assert_eq!(Arc::strong_count(&e1), 4);
    }

    #[test]
    fn test_tables_recycled_into_pool() {
        let pool = Arc::new(PropertyTablePool::new());
        {
            let mut map = PropertyMap::with_pool(&pool);
            map.set(PROP_PID_WIDTH, 1u32).unwrap();
            let _copy = map.fork();
        }
        assert_eq!(pool.len(), 2);
        let map = PropertyMap::with_pool(&pool);
        assert!(map.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_weak_handle_follows_last_owner() {
        let map = PropertyMap::new();
        let weak = map.downgrade();
        assert!(weak.upgrade().is_some());
        drop(map);
        assert!(!weak.is_alive());
    }

    #[test]
    fn test_timescale_helper() {
        let mut map = PropertyMap::new();
        assert_eq!(map.timescale(), None);
        map.set(PROP_PID_TIMESCALE, 90_000u32).unwrap();
        assert_eq!(map.timescale(), Some(90_000));
    }
}

// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Decoding of OBF (OsmAnd Binary Format) files.
//!
//! An OBF file is a sequence of protobuf-tagged sections. [obtain_info] scans the
//! top-level structure and returns [ObfInfo], which describes every section.
//! Map objects are then loaded with [load_map_objects], and roads with
//! [search_subregions] + [load_subregion_roads]; both descend the spatial tree
//! of the section and decode only the blocks overlapping the query box.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

pub mod area;
pub mod block_cache;
pub mod cursor;
pub mod index_cache;
pub mod info;
pub mod map;
pub mod road;
pub mod routing;
pub mod source;
pub mod tree;

#[cfg(test)]
mod test_writer;

pub use area::{AreaI, PointI};
pub use block_cache::{DataBlockCache, DataBlockId};
pub use index_cache::CachedIndexes;
pub use info::{obtain_info, MapLevel, MapSection, ObfInfo, OtherSection, RoutingSection};
pub use map::{load_map_objects, MapObject, MapQuery, MapQueryResult, MapRules};
pub use road::{RestrictionKind, RouteRule, RouteRules, RouteRuleKind, RouteDataObject};
pub use routing::{load_subregion_roads, search_subregions, RouteSubregion};
pub use source::{FileFormat, ObfFile};
pub use tree::{Foundation, TreeMetrics};

/// Cancellation hook polled by long-running loads and searches.
pub trait QueryController {
    fn is_aborted(&self) -> bool;
}

/// Controller which never aborts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverAbort;

impl QueryController for NeverAbort {
    fn is_aborted(&self) -> bool {
        false
    }
}

static NEXT_SECTION_RUNTIME_ID: AtomicU32 = AtomicU32::new(1);

/// Allocates a process-unique identifier of an opened section.
pub(crate) fn next_section_runtime_id() -> u32 {
    NEXT_SECTION_RUNTIME_ID.fetch_add(1, Ordering::Relaxed)
}

/// Globally unique object identifier.
///
/// Non-negative raw ids (OSM-derived) are kept as-is. Negative ids are only unique
/// within a section, and are remapped by setting the top bit and embedding the
/// section runtime id in bits 40..63. The remapping is stable only within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObfObjectId(pub u64);

impl ObfObjectId {
    const LOCAL_BITS: u32 = 40;
    const LOCAL_MASK: u64 = (1 << Self::LOCAL_BITS) - 1;
    const SECTION_MASK: u64 = (1 << 23) - 1;

    pub fn from_raw(raw: i64, section_runtime_id: u32) -> Self {
        if raw >= 0 {
            Self(raw as u64)
        } else {
            let section = (section_runtime_id as u64) & Self::SECTION_MASK;
            Self((1 << 63) | (section << Self::LOCAL_BITS) | (raw as u64 & Self::LOCAL_MASK))
        }
    }

    #[inline]
    pub fn is_section_local(&self) -> bool {
        self.0 >> 63 == 1
    }
}

/// Value initialised at most once, on first use, possibly under contention.
///
/// Readers after the initialisation never lock. A failed initialisation
/// leaves the cell empty, so the next caller retries.
#[derive(Debug, Default)]
pub(crate) struct OnceLoad<T> {
    cell: OnceLock<T>,
    lock: Mutex<()>,
}

impl<T> OnceLoad<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_value(value: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(value);
        Self {
            cell,
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn get_or_try_init<F, E>(&self, init: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(v) = self.cell.get() {
            return Ok(v);
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(v) = self.cell.get() {
            return Ok(v);
        }

        let value = init()?;
        Ok(self.cell.get_or_init(|| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn object_ids() {
        assert_eq!(ObfObjectId::from_raw(42, 7), ObfObjectId(42));
        let a = ObfObjectId::from_raw(-5, 1);
        let b = ObfObjectId::from_raw(-5, 2);
        assert_ne!(a, b);
        assert!(a.is_section_local());
        assert!(!ObfObjectId::from_raw(5, 1).is_section_local());
        assert_eq!(a, ObfObjectId::from_raw(-5, 1));
    }

    #[test]
    fn once_load_runs_once() {
        let calls = AtomicUsize::new(0);
        let cell: OnceLoad<u32> = OnceLoad::new();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let v = cell
                        .get_or_try_init(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ()>(7)
                        })
                        .unwrap();
                    assert_eq!(*v, 7);
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_load_retries_after_failure() {
        let cell: OnceLoad<u32> = OnceLoad::new();
        assert!(cell.get_or_try_init(|| Err::<u32, _>("boom")).is_err());
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_try_init(|| Ok::<_, ()>(3)).unwrap(), 3);
    }
}

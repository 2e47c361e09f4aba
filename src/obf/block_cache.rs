// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Cache of decoded data blocks shared between concurrent queries.
//!
//! The first caller asking for an absent block receives a [BlockPromise] and is
//! responsible for decoding it. Callers asking for the same block in the meantime
//! receive a [BlockFuture], which blocks until the promise is fulfilled, so every
//! block is decoded at most once no matter how many threads want it.
//!
//! Every handed-out [BlockRef] counts as a reference for the zoom it was obtained at,
//! and is released on drop. Only unreferenced blocks are ever evicted.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, RangeInclusive};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::area::AreaI;
use crate::Error;

/// Identity of a data block: the section it belongs to and its position in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataBlockId {
    pub section_runtime_id: u32,
    pub offset: usize,
}

#[derive(Debug)]
enum State<T> {
    Loading,
    Loaded(Arc<T>),
    Failed(Error),
}

#[derive(Debug)]
struct Entry<T> {
    state: State<T>,
    refs: HashMap<u8, usize>,
    access_count: u64,
    valid_zooms: RangeInclusive<u8>,
}

impl<T> Entry<T> {
    fn total_refs(&self) -> usize {
        self.refs.values().sum()
    }
}

#[derive(Debug)]
struct Inner<T> {
    entries: Mutex<HashMap<DataBlockId, Entry<T>>>,
    changed: Condvar,
    capacity: usize,
    cache_inner_blocks: bool,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<DataBlockId, Entry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, id: DataBlockId, zoom: u8) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            if let Some(count) = entry.refs.get_mut(&zoom) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    entry.refs.remove(&zoom);
                }
            }
        }
        self.evict_over_capacity(&mut entries);
    }

    /// Drops unreferenced loaded blocks, least accessed first, until at most
    /// `capacity` blocks remain.
    fn evict_over_capacity(&self, entries: &mut HashMap<DataBlockId, Entry<T>>) {
        if entries.len() <= self.capacity {
            return;
        }

        let mut candidates: Vec<_> = entries
            .iter()
            .filter(|(_, e)| matches!(e.state, State::Loaded(_)) && e.total_refs() == 0)
            .map(|(id, e)| (e.access_count, *id))
            .collect();
        candidates.sort();

        let excess = entries.len() - self.capacity;
        for (_, id) in candidates.into_iter().take(excess) {
            log::trace!("evicting data block {id:?}");
            entries.remove(&id);
        }
    }
}

/// Shared cache of decoded data blocks. Cloning produces another handle to the same cache.
#[derive(Debug)]
pub struct DataBlockCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DataBlockCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Outcome of [DataBlockCache::obtain_reference_or_future_or_make_promise].
pub enum Lookup<T> {
    /// The block is loaded, and a reference was taken.
    Ready(BlockRef<T>),

    /// Another caller is loading the block.
    Pending(BlockFuture<T>),

    /// Nobody has the block; the caller must load it and fulfil the promise.
    MustLoad(BlockPromise<T>),
}

impl<T> DataBlockCache<T> {
    /// Creates a cache keeping up to `capacity` unreferenced blocks.
    pub fn new(capacity: usize) -> Self {
        Self::with_options(capacity, false)
    }

    /// Like [DataBlockCache::new], but with `cache_inner_blocks` also blocks
    /// entirely within a query area are cached.
    pub fn with_options(capacity: usize, cache_inner_blocks: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
                capacity,
                cache_inner_blocks,
            }),
        }
    }

    /// Checks whether a block is worth caching. Blocks which lie entirely within
    /// the query area are unlikely to be reused by other queries and are skipped,
    /// unless the cache was asked to keep them or already holds them.
    pub fn should_cache_block(&self, id: DataBlockId, block_area: &AreaI, query_area: Option<&AreaI>) -> bool {
        if self.inner.cache_inner_blocks {
            return true;
        }
        match query_area {
            Some(q) if q.contains(block_area) => self.inner.lock().contains_key(&id),
            _ => true,
        }
    }

    /// Looks up a block, taking a reference for `zoom` if it's loaded. The first
    /// caller for an absent (or previously failed) block receives the promise to load it.
    pub fn obtain_reference_or_future_or_make_promise(
        &self,
        id: DataBlockId,
        zoom: u8,
        valid_zooms: RangeInclusive<u8>,
    ) -> Lookup<T> {
        let mut entries = self.inner.lock();
        match entries.get_mut(&id) {
            Some(entry) => match &entry.state {
                State::Loaded(value) => {
                    let value = value.clone();
                    entry.access_count += 1;
                    *entry.refs.entry(zoom).or_insert(0) += 1;
                    Lookup::Ready(BlockRef {
                        cache: self.inner.clone(),
                        id,
                        zoom,
                        value,
                    })
                }
                State::Loading => Lookup::Pending(BlockFuture {
                    cache: self.inner.clone(),
                    id,
                    zoom,
                }),
                State::Failed(_) => {
                    entry.state = State::Loading;
                    entry.valid_zooms = valid_zooms;
                    Lookup::MustLoad(BlockPromise {
                        cache: self.inner.clone(),
                        id,
                        zoom,
                        done: false,
                    })
                }
            },
            None => {
                entries.insert(
                    id,
                    Entry {
                        state: State::Loading,
                        refs: HashMap::new(),
                        access_count: 0,
                        valid_zooms,
                    },
                );
                Lookup::MustLoad(BlockPromise {
                    cache: self.inner.clone(),
                    id,
                    zoom,
                    done: false,
                })
            }
        }
    }

    /// Returns a reference to a block, loading it with `load` if nobody else has
    /// or is currently loading it.
    pub fn get_or_load<F>(
        &self,
        id: DataBlockId,
        zoom: u8,
        valid_zooms: RangeInclusive<u8>,
        load: F,
    ) -> Result<BlockRef<T>, Error>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let mut load = Some(load);
        loop {
            match self.obtain_reference_or_future_or_make_promise(id, zoom, valid_zooms.clone()) {
                Lookup::Ready(r) => return Ok(r),
                Lookup::Pending(f) => match f.wait() {
                    Some(r) => return r,
                    None => continue,
                },
                Lookup::MustLoad(p) => {
                    let Some(load) = load.take() else {
                        // Only reachable if a promise was abandoned mid-way
                        continue;
                    };
                    return match load() {
                        Ok(value) => Ok(p.fulfil(value)),
                        Err(e) => {
                            p.fail(e.clone());
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Releases a reference obtained for `zoom`. [BlockRef] does this on drop.
    pub fn release_reference(&self, id: DataBlockId, zoom: u8) {
        self.inner.release(id, zoom);
    }

    /// Number of blocks in the cache, including ones being loaded.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blocks with at least one live reference.
    pub fn referenced_blocks(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|e| e.total_refs() > 0)
            .count()
    }

    /// Number of live references to a block at the given zoom.
    pub fn references(&self, id: DataBlockId, zoom: u8) -> usize {
        self.inner
            .lock()
            .get(&id)
            .and_then(|e| e.refs.get(&zoom).copied())
            .unwrap_or(0)
    }

    /// Zoom range a cached block was loaded for.
    pub fn valid_zooms(&self, id: DataBlockId) -> Option<RangeInclusive<u8>> {
        self.inner.lock().get(&id).map(|e| e.valid_zooms.clone())
    }

    /// Drops every unreferenced loaded block.
    pub fn clear_unreferenced(&self) {
        self.inner
            .lock()
            .retain(|_, e| !matches!(e.state, State::Loaded(_)) || e.total_refs() > 0);
    }
}

/// A counted reference to a cached block.
pub struct BlockRef<T> {
    cache: Arc<Inner<T>>,
    id: DataBlockId,
    zoom: u8,
    value: Arc<T>,
}

impl<T> BlockRef<T> {
    pub fn id(&self) -> DataBlockId {
        self.id
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }
}

impl<T> Deref for BlockRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> fmt::Debug for BlockRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRef")
            .field("id", &self.id)
            .field("zoom", &self.zoom)
            .finish()
    }
}

impl<T> Drop for BlockRef<T> {
    fn drop(&mut self) {
        self.cache.release(self.id, self.zoom);
    }
}

/// Handle to a block being loaded by another caller.
pub struct BlockFuture<T> {
    cache: Arc<Inner<T>>,
    id: DataBlockId,
    zoom: u8,
}

impl<T> BlockFuture<T> {
    /// Waits for the loader. Returns `None` if the loader gave up without
    /// publishing anything, in which case the caller should look the block up again.
    pub fn wait(self) -> Option<Result<BlockRef<T>, Error>> {
        let mut entries = self.cache.lock();
        loop {
            match entries.get_mut(&self.id) {
                None => return None,
                Some(entry) => match &entry.state {
                    State::Loading => {}
                    State::Failed(e) => return Some(Err(e.clone())),
                    State::Loaded(value) => {
                        let value = value.clone();
                        entry.access_count += 1;
                        *entry.refs.entry(self.zoom).or_insert(0) += 1;
                        return Some(Ok(BlockRef {
                            cache: self.cache.clone(),
                            id: self.id,
                            zoom: self.zoom,
                            value,
                        }));
                    }
                },
            }
            entries = self
                .cache
                .changed
                .wait(entries)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Obligation to load a block. Dropping it unfulfilled withdraws the block,
/// waking up every waiter.
pub struct BlockPromise<T> {
    cache: Arc<Inner<T>>,
    id: DataBlockId,
    zoom: u8,
    done: bool,
}

impl<T> BlockPromise<T> {
    /// Publishes the loaded block and returns the loader's own reference to it.
    pub fn fulfil(mut self, value: T) -> BlockRef<T> {
        let value = Arc::new(value);
        {
            let mut entries = self.cache.lock();
            let entry = entries.entry(self.id).or_insert_with(|| Entry {
                state: State::Loading,
                refs: HashMap::new(),
                access_count: 0,
                valid_zooms: self.zoom..=self.zoom,
            });
            entry.state = State::Loaded(value.clone());
            entry.access_count += 1;
            *entry.refs.entry(self.zoom).or_insert(0) += 1;
            self.cache.evict_over_capacity(&mut entries);
        }
        self.done = true;
        self.cache.changed.notify_all();

        BlockRef {
            cache: self.cache.clone(),
            id: self.id,
            zoom: self.zoom,
            value,
        }
    }

    /// Hands the error to every waiter. The next lookup will retry the load.
    pub fn fail(mut self, error: Error) {
        if let Some(entry) = self.cache.lock().get_mut(&self.id) {
            entry.state = State::Failed(error);
        }
        self.done = true;
        self.cache.changed.notify_all();
    }
}

impl<T> Drop for BlockPromise<T> {
    fn drop(&mut self) {
        if !self.done {
            self.cache.lock().remove(&self.id);
            self.cache.changed.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn id(offset: usize) -> DataBlockId {
        DataBlockId {
            section_runtime_id: 1,
            offset,
        }
    }

    #[test]
    fn concurrent_loads_decode_once() {
        let cache: DataBlockCache<Vec<u32>> = DataBlockCache::new(8);
        let decodes = AtomicUsize::new(0);
        const N: usize = 16;

        let refs: Vec<BlockRef<Vec<u32>>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..N)
                .map(|_| {
                    s.spawn(|| {
                        cache
                            .get_or_load(id(100), 14, 13..=15, || {
                                decodes.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(Duration::from_millis(20));
                                Ok(vec![1, 2, 3])
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(decodes.load(Ordering::SeqCst), 1);
        assert_eq!(refs.len(), N);
        assert!(refs.iter().all(|r| **r == vec![1, 2, 3]));
        assert_eq!(cache.references(id(100), 14), N);
        assert_eq!(cache.valid_zooms(id(100)), Some(13..=15));

        drop(refs);
        assert_eq!(cache.references(id(100), 14), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn promise_and_future() {
        let cache: DataBlockCache<&'static str> = DataBlockCache::new(8);

        let Lookup::MustLoad(promise) = cache.obtain_reference_or_future_or_make_promise(id(1), 10, 10..=10) else {
            panic!("expected a promise");
        };
        let Lookup::Pending(future) = cache.obtain_reference_or_future_or_make_promise(id(1), 11, 10..=11) else {
            panic!("expected a future");
        };

        let r = promise.fulfil("block");
        let waited = future.wait().unwrap().unwrap();
        assert_eq!(*waited, "block");
        assert_eq!(cache.references(id(1), 10), 1);
        assert_eq!(cache.references(id(1), 11), 1);

        let Lookup::Ready(again) = cache.obtain_reference_or_future_or_make_promise(id(1), 10, 10..=10) else {
            panic!("expected a ready block");
        };
        assert_eq!(cache.references(id(1), 10), 2);
        drop((r, waited, again));
        assert_eq!(cache.referenced_blocks(), 0);
    }

    #[test]
    fn failure_reaches_waiters_and_allows_retry() {
        let cache: DataBlockCache<u32> = DataBlockCache::new(8);

        let Lookup::MustLoad(promise) = cache.obtain_reference_or_future_or_make_promise(id(1), 10, 10..=10) else {
            panic!("expected a promise");
        };
        let Lookup::Pending(future) = cache.obtain_reference_or_future_or_make_promise(id(1), 10, 10..=10) else {
            panic!("expected a future");
        };
        promise.fail(Error::Truncated(5));
        assert!(matches!(future.wait(), Some(Err(Error::Truncated(5)))));

        let r = cache.get_or_load(id(1), 10, 10..=10, || Ok(7)).unwrap();
        assert_eq!(*r, 7);
    }

    #[test]
    fn abandoned_promise_wakes_waiters() {
        let cache: DataBlockCache<u32> = DataBlockCache::new(8);
        let Lookup::MustLoad(promise) = cache.obtain_reference_or_future_or_make_promise(id(1), 10, 10..=10) else {
            panic!("expected a promise");
        };
        let Lookup::Pending(future) = cache.obtain_reference_or_future_or_make_promise(id(1), 10, 10..=10) else {
            panic!("expected a future");
        };
        drop(promise);
        assert!(future.wait().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn referenced_blocks_are_never_evicted() {
        let cache: DataBlockCache<usize> = DataBlockCache::new(2);
        let held = cache.get_or_load(id(0), 10, 10..=10, || Ok(0)).unwrap();
        for i in 1..5 {
            let r = cache.get_or_load(id(i), 10, 10..=10, || Ok(i)).unwrap();
            drop(r);
        }

        assert!(cache.len() <= 2);
        assert_eq!(cache.references(id(0), 10), 1);
        assert_eq!(*held, 0);
    }

    #[test]
    fn inner_blocks_are_not_cached() {
        let cache: DataBlockCache<u32> = DataBlockCache::new(8);
        let query = AreaI::new(0, 0, 100, 100);
        assert!(!cache.should_cache_block(id(1), &AreaI::new(10, 10, 20, 20), Some(&query)));
        assert!(cache.should_cache_block(id(1), &AreaI::new(90, 90, 200, 200), Some(&query)));
        assert!(cache.should_cache_block(id(1), &AreaI::new(10, 10, 20, 20), None));

        let all = DataBlockCache::<u32>::with_options(8, true);
        assert!(all.should_cache_block(id(1), &AreaI::new(10, 10, 20, 20), Some(&query)));
    }
}

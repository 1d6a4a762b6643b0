//! Pooling allocator with asynchronous release.
//!
//! Allocations are rounded up to the next power of two; `(flavor, device,
//! rounded size)` keys a free-list multimap so freed blocks are recycled
//! instead of being returned to the OS. Memory that a running kernel may
//! still touch is not recycled immediately: it is parked on a per-stream
//! release chain tagged with the stream's fence value and only moves to the
//! free lists once the stream's event passes that fence.
//!
//! Without a GPU driver loaded every flavor is backed by aligned host memory,
//! but each flavor keeps its own identity in the cache key: blocks never
//! migrate between flavors through the free lists.

use std::alloc::Layout;
use std::collections::HashMap;

use smelt_dtype::AllocType;
use snafu::ensure;
use tracing::{debug, trace, warn};

use crate::error::{EmptyAllocationSnafu, OutOfMemorySnafu, PrefetchFlavorSnafu, Result, UnknownPointerSnafu};
use crate::stream::StreamKey;

/// Alignment of every block handed out; sufficient for any element type and
/// for the vectorized access patterns of the back-ends.
const ALIGNMENT: usize = 64;

/// Cache key for block reuse. `device` is meaningful for `Device` memory
/// only; process-wide flavors use `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AllocKey {
    flavor: AllocType,
    device: i32,
    size: usize,
}

impl AllocKey {
    fn new(flavor: AllocType, device: i32, size: usize) -> Self {
        let device = if matches!(flavor, AllocType::Device) { device } else { -1 };
        Self { flavor, device, size }
    }
}

/// A freed block waiting for its stream's event before it can be reused.
#[derive(Debug)]
struct ReleaseEntry {
    addr: usize,
    key: AllocKey,
    fence: u64,
}

/// Free-list hit/miss counters and per-flavor byte accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    pub hits: u64,
    pub misses: u64,
    /// Bytes currently handed out, per flavor.
    pub usage: [usize; AllocType::COUNT],
    /// High-water mark of `usage`, per flavor.
    pub watermark: [usize; AllocType::COUNT],
}

#[derive(Debug, Default)]
pub struct Allocator {
    free: HashMap<AllocKey, Vec<usize>>,
    used: HashMap<usize, AllocKey>,
    pending: HashMap<StreamKey, Vec<ReleaseEntry>>,
    stats: AllocStats,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `size` bytes of the given flavor. The returned address is
    /// aligned sufficiently for any use.
    pub fn alloc(&mut self, flavor: AllocType, device: i32, size: usize) -> Result<usize> {
        ensure!(size > 0, EmptyAllocationSnafu);

        let rounded = size.next_power_of_two();

        // Free-list fast path: the exact bucket first, then the smallest
        // cached block of any larger bucket.
        let mut probe = rounded;
        loop {
            let key = AllocKey::new(flavor, device, probe);
            if let Some(blocks) = self.free.get_mut(&key)
                && let Some(addr) = blocks.pop()
            {
                if blocks.is_empty() {
                    self.free.remove(&key);
                }
                self.stats.hits += 1;
                self.register(addr, key);
                trace!(addr = format_args!("{addr:#x}"), flavor = flavor.name(), size, "allocation reused");
                return Ok(addr);
            }
            probe = match probe.checked_mul(2) {
                Some(next) => next,
                None => break,
            };
        }

        self.stats.misses += 1;
        let key = AllocKey::new(flavor, device, rounded);
        let addr = match Self::native_alloc(rounded) {
            Some(addr) => addr,
            None => {
                // Native allocation failed: hand every cached block back to
                // the OS and retry once before reporting out-of-memory.
                self.trim();
                Self::native_alloc(rounded).ok_or_else(|| OutOfMemorySnafu { flavor, size }.build())?
            }
        };

        self.register(addr, key);
        trace!(addr = format_args!("{addr:#x}"), flavor = flavor.name(), size, rounded, "allocation");
        Ok(addr)
    }

    /// Release a block. `Host` memory returns to the free list immediately.
    /// Other flavors are parked on the stream's release chain (when a stream
    /// is active) and recycled once the stream's event passes `fence`.
    pub fn free(&mut self, addr: usize, stream: Option<(StreamKey, u64)>) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let key = self.used.remove(&addr).ok_or_else(|| UnknownPointerSnafu { addr }.build())?;
        self.stats.usage[key.flavor as usize] -= key.size;

        match stream {
            Some((stream, fence)) if key.flavor.deferred_release() => {
                trace!(addr = format_args!("{addr:#x}"), fence, "release deferred");
                self.pending.entry(stream).or_default().push(ReleaseEntry { addr, key, fence });
            }
            _ => {
                self.free.entry(key).or_default().push(addr);
            }
        }
        Ok(())
    }

    /// Move every pending block of `stream` whose fence has been reached onto
    /// the free lists.
    pub fn drain_releases(&mut self, stream: StreamKey, reached: u64) {
        let Some(chain) = self.pending.get_mut(&stream) else { return };
        let mut drained = 0usize;
        let mut i = 0;
        while i < chain.len() {
            if chain[i].fence <= reached {
                let entry = chain.swap_remove(i);
                self.free.entry(entry.key).or_default().push(entry.addr);
                drained += 1;
            } else {
                i += 1;
            }
        }
        if chain.is_empty() {
            self.pending.remove(&stream);
        }
        if drained > 0 {
            trace!(stream = ?stream, drained, "release chain drained");
        }
    }

    /// Force every pending block onto the free lists. Only valid once all
    /// streams have been synchronized (the shutdown path).
    pub fn drain_all_releases(&mut self) {
        for (_, chain) in self.pending.drain() {
            for entry in chain {
                self.free.entry(entry.key).or_default().push(entry.addr);
            }
        }
    }

    /// Change the flavor of an allocated block, returning the new address.
    ///
    /// When source and target flavor coincide (and, for device memory, the
    /// block already lives on `device`) the input address is returned
    /// unchanged. Otherwise the contents move to a fresh block and the old
    /// one is released through the regular (possibly deferred) path. A
    /// `Device` → `Device` move across device indices is the peer-to-peer
    /// case.
    pub fn migrate(
        &mut self,
        addr: usize,
        target: AllocType,
        device: i32,
        stream: Option<(StreamKey, u64)>,
    ) -> Result<usize> {
        let key = *self.used.get(&addr).ok_or_else(|| UnknownPointerSnafu { addr }.build())?;
        let target_key = AllocKey::new(target, device, key.size);
        if key == target_key {
            return Ok(addr);
        }
        if key.flavor == AllocType::Device && target == AllocType::Device {
            debug!(from = key.device, to = device, "peer-to-peer migration");
        }

        let new_addr = self.alloc(target, device, key.size)?;
        // SAFETY: both blocks were handed out by this allocator with
        // identical rounded sizes and are disjoint.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, key.size);
        }
        self.free(addr, stream)?;
        Ok(new_addr)
    }

    /// Make a managed block resident on `device` (`-1` = host, `-2` = all
    /// GPUs). With no GPU driver loaded the data is already host-resident,
    /// so only the argument validation is observable.
    pub fn prefetch(&self, addr: usize, device: i32) -> Result<()> {
        let key = self.used.get(&addr).ok_or_else(|| UnknownPointerSnafu { addr }.build())?;
        ensure!(
            matches!(key.flavor, AllocType::Managed | AllocType::ManagedReadMostly),
            PrefetchFlavorSnafu { flavor: key.flavor }
        );
        trace!(addr = format_args!("{addr:#x}"), device, "prefetch");
        Ok(())
    }

    /// Return every cached block to the OS.
    pub fn trim(&mut self) {
        let blocks: usize = self.free.values().map(Vec::len).sum();
        for (key, addrs) in self.free.drain() {
            for addr in addrs {
                Self::native_free(addr, key.size);
            }
        }
        if blocks > 0 {
            debug!(blocks, "trimmed allocation cache");
        }
    }

    /// Drop all tracking state, warning about blocks never handed back.
    pub fn shutdown(&mut self) {
        self.drain_all_releases();
        self.trim();
        if !self.used.is_empty() {
            warn!(leaked = self.used.len(), "allocations were never freed");
            for (addr, key) in self.used.drain() {
                Self::native_free(addr, key.size);
            }
        }
        self.stats = AllocStats::default();
    }

    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Number of blocks currently handed out.
    pub fn live_allocations(&self) -> usize {
        self.used.len()
    }

    /// Number of blocks sitting on the free lists.
    pub fn cached_blocks(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    fn register(&mut self, addr: usize, key: AllocKey) {
        self.used.insert(addr, key);
        let usage = &mut self.stats.usage[key.flavor as usize];
        *usage += key.size;
        let watermark = &mut self.stats.watermark[key.flavor as usize];
        *watermark = (*watermark).max(*usage);
    }

    fn native_alloc(size: usize) -> Option<usize> {
        let layout = Layout::from_size_align(size, ALIGNMENT).ok()?;
        // SAFETY: layout has nonzero size (callers reject empty allocations).
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() { None } else { Some(ptr as usize) }
    }

    fn native_free(addr: usize, size: usize) {
        let layout = Layout::from_size_align(size, ALIGNMENT).expect("valid allocation layout");
        // SAFETY: the block was produced by `native_alloc` with this layout.
        unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.drain_all_releases();
        self.trim();
        for (addr, key) in self.used.drain() {
            Self::native_free(addr, key.size);
        }
    }
}

//! Executable code cache.
//!
//! Small blocks of read/write/execute memory carved out of RWX regions. Every
//! region sits on exactly one of three lists:
//!
//! - *live*: bump space is still available at the end of the region,
//! - *partial*: bump space is gone but freed blocks may be reused,
//! - *full*: neither.
//!
//! A region is only re-filed when an allocation visits it. Freeing never
//! moves a region, so space freed in a *full* region stays unreachable until
//! [`CodeCache::rebalance`] is called explicitly.
//!
//! Each block starts with a 16-byte secret `{region, size}` followed by the
//! caller's bytes. Callers normally free through the [`CodeBlock`] handle; the
//! secret lets [`CodeCache::free_raw`] do the same from a bare pointer.
//!
//! Free-list nodes live in an ordinary heap pool, never inside a code region,
//! so bookkeeping writes never dirty code pages.

#![allow(unsafe_code)]

use core::mem::size_of;
use core::ptr::NonNull;

use crate::config::KnightConfig;
use crate::error::{KnightError, Result};
use crate::lifecycle::{LifecycleLevel, LifecycleLog};
use crate::platform::Mapping;

/// Alignment of every pointer handed out.
pub const CODE_ALIGN: usize = 16;

/// Bytes reserved in front of every block for its secret.
pub const SECRET_SIZE: usize = 16;

/// Smallest slot: a secret plus one aligned payload granule.
pub const MIN_ALLOC_SIZE: usize = alloc_size(1);

#[repr(C)]
#[derive(Clone, Copy)]
struct CodeSecret {
    region: usize,
    size: usize,
}

const _: () = assert!(size_of::<CodeSecret>() <= SECRET_SIZE);
const _: () = assert!(SECRET_SIZE % CODE_ALIGN == 0);

/// Slot size for a `size`-byte request: secret included, 16-byte rounded.
#[inline]
#[must_use]
pub const fn alloc_size(size: usize) -> usize {
    (size + SECRET_SIZE + CODE_ALIGN - 1) & !(CODE_ALIGN - 1)
}

#[inline]
fn checked_alloc_size(size: usize) -> Option<usize> {
    size.checked_add(SECRET_SIZE + CODE_ALIGN - 1)
        .map(|s| s & !(CODE_ALIGN - 1))
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Identifies a region of a [`CodeCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(usize);

impl RegionId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which list a region is filed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionList {
    Live,
    Partial,
    Full,
}

impl RegionList {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

/// A block of executable memory.
///
/// Not `Copy`: giving it back to [`CodeCache::free`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct CodeBlock {
    ptr: NonNull<u8>,
    region: RegionId,
    size: usize,
}

impl CodeBlock {
    /// Start of the caller's bytes, 16-byte aligned.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    #[must_use]
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Whole slot, secret included.
    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.size
    }

    /// Usable bytes. At least the size that was requested.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.size - SECRET_SIZE
    }
}

// ---------------------------------------------------------------------------
// Regions and metadata
// ---------------------------------------------------------------------------

struct CodeRegion {
    mapping: Mapping,
    /// Offset of the bump cursor.
    cursor: usize,
    /// Head of this region's freed-block list (index into the node pool).
    free_list: Option<usize>,
    total_size: usize,
    /// Bump space left at the end of the region.
    end_free: usize,
    /// `end_free` plus everything handed back through `free`.
    total_free: usize,
    next: Option<usize>,
    list: RegionList,
}

#[derive(Clone, Copy)]
struct FreedNode {
    region: usize,
    /// Slot offset inside the region (where the secret goes).
    offset: usize,
    size: usize,
    next: Option<usize>,
}

/// Heap-backed pool of free-list nodes, grown a page worth of nodes at a time.
struct NodePool {
    nodes: Vec<FreedNode>,
    /// Recycled node slots.
    spare: Option<usize>,
    batch: usize,
}

impl NodePool {
    fn new(page_size: usize) -> Self {
        Self {
            nodes: Vec::new(),
            spare: None,
            batch: (page_size / size_of::<FreedNode>()).max(1),
        }
    }

    fn take(&mut self, node: FreedNode) -> usize {
        if let Some(index) = self.spare {
            self.spare = self.nodes[index].next;
            self.nodes[index] = node;
            return index;
        }
        if self.nodes.len() == self.nodes.capacity() {
            self.nodes.reserve_exact(self.batch);
        }
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn give_back(&mut self, index: usize) {
        self.nodes[index].next = self.spare;
        self.spare = Some(index);
    }

    fn spare_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.spare;
        while let Some(index) = cursor {
            count += 1;
            cursor = self.nodes[index].next;
        }
        count
    }
}

/// Snapshot of one region's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub list: RegionList,
    pub base: usize,
    pub total_size: usize,
    pub end_free: usize,
    pub total_free: usize,
    pub free_blocks: usize,
}

/// Cache-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub live: usize,
    pub partial: usize,
    pub full: usize,
    pub mapped_bytes: usize,
    pub total_free: usize,
    /// Freed blocks waiting on region free lists.
    pub free_blocks: usize,
    /// Metadata nodes parked in the pool for reuse.
    pub pooled_nodes: usize,
}

impl CodeCacheStats {
    #[must_use]
    pub fn regions(&self) -> usize {
        self.live + self.partial + self.full
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Allocator for executable code blocks.
pub struct CodeCache {
    regions: Vec<CodeRegion>,
    first_live: Option<usize>,
    first_partial: Option<usize>,
    first_full: Option<usize>,
    pool: NodePool,
    granularity: usize,
    region_size: usize,
    lifecycle: LifecycleLog,
}

impl CodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&KnightConfig::default())
    }

    #[must_use]
    pub fn with_config(config: &KnightConfig) -> Self {
        let config = config.normalized();
        Self {
            regions: Vec::new(),
            first_live: None,
            first_partial: None,
            first_full: None,
            pool: NodePool::new(config.memory.page_size),
            granularity: config.memory.granularity,
            region_size: config.code_region_size,
            lifecycle: LifecycleLog::new("code_cache", config.lifecycle_log),
        }
    }

    /// Allocate at least `size` bytes of executable memory.
    pub fn alloc(&mut self, size: usize) -> Result<CodeBlock> {
        let alloc_size = checked_alloc_size(size).ok_or(KnightError::Exhausted { size })?;

        if let Some(block) = self.alloc_from_live(alloc_size) {
            return Ok(block);
        }
        if let Some(block) = self.alloc_from_partial(alloc_size) {
            return Ok(block);
        }

        self.add_region(alloc_size)?;
        self.alloc_from_live(alloc_size)
            .ok_or(KnightError::Exhausted { size })
    }

    /// Give a block back. Its region is not re-filed until an allocation
    /// visits it.
    ///
    /// A block this cache did not hand out (one from another cache) is
    /// ignored and nothing is accounted. Returns whether the block was taken.
    pub fn free(&mut self, block: CodeBlock) -> bool {
        let region = block.region.0;
        let slot = block.addr().wrapping_sub(SECRET_SIZE);
        let Some(offset) = self.owned_slot(region, slot, block.size) else {
            self.lifecycle.record(
                LifecycleLevel::Warn,
                "foreign_free",
                Some(block.addr()),
                Some(block.size),
                "ignored",
                || format!("region={region};regions={}", self.regions.len()),
            );
            return false;
        };
        self.release(region, offset, block.size);
        true
    }

    /// Offset of `slot` inside `region` if it is a block this cache placed
    /// there: inside the bumped part, aligned, and carrying a matching secret.
    fn owned_slot(&self, region: usize, slot: usize, size: usize) -> Option<usize> {
        let owner = self.regions.get(region)?;
        if !owner.mapping.contains(slot) || size < MIN_ALLOC_SIZE {
            return None;
        }
        let offset = slot - owner.mapping.as_ptr() as usize;
        let in_bumped_part = offset
            .checked_add(size)
            .is_some_and(|end| end <= owner.cursor);
        if offset % CODE_ALIGN != 0 || !in_bumped_part {
            return None;
        }
        // SAFETY: offset is 16-byte aligned and offset + SECRET_SIZE lies
        // below the bump cursor, inside the mapping.
        let secret = unsafe {
            owner
                .mapping
                .base()
                .add(offset)
                .cast::<CodeSecret>()
                .read()
        };
        (secret.region == region && secret.size == size).then_some(offset)
    }

    /// Free a block from its bare pointer.
    ///
    /// # Safety
    /// `ptr` must be the start of a live block returned by this cache, and
    /// must not be freed again.
    pub unsafe fn free_raw(&mut self, ptr: NonNull<u8>) {
        // SAFETY: the caller guarantees a live block, so the secret sits in
        // the 16 bytes before it, inside the same region.
        let secret = unsafe {
            ptr.as_ptr()
                .sub(SECRET_SIZE)
                .cast::<CodeSecret>()
                .read()
        };
        debug_assert!(secret.region < self.regions.len());
        let slot = ptr.as_ptr() as usize - SECRET_SIZE;
        let offset = slot - self.regions[secret.region].mapping.as_ptr() as usize;
        self.release(secret.region, offset, secret.size);
    }

    fn release(&mut self, region: usize, offset: usize, size: usize) {
        let head = self.regions[region].free_list;
        let node = self.pool.take(FreedNode {
            region,
            offset,
            size,
            next: head,
        });
        let region = &mut self.regions[region];
        region.free_list = Some(node);
        region.total_free += size;
    }

    /// Pure bump allocation from the first live region with enough room.
    fn alloc_from_live(&mut self, alloc_size: usize) -> Option<CodeBlock> {
        let mut prev = None;
        let mut cursor = self.first_live;
        while let Some(index) = cursor {
            let region = &mut self.regions[index];
            if region.end_free >= alloc_size {
                let offset = region.cursor;
                region.cursor += alloc_size;
                region.end_free -= alloc_size;
                region.total_free -= alloc_size;

                if region.end_free < MIN_ALLOC_SIZE {
                    let target = if region.total_free >= MIN_ALLOC_SIZE {
                        RegionList::Partial
                    } else {
                        RegionList::Full
                    };
                    self.refile(RegionList::Live, prev, index, target);
                }
                return Some(self.place(index, offset, alloc_size));
            }
            prev = Some(index);
            cursor = region.next;
        }
        None
    }

    /// First-fit reuse of a freed block in the first partial region that
    /// might hold one.
    fn alloc_from_partial(&mut self, alloc_size: usize) -> Option<CodeBlock> {
        let mut prev = None;
        let mut cursor = self.first_partial;
        while let Some(index) = cursor {
            if self.regions[index].total_free >= alloc_size {
                if let Some(offset) = self.take_free_block(index, alloc_size) {
                    let region = &mut self.regions[index];
                    // The slot keeps its full size, only alloc_size is
                    // accounted; the tail of a larger slot is stranded.
                    region.total_free -= alloc_size;
                    if region.total_free < MIN_ALLOC_SIZE {
                        self.refile(RegionList::Partial, prev, index, RegionList::Full);
                    }
                    return Some(self.place(index, offset, alloc_size));
                }
            }
            prev = Some(index);
            cursor = self.regions[index].next;
        }
        None
    }

    /// Unlink the first freed block of at least `alloc_size` bytes.
    fn take_free_block(&mut self, region: usize, alloc_size: usize) -> Option<usize> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.regions[region].free_list;
        while let Some(node) = cursor {
            let FreedNode { offset, size, next, .. } = self.pool.nodes[node];
            if size >= alloc_size {
                match prev {
                    Some(prev) => self.pool.nodes[prev].next = next,
                    None => self.regions[region].free_list = next,
                }
                self.pool.give_back(node);
                return Some(offset);
            }
            prev = Some(node);
            cursor = next;
        }
        None
    }

    /// Write the secret and build the handle.
    fn place(&mut self, region: usize, offset: usize, alloc_size: usize) -> CodeBlock {
        let mapping = &self.regions[region].mapping;
        debug_assert!(offset + alloc_size <= mapping.len());
        // SAFETY: offset + alloc_size lies inside the RWX mapping and offset
        // is 16-byte aligned, so the secret write is in bounds and aligned.
        let ptr = unsafe {
            let slot = mapping.base().add(offset);
            slot.cast::<CodeSecret>().write(CodeSecret {
                region,
                size: alloc_size,
            });
            slot.add(SECRET_SIZE)
        };
        CodeBlock {
            ptr,
            region: RegionId(region),
            size: alloc_size,
        }
    }

    fn add_region(&mut self, alloc_size: usize) -> Result<usize> {
        let granularity = self.granularity;
        let size = alloc_size
            .checked_add(granularity * 2)
            .map(|s| s - s % granularity)
            .ok_or(KnightError::Exhausted { size: alloc_size })?
            .max(self.region_size);

        let mapping = match Mapping::executable(size) {
            Ok(mapping) => mapping,
            Err(err) => {
                let event = match err {
                    KnightError::Protect { .. } => "protect_failed",
                    _ => "map_failed",
                };
                self.lifecycle.record(
                    LifecycleLevel::Error,
                    event,
                    None,
                    Some(size),
                    "error",
                    || err.to_string(),
                );
                return Err(err);
            }
        };

        let total_size = mapping.len();
        let base = mapping.as_ptr() as usize;
        let index = self.regions.len();
        self.regions.push(CodeRegion {
            mapping,
            cursor: 0,
            free_list: None,
            total_size,
            end_free: total_size,
            total_free: total_size,
            next: None,
            list: RegionList::Live,
        });
        self.push_front(RegionList::Live, index);
        self.lifecycle.record(
            LifecycleLevel::Debug,
            "region_mapped",
            Some(base),
            Some(total_size),
            "ok",
            || format!("request={alloc_size};regions={}", index + 1),
        );
        Ok(index)
    }

    // -----------------------------------------------------------------------
    // List plumbing
    // -----------------------------------------------------------------------

    fn head_mut(&mut self, list: RegionList) -> &mut Option<usize> {
        match list {
            RegionList::Live => &mut self.first_live,
            RegionList::Partial => &mut self.first_partial,
            RegionList::Full => &mut self.first_full,
        }
    }

    fn push_front(&mut self, list: RegionList, index: usize) {
        let head = *self.head_mut(list);
        let region = &mut self.regions[index];
        region.next = head;
        region.list = list;
        *self.head_mut(list) = Some(index);
    }

    /// Move `index` (whose predecessor on `from` is `prev`) to the front of `to`.
    fn refile(&mut self, from: RegionList, prev: Option<usize>, index: usize, to: RegionList) {
        debug_assert_eq!(self.regions[index].list, from);
        let next = self.regions[index].next;
        match prev {
            Some(prev) => self.regions[prev].next = next,
            None => *self.head_mut(from) = next,
        }
        self.push_front(to, index);

        let region = &self.regions[index];
        let (end_free, total_free) = (region.end_free, region.total_free);
        self.lifecycle.record(
            LifecycleLevel::Trace,
            "region_refiled",
            Some(region.mapping.as_ptr() as usize),
            Some(region.total_size),
            to.as_str(),
            || format!("from={};end_free={end_free};total_free={total_free}", from.as_str()),
        );
    }

    /// Re-file every region according to its current counters.
    ///
    /// Not called implicitly. Recovers space freed into regions that had
    /// already drifted to *full*. Returns how many regions changed list.
    pub fn rebalance(&mut self) -> usize {
        self.first_live = None;
        self.first_partial = None;
        self.first_full = None;

        let mut moved = 0;
        for index in (0..self.regions.len()).rev() {
            let region = &self.regions[index];
            let target = if region.end_free >= MIN_ALLOC_SIZE {
                RegionList::Live
            } else if region.total_free >= MIN_ALLOC_SIZE {
                RegionList::Partial
            } else {
                RegionList::Full
            };
            if region.list != target {
                moved += 1;
            }
            self.push_front(target, index);
        }
        self.lifecycle.record(
            LifecycleLevel::Info,
            "rebalance",
            None,
            Some(self.regions.len()),
            "ok",
            || format!("moved={moved}"),
        );
        moved
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Region containing `addr`, if any.
    #[must_use]
    pub fn region_of(&self, addr: usize) -> Option<RegionId> {
        self.regions
            .iter()
            .position(|r| r.mapping.contains(addr))
            .map(RegionId)
    }

    #[must_use]
    pub fn region_info(&self, id: RegionId) -> Option<RegionInfo> {
        let region = self.regions.get(id.0)?;
        Some(RegionInfo {
            list: region.list,
            base: region.mapping.as_ptr() as usize,
            total_size: region.total_size,
            end_free: region.end_free,
            total_free: region.total_free,
            free_blocks: self.free_list_len(region.free_list),
        })
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn stats(&self) -> CodeCacheStats {
        let mut stats = CodeCacheStats {
            pooled_nodes: self.pool.spare_count(),
            ..CodeCacheStats::default()
        };
        for region in &self.regions {
            match region.list {
                RegionList::Live => stats.live += 1,
                RegionList::Partial => stats.partial += 1,
                RegionList::Full => stats.full += 1,
            }
            stats.mapped_bytes += region.mapping.len();
            stats.total_free += region.total_free;
            stats.free_blocks += self.free_list_len(region.free_list);
        }
        stats
    }

    fn free_list_len(&self, mut cursor: Option<usize>) -> usize {
        let mut count = 0;
        while let Some(node) = cursor {
            debug_assert!(self.pool.nodes[node].region < self.regions.len());
            count += 1;
            cursor = self.pool.nodes[node].next;
        }
        count
    }

    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.lifecycle
    }

    pub fn lifecycle_log_mut(&mut self) -> &mut LifecycleLog {
        &mut self.lifecycle
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

//! Lump allocator: a bulk-resettable bump arena.
//!
//! Lumps are mapped on demand and carved with a bump cursor. Individual frees
//! are no-ops; the only way to reclaim memory is [`LumpAllocator::reset`],
//! which rewinds every lump at once without running destructors. Payloads
//! must therefore be trivially destructible.
//!
//! Region headers live in a side table, not at the start of the lump, so a
//! scan for space never touches the lumps themselves.

#![allow(unsafe_code)]

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::config::KnightConfig;
use crate::error::{KnightError, Result};
use crate::lifecycle::{LifecycleLevel, LifecycleLog};
use crate::node_alloc::NodeAllocator;
use crate::platform::{Mapping, Protection};

/// Allocation granule and alignment of every lump allocation.
pub const LUMP_ALIGN: usize = 8;

struct LumpRegion {
    mapping: Mapping,
    /// Offset of the next free byte from the start of the mapping.
    cursor: usize,
    size: usize,
    available: usize,
    next: Option<usize>,
    prev: Option<usize>,
}

/// Doubly linked list of region indices.
#[derive(Debug, Default, Clone, Copy)]
struct RegionList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl RegionList {
    fn push_front(&mut self, regions: &mut [LumpRegion], index: usize) {
        regions[index].prev = None;
        regions[index].next = self.head;
        match self.head {
            Some(head) => regions[head].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;
    }

    fn unlink(&mut self, regions: &mut [LumpRegion], index: usize) {
        let (prev, next) = (regions[index].prev, regions[index].next);
        match prev {
            Some(prev) => regions[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => regions[next].prev = prev,
            None => self.tail = prev,
        }
        regions[index].prev = None;
        regions[index].next = None;
        self.len -= 1;
    }

    /// Move every entry of `other` to the end of `self`.
    fn append(&mut self, regions: &mut [LumpRegion], other: &mut RegionList) {
        let Some(other_head) = other.head else {
            return;
        };
        match self.tail {
            Some(tail) => {
                regions[tail].next = Some(other_head);
                regions[other_head].prev = Some(tail);
            }
            None => self.head = Some(other_head),
        }
        self.tail = other.tail;
        self.len += other.len;
        *other = RegionList::default();
    }
}

/// Bump arena over OS-mapped lumps.
pub struct LumpAllocator {
    regions: Vec<LumpRegion>,
    /// Regions with at least [`LUMP_ALIGN`] bytes left.
    usable: RegionList,
    /// Exhausted regions, waiting for a reset.
    unusable: RegionList,
    lump_size: usize,
    lifecycle: LifecycleLog,
}

impl LumpAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&KnightConfig::default())
    }

    #[must_use]
    pub fn with_config(config: &KnightConfig) -> Self {
        let config = config.normalized();
        Self {
            regions: Vec::new(),
            usable: RegionList::default(),
            unusable: RegionList::default(),
            lump_size: config.lump_size,
            lifecycle: LifecycleLog::new("lump", config.lifecycle_log),
        }
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// The memory stays valid until [`reset`](Self::reset) or drop.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let size = size
            .max(1)
            .checked_next_multiple_of(LUMP_ALIGN)
            .ok_or(KnightError::Exhausted { size })?;

        let index = match self.find_region(size) {
            Some(index) => index,
            None => self.map_region(size)?,
        };

        let region = &mut self.regions[index];
        debug_assert!(region.available >= size);
        // SAFETY: cursor + size <= size of the lump, which lies inside the mapping.
        let ptr = unsafe { region.mapping.base().add(region.cursor) };
        region.cursor += size;
        region.available -= size;
        debug_assert!(region.cursor <= region.size);

        // One last tiny allocation might still fit, but it is not worth it.
        if region.available < LUMP_ALIGN {
            self.usable.unlink(&mut self.regions, index);
            self.unusable.push_front(&mut self.regions, index);
        }
        Ok(ptr)
    }

    /// Individual frees are not supported; reclaim with [`reset`](Self::reset).
    #[inline]
    pub fn free(&mut self, _ptr: NonNull<u8>) {}

    /// Rewind every lump. Previously returned pointers must no longer be used.
    pub fn reset(&mut self) {
        let revived = self.unusable.len;
        self.usable.append(&mut self.regions, &mut self.unusable);
        for region in &mut self.regions {
            region.available = region.size;
            region.cursor = 0;
        }
        self.lifecycle.record(
            LifecycleLevel::Info,
            "reset",
            None,
            Some(self.regions.len()),
            "ok",
            || format!("revived={revived}"),
        );
    }

    /// First-fit scan of the usable list.
    fn find_region(&self, size: usize) -> Option<usize> {
        let mut cursor = self.usable.head;
        while let Some(index) = cursor {
            let region = &self.regions[index];
            if region.available >= size {
                return Some(index);
            }
            cursor = region.next;
        }
        None
    }

    fn map_region(&mut self, size: usize) -> Result<usize> {
        let region_size = if size > self.lump_size {
            size.checked_next_multiple_of(self.lump_size)
                .ok_or(KnightError::Exhausted { size })?
        } else {
            self.lump_size
        };

        let mapping = match Mapping::new(region_size, Protection::ReadWrite) {
            Ok(mapping) => mapping,
            Err(err) => {
                self.lifecycle.record(
                    LifecycleLevel::Error,
                    "map_failed",
                    None,
                    Some(region_size),
                    "error",
                    || err.to_string(),
                );
                return Err(err);
            }
        };

        let base = mapping.as_ptr() as usize;
        let index = self.regions.len();
        self.regions.push(LumpRegion {
            mapping,
            cursor: 0,
            size: region_size,
            available: region_size,
            next: None,
            prev: None,
        });
        self.usable.push_front(&mut self.regions, index);
        self.lifecycle.record(
            LifecycleLevel::Debug,
            "region_mapped",
            Some(base),
            Some(region_size),
            "ok",
            || format!("request={size};regions={}", index + 1),
        );
        Ok(index)
    }

    #[must_use]
    pub fn default_lump_size(&self) -> usize {
        self.lump_size
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn usable_regions(&self) -> usize {
        self.usable.len
    }

    #[must_use]
    pub fn unusable_regions(&self) -> usize {
        self.unusable.len
    }

    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.mapping.len()).sum()
    }

    /// Bytes still available across all regions.
    #[must_use]
    pub fn available_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.available).sum()
    }

    /// Returns true if `addr` lies in one of this allocator's lumps.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.regions.iter().any(|r| r.mapping.contains(addr))
    }

    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.lifecycle
    }

    pub fn lifecycle_log_mut(&mut self) -> &mut LifecycleLog {
        &mut self.lifecycle
    }
}

impl Default for LumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeAllocator for LumpAllocator {
    fn alloc(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.align() > LUMP_ALIGN {
            return Err(KnightError::UnsupportedAlignment {
                align: layout.align(),
                max: LUMP_ALIGN,
            });
        }
        LumpAllocator::alloc(self, layout.size())
    }

    unsafe fn dealloc(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(ptr);
    }
}

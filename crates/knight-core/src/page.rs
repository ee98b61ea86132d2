//! Page allocator.
//!
//! Hands out OS pages and recycles them. A miss maps one
//! granularity-sized block, returns its first page and stacks the rest on the
//! free list. Pages are never unmapped individually; the blocks are released
//! when the allocator is dropped.

use core::ptr::NonNull;

use crate::config::KnightConfig;
use crate::error::Result;
use crate::lifecycle::{LifecycleLevel, LifecycleLog};
use crate::platform::{Mapping, MemoryInfo, Protection};

/// One page of read/write memory owned by a [`PageAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Page {
    ptr: NonNull<u8>,
}

impl Page {
    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn as_non_null(self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// Recycling page source.
pub struct PageAllocator {
    memory: MemoryInfo,
    /// LIFO stack of free pages; the last element is the head.
    free: Vec<Page>,
    /// Every block mapped so far, released on drop.
    blocks: Vec<Mapping>,
    lifecycle: LifecycleLog,
}

impl PageAllocator {
    /// Page allocator using the OS page size and granularity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&KnightConfig::default())
    }

    #[must_use]
    pub fn with_info(memory: MemoryInfo) -> Self {
        Self::with_config(&KnightConfig::for_memory(memory))
    }

    #[must_use]
    pub fn with_config(config: &KnightConfig) -> Self {
        let config = config.normalized();
        Self {
            memory: config.memory,
            free: Vec::new(),
            blocks: Vec::new(),
            lifecycle: LifecycleLog::new("page", config.lifecycle_log),
        }
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.memory.page_size
    }

    #[inline]
    #[must_use]
    pub fn granularity(&self) -> usize {
        self.memory.granularity
    }

    /// Take a page, mapping a new block only when the free list is empty.
    pub fn alloc(&mut self) -> Result<Page> {
        if let Some(page) = self.free.pop() {
            return Ok(page);
        }

        let block = match Mapping::new(self.memory.granularity, Protection::ReadWrite) {
            Ok(block) => block,
            Err(err) => {
                self.lifecycle.record(
                    LifecycleLevel::Error,
                    "map_failed",
                    None,
                    Some(self.memory.granularity),
                    "error",
                    || err.to_string(),
                );
                return Err(err);
            }
        };

        let base = block.as_ptr() as usize;
        let page_size = self.memory.page_size;
        let pages = block.len() / page_size;
        self.free.reserve(pages.saturating_sub(1));
        // Stack from the top so the next pops walk the block upwards.
        for index in (1..pages).rev() {
            let addr = (base + index * page_size) as *mut u8;
            // Offsets inside a live mapping are never null.
            if let Some(ptr) = NonNull::new(addr) {
                self.free.push(Page { ptr });
            }
        }

        self.lifecycle.record(
            LifecycleLevel::Debug,
            "region_mapped",
            Some(base),
            Some(block.len()),
            "ok",
            || format!("pages={pages};blocks={}", self.blocks.len() + 1),
        );

        let first = Page { ptr: block.base() };
        self.blocks.push(block);
        Ok(first)
    }

    /// Return a page for reuse. It stays mapped until the allocator drops.
    ///
    /// Passing a page from another allocator is a contract violation.
    pub fn free(&mut self, page: Page) {
        debug_assert!(
            self.owns(page.addr()),
            "page {:#x} was not allocated here",
            page.addr()
        );
        self.free.push(page);
    }

    /// Returns true if `addr` lies in a block this allocator mapped.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.blocks.iter().any(|block| block.contains(addr))
    }

    /// Pages currently on the free list.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn mapped_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.blocks.iter().map(Mapping::len).sum()
    }

    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.lifecycle
    }

    pub fn lifecycle_log_mut(&mut self) -> &mut LifecycleLog {
        &mut self.lifecycle
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: pages point into mappings owned by this allocator; moving the
// allocator moves ownership of all of them.
#[allow(unsafe_code)]
unsafe impl Send for PageAllocator {}

//! The allocator seam used for container nodes.
//!
//! A [`NodeAllocator`] is the `{alloc, dealloc}` pair a container such as
//! [`HashTable`](crate::hash_table::HashTable) draws its nodes from. The heap
//! is the default; a [`LumpAllocator`](crate::lump::LumpAllocator) can be
//! plugged in for bulk-freed scratch tables.

#![allow(unsafe_code)]

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::{KnightError, Result};

/// Source of raw node memory.
pub trait NodeAllocator {
    /// Allocate memory fitting `layout`.
    fn alloc(&mut self, layout: Layout) -> Result<NonNull<u8>>;

    /// Give memory back.
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this allocator with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn dealloc(&mut self, ptr: NonNull<u8>, layout: Layout);
}

impl<A: NodeAllocator + ?Sized> NodeAllocator for &mut A {
    #[inline]
    fn alloc(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        (**self).alloc(layout)
    }

    #[inline]
    unsafe fn dealloc(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded contract.
        unsafe { (**self).dealloc(ptr, layout) }
    }
}

/// The global heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemAllocator;

impl NodeAllocator for SystemAllocator {
    fn alloc(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            // Zero-sized nodes need no memory, only a well-aligned address.
            let dangling = core::ptr::null_mut::<u8>().wrapping_add(layout.align());
            return NonNull::new(dangling).ok_or(KnightError::Exhausted { size: 0 });
        }
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(KnightError::Exhausted {
            size: layout.size(),
        })
    }

    unsafe fn dealloc(&mut self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // SAFETY: caller guarantees ptr came from `alloc` with this layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocator_round_trip() {
        let mut heap = SystemAllocator;
        let layout = Layout::new::<[u64; 4]>();
        let ptr = heap.alloc(layout).expect("heap");
        assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        // SAFETY: ptr is a fresh allocation of `layout`.
        unsafe {
            ptr.as_ptr().write_bytes(0, layout.size());
            heap.dealloc(ptr, layout);
        }
    }

    #[test]
    fn zero_sized_layouts_are_aligned() {
        let mut heap = SystemAllocator;
        let layout = Layout::from_size_align(0, 16).expect("layout");
        let ptr = heap.alloc(layout).expect("zst");
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        // SAFETY: zero-sized dealloc is a no-op.
        unsafe { heap.dealloc(ptr, layout) };
    }

    #[test]
    fn borrowed_allocator_forwards() {
        fn take<A: NodeAllocator>(mut alloc: A) -> NonNull<u8> {
            alloc.alloc(Layout::new::<u32>()).expect("alloc")
        }
        let mut heap = SystemAllocator;
        let ptr = take(&mut heap);
        // SAFETY: allocated above with the same layout.
        unsafe { heap.dealloc(ptr, Layout::new::<u32>()) };
    }
}

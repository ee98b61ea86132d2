//! OS virtual-memory primitives.
//!
//! This is the only module that talks to `mmap`/`munmap`/`mprotect`/`sysconf`. Everything
//! above it works with [`Mapping`], an owned anonymous mapping that is
//! released when dropped, so allocator teardown is just dropping the owner.

#![allow(unsafe_code)]

use core::ptr::{self, NonNull};

use crate::error::{KnightError, Result};

/// Fallback when `sysconf` cannot report a page size.
const FALLBACK_PAGE_SIZE: usize = 4096;

// ---------------------------------------------------------------------------
// Protection
// ---------------------------------------------------------------------------

/// Access rights of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Ordinary data memory.
    ReadWrite,
    /// Code memory: stays writable and executable for its whole lifetime.
    ReadWriteExecute,
}

impl Protection {
    /// The `PROT_*` bits for this protection.
    #[must_use]
    pub const fn bits(self) -> i32 {
        match self {
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Self::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    /// Returns true if code may run from memory with this protection.
    #[must_use]
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::ReadWriteExecute)
    }

    const fn map_flags(self) -> i32 {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "macos")]
        {
            if self.is_executable() {
                return flags | libc::MAP_JIT;
            }
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// Memory geometry
// ---------------------------------------------------------------------------

/// Page size and mapping granularity of the host.
///
/// `granularity` is the number of bytes a single mapping call hands out. On
/// POSIX hosts the kernel reports the page size for both; callers that want
/// batched page mapping raise it with [`MemoryInfo::with_granularity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub page_size: usize,
    pub granularity: usize,
}

impl MemoryInfo {
    /// Ask the OS.
    #[must_use]
    pub fn query() -> Self {
        let page_size = page_size();
        Self {
            page_size,
            granularity: page_size,
        }
    }

    /// Override the granularity, rounded up to a whole number of pages.
    #[must_use]
    pub fn with_granularity(self, granularity: usize) -> Self {
        let granularity = round_up(granularity.max(self.page_size), self.page_size);
        Self {
            granularity,
            ..self
        }
    }

    /// Repair hand-built geometry: a page size that is not a power of two is
    /// replaced by the OS value, and the granularity becomes a non-zero
    /// multiple of the page size.
    #[must_use]
    pub fn normalized(self) -> Self {
        let page_size = if self.page_size.is_power_of_two() {
            self.page_size
        } else {
            page_size()
        };
        let granularity = self
            .granularity
            .max(page_size)
            .checked_next_multiple_of(page_size)
            .unwrap_or(page_size);
        Self {
            page_size,
            granularity,
        }
    }

    /// Pages produced by one mapping call.
    #[must_use]
    pub const fn pages_per_block(&self) -> usize {
        self.granularity / self.page_size
    }
}

/// The OS page size.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw <= 0 {
        FALLBACK_PAGE_SIZE
    } else {
        raw as usize
    }
}

/// Round `value` up to a multiple of the power-of-two `align`.
#[inline]
#[must_use]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// An owned anonymous mapping. Unmapped on drop.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    protection: Protection,
}

// SAFETY: the mapping is exclusively owned; nothing about it is tied to the
// thread that created it.
unsafe impl Send for Mapping {}

impl Mapping {
    /// Map `len` bytes (rounded up to the page size) with `protection`.
    pub fn new(len: usize, protection: Protection) -> Result<Self> {
        if len == 0 {
            return Err(KnightError::Exhausted { size: 0 });
        }
        let page = page_size();
        let len = len
            .checked_add(page - 1)
            .map(|l| l & !(page - 1))
            .ok_or(KnightError::Exhausted { size: len })?;

        // SAFETY: anonymous private mapping with a non-zero, page-rounded
        // length; the kernel picks the address.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                protection.bits(),
                protection.map_flags(),
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(KnightError::map_failed(len));
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| KnightError::map_failed(len))?;
        Ok(Self {
            ptr,
            len,
            protection,
        })
    }

    /// Map `len` bytes of code memory.
    ///
    /// The range is mapped read/write and then switched to read/write/execute
    /// with `mprotect`. macOS only hands out JIT memory through `MAP_JIT`, so
    /// there the rights are requested at map time.
    pub fn executable(len: usize) -> Result<Self> {
        if cfg!(target_os = "macos") {
            return Self::new(len, Protection::ReadWriteExecute);
        }
        let mut mapping = Self::new(len, Protection::ReadWrite)?;
        mapping.protect(Protection::ReadWriteExecute)?;
        Ok(mapping)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Returns true if `addr` falls inside the mapping.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }

    /// Change the protection of the whole mapping.
    pub fn protect(&mut self, protection: Protection) -> Result<()> {
        // SAFETY: the range is exactly the one returned by mmap.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.len,
                protection.bits(),
            )
        };
        if rc != 0 {
            return Err(KnightError::protect_failed(self.len));
        }
        self.protection = protection;
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len) };
        debug_assert_eq!(rc, 0, "munmap failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn granularity_override_rounds_to_pages() {
        let info = MemoryInfo::query();
        assert_eq!(info.pages_per_block(), 1);

        let batched = info.with_granularity(info.page_size * 4 + 1);
        assert_eq!(batched.granularity, info.page_size * 5);
        assert_eq!(batched.pages_per_block(), 5);

        let tiny = info.with_granularity(1);
        assert_eq!(tiny.granularity, info.page_size);
    }

    #[test]
    fn normalized_repairs_degenerate_geometry() {
        let os = page_size();
        let fixed = MemoryInfo {
            page_size: 0,
            granularity: 0,
        }
        .normalized();
        assert_eq!(fixed.page_size, os);
        assert_eq!(fixed.granularity, os);

        let odd = MemoryInfo {
            page_size: 4096,
            granularity: 4096 * 3 + 7,
        }
        .normalized();
        assert_eq!(odd.granularity, 4096 * 4);

        let sane = MemoryInfo::query();
        assert_eq!(sane.normalized(), sane);
    }

    #[test]
    fn round_up_behaviour() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 8), 24);
    }

    #[test]
    fn mapping_is_page_rounded_and_writable() {
        let map = Mapping::new(10, Protection::ReadWrite).expect("mmap");
        assert_eq!(map.len(), page_size());
        assert_eq!(map.as_ptr() as usize % page_size(), 0);
        assert!(map.contains(map.as_ptr() as usize));
        assert!(!map.contains(map.as_ptr() as usize + map.len()));

        // SAFETY: the mapping is live and at least 10 bytes long.
        unsafe {
            map.as_ptr().write_bytes(0xAB, 10);
            assert_eq!(*map.as_ptr().add(9), 0xAB);
        }
    }

    #[test]
    fn zero_length_mapping_is_rejected() {
        assert!(matches!(
            Mapping::new(0, Protection::ReadWrite),
            Err(KnightError::Exhausted { size: 0 })
        ));
    }

    #[test]
    fn protection_bits() {
        assert!(!Protection::ReadWrite.is_executable());
        assert!(Protection::ReadWriteExecute.is_executable());
        assert_eq!(
            Protection::ReadWriteExecute.bits() & libc::PROT_EXEC,
            libc::PROT_EXEC
        );
    }

    #[test]
    fn protect_switches_rights() {
        let mut map = Mapping::new(1, Protection::ReadWrite).expect("mmap");
        map.protect(Protection::ReadWriteExecute).expect("mprotect");
        assert_eq!(map.protection(), Protection::ReadWriteExecute);
    }

    #[test]
    fn executable_mapping_ends_up_rwx_and_writable() {
        let map = Mapping::executable(100).expect("code mapping");
        assert_eq!(map.protection(), Protection::ReadWriteExecute);
        assert_eq!(map.len(), page_size());
        // SAFETY: the mapping is live, writable and at least 100 bytes long.
        unsafe {
            map.as_ptr().write_bytes(0xC3, 100);
            assert_eq!(*map.as_ptr().add(99), 0xC3);
        }
    }

    #[test]
    fn zero_length_code_mapping_is_rejected() {
        assert!(matches!(
            Mapping::executable(0),
            Err(KnightError::Exhausted { size: 0 })
        ));
    }
}

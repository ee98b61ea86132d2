//! Chained hash table with a pluggable node allocator.
//!
//! Buckets are a power-of-two array indexed by Fibonacci hashing: the 32-bit
//! key hash is multiplied by `0x9E3779B9` and the top `bits` bits select the
//! bucket. The table doubles once it holds 90% as many entries as buckets and
//! never shrinks.
//!
//! Nodes come from a [`NodeAllocator`]. Removed nodes can be retained on a
//! private free list instead of being returned, which pays off when the
//! backing allocator cannot free individually (a lump arena).
//!
//! Keys and values are stored inline and dropped with the node. To store a
//! key by reference and compare it by identity, wrap it in [`ByRef`].

#![allow(unsafe_code)]

use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::error::Result;
use crate::lifecycle::{LifecycleLevel, LifecycleLog};
use crate::node_alloc::{NodeAllocator, SystemAllocator};

/// Smallest bucket exponent accepted at construction.
pub const MIN_BITS: u32 = 4;
/// Largest bucket exponent accepted at construction.
pub const MAX_BITS: u32 = 26;
/// Growth stops here; past it chains simply get longer.
pub const GROWTH_LIMIT_BITS: u32 = 30;

const FIBONACCI: u32 = 0x9E37_79B9;

/// Key hash function.
pub type HashFn<K> = fn(&K) -> u32;
/// Key comparator, consulted before `PartialEq`.
pub type CompareFn<K> = fn(&K, &K) -> bool;

type Link<K, V> = Option<NonNull<HashNode<K, V>>>;

struct HashNode<K, V> {
    next: Link<K, V>,
    key_hash: u32,
    key: K,
    value: V,
}

/// Bucket index of `hash` for a table of `2^(32 - shift)` buckets.
#[inline]
#[must_use]
pub const fn bucket_index(hash: u32, shift: u32) -> usize {
    (hash.wrapping_mul(FIBONACCI) >> shift) as usize
}

/// Entry count at which a table of `buckets` buckets grows.
#[inline]
#[must_use]
pub const fn grow_limit(buckets: usize) -> usize {
    buckets * 9 / 10
}

// ---------------------------------------------------------------------------
// Stock key helpers
// ---------------------------------------------------------------------------

/// Rotate-left-by-4 xor hash over the bytes of a string.
#[must_use]
pub fn hash_str<S: AsRef<str> + ?Sized>(key: &S) -> u32 {
    key.as_ref()
        .bytes()
        .fold(0u32, |h, b| h.rotate_left(4) ^ u32::from(b))
}

/// String equality, for use as a [`CompareFn`].
#[must_use]
pub fn strings_equal<S: AsRef<str> + ?Sized>(a: &S, b: &S) -> bool {
    a.as_ref() == b.as_ref()
}

/// A key stored by reference and compared by address.
pub struct ByRef<'a, T: ?Sized>(pub &'a T);

impl<T: ?Sized> ByRef<'_, T> {
    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        (self.0 as *const T).cast::<()>() as usize
    }
}

impl<T: ?Sized> Clone for ByRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for ByRef<'_, T> {}

impl<T: ?Sized> PartialEq for ByRef<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized> Eq for ByRef<'_, T> {}

impl<T: ?Sized> fmt::Debug for ByRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByRef({:#x})", self.addr())
    }
}

/// Address hash for [`ByRef`] keys.
#[must_use]
pub fn hash_address<T: ?Sized>(key: &ByRef<'_, T>) -> u32 {
    let addr = key.addr() as u64;
    (addr ^ (addr >> 32)) as u32
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Chained hash table. See the module docs.
pub struct HashTable<K, V, A: NodeAllocator = SystemAllocator> {
    buckets: Box<[Link<K, V>]>,
    bits: u32,
    shift: u32,
    len: usize,
    grow_limit: usize,
    hash: HashFn<K>,
    compare: Option<CompareFn<K>>,
    alloc: A,
    /// Retained nodes; only `next` is initialized.
    free_list: Link<K, V>,
    retained: usize,
    keep_free_list: bool,
    lifecycle: LifecycleLog,
    _owns: PhantomData<HashNode<K, V>>,
}

// SAFETY: the table exclusively owns its nodes; sending it sends the keys,
// values and allocator along with it.
unsafe impl<K: Send, V: Send, A: NodeAllocator + Send> Send for HashTable<K, V, A> {}

impl<K, V> HashTable<K, V, SystemAllocator> {
    /// Heap-backed table with `2^bits` buckets (`bits` clamped to `[4, 26]`).
    #[must_use]
    pub fn new(bits: u32, hash: HashFn<K>) -> Self {
        Self::with_allocator(bits, hash, SystemAllocator, false)
    }
}

impl<K, V, A: NodeAllocator> HashTable<K, V, A> {
    /// Table whose nodes come from `alloc`. With `keep_free_list`, removed
    /// nodes are kept for reuse instead of being handed back.
    #[must_use]
    pub fn with_allocator(bits: u32, hash: HashFn<K>, alloc: A, keep_free_list: bool) -> Self {
        let bits = bits.clamp(MIN_BITS, MAX_BITS);
        let buckets = 1usize << bits;
        Self {
            buckets: vec![None; buckets].into_boxed_slice(),
            bits,
            shift: 32 - bits,
            len: 0,
            grow_limit: grow_limit(buckets),
            hash,
            compare: None,
            alloc,
            free_list: None,
            retained: 0,
            keep_free_list,
            lifecycle: LifecycleLog::new("hash_table", false),
            _owns: PhantomData,
        }
    }

    /// Use `compare` before falling back to `PartialEq`.
    #[must_use]
    pub fn with_comparator(mut self, compare: CompareFn<K>) -> Self {
        self.compare = Some(compare);
        self
    }

    #[must_use]
    pub fn with_lifecycle_log(mut self, enabled: bool) -> Self {
        self.lifecycle.set_enabled(enabled);
        self
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

    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Nodes parked on the free list.
    #[must_use]
    pub fn retained_nodes(&self) -> usize {
        self.retained
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.lifecycle
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        bucket_index(hash, self.shift)
    }

    /// Take a node from the free list or the allocator.
    fn obtain_node(&mut self) -> Result<NonNull<HashNode<K, V>>> {
        if let Some(node) = self.free_list {
            // SAFETY: retained nodes keep a valid `next` field.
            self.free_list = unsafe { ptr::addr_of!((*node.as_ptr()).next).read() };
            self.retained -= 1;
            return Ok(node);
        }
        let raw = self.alloc.alloc(Layout::new::<HashNode<K, V>>())?;
        Ok(raw.cast())
    }

    /// Recycle or free a node whose key and value are already gone.
    ///
    /// # Safety
    /// `node` must come from `obtain_node` and be unlinked from every bucket.
    unsafe fn release_node(&mut self, node: NonNull<HashNode<K, V>>) {
        if self.keep_free_list {
            // SAFETY: writing only the `next` field of owned node memory.
            unsafe { ptr::addr_of_mut!((*node.as_ptr()).next).write(self.free_list) };
            self.free_list = Some(node);
            self.retained += 1;
        } else {
            // SAFETY: allocated by `self.alloc` with this layout.
            unsafe {
                self.alloc
                    .dealloc(node.cast(), Layout::new::<HashNode<K, V>>());
            }
        }
    }

    /// Double the bucket array and relink every node.
    fn grow(&mut self) {
        if self.bits >= GROWTH_LIMIT_BITS {
            return;
        }
        let old_buckets = self.buckets.len();
        self.bits += 1;
        self.shift = 32 - self.bits;
        let buckets = 1usize << self.bits;
        self.grow_limit = grow_limit(buckets);

        let old = std::mem::replace(&mut self.buckets, vec![None; buckets].into_boxed_slice());
        for mut cursor in old.iter().copied() {
            while let Some(node) = cursor {
                // SAFETY: every linked node is live and owned by the table.
                unsafe {
                    let node_ref = &mut *node.as_ptr();
                    cursor = node_ref.next;
                    let index = bucket_index(node_ref.key_hash, self.shift);
                    node_ref.next = self.buckets[index];
                    self.buckets[index] = Some(node);
                }
            }
        }

        let len = self.len;
        self.lifecycle.record(
            LifecycleLevel::Debug,
            "grow",
            None,
            Some(buckets),
            "ok",
            || format!("old_buckets={old_buckets};entries={len}"),
        );
    }

    /// Drop every node's key and value and release the node.
    fn destroy_nodes(&mut self) {
        for index in 0..self.buckets.len() {
            let mut cursor = self.buckets[index].take();
            while let Some(node) = cursor {
                // SAFETY: the chain was detached above, each node is visited
                // once, and its fields are dropped before it is released.
                unsafe {
                    cursor = (*node.as_ptr()).next;
                    ptr::drop_in_place(node.as_ptr());
                    self.release_node(node);
                }
            }
        }
        self.len = 0;
    }

    /// Remove every entry. The bucket count is kept.
    pub fn clear(&mut self) {
        self.destroy_nodes();
    }

    /// Iterate over all entries in bucket order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            buckets: &self.buckets,
            bucket: 0,
            node: None,
            remaining: self.len,
        }
    }
}

impl<K: PartialEq, V, A: NodeAllocator> HashTable<K, V, A> {
    #[inline]
    fn matches(&self, node: &HashNode<K, V>, hash: u32, key: &K) -> bool {
        node.key_hash == hash
            && (self.compare.is_some_and(|cmp| cmp(&node.key, key)) || node.key == *key)
    }

    fn find_node(&self, hash: u32, key: &K) -> Link<K, V> {
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(node) = cursor {
            // SAFETY: linked nodes are live for as long as `self` is borrowed.
            let node_ref = unsafe { node.as_ref() };
            if self.matches(node_ref, hash, key) {
                return Some(node);
            }
            cursor = node_ref.next;
        }
        None
    }

    /// Insert or update. Returns the previous value if the key was present;
    /// in that case the stored key is kept and `key` is dropped.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let hash = (self.hash)(&key);
        if let Some(node) = self.find_node(hash, &key) {
            // SAFETY: node is live and uniquely reachable through `&mut self`.
            let slot = unsafe { &mut (*node.as_ptr()).value };
            return Ok(Some(std::mem::replace(slot, value)));
        }

        if self.len >= self.grow_limit {
            self.grow();
        }

        let node = self.obtain_node()?;
        let index = self.bucket_of(hash);
        // SAFETY: node is suitably sized and aligned, and uninitialized.
        unsafe {
            node.as_ptr().write(HashNode {
                next: self.buckets[index],
                key_hash: hash,
                key,
                value,
            });
        }
        self.buckets[index] = Some(node);
        self.len += 1;
        Ok(None)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = (self.hash)(key);
        let index = self.bucket_of(hash);

        let mut prev: Link<K, V> = None;
        let mut cursor = self.buckets[index];
        while let Some(node) = cursor {
            // SAFETY: linked nodes are live.
            let node_ref = unsafe { node.as_ref() };
            let next = node_ref.next;
            if self.matches(node_ref, hash, key) {
                match prev {
                    // SAFETY: prev is a live node in the same chain.
                    Some(prev) => unsafe { (*prev.as_ptr()).next = next },
                    None => self.buckets[index] = next,
                }
                self.len -= 1;
                // SAFETY: node is unlinked; moving the fields out leaves raw
                // memory that release_node recycles or frees.
                unsafe {
                    let HashNode { key, value, .. } = node.as_ptr().read();
                    drop(key);
                    self.release_node(node);
                    return Some(value);
                }
            }
            prev = Some(node);
            cursor = next;
        }
        None
    }

    #[must_use]
    pub fn find(&self, key: &K) -> Option<&V> {
        let node = self.find_node((self.hash)(key), key)?;
        // SAFETY: the node outlives the shared borrow of `self`.
        Some(unsafe { &(*node.as_ptr()).value })
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        let node = self.find_node((self.hash)(key), key)?;
        // SAFETY: the node outlives the exclusive borrow of `self`.
        Some(unsafe { &mut (*node.as_ptr()).value })
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }
}

impl<K, V, A: NodeAllocator> Drop for HashTable<K, V, A> {
    fn drop(&mut self) {
        self.keep_free_list = false;
        self.destroy_nodes();
        while let Some(node) = self.free_list {
            // SAFETY: retained nodes hold only a valid `next`, and were
            // allocated by `self.alloc`.
            unsafe {
                self.free_list = ptr::addr_of!((*node.as_ptr()).next).read();
                self.release_node(node);
            }
        }
        self.retained = 0;
    }
}

impl<K: fmt::Debug, V: fmt::Debug, A: NodeAllocator> fmt::Debug for HashTable<K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over `(&K, &V)` pairs.
pub struct Iter<'a, K, V> {
    buckets: &'a [Link<K, V>],
    bucket: usize,
    node: Link<K, V>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.node {
                // SAFETY: nodes stay live while the table is borrowed.
                let node_ref: &'a HashNode<K, V> = unsafe { &*node.as_ptr() };
                self.node = node_ref.next;
                self.remaining -= 1;
                return Some((&node_ref.key, &node_ref.value));
            }
            if self.bucket >= self.buckets.len() {
                return None;
            }
            self.node = self.buckets[self.bucket];
            self.bucket += 1;
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lump::LumpAllocator;
    use std::cell::Cell;
    use std::rc::Rc;

    fn string_table(bits: u32) -> HashTable<String, usize> {
        HashTable::new(bits, hash_str)
    }

    #[test]
    fn bits_are_clamped() {
        assert_eq!(string_table(0).bucket_count(), 16);
        assert_eq!(string_table(3).bits(), MIN_BITS);
        assert_eq!(string_table(10).bucket_count(), 1024);
        let table: HashTable<u32, u32> = HashTable::new(40, |k| *k);
        assert_eq!(table.bits(), MAX_BITS);
    }

    #[test]
    fn fibonacci_bucket_uses_top_bits() {
        // shift 28 keeps the top four bits of the scrambled hash.
        assert_eq!(bucket_index(0, 28), 0);
        assert_eq!(bucket_index(1, 28), (0x9E37_79B9u32 >> 28) as usize);
        for hash in [1u32, 7, 0xFFFF_FFFF, 0x1234_5678] {
            assert!(bucket_index(hash, 28) < 16);
        }
    }

    #[test]
    fn string_hash_matches_rotate_xor() {
        assert_eq!(hash_str(""), 0);
        assert_eq!(hash_str("a"), 0x61);
        assert_eq!(hash_str("ab"), (0x61u32 << 4) ^ 0x62);
        assert_eq!(hash_str("abc"), hash_str(&"abc".to_string()));
        assert!(strings_equal("x", "x"));
        assert!(!strings_equal("x", "y"));
    }

    #[test]
    fn insert_find_remove() {
        let mut table = string_table(4);
        assert_eq!(table.insert("one".into(), 1).expect("insert"), None);
        assert_eq!(table.insert("two".into(), 2).expect("insert"), None);
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(&"one".into()), Some(&1));
        assert!(table.contains_key(&"two".into()));
        assert_eq!(table.find(&"three".into()), None);

        assert_eq!(table.remove(&"one".into()), Some(1));
        assert_eq!(table.remove(&"one".into()), None);
        assert_eq!(table.len(), 1);
        assert!(!table.contains_key(&"one".into()));
    }

    #[test]
    fn upsert_replaces_value() {
        let mut table = string_table(4);
        table.insert("k".into(), 1).expect("insert");
        assert_eq!(table.insert("k".into(), 2).expect("insert"), Some(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&"k".into()), Some(&2));

        *table.find_mut(&"k".into()).expect("present") += 40;
        assert_eq!(table.find(&"k".into()), Some(&42));
    }

    #[test]
    fn fifteenth_insert_doubles_sixteen_buckets() {
        let mut table = string_table(4);
        for i in 0..14 {
            table.insert(format!("key{i}"), i).expect("insert");
        }
        assert_eq!(table.bucket_count(), 16);
        table.insert("key14".into(), 14).expect("insert");
        assert_eq!(table.bucket_count(), 32);
        for i in 0..15 {
            assert_eq!(table.find(&format!("key{i}")), Some(&i));
        }
    }

    #[test]
    fn colliding_hashes_chain() {
        let mut table: HashTable<u32, &str> = HashTable::new(4, |_| 7);
        table.insert(1, "a").expect("insert");
        table.insert(2, "b").expect("insert");
        table.insert(3, "c").expect("insert");
        assert_eq!(table.find(&2), Some(&"b"));
        assert_eq!(table.remove(&2), Some("b"));
        assert_eq!(table.find(&1), Some(&"a"));
        assert_eq!(table.find(&3), Some(&"c"));
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn clear_keeps_bucket_count() {
        let mut table = string_table(4);
        for i in 0..40 {
            table.insert(format!("k{i}"), i).expect("insert");
        }
        let buckets = table.bucket_count();
        assert!(buckets > 16);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.bucket_count(), buckets);
        assert_eq!(table.find(&"k1".into()), None);
        table.insert("again".into(), 1).expect("insert");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn retained_nodes_are_reused() {
        let mut table: HashTable<u64, u64> =
            HashTable::with_allocator(4, |k| *k as u32, SystemAllocator, true);
        for i in 0..5 {
            table.insert(i, i * 10).expect("insert");
        }
        table.remove(&1);
        table.remove(&2);
        assert_eq!(table.retained_nodes(), 2);
        table.insert(100, 1).expect("insert");
        assert_eq!(table.retained_nodes(), 1);
        table.clear();
        assert_eq!(table.retained_nodes(), 5);
        assert!(table.is_empty());
    }

    #[test]
    fn by_ref_keys_compare_by_identity() {
        let a = String::from("same");
        let b = String::from("same");
        let mut table: HashTable<ByRef<'_, String>, u8> = HashTable::new(4, hash_address);
        table.insert(ByRef(&a), 1).expect("insert");
        table.insert(ByRef(&b), 2).expect("insert");
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(&ByRef(&a)), Some(&1));
        assert_eq!(table.find(&ByRef(&b)), Some(&2));
        assert_eq!(ByRef(&a), ByRef(&a));
        assert_ne!(ByRef(&a), ByRef(&b));
    }

    #[test]
    fn comparator_is_consulted_first() {
        fn fold_case(s: &String) -> u32 {
            hash_str(&s.to_ascii_lowercase())
        }
        fn eq_ignore_case(a: &String, b: &String) -> bool {
            a.eq_ignore_ascii_case(b)
        }
        let mut table: HashTable<String, u8> =
            HashTable::new(4, fold_case).with_comparator(eq_ignore_case);
        table.insert("Hello".into(), 1).expect("insert");
        assert_eq!(table.insert("HELLO".into(), 2).expect("insert"), Some(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&"hello".into()), Some(&2));
    }

    #[test]
    fn values_are_dropped_exactly_once() {
        struct Tracked(Rc<Cell<usize>>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        {
            let mut table: HashTable<u32, Tracked> =
                HashTable::with_allocator(4, |k| *k, SystemAllocator, true);
            for i in 0..20 {
                table.insert(i, Tracked(drops.clone())).expect("insert");
            }
            // Replacing hands the old value back; dropping it counts.
            drop(table.insert(3, Tracked(drops.clone())).expect("insert"));
            assert_eq!(drops.get(), 1);
            drop(table.remove(&4));
            assert_eq!(drops.get(), 2);
            table.clear();
            assert_eq!(drops.get(), 21);
            for i in 0..3 {
                table.insert(i, Tracked(drops.clone())).expect("insert");
            }
        }
        assert_eq!(drops.get(), 24);
    }

    #[test]
    fn lump_backed_table() {
        let mut lump = LumpAllocator::new();
        {
            let mut table: HashTable<u64, u64, &mut LumpAllocator> =
                HashTable::with_allocator(4, |k| *k as u32, &mut lump, true);
            for i in 0..100 {
                table.insert(i, i + 1).expect("insert");
            }
            for i in 0..100 {
                assert_eq!(table.find(&i), Some(&(i + 1)));
            }
            assert!(table.allocator().region_count() >= 1);
        }
        lump.reset();
        assert_eq!(lump.unusable_regions(), 0);
    }

    #[test]
    fn iter_visits_everything() {
        let mut table = string_table(4);
        for i in 0..30 {
            table.insert(format!("v{i}"), i).expect("insert");
        }
        let mut seen: Vec<usize> = table.iter().map(|(_, v)| *v).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
        assert_eq!(table.iter().size_hint(), (30, Some(30)));
        assert!(format!("{table:?}").contains("\"v7\": 7"));
    }

    #[test]
    fn lifecycle_records_growth() {
        let mut table = string_table(4).with_lifecycle_log(true);
        for i in 0..15 {
            table.insert(format!("g{i}"), i).expect("insert");
        }
        let grow = table.lifecycle_log().events("grow").next().expect("grow");
        assert_eq!(grow.size, Some(32));
        assert_eq!(grow.details, "old_buckets=16;entries=14");
    }
}

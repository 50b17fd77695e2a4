//! An index over the code allocations in the system.
//!
//! [`CodeMap`] answers one question: given an arbitrary machine address
//! (typically a return address captured while walking a stack), which code
//! allocation contains it? Lookups are approximately O(log n), sometimes
//! worse right after the collector has moved things around.
//!
//! The index holds *weak* references to the code allocations: the collector
//! reports reclamations through [`CodeMap::retire`] and relocations through
//! [`CodeMap::relocate`], so no explicit free operation exists. A sorted
//! order is maintained lazily; a [`RelocationWatch`] from the host tells a
//! lookup whether a previously established order can still be trusted.
//!
//! Note that the trailing metadata of a code allocation is considered part
//! of the allocation for containment purposes.

#![warn(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use keel_common::{CodeHost, RelocationWatch};

/// Sort key for base pointers: subtracting one wraps the null pointer to
/// the largest value, so reclaimed slots sort past every real address.
fn key(ptr: *const u8) -> usize {
    (ptr as usize).wrapping_sub(1)
}

struct Inner {
    /// The slot array. Live entries occupy `0..count`; entries may be null
    /// when the collector reclaimed them since the last compaction.
    table: Vec<*const u8>,
    count: usize,
    /// Reports whether any registered base address moved since the table
    /// was last sorted. Created lazily with the first entry.
    watch: Option<Box<dyn RelocationWatch>>,
    /// Whether `table[0..count]` was sorted the last time we looked. Even
    /// when set, the order may be stale; the watch is the arbiter.
    sorted: bool,
}

// The raw pointers in `table` are addresses to query the host about, never
// dereferenced by the index itself.
unsafe impl Send for Inner {}

/// A concurrent map from instruction pointers to code-allocation bases.
///
/// One process-wide lock serializes all access; see the module docs for the
/// relocation protocol.
pub struct CodeMap {
    host: Arc<dyn CodeHost>,
    inner: Mutex<Inner>,
}

impl CodeMap {
    /// Creates an empty index on top of `host`.
    pub fn new(host: Arc<dyn CodeHost>) -> CodeMap {
        CodeMap {
            host,
            inner: Mutex::new(Inner {
                table: Vec::new(),
                count: 0,
                watch: None,
                sorted: false,
            }),
        }
    }

    /// Registers the code allocation starting at `code`.
    ///
    /// Pointers the host does not recognize as code are rejected with a
    /// warning. Duplicate registrations are tolerated here and unified
    /// during the next sort.
    pub fn add(&self, code: *const u8) {
        if !self.host.is_code(code) {
            tracing::warn!(?code, "refusing to index a pointer that is not a code allocation");
            return;
        }

        let mut inner = self.inner.lock();
        self.ensure(&mut inner, 1);
        let at = inner.count;
        inner.table[at] = code;
        inner.count += 1;
        inner.sorted = false;
    }

    /// Finds the base of the code allocation containing `ptr`.
    ///
    /// Returns `None` when `ptr` lies outside every registered allocation.
    /// Never panics.
    pub fn find(&self, ptr: *const u8) -> Option<*const u8> {
        if !self.host.is_code(ptr) {
            return None;
        }

        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return None;
        }

        if inner.sorted {
            // The table could still be sorted; try a binary search first.
            let table = &inner.table[..inner.count];
            let at = table.partition_point(|&p| key(p) < key(ptr));
            if at < table.len() && self.contains(table[at], ptr) {
                return Some(table[at]);
            }
            if at > 0 && self.contains(table[at - 1], ptr) {
                return Some(table[at - 1]);
            }

            // If nothing moved since the sort, the miss is authoritative.
            if !inner.watch.as_ref().map_or(false, |w| w.moved()) {
                return None;
            }
        }

        self.sort_and_find(&mut inner, ptr)
    }

    /// Tells the index that the collector reclaimed the allocation at
    /// `base`. The slot is dropped during the next sort.
    pub fn retire(&self, base: *const u8) {
        let mut inner = self.inner.lock();
        let count = inner.count;
        for slot in inner.table[..count].iter_mut() {
            if *slot == base {
                *slot = std::ptr::null();
            }
        }
        inner.sorted = false;
    }

    /// Tells the index that the collector moved the allocation at `old` to
    /// `new`.
    pub fn relocate(&self, old: *const u8, new: *const u8) {
        let mut inner = self.inner.lock();
        let count = inner.count;
        for slot in inner.table[..count].iter_mut() {
            if *slot == old {
                *slot = new;
            }
        }
        inner.sorted = false;
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.table.clear();
        inner.count = 0;
        inner.watch = None;
        inner.sorted = false;
    }

    /// The number of slots currently in use, including slots the collector
    /// has nulled since the last compaction.
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    /// Whether the index holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, base: *const u8, ptr: *const u8) -> bool {
        if base.is_null() {
            return false;
        }
        let start = base as usize;
        let end = start + self.host.code_size(base);
        (start..end).contains(&(ptr as usize))
    }

    /// Makes room for `extra` more entries, compacting and re-registering
    /// live entries with the watch while data is being copied anyway.
    fn ensure(&self, inner: &mut Inner, extra: usize) {
        let needed = inner.count + extra;
        if needed <= inner.table.len() && inner.watch.is_some() {
            return;
        }

        if inner.watch.is_none() {
            inner.watch = Some(self.host.create_watch());
        }

        if needed > inner.table.len() {
            let grown = (inner.table.len() * 2).max(needed).max(16);
            inner.table.resize(grown, std::ptr::null());
            Self::compact(inner);
        }
    }

    /// Sorts `table[0..count]` with heapsort while looking for `ptr`.
    ///
    /// Heapsort is used deliberately: it finds the containing allocation
    /// while sorting, it unifies duplicate registrations, and concurrent
    /// pointer rewrites cannot corrupt its structural invariants (they only
    /// leave the result unsorted, which the watch reports to the next
    /// lookup).
    fn sort_and_find(&self, inner: &mut Inner, ptr: *const u8) -> Option<*const u8> {
        tracing::trace!(entries = inner.count, "re-sorting the code index");

        let mut end = inner.count;
        {
            let table = &mut inner.table[..end];

            // Build a max-heap over the sort keys.
            for at in (0..end / 2).rev() {
                sift_down(table, at, end);
            }

            let mut prev: *const u8 = std::ptr::null();
            let mut found = None;

            while end > 0 {
                end -= 1;
                table.swap(0, end);
                sift_down(table, 0, end);

                let now = table[end];
                if now.is_null() {
                    continue;
                }

                if self.contains(now, ptr) {
                    found = Some(now);
                }

                // Adjacent equal pointers are double registrations; unify
                // them by nulling the later slot.
                if now == prev {
                    tracing::warn!(?now, "code allocation was registered twice");
                    table[end] = std::ptr::null();
                } else {
                    prev = now;
                }
            }

            inner.sorted = true;
            Self::compact(inner);

            found
        }
    }

    /// Drops null slots and re-registers the survivors with the watch.
    fn compact(inner: &mut Inner) {
        let watch = inner.watch.as_mut().expect("compacting without a watch");
        watch.clear();

        let mut kept = 0;
        for at in 0..inner.count {
            let entry = inner.table[at];
            if !entry.is_null() {
                inner.table[kept] = entry;
                watch.add(entry);
                kept += 1;
            }
        }
        for slot in inner.table[kept..inner.count].iter_mut() {
            *slot = std::ptr::null();
        }
        inner.count = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_last() {
        assert!(key(std::ptr::null()) > key(0x7fff_ffff_usize as *const u8));
        assert!(key(0x1000 as *const u8) < key(0x1001 as *const u8));
    }
}

fn sift_down(table: &mut [*const u8], mut at: usize, end: usize) {
    loop {
        let mut largest = at;
        let left = 2 * at + 1;
        let right = 2 * at + 2;
        if left < end && key(table[left]) > key(table[largest]) {
            largest = left;
        }
        if right < end && key(table[right]) > key(table[largest]) {
            largest = right;
        }
        if largest == at {
            return;
        }
        table.swap(at, largest);
        at = largest;
    }
}

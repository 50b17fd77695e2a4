//! Storage for the FDE records of JIT-compiled functions.
//!
//! The table keeps unwind records in a way that does not degrade collector
//! performance while still allowing fast lookup by program counter. It is a
//! set of chunks; each chunk holds one CIE and a fixed pool of FDE slots
//! plus a sorted index for binary searching. Chunks bear no relation to
//! each other, so a lookup scans all of them; the chunk capacity trades
//! scan length against wasted slots.
//!
//! FDEs never move once allocated (the collector rewrites the code pointer
//! *inside* a record, it does not move the record), so sorting happens on a
//! side array of slot indices. A relocation invalidates the chunk's sort;
//! the next lookup re-sorts, searching for its target while it does so.
//!
//! This is deliberately similar to the code-address index in
//! `keel-codemap`. It stays a separate structure because FDE records carry
//! a 32-bit relative CIE pointer, which forces records to live in one
//! allocation close to their CIE.

use std::alloc::{alloc_zeroed, Layout};
use std::ptr::{addr_of_mut, NonNull};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use keel_common::fatal;

use crate::raw::{Cie, CieInit, Fde, CHUNK_FDES};

/// One FDE slot: either free (linking to the next free slot by index) or
/// holding a live record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free(Option<u32>),
    Used,
}

#[repr(C)]
struct Entry {
    // First field, so an `*mut Fde` handed out to the unwinder is also a
    // pointer to its entry.
    fde: Fde,
    state: SlotState,
}

/// A single chunk: one CIE followed by a pool of FDE slots.
///
/// `#[repr(C)]` keeps `header` in front of `entries` so every FDE's 32-bit
/// relative CIE offset is positive and small.
#[repr(C)]
struct DwarfChunk {
    header: Cie,
    entries: [Entry; CHUNK_FDES],
    /// CIE initializer used for `header`; chunks are segregated by it.
    kind: CieInit,
    /// Head of the free list, an index into `entries`.
    first_free: Option<u32>,
    /// Slot indices ordered by `code_start`, valid while `sorted` holds.
    index: [u32; CHUNK_FDES],
    index_len: usize,
    /// Cleared whenever a slot is allocated, freed or relocated.
    sorted: bool,
    /// Number of re-sorts performed, for diagnostics.
    sorts: usize,
}

impl DwarfChunk {
    /// Allocates and initializes a chunk on the heap without staging the
    /// (large) value on the stack. Backing-memory failure is fatal.
    fn new(kind: CieInit) -> Box<DwarfChunk> {
        unsafe {
            let layout = Layout::new::<DwarfChunk>();
            let raw = alloc_zeroed(layout) as *mut DwarfChunk;
            if raw.is_null() {
                fatal!("out of memory allocating a {} byte unwind-table chunk", layout.size());
            }

            // All-zero bytes are valid for `header`, `entries[i].fde` and
            // `index`; the remaining fields are written explicitly.
            addr_of_mut!((*raw).kind).write(kind);
            addr_of_mut!((*raw).first_free).write(Some(0));
            addr_of_mut!((*raw).index_len).write(0);
            addr_of_mut!((*raw).sorted).write(false);
            addr_of_mut!((*raw).sorts).write(0);

            for at in 0..CHUNK_FDES {
                let next = if at + 1 < CHUNK_FDES {
                    Some(at as u32 + 1)
                } else {
                    None
                };
                addr_of_mut!((*raw).entries[at].state).write(SlotState::Free(next));
            }

            kind(&mut *addr_of_mut!((*raw).header));

            Box::from_raw(raw)
        }
    }

    fn alloc(&mut self, code: *const u8, code_size: usize) -> Option<NonNull<Fde>> {
        let at = self.first_free? as usize;
        let cie = &self.header as *const Cie;

        let entry = &mut self.entries[at];
        self.first_free = match entry.state {
            SlotState::Free(next) => next,
            SlotState::Used => fatal!("unwind-table free list is corrupt"),
        };
        entry.state = SlotState::Used;

        entry.fde = Fde {
            length: (std::mem::size_of::<Fde>() - std::mem::size_of::<u32>()) as u32,
            cie_offset: 0,
            data: [0; crate::raw::FDE_DATA],
        };
        entry.fde.set_cie(cie);
        entry.fde.set_code_start(code);
        entry.fde.set_code_size(code_size);
        entry.fde.set_aug_size(0);

        self.sorted = false;
        Some(NonNull::from(&mut entry.fde))
    }

    fn free(&mut self, at: usize) {
        let entry = &mut self.entries[at];
        if entry.state != SlotState::Used {
            fatal!("double free of an unwind record");
        }
        entry.fde = Fde {
            length: 0,
            cie_offset: 0,
            data: [0; crate::raw::FDE_DATA],
        };
        entry.state = SlotState::Free(self.first_free);
        self.first_free = Some(at as u32);
        self.sorted = false;
    }

    /// The slot index of `fde`, if it points into this chunk.
    fn slot_of(&self, fde: *const Fde) -> Option<usize> {
        let base = self.entries.as_ptr() as usize;
        let end = base + CHUNK_FDES * std::mem::size_of::<Entry>();
        let addr = fde as usize;
        if !(base..end).contains(&addr) {
            return None;
        }
        let offset = addr - base;
        if offset % std::mem::size_of::<Entry>() != 0 {
            return None;
        }
        Some(offset / std::mem::size_of::<Entry>())
    }

    /// Binary search over the sorted index. Only meaningful while `sorted`.
    fn search(&self, pc: *const u8) -> Option<NonNull<Fde>> {
        let index = &self.index[..self.index_len];
        let at = index.partition_point(|&slot| {
            (self.entries[slot as usize].fde.code_start() as usize) <= pc as usize
        });
        if at == 0 {
            return None;
        }
        let entry = &self.entries[index[at - 1] as usize];
        if entry.fde.contains(pc) {
            Some(NonNull::from(&entry.fde))
        } else {
            None
        }
    }

    /// Rebuilds the sorted index with heapsort, looking for `pc` while the
    /// elements stream past. Heapsort keeps its structural invariants even
    /// if code pointers are rewritten mid-sort; a rewrite merely leaves the
    /// order stale, which the cleared `sorted` flag reports to the next
    /// lookup.
    fn update(&mut self, pc: *const u8) -> Option<NonNull<Fde>> {
        self.index_len = 0;
        for at in 0..CHUNK_FDES {
            if self.entries[at].state == SlotState::Used {
                self.index[self.index_len] = at as u32;
                self.index_len += 1;
            }
        }

        let len = self.index_len;
        let key = |entries: &[Entry; CHUNK_FDES], slot: u32| {
            entries[slot as usize].fde.code_start() as usize
        };

        fn sift_down(
            index: &mut [u32],
            entries: &[Entry; CHUNK_FDES],
            key: impl Fn(&[Entry; CHUNK_FDES], u32) -> usize,
            mut at: usize,
            end: usize,
        ) {
            loop {
                let mut largest = at;
                for child in [2 * at + 1, 2 * at + 2] {
                    if child < end && key(entries, index[child]) > key(entries, index[largest]) {
                        largest = child;
                    }
                }
                if largest == at {
                    return;
                }
                index.swap(at, largest);
                at = largest;
            }
        }

        let mut found = None;
        {
            let (entries, index) = (&self.entries, &mut self.index);
            let index = &mut index[..len];

            for at in (0..len / 2).rev() {
                sift_down(index, entries, key, at, len);
            }

            let mut end = len;
            while end > 0 {
                end -= 1;
                index.swap(0, end);
                sift_down(index, entries, key, 0, end);

                let entry = &entries[index[end] as usize];
                if entry.fde.contains(pc) {
                    found = Some(NonNull::from(&entry.fde));
                }
            }
        }

        self.sorted = true;
        self.sorts += 1;
        tracing::trace!(entries = len, "re-sorted an unwind-table chunk");
        found
    }

    fn find(&mut self, pc: *const u8) -> Option<NonNull<Fde>> {
        if self.sorted {
            if let Some(found) = self.search(pc) {
                return Some(found);
            }
            // A failed search is authoritative unless a relocation raced
            // in; in that case fall through and sort again.
            if self.sorted {
                return None;
            }
        }
        self.update(pc)
    }
}

/// The process-wide store of unwind records for JIT code.
///
/// One instance exists per process (see [`DwarfTable::global`]) because the
/// platform's FDE-lookup hook is a singleton; separate instances only
/// appear in tests.
pub struct DwarfTable {
    chunks: Mutex<Vec<Box<DwarfChunk>>>,
}

impl DwarfTable {
    /// Creates an empty table.
    pub fn new() -> DwarfTable {
        DwarfTable {
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// The table consulted by the platform unwinder hook.
    pub fn global() -> &'static DwarfTable {
        static GLOBAL: Lazy<DwarfTable> = Lazy::new(DwarfTable::new);
        &GLOBAL
    }

    /// Allocates an FDE for the function occupying `code..code + code_size`.
    ///
    /// `init` identifies (and on chunk creation, writes) the CIE shared by
    /// the record's chunk. The returned pointer stays valid until
    /// [`DwarfTable::free`]; the record itself never moves.
    pub fn alloc(&self, code: *const u8, code_size: usize, init: CieInit) -> NonNull<Fde> {
        let mut chunks = self.chunks.lock();

        // Most recently created chunk of the right kind first.
        if let Some(chunk) = chunks.iter_mut().rev().find(|c| c.kind == init) {
            if let Some(fde) = chunk.alloc(code, code_size) {
                return fde;
            }
        }

        let mut chunk = DwarfChunk::new(init);
        let fde = chunk
            .alloc(code, code_size)
            .expect("a fresh chunk always has room");
        chunks.push(chunk);
        fde
    }

    /// Returns `fde` to its chunk's free list.
    pub fn free(&self, fde: NonNull<Fde>) {
        let mut chunks = self.chunks.lock();
        for chunk in chunks.iter_mut() {
            if let Some(slot) = chunk.slot_of(fde.as_ptr()) {
                chunk.free(slot);
                return;
            }
        }
        tracing::warn!(?fde, "freeing an unwind record that is not in the table");
    }

    /// Finds the FDE covering `pc`. Returns `None` when `pc` is not inside
    /// any registered function.
    pub fn find(&self, pc: *const u8) -> Option<NonNull<Fde>> {
        let mut chunks = self.chunks.lock();
        chunks.iter_mut().find_map(|chunk| chunk.find(pc))
    }

    /// Collector callback: the function behind `fde` moved to `code`.
    pub fn relocate(&self, fde: NonNull<Fde>, code: *const u8) {
        let mut chunks = self.chunks.lock();
        for chunk in chunks.iter_mut() {
            if let Some(slot) = chunk.slot_of(fde.as_ptr()) {
                chunk.entries[slot].fde.set_code_start(code);
                chunk.sorted = false;
                return;
            }
        }
        tracing::warn!(?fde, "relocating an unwind record that is not in the table");
    }

    /// The number of live records, counted the slow way.
    pub fn live(&self) -> usize {
        let chunks = self.chunks.lock();
        chunks
            .iter()
            .map(|c| {
                c.entries
                    .iter()
                    .filter(|e| e.state == SlotState::Used)
                    .count()
            })
            .sum()
    }
}

impl Default for DwarfTable {
    fn default() -> DwarfTable {
        DwarfTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cie(cie: &mut Cie) {
        cie.version = 1;
        cie.data[0] = b'z';
    }

    fn other_cie(cie: &mut Cie) {
        cie.version = 3;
    }

    fn ptr(addr: usize) -> *const u8 {
        addr as *const u8
    }

    #[test]
    fn alloc_fills_the_record() {
        let table = DwarfTable::new();
        let fde = table.alloc(ptr(0x4000), 0x100, test_cie);
        let fde = unsafe { fde.as_ref() };

        assert_eq!(fde.code_start(), ptr(0x4000));
        assert_eq!(fde.code_size(), 0x100);
        assert_eq!(fde.aug_size(), 0);
        let cie = unsafe { &*fde.cie() };
        assert_eq!(cie.version, 1);
        assert_eq!(cie.data[0], b'z');
        assert_eq!(cie.id, 0);
    }

    #[test]
    fn find_resorts_exactly_once() {
        let table = DwarfTable::new();
        table.alloc(ptr(0x0), 0x100, test_cie);
        table.alloc(ptr(0x200), 0x100, test_cie);
        table.alloc(ptr(0x100), 0x100, test_cie);

        let found = table.find(ptr(0x150)).expect("covered by the 0x100 record");
        assert_eq!(unsafe { found.as_ref() }.code_start(), ptr(0x100));
        assert_eq!(table.chunks.lock()[0].sorts, 1);

        // The established order is retained for further lookups.
        let found = table.find(ptr(0x150)).unwrap();
        assert_eq!(unsafe { found.as_ref() }.code_start(), ptr(0x100));
        let found = table.find(ptr(0x250)).unwrap();
        assert_eq!(unsafe { found.as_ref() }.code_start(), ptr(0x200));
        assert_eq!(table.find(ptr(0x300)), None);
        assert_eq!(table.chunks.lock()[0].sorts, 1);
    }

    #[test]
    fn alloc_free_liveness() {
        let table = DwarfTable::new();
        let mut live = Vec::new();

        for round in 0..3 {
            for at in 0..100 {
                let base = 0x1_0000 + (round * 100 + at) * 0x40;
                live.push((base, table.alloc(ptr(base), 0x40, test_cie)));
            }
            assert_eq!(table.live(), live.len());

            // Free every other record.
            let mut keep = Vec::new();
            for (at, (base, fde)) in live.drain(..).enumerate() {
                if at % 2 == 0 {
                    table.free(fde);
                } else {
                    keep.push((base, fde));
                }
            }
            live = keep;
            assert_eq!(table.live(), live.len());

            // Every surviving record still reports its own function.
            for &(base, fde) in &live {
                assert_eq!(unsafe { fde.as_ref() }.code_start(), ptr(base));
                let found = table.find(ptr(base + 0x20)).unwrap();
                assert_eq!(found, fde);
            }
        }
    }

    #[test]
    fn freed_records_are_not_found() {
        let table = DwarfTable::new();
        let a = table.alloc(ptr(0x1000), 0x80, test_cie);
        let b = table.alloc(ptr(0x2000), 0x80, test_cie);

        assert!(table.find(ptr(0x1040)).is_some());
        table.free(a);
        assert_eq!(table.find(ptr(0x1040)), None);
        assert_eq!(table.find(ptr(0x2040)), Some(b));

        // The slot is recycled.
        let c = table.alloc(ptr(0x3000), 0x80, test_cie);
        assert_eq!(a, c);
        assert_eq!(table.find(ptr(0x3040)), Some(c));
    }

    #[test]
    fn relocation_invalidates_the_sort() {
        let table = DwarfTable::new();
        let a = table.alloc(ptr(0x1000), 0x80, test_cie);
        table.alloc(ptr(0x2000), 0x80, test_cie);

        assert!(table.find(ptr(0x1040)).is_some());
        let sorts = table.chunks.lock()[0].sorts;

        table.relocate(a, ptr(0x4000));
        assert_eq!(table.find(ptr(0x1040)), None);
        assert_eq!(table.find(ptr(0x4040)), Some(a));
        assert!(table.chunks.lock()[0].sorts > sorts);
    }

    #[test]
    fn chunks_are_segregated_by_cie() {
        let table = DwarfTable::new();
        let a = table.alloc(ptr(0x1000), 0x80, test_cie);
        let b = table.alloc(ptr(0x2000), 0x80, other_cie);
        assert_eq!(table.chunks.lock().len(), 2);

        assert_eq!(unsafe { &*a.as_ref().cie() }.version, 1);
        assert_eq!(unsafe { &*b.as_ref().cie() }.version, 3);

        // Both chunks are searched.
        assert_eq!(table.find(ptr(0x1040)), Some(a));
        assert_eq!(table.find(ptr(0x2040)), Some(b));
    }

    #[test]
    fn chunk_overflow_creates_a_new_chunk() {
        let table = DwarfTable::new();
        for at in 0..CHUNK_FDES + 1 {
            table.alloc(ptr(0x10_0000 + at * 0x10), 0x10, test_cie);
        }
        assert_eq!(table.chunks.lock().len(), 2);
        assert_eq!(table.live(), CHUNK_FDES + 1);

        let last = 0x10_0000 + CHUNK_FDES * 0x10;
        let found = table.find(ptr(last + 0x8)).unwrap();
        assert_eq!(unsafe { found.as_ref() }.code_start(), ptr(last));
    }
}

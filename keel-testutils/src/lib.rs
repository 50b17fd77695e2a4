//! A simulated code host for tests.
//!
//! [`SimHeap`] stands in for the garbage collector: it hands out "code
//! allocations" (either real buffers or synthetic address ranges), can
//! relocate and reclaim them on demand, and implements the watch protocol
//! so the indices under test see the same invalidation signals a real
//! collector would produce.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use keel_common::{CodeHost, RelocationWatch};

#[derive(Default)]
struct SimState {
    /// Live blocks: base address -> length.
    blocks: BTreeMap<usize, usize>,
    /// Buffers backing real allocations, kept alive for the heap's lifetime.
    backing: Vec<Box<[u8]>>,
}

/// A simulated code heap.
///
/// Cloning shares the underlying state, so a clone can be handed to the
/// index under test while the original drives relocations.
#[derive(Clone, Default)]
pub struct SimHeap {
    state: Arc<Mutex<SimState>>,
    /// Bumped on every relocation; watches compare against it.
    epoch: Arc<AtomicU64>,
}

impl SimHeap {
    /// Creates an empty heap.
    pub fn new() -> SimHeap {
        SimHeap::default()
    }

    /// Allocates a real, readable code block of `len` bytes and returns its
    /// base address. The buffer stays alive as long as the heap.
    pub fn alloc(&self, len: usize) -> *const u8 {
        let mut state = self.state.lock();
        let buf = vec![0u8; len].into_boxed_slice();
        let base = buf.as_ptr();
        state.backing.push(buf);
        state.blocks.insert(base as usize, len);
        base
    }

    /// Registers a synthetic block at a literal address. The memory is not
    /// dereferenceable; useful for address-arithmetic tests.
    pub fn register(&self, base: usize, len: usize) {
        self.state.lock().blocks.insert(base, len);
    }

    /// Forgets the block at `base`, as a collection would.
    pub fn reclaim(&self, base: usize) {
        self.state.lock().blocks.remove(&base);
    }

    /// Moves the synthetic block at `old` to `new` and bumps the relocation
    /// epoch so outstanding watches report motion.
    pub fn relocate(&self, old: usize, new: usize) {
        let mut state = self.state.lock();
        if let Some(len) = state.blocks.remove(&old) {
            state.blocks.insert(new, len);
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// The length of the block at `base`, if one is registered.
    pub fn block_len(&self, base: usize) -> Option<usize> {
        self.state.lock().blocks.get(&base).copied()
    }
}

impl CodeHost for SimHeap {
    fn code_size(&self, code: *const u8) -> usize {
        self.block_len(code as usize).unwrap_or(0)
    }

    fn is_code(&self, ptr: *const u8) -> bool {
        let state = self.state.lock();
        let addr = ptr as usize;
        state
            .blocks
            .range(..=addr)
            .next_back()
            .map(|(&base, &len)| addr < base + len)
            .unwrap_or(false)
    }

    fn create_watch(&self) -> Box<dyn RelocationWatch> {
        Box::new(SimWatch {
            epoch: Arc::clone(&self.epoch),
            seen: self.epoch.load(Ordering::SeqCst),
        })
    }
}

/// Watch over a [`SimHeap`]: reports motion whenever the heap's relocation
/// epoch advanced since the last `clear`. Deliberately coarse; the watch
/// contract allows false positives.
struct SimWatch {
    epoch: Arc<AtomicU64>,
    seen: u64,
}

impl RelocationWatch for SimWatch {
    fn add(&mut self, _addr: *const u8) {}

    fn remove(&mut self, _addr: *const u8) {}

    fn clear(&mut self) {
        self.seen = self.epoch.load(Ordering::SeqCst);
    }

    fn moved(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) > self.seen
    }
}

/// A tiny deterministic xorshift generator for property-style tests.
pub struct XorShift(u64);

impl XorShift {
    /// Creates a generator from a non-zero seed.
    pub fn new(seed: u64) -> XorShift {
        XorShift(seed.max(1))
    }

    /// The next pseudo-random value.
    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// A pseudo-random value below `bound`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound.max(1)
    }
}

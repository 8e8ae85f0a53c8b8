//! Reference-counted backing buffers for zero-copy spans.
//!
//! Every byte chunk delivered by the socket layer is handed to a
//! [`BufArena`], which owns it until every message referencing it has
//! been destroyed. Strings built during parsing never copy out of
//! these buffers; they record a [`BufId`] plus offsets instead. The
//! arena can split an entry in two so a pipelined sibling message owns
//! the tail of a partially consumed chunk.
//!
//! Freed slots go back on a free list and are reused under a bumped
//! generation, so the slot table is bounded by the peak number of
//! simultaneously live buffers no matter how long the arena lives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

/// Default cap on live entries per arena; exceeding it is treated as
/// resource exhaustion by the lifecycle driver.
pub const DEFAULT_MAX_BUFFERS: usize = 4096;

/// Identifies one backing buffer within a [`BufArena`].
///
/// An id pairs a slot index with the slot's generation at allocation
/// time. Reclaiming a slot bumps its generation before reuse, so a
/// stale id keeps naming the dead buffer (and stops resolving) instead
/// of aliasing whatever moved into the slot later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufId {
    idx: u32,
    r#gen: u32,
}

impl BufId {
    /// Slot index inside the owning arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.idx as usize
    }
}

struct BufEntry {
    mem: Arc<[u8]>,
    /// Window into `mem`; split entries share the allocation.
    start: usize,
    len: usize,
    refs: AtomicU32,
}

impl BufEntry {
    fn slice(&self) -> &[u8] {
        &self.mem[self.start..self.start + self.len]
    }
}

struct Slot {
    /// Bumped every time the slot's entry is freed.
    r#gen: u32,
    entry: Option<BufEntry>,
}

/// Arena of reference-counted byte buffers backing zero-copy spans.
///
/// Structural changes (insert, split, reclaim) require `&mut self` and
/// belong to the single writer that owns the connection; refcount
/// traffic is atomic and may come from any thread holding a shared
/// reference.
pub struct BufArena {
    slots: Vec<Slot>,
    /// Vacant slot indices awaiting reuse.
    free: Vec<u32>,
    live: usize,
    max_entries: usize,
}

impl Default for BufArena {
    fn default() -> Self {
        Self::new()
    }
}

impl BufArena {
    /// Create an arena with the default entry cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERS)
    }

    /// Create an arena capped at `max_entries` live buffers.
    #[must_use]
    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_entries,
        }
    }

    /// Take ownership of a delivered chunk. Returns `None` when the
    /// entry cap is reached (resource exhaustion).
    pub fn insert(&mut self, data: impl Into<Arc<[u8]>>) -> Option<BufId> {
        let mem: Arc<[u8]> = data.into();
        let len = mem.len();
        self.insert_entry(mem, 0, len)
    }

    fn insert_entry(&mut self, mem: Arc<[u8]>, start: usize, len: usize) -> Option<BufId> {
        if self.live >= self.max_entries {
            return None;
        }
        let entry = BufEntry {
            mem,
            start,
            len,
            refs: AtomicU32::new(1),
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                debug_assert!(slot.entry.is_none(), "free list held a live slot");
                slot.entry = Some(entry);
                idx
            }
            None => {
                let idx = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    r#gen: 0,
                    entry: Some(entry),
                });
                idx
            }
        };
        self.live += 1;
        Some(BufId {
            idx,
            r#gen: self.slots[idx as usize].r#gen,
        })
    }

    /// Split the entry at `at`: the original keeps `[0, at)`, the new
    /// entry owns `[at, len)` with its own refcount of one. This is
    /// how a sibling message takes over the unconsumed tail of a
    /// chunk. Returns `None` on cap exhaustion.
    ///
    /// # Panics
    /// If `id` is released or `at` exceeds the entry length.
    pub fn split_off(&mut self, id: BufId, at: usize) -> Option<BufId> {
        let (mem, start, len) = {
            let entry = self.entry(id);
            assert!(at <= entry.len, "split offset {at} out of range");
            (Arc::clone(&entry.mem), entry.start, entry.len)
        };
        let tail = self.insert_entry(mem, start + at, len - at)?;
        if let Some(entry) = &mut self.slots[id.index()].entry {
            entry.len = at;
        }
        Some(tail)
    }

    /// Bytes of a live entry.
    ///
    /// # Panics
    /// If the entry was released.
    #[must_use]
    pub fn bytes(&self, id: BufId) -> &[u8] {
        self.entry(id).slice()
    }

    /// Bytes of an entry, `None` once released.
    #[must_use]
    pub fn get(&self, id: BufId) -> Option<&[u8]> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.r#gen == id.r#gen => slot.entry.as_ref().map(BufEntry::slice),
            _ => None,
        }
    }

    /// Length of a live entry in bytes.
    #[must_use]
    pub fn len(&self, id: BufId) -> usize {
        self.entry(id).len
    }

    /// True when no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of live entries.
    #[must_use]
    pub fn live_entries(&self) -> usize {
        self.live
    }

    /// Size of the slot table, counting vacant slots. Bounded by the
    /// peak number of simultaneously live entries.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Bump the refcount of an entry. Atomic; callable from any thread.
    pub fn retain(&self, id: BufId) {
        self.entry(id).refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference. The entry's memory is freed by the next
    /// [`Self::reclaim`] once the count reaches zero. Atomic.
    pub fn release(&self, id: BufId) {
        let prev = self.entry(id).refs.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "release of dead buffer {id:?}");
    }

    /// Current refcount, for diagnostics.
    #[must_use]
    pub fn refs(&self, id: BufId) -> u32 {
        self.entry(id).refs.load(Ordering::Acquire)
    }

    /// Free every entry whose refcount has dropped to zero and return
    /// its slot to the free list under a new generation. Ids handed
    /// out before the free keep naming the dead buffer. Returns the
    /// number of entries freed.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        for (idx, slot) in (0u32..).zip(self.slots.iter_mut()) {
            let dead = slot
                .entry
                .as_ref()
                .is_some_and(|e| e.refs.load(Ordering::Acquire) == 0);
            if dead {
                fence(Ordering::Acquire);
                slot.entry = None;
                slot.r#gen = slot.r#gen.wrapping_add(1);
                self.free.push(idx);
                freed += 1;
            }
        }
        self.live -= freed;
        freed
    }

    fn entry(&self, id: BufId) -> &BufEntry {
        match self.slots.get(id.index()) {
            Some(Slot {
                r#gen,
                entry: Some(entry),
            }) if *r#gen == id.r#gen => entry,
            _ => panic!("buffer {id:?} released or out of range"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_back() {
        let mut arena = BufArena::new();
        let id = arena.insert(b"hello".to_vec()).unwrap();
        assert_eq!(arena.bytes(id), b"hello");
        assert_eq!(arena.len(id), 5);
        assert_eq!(arena.refs(id), 1);
    }

    #[test]
    fn split_keeps_head_and_tail_independent() {
        let mut arena = BufArena::new();
        let head = arena.insert(b"GET /a\r\nGET /b\r\n".to_vec()).unwrap();
        let tail = arena.split_off(head, 8).unwrap();

        assert_eq!(arena.bytes(head), b"GET /a\r\n");
        assert_eq!(arena.bytes(tail), b"GET /b\r\n");

        // Releasing the head must not disturb the tail.
        arena.release(head);
        assert_eq!(arena.reclaim(), 1);
        assert_eq!(arena.bytes(tail), b"GET /b\r\n");
        assert!(arena.get(head).is_none());
    }

    #[test]
    fn reclaim_frees_only_zero_refcount_entries() {
        let mut arena = BufArena::new();
        let a = arena.insert(b"a".to_vec()).unwrap();
        let b = arena.insert(b"b".to_vec()).unwrap();

        arena.retain(a); // two refs on a
        arena.release(a); // back to one
        arena.release(b); // zero

        assert_eq!(arena.reclaim(), 1);
        assert!(arena.get(a).is_some());
        assert!(arena.get(b).is_none());
        assert_eq!(arena.live_entries(), 1);
    }

    #[test]
    fn freed_slot_is_reused_under_a_new_generation() {
        let mut arena = BufArena::new();
        let first = arena.insert(b"one".to_vec()).unwrap();
        arena.release(first);
        assert_eq!(arena.reclaim(), 1);

        let second = arena.insert(b"two".to_vec()).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.bytes(second), b"two");
    }

    #[test]
    fn slot_table_stays_bounded_across_churn() {
        let mut arena = BufArena::new();
        for n in 0..4096u32 {
            let id = arena.insert(n.to_be_bytes().to_vec()).unwrap();
            arena.release(id);
            assert_eq!(arena.reclaim(), 1);
            assert_eq!(arena.live_entries(), 0);
        }
        // One buffer live at a time needs exactly one slot.
        assert_eq!(arena.slot_count(), 1);
    }

    #[test]
    fn entry_cap_reports_exhaustion() {
        let mut arena = BufArena::with_limit(2);
        assert!(arena.insert(b"1".to_vec()).is_some());
        assert!(arena.insert(b"2".to_vec()).is_some());
        assert!(arena.insert(b"3".to_vec()).is_none());
    }

    #[test]
    fn split_counts_against_the_cap() {
        let mut arena = BufArena::with_limit(1);
        let id = arena.insert(b"ab".to_vec()).unwrap();
        assert!(arena.split_off(id, 1).is_none());
    }

    #[test]
    #[should_panic(expected = "released or out of range")]
    fn stale_id_panics() {
        let mut arena = BufArena::new();
        let id = arena.insert(b"x".to_vec()).unwrap();
        arena.release(id);
        arena.reclaim();
        let _ = arena.bytes(id);
    }
}

//! Storage for in-flight present records.
//!
//! A fixed-capacity ring of slots owns every live record; all lookup tables
//! map their key to a [`Handle`] into the ring. A handle resolves only while
//! the slot still holds the record it was created for, so entries left in
//! relation lists after an eviction are detectably stale rather than
//! dangling.
//!
//! Two eviction rules bound memory and keep the key space consistent:
//! inserting into an occupied slot displaces the previous occupant, and
//! installing a key that is already held displaces the previous holder. Both
//! displaced records are returned to the caller, which reports them lost.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::present::PresentRecord;

pub const RING_CAPACITY_DEFAULT: usize = 4096;

/// A validated reference to a live record: slot position plus the record id
/// that slot held when the handle was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: u32,
    id: u64,
}

pub struct RecordStore {
    slots: Vec<Option<PresentRecord>>,
    next_slot: usize,
    next_id: u64,

    /// Most recent in-flight present per originating thread.
    pub(crate) by_thread: HashMap<u32, Handle>,
    /// Per-process presents ordered by creation time.
    pub(crate) by_process: HashMap<u32, BTreeMap<u64, Handle>>,
    /// Present queue packets, keyed by submit sequence.
    pub(crate) by_submit_sequence: HashMap<u32, Handle>,
    /// Windowing identity: (composition surface, present count, bind id).
    pub(crate) by_composition_token: HashMap<(u64, u64, u64), Handle>,
    /// Kernel present-history token, tracked until the compositor hand-off.
    pub(crate) by_kernel_token: HashMap<u64, Handle>,
    /// Blit presents whose composed-vs-frontbuffer nature is still unknown,
    /// keyed by kernel context.
    pub(crate) by_blit_context: HashMap<u64, Handle>,
    /// Last present handed off to the compositor per window.
    pub(crate) by_window_last: HashMap<u64, Handle>,
    /// Legacy blit presents awaiting a compositor flip-chain notification.
    pub(crate) by_legacy_blit_token: HashMap<u64, Handle>,
    /// Presents the compositor's next own present will pick up.
    pub(crate) waiting_for_compositor: VecDeque<Handle>,
}

impl RecordStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RecordStore {
            slots: (0..capacity).map(|_| None).collect(),
            next_slot: 0,
            next_id: 1,
            by_thread: HashMap::new(),
            by_process: HashMap::new(),
            by_submit_sequence: HashMap::new(),
            by_composition_token: HashMap::new(),
            by_kernel_token: HashMap::new(),
            by_blit_context: HashMap::new(),
            by_window_last: HashMap::new(),
            by_legacy_blit_token: HashMap::new(),
            waiting_for_compositor: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, h: Handle) -> Option<&PresentRecord> {
        self.slots
            .get(h.slot as usize)?
            .as_ref()
            .filter(|rec| rec.id == h.id)
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut PresentRecord> {
        self.slots
            .get_mut(h.slot as usize)?
            .as_mut()
            .filter(|rec| rec.id == h.id)
    }

    /// Insert a new record at the next ring position. Returns its handle and
    /// the displaced occupant, if the slot was still in use.
    pub fn insert(&mut self, mut rec: PresentRecord) -> (Handle, Option<PresentRecord>) {
        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % self.slots.len();

        let evicted = if let Some(old) = &self.slots[slot] {
            let old_handle = Handle { slot: slot as u32, id: old.id };
            self.purge_indexes(old_handle, false);
            self.slots[slot].take()
        } else {
            None
        };

        let id = self.next_id;
        self.next_id += 1;
        rec.id = id;
        rec.ring_index = slot as u32;
        self.slots[slot] = Some(rec);
        (Handle { slot: slot as u32, id }, evicted)
    }

    /// Remove a record, dropping every index entry that refers to it.
    pub fn remove(&mut self, h: Handle) -> Option<PresentRecord> {
        self.get(h)?;
        self.purge_indexes(h, false);
        self.slots[h.slot as usize].take()
    }

    /// Enter the record into its process's creation-time order. A collision
    /// on the same timestamp displaces the previous holder, which is
    /// returned.
    pub fn index_process(&mut self, h: Handle) -> Option<PresentRecord> {
        let (pid, qpc) = {
            let rec = self.get(h)?;
            (rec.pid, rec.qpc_start)
        };
        match self.by_process.entry(pid).or_default().get(&qpc).copied() {
            Some(prev) if prev == h => None,
            Some(prev) => {
                let evicted = self.remove(prev);
                self.by_process.entry(pid).or_default().insert(qpc, h);
                evicted
            }
            None => {
                self.by_process.entry(pid).or_default().insert(qpc, h);
                None
            }
        }
    }

    /// Handles of every live record, oldest insertion first.
    pub fn live_handles(&self) -> Vec<Handle> {
        let cap = self.slots.len();
        (0..cap)
            .map(|i| (self.next_slot + i) % cap)
            .filter_map(|slot| {
                self.slots[slot]
                    .as_ref()
                    .map(|rec| Handle { slot: slot as u32, id: rec.id })
            })
            .collect()
    }

    /// Drop every index entry pointing at this record. The record's own key
    /// fields say where to look; the compositor wait queue and dependent
    /// lists are validated lazily on drain instead. `keep_thread` preserves
    /// the thread entry for records that still owe a runtime stop.
    pub(crate) fn purge_indexes(&mut self, h: Handle, keep_thread: bool) {
        let Some(rec) = self.get(h) else { return };
        let tid = rec.tid;
        let pid = rec.pid;
        let qpc = rec.qpc_start;
        let seq = rec.submit_sequence;
        let token = rec.token_ptr;
        let comp_key = (
            rec.composition_surface,
            rec.composition_present_count,
            rec.composition_bind_id,
        );
        let context = rec.kernel_context;
        let hwnd = rec.hwnd;
        let legacy = rec.legacy_blit_token;

        if !keep_thread && self.by_thread.get(&tid) == Some(&h) {
            self.by_thread.remove(&tid);
        }
        if let Some(order) = self.by_process.get_mut(&pid) {
            if order.get(&qpc) == Some(&h) {
                order.remove(&qpc);
            }
            if order.is_empty() {
                self.by_process.remove(&pid);
            }
        }
        if seq != 0 && self.by_submit_sequence.get(&seq) == Some(&h) {
            self.by_submit_sequence.remove(&seq);
        }
        if token != 0 && self.by_kernel_token.get(&token) == Some(&h) {
            self.by_kernel_token.remove(&token);
        }
        if comp_key != (0, 0, 0) && self.by_composition_token.get(&comp_key) == Some(&h) {
            self.by_composition_token.remove(&comp_key);
        }
        if context != 0 && self.by_blit_context.get(&context) == Some(&h) {
            self.by_blit_context.remove(&context);
        }
        if hwnd != 0 && self.by_window_last.get(&hwnd) == Some(&h) {
            self.by_window_last.remove(&hwnd);
        }
        if legacy != 0 && self.by_legacy_blit_token.get(&legacy) == Some(&h) {
            self.by_legacy_blit_token.remove(&legacy);
        }
    }
}

macro_rules! index_fn {
    ($(#[$doc:meta])* $name:ident, $map:ident, $key:ty) => {
        impl RecordStore {
            $(#[$doc])*
            /// Re-installing the key the record already holds is a no-op.
            /// A different previous holder is removed and returned so the
            /// caller can report it lost.
            pub fn $name(&mut self, key: $key, h: Handle) -> Option<PresentRecord> {
                match self.$map.get(&key).copied() {
                    Some(prev) if prev == h => None,
                    Some(prev) => {
                        let evicted = self.remove(prev);
                        self.$map.insert(key, h);
                        evicted
                    }
                    None => {
                        self.$map.insert(key, h);
                        None
                    }
                }
            }
        }
    };
}

index_fn!(
    /// Track the record as the thread's current in-flight present.
    index_thread, by_thread, u32
);
index_fn!(
    /// Index by queue-packet submit sequence.
    index_submit_sequence, by_submit_sequence, u32
);
index_fn!(
    /// Index by kernel present-history token.
    index_kernel_token, by_kernel_token, u64
);
index_fn!(
    /// Index by the windowing composition token triple.
    index_composition_token, by_composition_token, (u64, u64, u64)
);
index_fn!(
    /// Track an ambiguous blit by its kernel context.
    index_blit_context, by_blit_context, u64
);
index_fn!(
    /// Track the record as the window's last compositor hand-off.
    index_window_last, by_window_last, u64
);
index_fn!(
    /// Index by the legacy blit token the compositor reports back.
    index_legacy_blit_token, by_legacy_blit_token, u64
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHeader;

    fn record(qpc: u64, pid: u32, tid: u32) -> PresentRecord {
        PresentRecord::new(&EventHeader { qpc, pid, tid })
    }

    #[test]
    fn test_handle_validates_slot_reuse() {
        let mut store = RecordStore::new(1);
        let (h1, _) = store.insert(record(100, 10, 1));
        let (h2, evicted) = store.insert(record(200, 10, 2));
        assert!(evicted.is_some());
        assert_eq!(evicted.unwrap().qpc_start, 100);
        assert!(store.get(h1).is_none());
        assert_eq!(store.get(h2).unwrap().qpc_start, 200);
    }

    #[test]
    fn test_ring_eviction_count() {
        let mut store = RecordStore::new(4);
        let mut evicted = 0;
        for i in 0..10 {
            let (_, old) = store.insert(record(100 + i, 10, i as u32));
            if old.is_some() {
                evicted += 1;
            }
        }
        assert_eq!(evicted, 6);
        assert_eq!(store.live_count(), 4);
    }

    #[test]
    fn test_eviction_purges_indexes() {
        let mut store = RecordStore::new(1);
        let (h1, _) = store.insert(record(100, 10, 1));
        store.get_mut(h1).unwrap().submit_sequence = 7;
        store.index_thread(1, h1);
        store.index_submit_sequence(7, h1);
        store.index_process(h1);

        store.insert(record(200, 10, 2));
        assert!(store.by_thread.is_empty());
        assert!(store.by_submit_sequence.is_empty());
        assert!(store.by_process.is_empty());
    }

    #[test]
    fn test_key_replacement_evicts_prior_holder() {
        let mut store = RecordStore::new(8);
        let (h1, _) = store.insert(record(100, 10, 1));
        store.get_mut(h1).unwrap().submit_sequence = 7;
        store.index_submit_sequence(7, h1);

        let (h2, _) = store.insert(record(200, 10, 2));
        store.get_mut(h2).unwrap().submit_sequence = 7;
        let evicted = store.index_submit_sequence(7, h2);
        assert_eq!(evicted.unwrap().qpc_start, 100);
        assert!(store.get(h1).is_none());
        assert_eq!(store.by_submit_sequence.get(&7), Some(&h2));
    }

    #[test]
    fn test_reinstall_same_record_is_noop() {
        let mut store = RecordStore::new(8);
        let (h, _) = store.insert(record(100, 10, 1));
        store.get_mut(h).unwrap().submit_sequence = 7;
        assert!(store.index_submit_sequence(7, h).is_none());
        assert!(store.index_submit_sequence(7, h).is_none());
        assert!(store.get(h).is_some());
    }

    #[test]
    fn test_remove_purges_everything() {
        let mut store = RecordStore::new(8);
        let (h, _) = store.insert(record(100, 10, 1));
        {
            let rec = store.get_mut(h).unwrap();
            rec.submit_sequence = 9;
            rec.token_ptr = 0xBEEF;
            rec.hwnd = 0x77;
        }
        store.index_thread(1, h);
        store.index_process(h);
        store.index_submit_sequence(9, h);
        store.index_kernel_token(0xBEEF, h);
        store.index_window_last(0x77, h);

        let rec = store.remove(h).unwrap();
        assert_eq!(rec.qpc_start, 100);
        assert!(store.by_thread.is_empty());
        assert!(store.by_process.is_empty());
        assert!(store.by_submit_sequence.is_empty());
        assert!(store.by_kernel_token.is_empty());
        assert!(store.by_window_last.is_empty());
        assert!(store.get(h).is_none());
    }

    #[test]
    fn test_purge_can_keep_thread_entry() {
        let mut store = RecordStore::new(8);
        let (h, _) = store.insert(record(100, 10, 1));
        store.index_thread(1, h);
        store.index_process(h);
        store.purge_indexes(h, true);
        assert_eq!(store.by_thread.get(&1), Some(&h));
        assert!(store.by_process.is_empty());
    }

    #[test]
    fn test_live_handles_oldest_first() {
        let mut store = RecordStore::new(4);
        for i in 0..6u64 {
            store.insert(record(100 + i, 10, i as u32));
        }
        let qpcs: Vec<u64> = store
            .live_handles()
            .into_iter()
            .map(|h| store.get(h).unwrap().qpc_start)
            .collect();
        assert_eq!(qpcs, vec![102, 103, 104, 105]);
    }
}

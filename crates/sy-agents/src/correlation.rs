use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sy_core::types::SessionId;
use tokio::time::Instant;

/// An outstanding request, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub session_id: SessionId,
    pub seq: u64,
    pub submitted_at: Instant,
    pub deadline: Instant,
    /// Set when the owning session closes; the eventual reply is dropped.
    pub discard: bool,
}

/// Correlation table for one agent kind.
///
/// Ids come from a monotonically increasing counter and are never handed out
/// twice. Insertion goes through the entry API and retirement is a single
/// `remove`, so a reply, a timeout and a disconnect racing for the same id
/// resolve it exactly once between them.
pub struct CorrelationTable {
    next_id: AtomicU64,
    entries: DashMap<u64, PendingRequest>,
    outstanding: AtomicUsize,
    capacity: usize,
}

impl CorrelationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate an id and record the request under it. Returns `None` when
    /// the table is at capacity.
    pub fn reserve(&self, session_id: SessionId, seq: u64, deadline: Instant) -> Option<u64> {
        let claimed = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if claimed.is_err() {
            return None;
        }

        let request = PendingRequest {
            session_id,
            seq,
            submitted_at: Instant::now(),
            deadline,
            discard: false,
        };
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(request);
                return Some(id);
            }
        }
    }

    /// Retire `id`. Only the first caller gets the request back.
    pub fn resolve(&self, id: u64) -> Option<PendingRequest> {
        let (_, request) = self.entries.remove(&id)?;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        Some(request)
    }

    /// Flag every request of a session for discard-on-arrival.
    pub fn mark_discard(&self, session_id: SessionId) -> usize {
        let mut marked = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.session_id == session_id && !entry.discard {
                entry.discard = true;
                marked += 1;
            }
        }
        marked
    }

    /// Retire everything still outstanding.
    pub fn drain(&self) -> Vec<(u64, PendingRequest)> {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut drained: Vec<(u64, PendingRequest)> = ids
            .into_iter()
            .filter_map(|id| self.resolve(id).map(|r| (id, r)))
            .collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Requests still awaiting a reply for `session_id`, discarded ones excluded.
    pub fn live_for_session(&self, session_id: SessionId) -> usize {
        self.entries
            .iter()
            .filter(|e| e.session_id == session_id && !e.discard)
            .count()
    }

    pub fn len(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn ids_increase_and_are_not_reused() {
        let table = CorrelationTable::new(8);
        let sid = SessionId::new();
        let a = table.reserve(sid, 1, deadline()).unwrap();
        let b = table.reserve(sid, 2, deadline()).unwrap();
        assert!(b > a);
        table.resolve(a).unwrap();
        let c = table.reserve(sid, 3, deadline()).unwrap();
        assert!(c > b, "retired ids are not handed out again");
    }

    #[test]
    fn resolve_happens_once() {
        let table = CorrelationTable::new(8);
        let id = table.reserve(SessionId::new(), 1, deadline()).unwrap();
        assert!(table.resolve(id).is_some());
        assert!(table.resolve(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn capacity_is_enforced_and_freed_on_resolve() {
        let table = CorrelationTable::new(2);
        let sid = SessionId::new();
        let a = table.reserve(sid, 1, deadline()).unwrap();
        table.reserve(sid, 2, deadline()).unwrap();
        assert!(table.reserve(sid, 3, deadline()).is_none());
        table.resolve(a);
        assert!(table.reserve(sid, 3, deadline()).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn discard_marks_only_that_session() {
        let table = CorrelationTable::new(8);
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let a = table.reserve(s1, 1, deadline()).unwrap();
        let b = table.reserve(s2, 1, deadline()).unwrap();
        assert_eq!(table.mark_discard(s1), 1);
        assert_eq!(table.mark_discard(s1), 0);
        assert!(table.resolve(a).unwrap().discard);
        assert!(!table.resolve(b).unwrap().discard);
    }

    #[test]
    fn drain_empties_the_table_in_id_order() {
        let table = CorrelationTable::new(8);
        let sid = SessionId::new();
        for seq in 1..=3 {
            table.reserve(sid, seq, deadline()).unwrap();
        }
        let seqs: Vec<u64> = table.drain().into_iter().map(|(_, r)| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_reserve_yields_distinct_ids() {
        let table = Arc::new(CorrelationTable::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let sid = SessionId::new();
                    (0..500)
                        .map(|seq| table.reserve(sid, seq, Instant::now()).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}

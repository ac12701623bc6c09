//! The dedup ring: a bounded circular buffer of the most recent 8 distinct
//! `(update_id, sha256(payload))` pairs, used to suppress replayed updates
//! during backlog replay. Load-bearing for correctness — preserve the
//! "most-recent N unique ids" semantics if ever replaced.

use sha2::{Digest, Sha256};

const CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    update_id: String,
    hash: [u8; 32],
}

/// Outcome of checking one update against the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Same id, same hash: an exact replay. The whole batch should be dropped.
    Duplicate,
    /// Same id, different hash: the id was reused with new content. The new
    /// entry replaces the old one at its ring slot.
    Replaced,
    /// A genuinely new id: inserted at the cursor.
    New,
}

/// Fixed-capacity ring of the last [`CAPACITY`] distinct update ids. Slots
/// start empty and are written strictly at the cursor, which always
/// advances — never at whatever slot a scan happened to match.
pub struct DedupRing {
    entries: Vec<Option<Entry>>,
    cursor: usize,
}

impl DedupRing {
    pub fn new() -> Self {
        Self { entries: vec![None; CAPACITY], cursor: 0 }
    }

    pub fn sha256(payload: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.finalize().into()
    }

    /// Check `update_id`/`hash` against the ring and mutate it under a
    /// "most-recent N unique ids" rule:
    /// - same id + same hash → [`DedupOutcome::Duplicate`], ring unchanged.
    /// - same id + different hash → stop scanning, clear the stale slot, and
    ///   insert the new entry at the ring cursor (not the matched slot),
    ///   [`DedupOutcome::Replaced`].
    /// - not found → insert at the cursor (wrapping), [`DedupOutcome::New`].
    pub fn check(&mut self, update_id: &str, hash: [u8; 32]) -> DedupOutcome {
        if let Some(slot) = self.entries.iter().position(|e| matches!(e, Some(e) if e.update_id == update_id)) {
            if self.entries[slot].as_ref().unwrap().hash == hash {
                return DedupOutcome::Duplicate;
            }
            self.entries[slot] = None;
            self.insert_at_cursor(update_id, hash);
            return DedupOutcome::Replaced;
        }

        self.insert_at_cursor(update_id, hash);
        DedupOutcome::New
    }

    fn insert_at_cursor(&mut self, update_id: &str, hash: [u8; 32]) {
        self.entries[self.cursor] = Some(Entry { update_id: update_id.to_owned(), hash });
        self.cursor = (self.cursor + 1) % CAPACITY;
    }
}

impl Default for DedupRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_update_is_deduped() {
        let mut ring = DedupRing::new();
        let hash = DedupRing::sha256(b"payload");
        assert_eq!(ring.check("id-1", hash), DedupOutcome::New);
        assert_eq!(ring.check("id-1", hash), DedupOutcome::Duplicate);
    }

    #[test]
    fn same_id_different_payload_replaces() {
        let mut ring = DedupRing::new();
        let h1 = DedupRing::sha256(b"payload-1");
        let h2 = DedupRing::sha256(b"payload-2");
        assert_eq!(ring.check("id-1", h1), DedupOutcome::New);
        assert_eq!(ring.check("id-1", h2), DedupOutcome::Replaced);
        // now the new hash is the one remembered
        assert_eq!(ring.check("id-1", h2), DedupOutcome::Duplicate);
    }

    #[test]
    fn only_last_eight_distinct_ids_are_remembered() {
        let mut ring = DedupRing::new();
        let hash = DedupRing::sha256(b"x");
        for i in 0..8 {
            assert_eq!(ring.check(&format!("id-{i}"), hash), DedupOutcome::New);
        }
        // id-0 should have been evicted by the 9th distinct id
        assert_eq!(ring.check("id-8", hash), DedupOutcome::New);
        assert_eq!(ring.check("id-0", hash), DedupOutcome::New, "id-0 was evicted, so this is a fresh insert");
    }
}

//! Per-account nonce allocation (spec §4.4).
//!
//! One `NonceManager` exists per signing account. It is owned exclusively
//! by the DEX Core task; all mutation goes through `&mut self` so the
//! single-owner invariant is enforced by the borrow checker rather than a
//! runtime lock.

use std::collections::BTreeSet;

use tracing::warn;

#[derive(Debug)]
pub struct NonceManager {
    next_nonce: u64,
    free_nonces: BTreeSet<u64>,
    previous_latest_nonce: Option<u64>,
}

impl NonceManager {
    pub fn new(starting_nonce: u64) -> Self {
        Self {
            next_nonce: starting_nonce,
            free_nonces: BTreeSet::new(),
            previous_latest_nonce: None,
        }
    }

    /// Resumes from persisted state without replaying already-issued nonces
    /// (spec §4.3 "max_nonce... used at startup to resume").
    pub fn resume_from(max_in_flight_nonce: Option<u64>) -> Self {
        Self::new(max_in_flight_nonce.map(|n| n + 1).unwrap_or(0))
    }

    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }

    /// Pops the smallest free nonce; otherwise mints a new one.
    pub fn get(&mut self) -> u64 {
        if let Some(&smallest) = self.free_nonces.iter().next() {
            self.free_nonces.remove(&smallest);
            return smallest;
        }

        let n = self.next_nonce;
        self.next_nonce += 1;
        n
    }

    /// Releases a nonce back to the pool. If it's contiguous with
    /// `next_nonce`, recycles immediately instead of leaving a free-list
    /// entry (spec §4.4 "repeats as long as contiguous").
    pub fn put(&mut self, n: u64) {
        if n + 1 == self.next_nonce {
            self.next_nonce = n;

            // a released nonce may now make a previously-free one
            // contiguous too; keep collapsing downward
            while self.next_nonce > 0 && self.free_nonces.remove(&(self.next_nonce - 1)) {
                self.next_nonce -= 1;
            }

            return;
        }

        self.free_nonces.insert(n);
    }

    pub fn is_free(&self, n: u64) -> bool {
        self.free_nonces.contains(&n)
    }

    /// Reconciles against the chain's view after a sync (spec §4.4).
    /// `latest` is the latest confirmed nonce on chain, `pending` the
    /// latest nonce including unconfirmed transactions known to the node.
    pub fn sync(&mut self, latest: u64, pending: u64) {
        self.next_nonce = self.next_nonce.max(latest);

        if latest < pending {
            let stuck = self.free_nonces.contains(&latest) || self.previous_latest_nonce == Some(latest);

            if stuck {
                warn!(latest, pending, "nonce gap detected, account appears stuck");
                self.free_nonces.remove(&latest);
            }
        }

        self.previous_latest_nonce = Some(latest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_mints_sequential_nonces_when_nothing_is_free() {
        let mut mgr = NonceManager::new(0);
        assert_eq!(mgr.get(), 0);
        assert_eq!(mgr.get(), 1);
        assert_eq!(mgr.get(), 2);
    }

    #[test]
    fn put_then_get_restores_state_for_most_recent_allocation() {
        let mut mgr = NonceManager::new(0);
        let n = mgr.get();
        mgr.put(n);
        assert_eq!(mgr.next_nonce(), 0);
    }

    #[test]
    fn scenario_nonce_recycle() {
        // spec §8 scenario 5: reserve 5,6,7; release 7; next get() returns 7;
        // release 6 then 5; next_nonce shrinks to 5.
        let mut mgr = NonceManager::new(5);
        assert_eq!(mgr.get(), 5);
        assert_eq!(mgr.get(), 6);
        assert_eq!(mgr.get(), 7);
        assert_eq!(mgr.next_nonce(), 8);

        mgr.put(7);
        assert_eq!(mgr.get(), 7);

        mgr.put(7);
        mgr.put(6);
        mgr.put(5);
        assert_eq!(mgr.next_nonce(), 5);
        assert!(mgr.free_nonces.is_empty());
    }

    #[test]
    fn non_contiguous_release_stays_on_free_list() {
        let mut mgr = NonceManager::new(0);
        mgr.get(); // 0
        mgr.get(); // 1
        mgr.get(); // 2
        mgr.put(0);
        assert!(mgr.is_free(0));
        assert_eq!(mgr.next_nonce(), 3);
    }

    #[test]
    fn sync_never_decreases_next_nonce() {
        let mut mgr = NonceManager::new(10);
        mgr.sync(3, 3);
        assert_eq!(mgr.next_nonce(), 10);
    }

    #[test]
    fn sync_advances_next_nonce_to_latest_when_higher() {
        let mut mgr = NonceManager::new(0);
        mgr.sync(10, 10);
        assert_eq!(mgr.next_nonce(), 10);
    }

    #[test]
    fn sync_detects_stuck_gap() {
        let mut mgr = NonceManager::new(5);
        mgr.put(3);
        mgr.sync(3, 5);
        assert!(!mgr.is_free(3));
    }
}

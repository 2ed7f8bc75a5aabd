//! Waits-for graph and deadlock victim selection
//!
//! Lock acquisition in module-id order precludes cycles on the commit path;
//! this detector covers residual waits (caller-introduced dependencies,
//! paused transactions holding pre-images another one needs). The sweep
//! walks the waits-for edges and, on a cycle, picks the youngest member —
//! largest transaction id — as the victim.

use hotswap_core::TxnId;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Waits-for graph: edge `a -> b` means transaction `a` waits for `b`.
#[derive(Debug, Default)]
pub struct WaitGraph {
    edges: Mutex<HashMap<TxnId, TxnId>>,
}

impl WaitGraph {
    /// Empty graph.
    pub fn new() -> Self {
        WaitGraph {
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `waiter` is blocked on `holder`.
    pub fn add_wait(&self, waiter: TxnId, holder: TxnId) {
        if waiter != holder {
            self.edges.lock().insert(waiter, holder);
        }
    }

    /// Remove `txn`'s outgoing wait edge (it acquired what it needed or
    /// terminated).
    pub fn clear_wait(&self, txn: TxnId) {
        self.edges.lock().remove(&txn);
    }

    /// Drop every edge touching `txn`.
    pub fn remove_txn(&self, txn: TxnId) {
        let mut edges = self.edges.lock();
        edges.remove(&txn);
        edges.retain(|_, holder| *holder != txn);
    }

    /// Find one waits-for cycle, if any exists.
    ///
    /// Out-degree is at most one, so cycle detection is pointer chasing
    /// with a visited set per start node.
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let edges = self.edges.lock();
        for &start in edges.keys() {
            let mut path = vec![start];
            let mut cursor = start;
            while let Some(&next) = edges.get(&cursor) {
                if let Some(pos) = path.iter().position(|&t| t == next) {
                    return Some(path[pos..].to_vec());
                }
                path.push(next);
                cursor = next;
            }
        }
        None
    }

    /// Cycle victim: the youngest transaction (largest id) in any cycle.
    pub fn pick_victim(&self) -> Option<TxnId> {
        self.find_cycle()
            .and_then(|cycle| cycle.into_iter().max())
    }

    /// Number of outstanding wait edges (diagnostics).
    pub fn len(&self) -> usize {
        self.edges.lock().len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle_no_victim() {
        let g = WaitGraph::new();
        g.add_wait(TxnId(1), TxnId(2));
        g.add_wait(TxnId(2), TxnId(3));
        assert!(g.find_cycle().is_none());
        assert!(g.pick_victim().is_none());
    }

    #[test]
    fn test_two_cycle_victim_is_youngest() {
        let g = WaitGraph::new();
        g.add_wait(TxnId(4), TxnId(9));
        g.add_wait(TxnId(9), TxnId(4));
        assert_eq!(g.pick_victim(), Some(TxnId(9)));
    }

    #[test]
    fn test_longer_cycle_detected() {
        let g = WaitGraph::new();
        g.add_wait(TxnId(1), TxnId(2));
        g.add_wait(TxnId(2), TxnId(3));
        g.add_wait(TxnId(3), TxnId(1));
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.len(), 3);
        assert_eq!(g.pick_victim(), Some(TxnId(3)));
    }

    #[test]
    fn test_tail_leading_into_cycle_excluded() {
        let g = WaitGraph::new();
        // 7 -> 1 -> 2 -> 1 : the cycle is {1, 2}, 7 is outside it.
        g.add_wait(TxnId(7), TxnId(1));
        g.add_wait(TxnId(1), TxnId(2));
        g.add_wait(TxnId(2), TxnId(1));
        let cycle = g.find_cycle().unwrap();
        assert!(!cycle.contains(&TxnId(7)));
        assert_eq!(g.pick_victim(), Some(TxnId(2)));
    }

    #[test]
    fn test_clearing_wait_breaks_cycle() {
        let g = WaitGraph::new();
        g.add_wait(TxnId(1), TxnId(2));
        g.add_wait(TxnId(2), TxnId(1));
        g.clear_wait(TxnId(2));
        assert!(g.pick_victim().is_none());
    }

    #[test]
    fn test_remove_txn_drops_incoming_edges() {
        let g = WaitGraph::new();
        g.add_wait(TxnId(1), TxnId(3));
        g.add_wait(TxnId(2), TxnId(3));
        g.remove_txn(TxnId(3));
        assert!(g.is_empty());
    }

    #[test]
    fn test_self_wait_ignored() {
        let g = WaitGraph::new();
        g.add_wait(TxnId(1), TxnId(1));
        assert!(g.is_empty());
    }
}

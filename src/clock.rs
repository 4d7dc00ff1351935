/// Vector clocks for causal ordering.
///
/// A vector clock maps node addresses to monotonic event counters. Clocks
/// are pure data: all methods here are lock-free and the callers (the store,
/// the view-change coordinator) hold whatever synchronization they need.
///
/// Comparison treats missing keys as zero, and keys seen by neither side do
/// not exist for the purpose of the comparison. Two clocks whose counters
/// are pairwise equal compare as `Equal`; pairwise `<=` with at least one
/// strict inequality is `Less`; the symmetric case is `Greater`; anything
/// else is concurrent, reported as `None`.
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Vector clock: node address -> logical event counter.
///
/// Serializes transparently as a JSON object, which is exactly the
/// `causal-context` representation clients carry between requests. An empty
/// object is a valid clock meaning "no dependencies".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counts: HashMap<String, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter for a node, zero if absent.
    pub fn get(&self, node: &str) -> u64 {
        self.counts.get(node).copied().unwrap_or(0)
    }

    /// Increment the counter for a node.
    pub fn increment(&mut self, node: &str) {
        *self.counts.entry(node.to_string()).or_insert(0) += 1;
    }

    /// Merge another clock into this one, taking the pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, count) in &other.counts {
            let entry = self.counts.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    /// Compare two vector clocks.
    ///
    /// Returns:
    /// - `Some(Ordering::Less)` if self happened before other
    /// - `Some(Ordering::Greater)` if self happened after other
    /// - `Some(Ordering::Equal)` if they are the same
    /// - `None` if they are concurrent
    pub fn compare(&self, other: &VectorClock) -> Option<Ordering> {
        let all_nodes: HashSet<_> = self.counts.keys().chain(other.counts.keys()).collect();

        let mut has_less = false;
        let mut has_greater = false;

        for node in all_nodes {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => has_less = true,
                Ordering::Greater => has_greater = true,
                Ordering::Equal => {}
            }
        }

        match (has_less, has_greater) {
            (true, true) => None,
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => Some(Ordering::Equal),
        }
    }

    /// Project the clock onto a set of nodes.
    ///
    /// Counters for nodes outside the set are dropped; absent nodes stay
    /// absent (they already read as zero under comparison).
    pub fn project(&self, nodes: &[String]) -> VectorClock {
        VectorClock {
            counts: self
                .counts
                .iter()
                .filter(|(node, _)| nodes.contains(*node))
                .map(|(node, count)| (node.clone(), *count))
                .collect(),
        }
    }

    /// Test whether this clock is exactly one event from `other` ahead of
    /// it, ignoring the `own` key on both sides.
    ///
    /// Returns `Some(node)` iff there is exactly one node k != own with
    /// `self[k] == other[k] + 1` and `self[j] <= other[j]` for every other
    /// j != own. This is the predicate that admits the next gossip event
    /// from a single peer.
    pub fn one_up_except(&self, own: &str, other: &VectorClock) -> Option<String> {
        let all_nodes: HashSet<_> = self.counts.keys().chain(other.counts.keys()).collect();

        let mut one_up = None;
        for node in all_nodes {
            if node == own {
                continue;
            }
            let a = self.get(node);
            let b = other.get(node);
            if a == b + 1 {
                if one_up.is_some() {
                    return None;
                }
                one_up = Some(node.clone());
            } else if a > b {
                return None;
            }
        }

        one_up
    }

    /// True iff the clock records no events at all.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(pairs: [(&str, u64); N]) -> Self {
        VectorClock {
            counts: pairs
                .into_iter()
                .map(|(node, count)| (node.to_string(), count))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vc<const N: usize>(pairs: [(&str, u64); N]) -> VectorClock {
        VectorClock::from(pairs)
    }

    #[test]
    fn test_compare_table() {
        let cases: Vec<(VectorClock, VectorClock, Option<Ordering>)> = vec![
            (vc([("a", 1), ("b", 2)]), vc([("a", 2), ("b", 3)]), Some(Ordering::Less)),
            (vc([("a", 5), ("b", 2)]), vc([("a", 2), ("b", 3), ("c", 4)]), None),
            (vc([("a", 1)]), vc([("a", 2), ("b", 2)]), Some(Ordering::Less)),
            (vc([("a", 2), ("b", 2)]), vc([("a", 1)]), Some(Ordering::Greater)),
            (vc([("a", 2), ("b", 2)]), vc([("a", 2), ("b", 2)]), Some(Ordering::Equal)),
            (vc([("a", 1), ("b", 0)]), vc([("a", 0), ("b", 1)]), None),
            (vc([("a", 1), ("b", 0)]), vc([]), Some(Ordering::Greater)),
            (vc([]), vc([("a", 1)]), Some(Ordering::Less)),
            (vc([]), vc([]), Some(Ordering::Equal)),
        ];

        for (a, b, want) in cases {
            assert_eq!(a.compare(&b), want, "{a:?} compare {b:?}");
        }
    }

    #[test]
    fn test_explicit_zero_matches_missing() {
        // A counter recorded as zero compares exactly like an absent one.
        let a = vc([("a", 1), ("b", 0)]);
        let b = vc([("a", 1)]);
        assert_eq!(a.compare(&b), Some(Ordering::Equal));
    }

    #[test]
    fn test_one_up_except_table() {
        let cases: Vec<(VectorClock, VectorClock, Option<&str>)> = vec![
            (vc([("a", 5), ("b", 2)]), vc([("a", 0), ("b", 1)]), Some("b")),
            (vc([("a", 5), ("b", 2), ("c", 3)]), vc([("a", 0), ("b", 1), ("c", 1)]), None),
            (vc([("a", 5)]), vc([("b", 1)]), None),
            (vc([("a", 5), ("b", 1)]), vc([("a", 0)]), Some("b")),
        ];

        for (a, b, want) in cases {
            assert_eq!(
                a.one_up_except("a", &b).as_deref(),
                want,
                "{a:?} one-up {b:?}"
            );
        }
    }

    #[test]
    fn test_one_up_rejects_two_steps_ahead() {
        let a = vc([("b", 3)]);
        let b = vc([("b", 1)]);
        assert_eq!(a.one_up_except("a", &b), None);
    }

    #[test]
    fn test_increment_and_merge() {
        let mut a = VectorClock::new();
        a.increment("a");
        a.increment("a");
        a.increment("b");
        assert_eq!(a.get("a"), 2);
        assert_eq!(a.get("b"), 1);

        let mut b = vc([("a", 1), ("c", 4)]);
        b.merge(&a);
        assert_eq!(b, vc([("a", 2), ("b", 1), ("c", 4)]));
    }

    #[test]
    fn test_project() {
        let a = vc([("a", 3), ("b", 1), ("c", 7)]);
        let shard = vec!["a".to_string(), "c".to_string()];
        assert_eq!(a.project(&shard), vc([("a", 3), ("c", 7)]));
        assert_eq!(a.project(&[]), vc([]));
    }

    #[test]
    fn test_context_round_trips_as_plain_object() {
        let a = vc([("10.10.0.2:13800", 4)]);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"{"10.10.0.2:13800":4}"#);
        let back: VectorClock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        let empty: VectorClock = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        proptest::collection::hash_map("[a-d]", 0u64..5, 0..4)
            .prop_map(|counts| VectorClock { counts })
    }

    proptest! {
        #[test]
        fn prop_compare_antisymmetric(a in arb_clock(), b in arb_clock()) {
            let forward = a.compare(&b);
            let backward = b.compare(&a);
            let flipped = forward.map(Ordering::reverse);
            prop_assert_eq!(backward, flipped);
        }

        #[test]
        fn prop_merge_dominates_both(a in arb_clock(), b in arb_clock()) {
            let mut merged = a.clone();
            merged.merge(&b);
            prop_assert!(!matches!(merged.compare(&a), Some(Ordering::Less) | None));
            prop_assert!(!matches!(merged.compare(&b), Some(Ordering::Less) | None));
        }

        #[test]
        fn prop_merge_idempotent(a in arb_clock()) {
            let mut merged = a.clone();
            merged.merge(&a);
            prop_assert_eq!(merged, a);
        }
    }
}

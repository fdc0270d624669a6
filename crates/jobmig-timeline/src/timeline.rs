//! Interval arena for node availability.
//!
//! Records live in a growable `Vec` and link to their chronological
//! successor by index. Record 0 is always the head. Records dropped by a
//! merge go onto a free list and are reused by later splits.

use jobmig_core::NodeMask;
use tracing::trace;

#[derive(Debug, Clone)]
struct Record {
    begin: u64,
    end: u64,
    avail: NodeMask,
    next: Option<usize>,
}

/// A read-only view of one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval<'a> {
    pub begin: u64,
    pub end: u64,
    pub avail: &'a NodeMask,
}

/// Ordered, splittable set of `[begin, end)` intervals each carrying the
/// mask of nodes expected to stay free for the whole span.
#[derive(Debug, Clone)]
pub struct NodeSpaceMap {
    records: Vec<Record>,
    free: Vec<usize>,
    live: usize,
}

impl NodeSpaceMap {
    /// One record spanning `[begin, horizon)` with `avail` free.
    pub fn new(begin: u64, horizon: u64, avail: NodeMask) -> Self {
        Self {
            records: vec![Record {
                begin,
                end: horizon.max(begin),
                avail,
                next: None,
            }],
            free: Vec::new(),
            live: 1,
        }
    }

    /// Start of the first interval.
    pub fn begin(&self) -> u64 {
        self.records[0].begin
    }

    /// End of the last interval.
    pub fn horizon(&self) -> u64 {
        self.intervals().last().map_or(self.begin(), |i| i.end)
    }

    /// Number of live interval records.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Intervals in chronological order.
    pub fn intervals(&self) -> Intervals<'_> {
        Intervals {
            map: self,
            cursor: Some(0),
        }
    }

    /// Total time covered, `sum(end - begin)`.
    pub fn coverage(&self) -> u64 {
        self.intervals().map(|i| i.end - i.begin).sum()
    }

    /// Mark `busy` unavailable over `[start, end_reserve)`.
    ///
    /// `start` is clamped to the map's begin. Boundaries falling strictly
    /// inside an interval split it; every interval then fully inside the
    /// window has `busy` cleared from its mask. Finally at most one pair of
    /// adjacent intervals with identical masks is merged.
    pub fn reserve(&mut self, start: u64, end_reserve: u64, busy: &NodeMask) {
        let start = start.max(self.begin());
        if end_reserve <= start {
            return;
        }

        // Find the record holding `start`, splitting it if needed.
        let mut cursor = Some(0);
        let mut first = None;
        while let Some(idx) = cursor {
            let (begin, end, next) = self.span(idx);
            if start < end {
                first = Some(if start > begin {
                    self.split(idx, start)
                } else {
                    idx
                });
                break;
            }
            cursor = next;
        }
        let Some(first) = first else {
            // Entirely past the horizon.
            return;
        };

        // Find the record holding `end_reserve`, splitting it if needed.
        let mut cursor = Some(first);
        while let Some(idx) = cursor {
            let (begin, end, next) = self.span(idx);
            if end_reserve < end {
                if end_reserve > begin {
                    self.split(idx, end_reserve);
                }
                break;
            }
            cursor = next;
        }

        let mut cursor = Some(first);
        while let Some(idx) = cursor {
            let rec = &mut self.records[idx];
            if rec.begin >= end_reserve {
                break;
            }
            if rec.end <= end_reserve {
                rec.avail.and_not_assign(busy);
            }
            cursor = rec.next;
        }

        self.merge_first_identical();
    }

    /// Merge the first pair of adjacent intervals whose masks are equal.
    /// Returns whether a merge happened.
    pub fn merge_first_identical(&mut self) -> bool {
        let mut i = 0;
        while let Some(j) = self.records[i].next {
            if self.records[i].avail == self.records[j].avail {
                let (_, end, next) = self.span(j);
                self.records[i].end = end;
                self.records[i].next = next;
                self.release(j);
                trace!(at = end, records = self.live, "merged identical intervals");
                return true;
            }
            i = j;
        }
        false
    }

    /// Nodes free for the whole of `[start, end)`.
    ///
    /// Time past the horizon is assumed to look like the last interval.
    pub fn available_between(&self, start: u64, end: u64) -> NodeMask {
        let mut out: Option<NodeMask> = None;
        let mut last = None;
        for interval in self.intervals() {
            last = Some(interval);
            if interval.end <= start || interval.begin >= end {
                continue;
            }
            match out.as_mut() {
                Some(mask) => mask.and_assign(interval.avail),
                None => out = Some(interval.avail.clone()),
            }
        }
        match (out, last) {
            (Some(mask), _) => mask,
            (None, Some(last)) => last.avail.clone(),
            (None, None) => NodeMask::default(),
        }
    }

    fn span(&self, idx: usize) -> (u64, u64, Option<usize>) {
        let rec = &self.records[idx];
        (rec.begin, rec.end, rec.next)
    }

    /// Split record `idx` at `at`, returning the index of the new successor.
    fn split(&mut self, idx: usize, at: u64) -> usize {
        let rec = &self.records[idx];
        let successor = Record {
            begin: at,
            end: rec.end,
            avail: rec.avail.clone(),
            next: rec.next,
        };
        let new_idx = self.alloc(successor);
        let rec = &mut self.records[idx];
        rec.end = at;
        rec.next = Some(new_idx);
        new_idx
    }

    fn alloc(&mut self, record: Record) -> usize {
        self.live += 1;
        match self.free.pop() {
            Some(idx) => {
                self.records[idx] = record;
                idx
            }
            None => {
                self.records.push(record);
                self.records.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        let rec = &mut self.records[idx];
        rec.avail = NodeMask::default();
        rec.next = None;
        self.free.push(idx);
        self.live -= 1;
    }
}

/// Chronological iterator over a [`NodeSpaceMap`].
pub struct Intervals<'a> {
    map: &'a NodeSpaceMap,
    cursor: Option<usize>,
}

impl<'a> Iterator for Intervals<'a> {
    type Item = Interval<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let rec = &self.map.records[idx];
        self.cursor = rec.next;
        Some(Interval {
            begin: rec.begin,
            end: rec.end,
            avail: &rec.avail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NODES: usize = 8;

    fn mask(indices: &[usize]) -> NodeMask {
        NodeMask::from_indices(NODES, indices.iter().copied())
    }

    fn spans(map: &NodeSpaceMap) -> Vec<(u64, u64)> {
        map.intervals().map(|i| (i.begin, i.end)).collect()
    }

    #[test]
    fn new_map_is_one_interval() {
        let map = NodeSpaceMap::new(100, 200, NodeMask::full(NODES));
        assert_eq!(map.len(), 1);
        assert_eq!(spans(&map), vec![(100, 200)]);
        assert_eq!(map.coverage(), 100);
    }

    #[test]
    fn reserve_inside_splits_twice() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(20, 50, &mask(&[0, 1]));

        assert_eq!(spans(&map), vec![(0, 20), (20, 50), (50, 100)]);
        let masks: Vec<_> = map.intervals().map(|i| i.avail.clone()).collect();
        assert!(masks[0].test(0));
        assert!(!masks[1].test(0));
        assert!(!masks[1].test(1));
        assert!(masks[1].test(2));
        assert!(masks[2].test(0));
    }

    #[test]
    fn reserve_on_existing_boundary_does_not_split() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(0, 40, &mask(&[3]));
        assert_eq!(spans(&map), vec![(0, 40), (40, 100)]);

        map.reserve(40, 100, &mask(&[4]));
        assert_eq!(spans(&map), vec![(0, 40), (40, 100)]);
        assert!(!map.available_between(40, 100).test(4));
        assert!(map.available_between(0, 40).test(4));
    }

    #[test]
    fn start_before_begin_is_clamped() {
        let mut map = NodeSpaceMap::new(50, 150, NodeMask::full(NODES));
        map.reserve(0, 80, &mask(&[2]));
        assert_eq!(spans(&map), vec![(50, 80), (80, 150)]);
        assert!(!map.available_between(50, 80).test(2));
    }

    #[test]
    fn reserve_past_horizon_is_a_noop() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(100, 300, &mask(&[1]));
        assert_eq!(map.len(), 1);
        assert_eq!(map.available_between(0, 100).count(), NODES);
    }

    #[test]
    fn reserve_beyond_horizon_masks_tail() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(60, 500, &mask(&[5]));
        assert_eq!(spans(&map), vec![(0, 60), (60, 100)]);
        assert!(!map.available_between(60, 100).test(5));
    }

    #[test]
    fn empty_window_is_ignored() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(40, 40, &mask(&[1]));
        map.reserve(60, 30, &mask(&[1]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn identical_neighbours_merge_one_pair() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(10, 20, &mask(&[0]));
        map.reserve(30, 40, &mask(&[0]));
        // (0,10) (10,20) (20,30) (30,40) (40,100), no equal neighbours.
        assert_eq!(map.len(), 5);

        // Blocking node 0 over the gap makes (10,20)(20,30)(30,40) equal.
        map.reserve(20, 30, &mask(&[0]));
        assert_eq!(map.len(), 4);
        assert_eq!(spans(&map), vec![(0, 10), (10, 30), (30, 40), (40, 100)]);

        assert!(map.merge_first_identical());
        assert_eq!(map.len(), 3);
        assert_eq!(spans(&map), vec![(0, 10), (10, 40), (40, 100)]);
        assert!(!map.merge_first_identical());
    }

    #[test]
    fn merged_records_are_reused() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(10, 20, &mask(&[0]));
        map.reserve(20, 30, &mask(&[0]));
        let arena = map.records.len();
        map.reserve(50, 60, &mask(&[1]));
        assert!(map.records.len() <= arena + 1);
        assert_eq!(map.coverage(), 100);
    }

    #[test]
    fn available_between_intersects_overlaps() {
        let mut map = NodeSpaceMap::new(0, 100, NodeMask::full(NODES));
        map.reserve(10, 20, &mask(&[0]));
        map.reserve(50, 60, &mask(&[1]));

        let free = map.available_between(0, 55);
        assert!(!free.test(0));
        assert!(!free.test(1));
        assert!(free.test(2));

        let early = map.available_between(0, 10);
        assert_eq!(early.count(), NODES);

        let beyond = map.available_between(500, 600);
        assert_eq!(beyond.count(), NODES);
    }

    fn arb_mask() -> impl Strategy<Value = NodeMask> {
        prop::collection::vec(any::<bool>(), NODES).prop_map(|bits| {
            NodeMask::from_indices(
                NODES,
                bits.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i),
            )
        })
    }

    proptest! {
        #[test]
        fn reservations_preserve_coverage(
            ops in prop::collection::vec((0u64..1000, 0u64..1000, arb_mask()), 0..40)
        ) {
            let mut map = NodeSpaceMap::new(0, 1000, NodeMask::full(NODES));
            for (a, b, busy) in &ops {
                let (start, end) = if a <= b { (*a, *b) } else { (*b, *a) };
                map.reserve(start, end, busy);

                prop_assert_eq!(map.coverage(), 1000);
                prop_assert_eq!(map.intervals().count(), map.len());

                let all: Vec<_> = map.intervals().collect();
                prop_assert_eq!(all[0].begin, 0);
                prop_assert_eq!(all[all.len() - 1].end, 1000);
                for pair in all.windows(2) {
                    prop_assert_eq!(pair[0].end, pair[1].begin);
                    prop_assert!(pair[0].begin < pair[0].end);
                }

                if start < end {
                    let mut still_free = map.available_between(start, end);
                    still_free.and_assign(busy);
                    prop_assert!(still_free.is_empty());
                }
            }
        }
    }
}

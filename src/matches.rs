//! Match Cache: per block position, which targets a filter confirmed or ruled
//! out.
//!
//! A target lives in at most one of the two sets of a [`MatchIndex`]. A block
//! with no entry at all is untested and must be matched against everything.
use std::collections::{BTreeMap, BTreeSet};

use crate::{elements::TargetId, types::Position};

/// Filter outcome for one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchIndex {
    /// Targets the filter probably contains.
    pub confirmed_match: BTreeSet<TargetId>,
    /// Targets the filter definitely does not contain.
    pub confirmed_no_match: BTreeSet<TargetId>,
}

impl MatchIndex {
    /// Record a probable hit.
    pub fn add_match(&mut self, target: TargetId) {
        self.confirmed_no_match.remove(&target);
        self.confirmed_match.insert(target);
    }

    /// Record a definite miss.
    pub fn add_no_match(&mut self, target: TargetId) {
        self.confirmed_match.remove(&target);
        self.confirmed_no_match.insert(target);
    }

    /// Whether `target` has an outcome for this block.
    pub fn is_tested(&self, target: &TargetId) -> bool {
        self.confirmed_match.contains(target) || self.confirmed_no_match.contains(target)
    }

    /// No probable hits recorded.
    pub fn is_clean(&self) -> bool {
        self.confirmed_match.is_empty()
    }
}

/// Outcomes for every tested block of one subchain.
#[derive(Clone, Debug, Default)]
pub struct MatchCache {
    entries: BTreeMap<Position, MatchIndex>,
}

impl MatchCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome for `position`, if it was ever tested.
    pub fn get(&self, position: &Position) -> Option<&MatchIndex> {
        self.entries.get(position)
    }

    /// Merge one test round for `position`: `tested` targets not in `matched`
    /// are recorded as misses. Returns whether the block now has any hit.
    pub fn record<'a, I>(&mut self, position: Position, tested: I, matched: &BTreeSet<TargetId>) -> bool
    where
        I: IntoIterator<Item = &'a TargetId>,
    {
        let entry = self.entries.entry(position).or_default();
        for target in tested {
            if matched.contains(target) {
                entry.add_match(*target);
            } else {
                entry.add_no_match(*target);
            }
        }
        !entry.is_clean()
    }

    /// Drop entries strictly above `height` (reorg rewind).
    pub fn forget_above(&mut self, height: u32) -> usize {
        let doomed: Vec<Position> = self
            .entries
            .keys()
            .filter(|p| p.height > height)
            .copied()
            .collect();
        for position in &doomed {
            self.entries.remove(position);
        }
        doomed.len()
    }

    /// Drop entries strictly below `height`; they will never be consulted again.
    pub fn prune_below(&mut self, height: u32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|p, _| p.height >= height);
        before - self.entries.len()
    }

    /// Highest tested position.
    pub fn highest(&self) -> Option<Position> {
        self.entries.keys().next_back().copied()
    }

    /// Number of tested positions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

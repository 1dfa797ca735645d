//! Include/skip conditions encoded as 64-bit masks.
//!
//! Every `@include`/`@skip` directive with a variable argument discovered
//! during compilation is assigned a bit index. At request time the variable
//! values collapse into a single [`IncludeFlags`] word, and selection
//! inclusion reduces to a handful of mask comparisons.

use std::ops::BitOr;

use apollo_compiler::Name;
use serde::Serialize;

use crate::response::JsonMap;

/// A 64-bit mask; bit `k` is set when include-condition `k` evaluates to
/// `true` for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct IncludeFlags(pub u64);

impl IncludeFlags {
    pub const EMPTY: IncludeFlags = IncludeFlags(0);

    pub fn with_bit(self, index: usize) -> Self {
        IncludeFlags(self.0 | (1 << index))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` when every bit of `pattern` is set in `self`.
    pub fn satisfies(self, pattern: IncludeFlags) -> bool {
        self.0 & pattern.0 == pattern.0
    }
}

impl BitOr for IncludeFlags {
    type Output = IncludeFlags;

    fn bitor(self, rhs: Self) -> Self {
        IncludeFlags(self.0 | rhs.0)
    }
}

/// One `@include`/`@skip` condition captured at compile time.
///
/// `@skip(if: $v)` is stored negated, so a condition always reads "the
/// selection wants this to be true".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IncludeCondition {
    pub variable: Name,
    pub negated: bool,
}

impl IncludeCondition {
    pub fn evaluate(&self, variables: &JsonMap) -> bool {
        let raw = variables
            .get(self.variable.as_str())
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        raw != self.negated
    }
}

/// The collapsed set of required mask patterns for one selection.
///
/// A selection is included iff at least one stored pattern is a subset of the
/// runtime flags. An empty set means the selection is always included, which
/// reduces the common case to a single comparison.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IncludeConditionSet {
    patterns: Vec<IncludeFlags>,
}

impl IncludeConditionSet {
    pub const ALWAYS: IncludeConditionSet = IncludeConditionSet {
        patterns: Vec::new(),
    };

    /// Collapses a list of per-path patterns.
    ///
    /// If any pattern is empty the selection has an unconditional occurrence
    /// and all patterns are discarded. Otherwise dominated patterns (those
    /// containing an already-kept pattern as a subset) are skipped, and kept
    /// patterns made redundant by a later candidate are purged.
    pub fn from_patterns(mut patterns: Vec<IncludeFlags>) -> Self {
        if patterns.iter().any(|pattern| pattern.is_empty()) {
            return IncludeConditionSet::ALWAYS;
        }
        patterns.sort_by_key(|pattern| pattern.0);
        let mut collapsed: Vec<IncludeFlags> = Vec::with_capacity(patterns.len());
        'candidates: for candidate in patterns {
            for kept in &collapsed {
                if candidate.satisfies(*kept) {
                    // A weaker requirement is already present.
                    continue 'candidates;
                }
            }
            collapsed.retain(|kept| !kept.satisfies(candidate));
            collapsed.push(candidate);
        }
        IncludeConditionSet {
            patterns: collapsed,
        }
    }

    pub fn is_always_included(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_included(&self, flags: IncludeFlags) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|pattern| flags.satisfies(*pattern))
    }

    pub fn patterns(&self) -> &[IncludeFlags] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(bits: &[usize]) -> IncludeFlags {
        bits.iter()
            .fold(IncludeFlags::EMPTY, |acc, bit| acc.with_bit(*bit))
    }

    #[test]
    fn unconditional_occurrence_clears_all_patterns() {
        let set =
            IncludeConditionSet::from_patterns(vec![flags(&[0]), IncludeFlags::EMPTY, flags(&[1])]);
        assert!(set.is_always_included());
        assert!(set.is_included(IncludeFlags::EMPTY));
    }

    #[test]
    fn dominated_patterns_are_dropped() {
        // {0} subsumes {0,1}: requiring fewer conditions is the weaker, and
        // therefore winning, requirement.
        let set = IncludeConditionSet::from_patterns(vec![flags(&[0, 1]), flags(&[0])]);
        assert_eq!(set.patterns(), &[flags(&[0])]);
    }

    #[test]
    fn later_candidates_purge_earlier_supersets() {
        let set = IncludeConditionSet::from_patterns(vec![
            flags(&[2, 3]),
            flags(&[1, 2, 3]),
            flags(&[2]),
        ]);
        assert_eq!(set.patterns(), &[flags(&[2])]);
    }

    #[test]
    fn collapse_is_idempotent_and_minimal() {
        let set = IncludeConditionSet::from_patterns(vec![
            flags(&[0]),
            flags(&[1, 2]),
            flags(&[0, 2]),
            flags(&[1, 2, 3]),
        ]);
        let collapsed = set.patterns().to_vec();
        let again = IncludeConditionSet::from_patterns(collapsed.clone());
        assert_eq!(again.patterns(), collapsed.as_slice());
        for (i, a) in collapsed.iter().enumerate() {
            for (j, b) in collapsed.iter().enumerate() {
                if i != j {
                    assert!(!a.satisfies(*b), "{a:?} is a superset of {b:?}");
                }
            }
        }
    }

    #[test]
    fn inclusion_matches_subset_semantics() {
        let set = IncludeConditionSet::from_patterns(vec![flags(&[0, 1]), flags(&[2])]);
        for runtime in 0u64..16 {
            let runtime = IncludeFlags(runtime);
            let expected = set
                .patterns()
                .iter()
                .any(|pattern| runtime.satisfies(*pattern));
            assert_eq!(set.is_included(runtime), expected);
        }
    }
}

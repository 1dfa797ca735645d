//! Defer conditions and the defer-scope parent chain.

use std::sync::Arc;

use apollo_compiler::Name;
use serde::Serialize;

use crate::response::JsonMap;

/// The runtime condition attached to a `@defer` directive.
///
/// `variable: None` means the defer is unconditional (always active).
/// Conditions are deduplicated by variable and capped at 64 per operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeferCondition {
    pub variable: Option<Name>,
}

impl DeferCondition {
    pub fn evaluate(&self, variables: &JsonMap) -> bool {
        match &self.variable {
            None => true,
            Some(variable) => variables
                .get(variable.as_str())
                .and_then(|value| value.as_bool())
                .unwrap_or(false),
        }
    }
}

/// The bitwise OR of defer-condition bits; doubles as the runtime value of
/// all defer conditions for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct DeferMask(pub u64);

impl DeferMask {
    pub const EMPTY: DeferMask = DeferMask(0);

    pub fn with_bit(self, index: usize) -> Self {
        DeferMask(self.0 | (1 << index))
    }

    pub fn contains_bit(self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }
}

/// A node in the defer-scope parent chain.
///
/// Every `@defer` encountered while collecting fields pushes a usage whose
/// parent is the enclosing defer scope (or `None` at the top).
#[derive(Debug, Serialize)]
pub struct DeferUsage {
    pub label: Option<String>,
    pub condition_index: usize,
    #[serde(skip)]
    pub parent: Option<Arc<DeferUsage>>,
}

impl DeferUsage {
    pub fn new(
        label: Option<String>,
        condition_index: usize,
        parent: Option<Arc<DeferUsage>>,
    ) -> Arc<Self> {
        Arc::new(DeferUsage {
            label,
            condition_index,
            parent,
        })
    }

    pub fn bit(&self) -> u64 {
        1 << self.condition_index
    }

    /// This usage followed by its ancestors, innermost first.
    pub fn chain(self: &Arc<Self>) -> impl Iterator<Item = &Arc<DeferUsage>> {
        std::iter::successors(Some(self), |usage| usage.parent.as_ref())
    }

    /// Distance to the root of the parent chain.
    pub fn depth(self: &Arc<Self>) -> usize {
        self.chain().count() - 1
    }

    /// Walks up the parent chain to the first usage whose condition is active.
    fn innermost_active<'a>(
        self: &'a Arc<Self>,
        defer_flags: DeferMask,
    ) -> Option<&'a Arc<DeferUsage>> {
        self.chain()
            .find(|usage| defer_flags.contains_bit(usage.condition_index))
    }

    pub fn is_ancestor_of(self: &Arc<Self>, other: &Arc<DeferUsage>) -> bool {
        other
            .chain()
            .skip(1)
            .any(|ancestor| Arc::ptr_eq(ancestor, self))
    }
}

/// Resolves the primary defer usage of a selection for the given runtime
/// flags.
///
/// Each stored usage contributes its innermost active ancestor; the outermost
/// of those wins, since a field is delivered with its outermost active defer.
/// If any usage has no active ancestor the field belongs to the initial
/// response and `None` is returned.
pub fn primary_defer_usage(
    usages: &[Arc<DeferUsage>],
    defer_flags: DeferMask,
) -> Option<Arc<DeferUsage>> {
    if usages.is_empty() {
        return None;
    }
    let mut outermost: Option<&Arc<DeferUsage>> = None;
    for usage in usages {
        let active = usage.innermost_active(defer_flags)?;
        outermost = match outermost {
            Some(current) if current.depth() <= active.depth() => Some(current),
            _ => Some(active),
        };
    }
    outermost.cloned()
}

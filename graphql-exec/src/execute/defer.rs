//! The defer execution coordinator.
//!
//! Tracks deferred branches (one per fork point, keyed by parent branch,
//! path, and defer usage), assembles `pending`/`incremental`/`completed`
//! payload parts, and seals the stream once every branch has delivered.
//! Results are emitted in the order branches complete; `hasNext` is `true`
//! until the coordinator observes all branches complete and no new ones are
//! possible.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::compile::DeferUsage;
use crate::execute::scheduler::BranchId;
use crate::execute::scheduler::WorkScheduler;
use crate::response::CompletedResult;
use crate::response::Error;
use crate::response::IncrementalListResult;
use crate::response::IncrementalObjectResult;
use crate::response::IncrementalResult;
use crate::response::OperationResult;
use crate::response::Path;
use crate::response::PendingResult;
use crate::result::ResultDocument;
use crate::result::ResultId;

#[derive(Debug)]
enum BranchKind {
    Defer {
        parent_element: ResultId,
        fields: Vec<ResultId>,
    },
    Stream {
        items: Vec<ResultId>,
    },
}

#[derive(Debug)]
struct BranchEntry {
    entry_id: u32,
    branch: BranchId,
    path: Path,
    label: Option<String>,
    kind: BranchKind,
    /// The coordinator entry this branch is nested in, if any. Parent
    /// delivery precedes child delivery.
    parent_entry: Option<u32>,
    announced: bool,
    delivered: bool,
}

#[derive(Default)]
struct CoordState {
    next_entry_id: u32,
    entries: Vec<BranchEntry>,
    // Fork points are deduplicated by (parent branch, path, usage identity):
    // a branch id is never reused within a request.
    keys: HashMap<(i32, String, usize), usize>,
    delivered: usize,
}

pub(crate) struct DeferCoordinator {
    state: Mutex<CoordState>,
    changed: Notify,
}

impl DeferCoordinator {
    pub(crate) fn new() -> Self {
        DeferCoordinator {
            state: Mutex::new(CoordState {
                next_entry_id: 1,
                ..Default::default()
            }),
            changed: Notify::new(),
        }
    }

    pub(crate) fn has_branches(&self) -> bool {
        !self.state.lock().entries.is_empty()
    }

    pub(crate) fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.delivered == state.entries.len()
    }

    /// Signalled whenever a new branch is forked; the delivery loop rebuilds
    /// its wait set on it.
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Creates (or joins) the deferred branch for one fork point and records
    /// its pending announcement.
    pub(crate) fn fork_defer(
        &self,
        scheduler: &WorkScheduler,
        parent_branch: BranchId,
        path: Path,
        usage: &Arc<DeferUsage>,
        parent_element: ResultId,
    ) -> BranchId {
        let key = (
            parent_branch.0,
            path.to_string(),
            Arc::as_ptr(usage) as usize,
        );
        let mut state = self.state.lock();
        if let Some(index) = state.keys.get(&key) {
            return state.entries[*index].branch;
        }
        // The parent entry is the sibling branch of the enclosing defer
        // scope when both fork at the same point, or the branch this fork
        // runs under when the nesting is deeper.
        let parent_entry = usage
            .parent
            .as_ref()
            .and_then(|parent| {
                let parent_key = (
                    parent_branch.0,
                    path.to_string(),
                    Arc::as_ptr(parent) as usize,
                );
                state
                    .keys
                    .get(&parent_key)
                    .map(|index| state.entries[*index].entry_id)
            })
            .or_else(|| {
                state
                    .entries
                    .iter()
                    .find(|entry| entry.branch == parent_branch)
                    .map(|entry| entry.entry_id)
            });
        let branch = scheduler.create_branch();
        let entry_id = state.next_entry_id;
        state.next_entry_id += 1;
        let index = state.entries.len();
        state.entries.push(BranchEntry {
            entry_id,
            branch,
            path,
            label: usage.label.clone(),
            kind: BranchKind::Defer {
                parent_element,
                fields: Vec::new(),
            },
            parent_entry,
            announced: false,
            delivered: false,
        });
        state.keys.insert(key, index);
        drop(state);
        tracing::trace!(branch = branch.0, "forked defer branch");
        self.changed.notify_waiters();
        branch
    }

    /// Records one deferred field element delivered by `branch`.
    pub(crate) fn add_deferred_field(&self, branch: BranchId, element: ResultId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|entry| entry.branch == branch) {
            if let BranchKind::Defer { fields, .. } = &mut entry.kind {
                fields.push(element);
            }
        }
    }

    /// Creates the stream branch for a list field.
    pub(crate) fn fork_stream(
        &self,
        scheduler: &WorkScheduler,
        parent_branch: BranchId,
        path: Path,
        label: Option<String>,
        items: Vec<ResultId>,
    ) -> BranchId {
        let branch = scheduler.create_branch();
        let mut state = self.state.lock();
        let parent_entry = state
            .entries
            .iter()
            .find(|entry| entry.branch == parent_branch)
            .map(|entry| entry.entry_id);
        let entry_id = state.next_entry_id;
        state.next_entry_id += 1;
        state.entries.push(BranchEntry {
            entry_id,
            branch,
            path,
            label,
            kind: BranchKind::Stream { items },
            parent_entry,
            announced: false,
            delivered: false,
        });
        drop(state);
        tracing::trace!(branch = branch.0, "forked stream branch");
        self.changed.notify_waiters();
        branch
    }

    /// Pending announcements not yet shipped in any payload.
    pub(crate) fn take_unannounced_pending(&self) -> Vec<PendingResult> {
        let mut state = self.state.lock();
        let mut pending = Vec::new();
        for entry in state.entries.iter_mut() {
            if !entry.announced {
                entry.announced = true;
                pending.push(PendingResult {
                    id: entry.entry_id,
                    path: entry.path.clone(),
                    label: entry.label.clone(),
                });
            }
        }
        pending
    }

    /// Branches eligible for delivery, in fork order: not yet delivered, and
    /// with their parent entry (if any) already delivered.
    pub(crate) fn deliverable_branches(&self) -> Vec<BranchId> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|entry| {
                !entry.delivered
                    && entry.parent_entry.map_or(true, |parent_id| {
                        state
                            .entries
                            .iter()
                            .any(|parent| parent.entry_id == parent_id && parent.delivered)
                    })
            })
            .map(|entry| entry.branch)
            .collect()
    }

    /// Builds the incremental payload for one completed branch.
    ///
    /// Emits an `IncrementalObjectResult`/`IncrementalListResult` when the
    /// branch delivered data, or only the `CompletedResult` when null
    /// propagation cancelled it. Nested branches forked while this branch
    /// executed ride along as new pending entries. `hasNext` is `false` on
    /// the payload that delivers the last outstanding branch.
    pub(crate) fn build_payload(
        &self,
        document: &ResultDocument,
        branch: BranchId,
        errors: Vec<Error>,
    ) -> OperationResult {
        let mut state = self.state.lock();
        let Some(index) = state
            .entries
            .iter()
            .position(|entry| entry.branch == branch && !entry.delivered)
        else {
            return OperationResult::default();
        };
        state.entries[index].delivered = true;
        state.delivered += 1;
        let entry = &state.entries[index];

        // Field errors recorded by the branch travel on the incremental
        // entry when data is delivered, on the completed entry otherwise.
        let (incremental, completed) = match &entry.kind {
            BranchKind::Defer {
                parent_element,
                fields,
            } => {
                if document.is_invalidated(*parent_element) || fields.is_empty() {
                    (
                        Vec::new(),
                        CompletedResult {
                            id: entry.entry_id,
                            errors,
                        },
                    )
                } else {
                    (
                        vec![IncrementalResult::Object(IncrementalObjectResult {
                            id: entry.entry_id,
                            sub_path: None,
                            data: Some(document.collect_fields(*parent_element, fields)),
                            errors,
                        })],
                        CompletedResult {
                            id: entry.entry_id,
                            errors: Vec::new(),
                        },
                    )
                }
            }
            BranchKind::Stream { items } => (
                vec![IncrementalResult::List(IncrementalListResult {
                    id: entry.entry_id,
                    items: items.iter().map(|item| document.collect(*item)).collect(),
                    errors,
                })],
                CompletedResult {
                    id: entry.entry_id,
                    errors: Vec::new(),
                },
            ),
        };
        drop(state);

        // New pending entries and hasNext are computed after marking this
        // branch delivered.
        let pending = self.take_unannounced_pending();
        let has_next = !self.is_complete();

        OperationResult {
            incremental,
            completed: vec![completed],
            pending,
            has_next: Some(has_next),
            ..Default::default()
        }
    }
}

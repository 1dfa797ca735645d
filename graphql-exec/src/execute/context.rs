//! Per-request operation context.
//!
//! The context owns the result document, the scheduler, the batch dispatcher,
//! and the defer coordinator for the lifetime of one request. Resolver tasks
//! hold `Arc` back-references; they may mutate the result tree at their
//! assigned path but never touch unrelated paths. Contexts are rented from a
//! pool and returned after the (possibly streaming) result has been fully
//! consumed; cancelled executions abandon the context instead.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::compile::DeferMask;
use crate::compile::IncludeFlags;
use crate::compile::Operation;
use crate::dispatch::BatchDispatcher;
use crate::execute::defer::DeferCoordinator;
use crate::execute::resolver::ObjectValue;
use crate::execute::scheduler::BranchId;
use crate::execute::scheduler::WorkScheduler;
use crate::pool::Pool;
use crate::response::Error;
use crate::response::JsonMap;
use crate::result::ResultDocument;

/// Lifecycle of an operation context.
///
/// `Cleaned` contexts return to the pool; cancelled executions skip
/// `Cleaned` and abandon the context so lingering tasks can never touch a
/// reused one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Initialized,
    Executing,
    ResultBuilt,
    Cleaned,
}

pub struct OperationContext {
    pub(crate) operation: Arc<Operation>,
    pub(crate) variables: JsonMap,
    pub(crate) include_flags: IncludeFlags,
    pub(crate) defer_flags: DeferMask,
    pub(crate) root_value: ObjectValue,
    pub(crate) services: Arc<dyn Any + Send + Sync>,
    pub(crate) scheduler: Arc<WorkScheduler>,
    pub(crate) dispatcher: Arc<BatchDispatcher>,
    pub(crate) coordinator: DeferCoordinator,
    pub(crate) result: Mutex<ResultDocument>,
    errors: Mutex<Vec<(BranchId, Error)>>,
    pub(crate) main_branch: BranchId,
    pub(crate) cancellation: CancellationToken,
    state: Mutex<ContextState>,
}

impl OperationContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn initialize(
        scratch: ContextScratch,
        operation: Arc<Operation>,
        variables: JsonMap,
        root_value: ObjectValue,
        services: Arc<dyn Any + Send + Sync>,
        scheduler: Arc<WorkScheduler>,
        dispatcher: Arc<BatchDispatcher>,
        main_branch: BranchId,
        cancellation: CancellationToken,
        // Variable batching runs with every defer condition inactive, which
        // folds deferred fragments into the initial payload.
        disable_defer: bool,
    ) -> Arc<OperationContext> {
        let include_flags = operation.include_flags(&variables);
        let defer_flags = if disable_defer {
            DeferMask::EMPTY
        } else {
            operation.defer_flags(&variables)
        };
        Arc::new(OperationContext {
            operation,
            variables,
            include_flags,
            defer_flags,
            root_value,
            services,
            scheduler,
            dispatcher,
            coordinator: DeferCoordinator::new(),
            result: Mutex::new(scratch.result),
            errors: Mutex::new(scratch.errors),
            main_branch,
            cancellation,
            state: Mutex::new(ContextState::Initialized),
        })
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        *self.state.lock() = state;
    }

    pub(crate) fn state(&self) -> ContextState {
        *self.state.lock()
    }

    /// Records a field error, attributed to the branch that produced it so
    /// incremental payloads can carry their own errors.
    pub(crate) fn report_error(&self, branch: BranchId, error: Error) {
        tracing::debug!(
            branch = branch.0,
            message = error.message.as_str(),
            "field error"
        );
        self.errors.lock().push((branch, error));
    }

    /// Drains the errors recorded for one branch.
    pub(crate) fn take_errors(&self, branch: BranchId) -> Vec<Error> {
        let mut errors = self.errors.lock();
        let mut taken = Vec::new();
        let mut index = 0;
        while index < errors.len() {
            if errors[index].0 == branch {
                taken.push(errors.remove(index).1);
            } else {
                index += 1;
            }
        }
        taken
    }

    /// Drains every error that has not been claimed by a branch payload.
    pub(crate) fn take_remaining_errors(&self) -> Vec<Error> {
        self.errors
            .lock()
            .drain(..)
            .map(|(_, error)| error)
            .collect()
    }
}

/// The pooled, reusable allocations of an operation context.
pub(crate) struct ContextScratch {
    pub(crate) result: ResultDocument,
    pub(crate) errors: Vec<(BranchId, Error)>,
}

impl Default for ContextScratch {
    fn default() -> Self {
        ContextScratch {
            result: ResultDocument::default(),
            errors: Vec::new(),
        }
    }
}

/// Stack-disciplined pool of context scratch state, so hot allocations stay
/// warm across requests.
pub(crate) struct ContextPool {
    pool: Pool<ContextScratch>,
}

impl ContextPool {
    pub(crate) fn new(capacity: usize) -> Self {
        ContextPool {
            pool: Pool::new(capacity),
        }
    }

    pub(crate) fn rent(&self) -> ContextScratch {
        self.pool.rent()
    }

    /// Returns a context to the pool once the result is fully consumed.
    ///
    /// Succeeds only when no task still holds the context: a lingering
    /// reference means the context must be abandoned (the pool never sees it
    /// again), which is exactly what cancellation relies on.
    pub(crate) fn clean(&self, context: Arc<OperationContext>) {
        context.set_state(ContextState::Cleaned);
        match Arc::try_unwrap(context) {
            Ok(context) => {
                context.dispatcher.shutdown();
                let mut result = context.result.into_inner();
                result.reset();
                let mut errors = context.errors.into_inner();
                errors.clear();
                errors.shrink_to(64);
                self.pool.recycle(ContextScratch { result, errors });
            }
            Err(context) => {
                tracing::debug!("operation context abandoned with live references");
                context.dispatcher.shutdown();
            }
        }
    }
}

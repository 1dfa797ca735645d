//! Operation execution.
//!
//! The [`Executor`] turns a compiled [`Operation`] plus per-request inputs
//! into an [`ExecutionResult`]: a single payload, a response stream whose
//! first element is the initial payload, or an [`OperationResultBatch`] for
//! variable batching. Each request owns a pooled operation context, a work
//! scheduler, a batch dispatcher, and (when incremental parts exist) a defer
//! coordinator.

use std::any::Any;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use apollo_compiler::ast::OperationType;
use futures::channel::mpsc;
use futures::FutureExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::compile::Operation;
use crate::dispatch::BatchDispatcher;
use crate::dispatch::DEFAULT_MAX_BATCH_WAIT_US;
use crate::error::ExecError;
use crate::execute::context::ContextPool;
use crate::execute::context::ContextState;
use crate::execute::context::OperationContext;
use crate::execute::resolver::ObjectValue;
use crate::execute::scheduler::WorkScheduler;
use crate::execute::task::enqueue_root_tasks;
use crate::response::ExecutionResult;
use crate::response::ExecutionResultKind;
use crate::response::JsonMap;
use crate::response::JsonWriterOptions;
use crate::response::NullOmission;
use crate::response::OperationResult;
use crate::response::OperationResultBatch;
use crate::response::ResponseStream;
use crate::result::ROOT_RESULT;

pub(crate) mod complete;
pub(crate) mod context;
pub(crate) mod defer;
pub mod resolver;
pub(crate) mod scheduler;
pub(crate) mod task;

pub use resolver::ResolverRegistry;
pub use scheduler::BranchId;
pub use scheduler::TaskId;

/// Executor configuration; every knob has a production default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub null_omission: NullOmission,
    pub indent_json: bool,
    pub max_response_depth: usize,
    pub max_batch_wait_us: u64,
    pub context_pool_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            null_omission: NullOmission::None,
            indent_json: false,
            max_response_depth: crate::response::DEFAULT_MAX_DEPTH,
            max_batch_wait_us: DEFAULT_MAX_BATCH_WAIT_US,
            context_pool_size: 16,
        }
    }
}

impl ExecutorConfig {
    pub fn writer_options(&self) -> JsonWriterOptions {
        JsonWriterOptions {
            omission: self.null_omission,
            indented: self.indent_json,
            max_depth: self.max_response_depth,
        }
    }

    fn max_batch_wait(&self) -> Duration {
        Duration::from_micros(self.max_batch_wait_us)
    }
}

/// Per-request inputs.
pub struct OperationRequest {
    pub variables: JsonMap,
    pub root_value: ObjectValue,
    pub services: Option<Arc<dyn Any + Send + Sync>>,
    pub cancellation: Option<CancellationToken>,
    pub extensions: Option<JsonMap>,
}

impl OperationRequest {
    pub fn new(root_value: ObjectValue) -> Self {
        OperationRequest {
            variables: JsonMap::new(),
            root_value,
            services: None,
            cancellation: None,
            extensions: None,
        }
    }

    pub fn with_variables(mut self, variables: JsonMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_services(mut self, services: Arc<dyn Any + Send + Sync>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_extensions(mut self, extensions: JsonMap) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

pub struct Executor {
    config: ExecutorConfig,
    contexts: Arc<ContextPool>,
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new(ExecutorConfig::default())
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let contexts = Arc::new(ContextPool::new(config.context_pool_size));
        Executor { config, contexts }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes one operation for one set of variables.
    ///
    /// Operations without incremental parts produce a single payload;
    /// operations carrying `@defer`/`@stream` produce a
    /// [`ResponseStream`] whose first element is the initial response.
    pub async fn execute(
        &self,
        operation: Arc<Operation>,
        request: OperationRequest,
    ) -> Result<ExecutionResult, ExecError> {
        if operation.kind() == OperationType::Subscription {
            return Err(ExecError::SubscriptionsNotSupported);
        }
        let span = tracing::info_span!(
            "execute_operation",
            operation.hash = operation.hash(),
            operation.kind = %operation.kind(),
        );
        let cancellation = request.cancellation.clone().unwrap_or_default();
        let dispatcher = BatchDispatcher::new(self.config.max_batch_wait());
        let scheduler = WorkScheduler::new(cancellation.clone());
        let main_branch = scheduler.create_branch();
        let extensions = request.extensions.clone();
        let ctx = OperationContext::initialize(
            self.contexts.rent(),
            operation.clone(),
            request.variables,
            request.root_value,
            request
                .services
                .unwrap_or_else(|| Arc::new(()) as Arc<dyn Any + Send + Sync>),
            scheduler,
            dispatcher,
            main_branch,
            cancellation,
            false,
        );

        if !operation.has_incremental_parts() {
            let result = self
                .execute_single(ctx.clone(), extensions)
                .instrument(span)
                .await;
            match result {
                Ok(result) => {
                    self.contexts.clean(ctx);
                    Ok(ExecutionResult::Single(result))
                }
                Err(error) => {
                    // Cancelled or failed executions abandon the context.
                    ctx.dispatcher.shutdown();
                    drop(ctx);
                    Err(error)
                }
            }
        } else {
            let (sender, receiver) = mpsc::unbounded();
            let contexts = self.contexts.clone();
            let driver_ctx = ctx.clone();
            tokio::spawn(
                async move {
                    let result = drive_incremental(driver_ctx.clone(), extensions, sender).await;
                    match result {
                        Ok(()) => contexts.clean(driver_ctx),
                        Err(error) => {
                            tracing::debug!(error = %error, "incremental execution aborted");
                            driver_ctx.dispatcher.shutdown();
                            drop(driver_ctx);
                        }
                    }
                }
                .instrument(span),
            );
            drop(ctx);
            Ok(ExecutionResult::Stream(ResponseStream::new(
                ExecutionResultKind::DeferredResult,
                receiver.boxed(),
            )))
        }
    }

    /// Executes one operation against N variable sets, sharing one scheduler
    /// and one batch dispatcher so keys coalesce across sub-executions.
    ///
    /// Sub-executions run with defer disabled: deferred fragments fold into
    /// their initial payloads, and the batch is returned in index order.
    pub async fn execute_batch(
        &self,
        operation: Arc<Operation>,
        variable_sets: Vec<JsonMap>,
        request: OperationRequest,
    ) -> Result<ExecutionResult, ExecError> {
        if operation.kind() == OperationType::Subscription {
            return Err(ExecError::SubscriptionsNotBatchable);
        }
        let span = tracing::info_span!(
            "execute_operation_batch",
            operation.hash = operation.hash(),
            size = variable_sets.len(),
        );
        async move {
            let cancellation = request.cancellation.clone().unwrap_or_default();
            let dispatcher = BatchDispatcher::new(self.config.max_batch_wait());
            let scheduler = WorkScheduler::new(cancellation.clone());
            let services = request
                .services
                .unwrap_or_else(|| Arc::new(()) as Arc<dyn Any + Send + Sync>);

            let mut contexts = Vec::with_capacity(variable_sets.len());
            for variables in variable_sets {
                let branch = scheduler.create_branch();
                let ctx = OperationContext::initialize(
                    self.contexts.rent(),
                    operation.clone(),
                    variables,
                    request.root_value.clone(),
                    services.clone(),
                    scheduler.clone(),
                    dispatcher.clone(),
                    branch,
                    cancellation.clone(),
                    true,
                );
                if let Err(error) = enqueue_root_tasks(&ctx).await {
                    drop(contexts);
                    dispatcher.shutdown();
                    return Err(error);
                }
                ctx.set_state(ContextState::Executing);
                contexts.push(ctx);
            }

            let run = scheduler.run(&dispatcher).await;
            if let Err(error) = run {
                drop(contexts);
                dispatcher.shutdown();
                return Err(error);
            }

            let mut results = Vec::with_capacity(contexts.len());
            for ctx in contexts {
                ctx.set_state(ContextState::ResultBuilt);
                let data = ctx.result.lock().collect(ROOT_RESULT);
                let errors = ctx.take_remaining_errors();
                results.push(OperationResult {
                    data: Some(data),
                    errors,
                    ..Default::default()
                });
                self.contexts.clean(ctx);
            }
            dispatcher.shutdown();
            Ok(ExecutionResult::Batch(OperationResultBatch { results }))
        }
        .instrument(span)
        .await
    }

    async fn execute_single(
        &self,
        ctx: Arc<OperationContext>,
        extensions: Option<JsonMap>,
    ) -> Result<OperationResult, ExecError> {
        enqueue_root_tasks(&ctx).await?;
        ctx.set_state(ContextState::Executing);
        ctx.scheduler.clone().run(&ctx.dispatcher).await?;
        ctx.set_state(ContextState::ResultBuilt);
        let data = ctx.result.lock().collect(ROOT_RESULT);
        let errors = ctx.take_remaining_errors();
        Ok(OperationResult {
            data: Some(data),
            errors,
            extensions,
            ..Default::default()
        })
    }
}

/// The streaming driver: runs the scheduler, emits the initial payload once
/// the main branch completes, then yields one payload per completed deferred
/// branch, in completion order. `hasNext: false` rides on the payload that
/// delivers the last branch.
async fn drive_incremental(
    ctx: Arc<OperationContext>,
    extensions: Option<JsonMap>,
    sender: mpsc::UnboundedSender<OperationResult>,
) -> Result<(), ExecError> {
    // Deferred work stays parked until the initial payload is snapshotted:
    // its null propagation must not mutate data the initial response
    // delivers.
    ctx.scheduler.hold_deferred();
    enqueue_root_tasks(&ctx).await?;
    ctx.set_state(ContextState::Executing);

    let scheduler = ctx.scheduler.clone();
    let dispatcher = ctx.dispatcher.clone();
    let mut run = pin!(scheduler.run(&dispatcher).fuse());
    let mut run_done = false;

    // Phase 1: the initial payload ships as soon as the main branch is done.
    {
        let mut main_done = pin!(scheduler.wait_for_completion(ctx.main_branch).fuse());
        tokio::select! {
            result = &mut run => {
                run_done = true;
                result?;
            }
            result = &mut main_done => {
                result?;
            }
        }
    }

    let pending = ctx.coordinator.take_unannounced_pending();
    let has_branches = !pending.is_empty() || ctx.coordinator.has_branches();
    let initial = OperationResult {
        data: Some(ctx.result.lock().collect(ROOT_RESULT)),
        errors: ctx.take_errors(ctx.main_branch),
        extensions,
        pending,
        has_next: if has_branches { Some(true) } else { None },
        ..Default::default()
    };
    if sender.unbounded_send(initial).is_err() {
        // The consumer dropped the stream; treat it like cancellation.
        ctx.cancellation.cancel();
        return Err(ExecError::Cancelled);
    }
    scheduler.release_deferred();

    // Phase 2: deliver branches in the order they complete, with a parent
    // entry always delivered before its nested children.
    loop {
        if ctx.coordinator.is_complete() {
            break;
        }
        let deliverable = ctx.coordinator.deliverable_branches();
        if deliverable.is_empty() {
            if run_done {
                // Completed but permanently gated branches would be a
                // coordinator bug; do not spin on them.
                tracing::warn!("incremental stream sealed with undeliverable branches");
                break;
            }
            tokio::select! {
                result = &mut run => {
                    run_done = true;
                    result?;
                }
                _ = ctx.coordinator.changed().notified() => {}
            }
            continue;
        }

        let waiters = deliverable.into_iter().map(|branch| {
            let scheduler = scheduler.clone();
            async move {
                let result = scheduler.wait_for_completion(branch).await;
                (branch, result)
            }
            .boxed()
        });
        let mut next_branch = pin!(futures::future::select_all(waiters).fuse());
        tokio::select! {
            result = &mut run, if !run_done => {
                run_done = true;
                result?;
            }
            ((branch, result), _, _) = &mut next_branch => {
                result?;
                let errors = ctx.take_errors(branch);
                let payload = {
                    let document = ctx.result.lock();
                    ctx.coordinator.build_payload(&document, branch, errors)
                };
                tracing::trace!(branch = branch.0, "delivering incremental payload");
                if sender.unbounded_send(payload).is_err() {
                    ctx.cancellation.cancel();
                    return Err(ExecError::Cancelled);
                }
            }
            _ = ctx.coordinator.changed().notified() => {}
        }
    }

    ctx.set_state(ContextState::ResultBuilt);
    Ok(())
}

//! Resolver tasks.
//!
//! The general execution path: a task rented per selection carries its parent
//! object, target result element, execution branch, and defer scope, invokes
//! the resolver pipeline, and hands the produced value to completion.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::compile::DeferUsage;
use crate::compile::ExecutionStrategy;
use crate::compile::Selection;
use crate::error::ExecError;
use crate::execute::complete::complete_object;
use crate::execute::complete::complete_value;
use crate::execute::complete::invoke_resolver;
use crate::execute::complete::report_field_error;
use crate::execute::context::OperationContext;
use crate::execute::resolver::FieldResolver;
use crate::execute::resolver::ObjectValue;
use crate::execute::resolver::ResolvedValue;
use crate::execute::resolver::ResolverContext;
use crate::execute::scheduler::BranchId;
use crate::execute::scheduler::ExecutorTask;
use crate::response::codes;
use crate::response::Path;
use crate::result::ResultId;
use crate::result::ROOT_RESULT;

pub(crate) struct ResolverTask {
    pub(crate) ctx: Arc<OperationContext>,
    pub(crate) selection: Arc<Selection>,
    pub(crate) parent: ObjectValue,
    pub(crate) element: ResultId,
    pub(crate) path: Path,
    pub(crate) branch: BranchId,
    pub(crate) ambient: Option<Arc<DeferUsage>>,
    pub(crate) deferred: bool,
}

impl ExecutorTask for ResolverTask {
    fn branch(&self) -> BranchId {
        self.branch
    }

    fn is_serial(&self) -> bool {
        self.selection.strategy() == ExecutionStrategy::Serial
    }

    fn is_deferred(&self) -> bool {
        self.deferred
    }

    fn execute(self: Box<Self>, cancellation: CancellationToken) -> BoxFuture<'static, ()> {
        async move { self.run(cancellation).await }.boxed()
    }
}

impl ResolverTask {
    async fn run(self, cancellation: CancellationToken) {
        if cancellation.is_cancelled() {
            return;
        }
        let ResolverTask {
            ctx,
            selection,
            parent,
            element,
            path,
            branch,
            ambient,
            ..
        } = self;

        let arguments = match selection.arguments().resolve(&ctx.variables) {
            Ok(arguments) => arguments,
            Err(message) => {
                report_field_error(
                    &ctx,
                    &selection,
                    branch,
                    element,
                    &path,
                    message,
                    codes::ARGUMENT_COERCION,
                );
                return;
            }
        };

        let resolved = match invoke_resolver(&ctx, &selection, &parent, &arguments, &path) {
            Some(result) => result,
            None => {
                // The full resolver pipeline.
                let Some(FieldResolver::Pipelined(resolver)) = selection.resolver() else {
                    unreachable!("invoke_resolver handles every other resolver shape");
                };
                let resolver_ctx = ResolverContext {
                    parent: parent.clone(),
                    arguments: arguments.clone(),
                    path: path.clone(),
                    services: ctx.services.clone(),
                    dispatcher: ctx.dispatcher.clone(),
                    cancellation: cancellation.clone(),
                };
                resolver(resolver_ctx).await
            }
        };

        if cancellation.is_cancelled() {
            return;
        }

        match resolved {
            Ok(value) => {
                complete_value(
                    &ctx,
                    &selection,
                    selection.ty(),
                    value,
                    element,
                    path,
                    branch,
                    ambient,
                )
                .await;
            }
            Err(error) => {
                report_field_error(
                    &ctx,
                    &selection,
                    branch,
                    element,
                    &path,
                    error.message,
                    codes::RESOLVER_ERROR,
                );
            }
        }
    }
}

/// Keeps a branch well-formed when a selection set produces no work of its
/// own.
pub(crate) struct NoopTask {
    pub(crate) branch: BranchId,
}

impl ExecutorTask for NoopTask {
    fn branch(&self) -> BranchId {
        self.branch
    }

    fn execute(self: Box<Self>, _cancellation: CancellationToken) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

/// Completes the list items a `@stream` withheld from the initial payload.
pub(crate) struct StreamTask {
    pub(crate) ctx: Arc<OperationContext>,
    pub(crate) selection: Arc<Selection>,
    pub(crate) branch: BranchId,
    pub(crate) items: Vec<(ResolvedValue, ResultId, Path)>,
    pub(crate) ambient: Option<Arc<DeferUsage>>,
}

impl ExecutorTask for StreamTask {
    fn branch(&self) -> BranchId {
        self.branch
    }

    fn is_deferred(&self) -> bool {
        true
    }

    fn execute(self: Box<Self>, cancellation: CancellationToken) -> BoxFuture<'static, ()> {
        async move {
            let StreamTask {
                ctx,
                selection,
                branch,
                items,
                ambient,
            } = *self;
            let Some(inner) = list_item_type(selection.ty()) else {
                return;
            };
            for (value, element, path) in items {
                if cancellation.is_cancelled() {
                    return;
                }
                complete_value(
                    &ctx,
                    &selection,
                    inner,
                    value,
                    element,
                    path,
                    branch,
                    ambient.clone(),
                )
                .await;
            }
        }
        .boxed()
    }
}

fn list_item_type(ty: &apollo_compiler::ast::Type) -> Option<&apollo_compiler::ast::Type> {
    match ty {
        apollo_compiler::ast::Type::List(inner)
        | apollo_compiler::ast::Type::NonNullList(inner) => Some(inner),
        _ => None,
    }
}

/// Enqueues the operation's root resolver tasks.
///
/// Deferred root selections fork their branches; everything else registers
/// into the context's main branch. If nothing lands on the main branch a
/// no-op task keeps it well-formed so the scheduler still reaches
/// completion.
pub(crate) async fn enqueue_root_tasks(ctx: &Arc<OperationContext>) -> Result<(), ExecError> {
    let root_set = ctx.operation.root_selection_set()?;
    let root_value = ctx.root_value.clone();
    let registered = complete_object(
        ctx,
        root_set,
        root_value,
        ROOT_RESULT,
        Path::empty(),
        ctx.main_branch,
        None,
    )
    .await;
    if registered == 0 {
        ctx.scheduler.register(Box::new(NoopTask {
            branch: ctx.main_branch,
        }));
    }
    Ok(())
}

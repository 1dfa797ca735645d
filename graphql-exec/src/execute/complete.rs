//! Value completion.
//!
//! Coerces a resolver's return value against the selection's declared type,
//! descending into list and object shape. Composite children either resolve
//! inline (pure) or enqueue resolver tasks; deferred children fork branches
//! through the coordinator. Errors are reported at the element's path and
//! null propagation bubbles to the nearest nullable ancestor.

use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::Name;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::compile::DeferUsage;
use crate::compile::ExecutionStrategy;
use crate::compile::Selection;
use crate::compile::SelectionSet;
use crate::compile::TYPENAME_FIELD;
use crate::execute::context::OperationContext;
use crate::execute::resolver::default_resolve;
use crate::execute::resolver::FieldResolver;
use crate::execute::resolver::ObjectValue;
use crate::execute::resolver::PureResolverContext;
use crate::execute::resolver::ResolvedValue;
use crate::execute::resolver::ResolverError;
use crate::execute::scheduler::BranchId;
use crate::execute::task::ResolverTask;
use crate::execute::task::StreamTask;
use crate::response::codes;
use crate::response::Error;
use crate::response::JsonValue;
use crate::response::Location;
use crate::response::Path;
use crate::result::ResultId;

/// Reports a field error at `path`, nulls the element, and propagates the
/// null if the position is non-nullable.
pub(crate) fn report_field_error(
    ctx: &OperationContext,
    selection: &Selection,
    branch: BranchId,
    element: ResultId,
    path: &Path,
    message: impl Into<String>,
    code: &'static str,
) {
    let mut error = Error::new(message).with_path(path.clone()).with_code(code);
    if let Some(location) = selection_location(ctx, selection) {
        error = error.with_location(location);
    }
    ctx.report_error(branch, error);
    let mut document = ctx.result.lock();
    document.invalidate(element);
    document.propagate_null(element);
}

fn selection_location(ctx: &OperationContext, selection: &Selection) -> Option<Location> {
    let node = selection.syntax_nodes().next()?;
    let span = node.name.location()?;
    let range = span.line_column_range(&ctx.operation.document().sources)?;
    Some(Location {
        line: range.start.line,
        column: range.start.column,
    })
}

/// Resolves one selection against its parent object, without a task: the
/// shared entry for the pure fast path and the task runtime.
pub(crate) fn invoke_resolver(
    ctx: &Arc<OperationContext>,
    selection: &Arc<Selection>,
    parent: &ObjectValue,
    arguments: &Arc<crate::response::JsonMap>,
    path: &Path,
) -> Option<Result<ResolvedValue, ResolverError>> {
    if *selection.field_name() == TYPENAME_FIELD {
        return Some(Ok(ResolvedValue::Leaf(JsonValue::String(
            parent.type_name().as_str().into(),
        ))));
    }
    match selection.resolver() {
        Some(FieldResolver::Pure(resolver)) => {
            let pure_ctx = PureResolverContext {
                parent,
                arguments: arguments.as_ref(),
                path,
            };
            Some(resolver(&pure_ctx))
        }
        Some(FieldResolver::Pipelined(_)) => None,
        None => Some(default_resolve(parent, selection.field_name())),
    }
}

/// Completes a resolved value against the selection's type. Returns the
/// number of tasks registered into the current branch.
pub(crate) fn complete_value<'a>(
    ctx: &'a Arc<OperationContext>,
    selection: &'a Arc<Selection>,
    ty: &'a ast::Type,
    value: ResolvedValue,
    element: ResultId,
    path: Path,
    branch: BranchId,
    ambient: Option<Arc<DeferUsage>>,
) -> BoxFuture<'a, usize> {
    async move {
        match ty {
            ast::Type::Named(name) => {
                complete_named(ctx, selection, name, true, value, element, path, branch, ambient)
                    .await
            }
            ast::Type::NonNullNamed(name) => {
                complete_named(ctx, selection, name, false, value, element, path, branch, ambient)
                    .await
            }
            ast::Type::List(inner) => {
                complete_list(ctx, selection, inner, true, value, element, path, branch, ambient)
                    .await
            }
            ast::Type::NonNullList(inner) => {
                complete_list(ctx, selection, inner, false, value, element, path, branch, ambient)
                    .await
            }
        }
    }
    .boxed()
}

#[allow(clippy::too_many_arguments)]
async fn complete_named(
    ctx: &Arc<OperationContext>,
    selection: &Arc<Selection>,
    type_name: &Name,
    nullable: bool,
    value: ResolvedValue,
    element: ResultId,
    path: Path,
    branch: BranchId,
    ambient: Option<Arc<DeferUsage>>,
) -> usize {
    if value_is_null(&value) {
        write_null(ctx, selection, nullable, element, &path, branch);
        return 0;
    }

    let is_leaf = matches!(
        ctx.operation.schema().types.get(type_name),
        Some(ExtendedType::Scalar(_) | ExtendedType::Enum(_))
    );
    if is_leaf {
        match value {
            ResolvedValue::Leaf(json) => {
                ctx.result.lock().set_leaf(element, json);
            }
            _ => {
                report_field_error(
                    ctx,
                    selection,
                    branch,
                    element,
                    &path,
                    format!(
                        "Resolver for \"{}.{}\" returned a composite value for leaf type \
                         \"{type_name}\".",
                        selection.parent_type(),
                        selection.field_name()
                    ),
                    codes::RESOLVER_ERROR,
                );
            }
        }
        return 0;
    }

    // Composite: shape the value into an object with a concrete type.
    let object = match into_object_value(ctx, type_name, value) {
        Ok(object) => object,
        Err(message) => {
            report_field_error(
                ctx,
                selection,
                branch,
                element,
                &path,
                message,
                codes::RESOLVER_ERROR,
            );
            return 0;
        }
    };
    let set = match ctx.operation.selection_set_for(selection, object.type_name()) {
        Ok(set) => set,
        Err(error) => {
            report_field_error(
                ctx,
                selection,
                branch,
                element,
                &path,
                error.to_string(),
                codes::RESOLVER_ERROR,
            );
            return 0;
        }
    };
    complete_object(ctx, set, object, element, path, branch, ambient).await
}

fn value_is_null(value: &ResolvedValue) -> bool {
    matches!(value, ResolvedValue::Null) || matches!(value, ResolvedValue::Leaf(JsonValue::Null))
}

fn write_null(
    ctx: &OperationContext,
    selection: &Selection,
    nullable: bool,
    element: ResultId,
    path: &Path,
    branch: BranchId,
) {
    if nullable {
        ctx.result.lock().set_null(element);
    } else {
        report_field_error(
            ctx,
            selection,
            branch,
            element,
            path,
            format!(
                "Cannot return null for non-nullable field \"{}.{}\".",
                selection.parent_type(),
                selection.field_name()
            ),
            codes::NON_NULL_VIOLATION,
        );
    }
}

/// Determines the concrete object type of a composite value.
fn into_object_value(
    ctx: &Arc<OperationContext>,
    declared_type: &Name,
    value: ResolvedValue,
) -> Result<ObjectValue, String> {
    let schema = ctx.operation.schema();
    match value {
        ResolvedValue::Object(object) => Ok(object),
        ResolvedValue::Leaf(JsonValue::Object(map)) => {
            let concrete = match schema.types.get(declared_type) {
                Some(ExtendedType::Object(_)) => declared_type.clone(),
                _ => match map.get("__typename").and_then(|value| value.as_str()) {
                    Some(type_name) => Name::new(type_name)
                        .map_err(|_| format!("\"{type_name}\" is not a valid type name."))?,
                    None => {
                        return Err(format!(
                            "Cannot determine the concrete type of abstract type \
                             \"{declared_type}\" without a \"__typename\" property.",
                        ))
                    }
                },
            };
            Ok(ObjectValue::json(concrete, map))
        }
        _ => Err(format!(
            "Expected an object value for type \"{declared_type}\".",
        )),
    }
}

enum ChildAction {
    Pure(Arc<Selection>, ResultId, Path),
    Task(Arc<Selection>, ResultId, Path),
    Defer(Arc<Selection>, ResultId, Path, Arc<DeferUsage>),
}

/// Completes an object element: allocates child elements in selection order
/// and drives each included child, honouring the pure fast path, deferred
/// forks, and task scheduling. Returns the number of tasks registered into
/// `branch`.
pub(crate) async fn complete_object(
    ctx: &Arc<OperationContext>,
    set: Arc<SelectionSet>,
    object: ObjectValue,
    element: ResultId,
    path: Path,
    branch: BranchId,
    ambient: Option<Arc<DeferUsage>>,
) -> usize {
    let mut actions = Vec::new();
    {
        let mut document = ctx.result.lock();
        document.begin_object(element);
        for selection in set.selections() {
            if !selection.is_included(ctx.include_flags) {
                continue;
            }
            let nullable = !selection.ty().is_non_null();
            let child = document.alloc(
                element,
                crate::response::PathSegment::Field(selection.response_name().clone()),
                nullable,
            );
            document.push_object_field(element, selection.response_name().clone(), child);
            let child_path = path.join_field(selection.response_name());

            // A field whose primary defer usage differs from the executing
            // branch's scope forks a new branch; a field sharing the scope
            // runs in the current branch.
            let primary = selection.primary_defer_usage(ctx.defer_flags);
            match primary {
                Some(usage)
                    if !matches!(&ambient, Some(current) if Arc::ptr_eq(&usage, current)) =>
                {
                    document.mark_deferred(child);
                    actions.push(ChildAction::Defer(selection.clone(), child, child_path, usage));
                }
                _ if selection.strategy() == ExecutionStrategy::Pure => {
                    actions.push(ChildAction::Pure(selection.clone(), child, child_path));
                }
                _ => {
                    actions.push(ChildAction::Task(selection.clone(), child, child_path));
                }
            }
        }
    }

    let mut registered = 0;
    let mut tasks: Vec<Box<dyn crate::execute::scheduler::ExecutorTask>> = Vec::new();
    for action in actions {
        match action {
            ChildAction::Defer(selection, child, child_path, usage) => {
                let defer_branch = ctx.coordinator.fork_defer(
                    &ctx.scheduler,
                    branch,
                    path.clone(),
                    &usage,
                    element,
                );
                ctx.coordinator.add_deferred_field(defer_branch, child);
                ctx.scheduler.register(Box::new(ResolverTask {
                    ctx: ctx.clone(),
                    selection,
                    parent: object.clone(),
                    element: child,
                    path: child_path,
                    branch: defer_branch,
                    ambient: Some(usage),
                    deferred: true,
                }));
            }
            ChildAction::Pure(selection, child, child_path) => {
                registered += complete_pure_child(
                    ctx,
                    &selection,
                    &object,
                    child,
                    child_path,
                    branch,
                    ambient.clone(),
                )
                .await;
            }
            ChildAction::Task(selection, child, child_path) => {
                tasks.push(Box::new(ResolverTask {
                    ctx: ctx.clone(),
                    selection,
                    parent: object.clone(),
                    element: child,
                    path: child_path,
                    branch,
                    ambient: ambient.clone(),
                    deferred: branch != ctx.main_branch,
                }));
            }
        }
    }
    // The stacks are LIFO: push in reverse so tasks pop in document order.
    registered += tasks.len();
    tasks.reverse();
    ctx.scheduler.register_all(tasks);
    registered
}

/// The pure fast path: resolve and complete a child inline under the
/// parent's completion step, without allocating a task.
async fn complete_pure_child(
    ctx: &Arc<OperationContext>,
    selection: &Arc<Selection>,
    parent: &ObjectValue,
    element: ResultId,
    path: Path,
    branch: BranchId,
    ambient: Option<Arc<DeferUsage>>,
) -> usize {
    let arguments = match selection.arguments().resolve(&ctx.variables) {
        Ok(arguments) => arguments,
        Err(message) => {
            report_field_error(
                ctx,
                selection,
                branch,
                element,
                &path,
                message,
                codes::ARGUMENT_COERCION,
            );
            return 0;
        }
    };
    let resolved = invoke_resolver(ctx, selection, parent, &arguments, &path)
        .expect("pure selections have a non-pipelined resolver");
    match resolved {
        Ok(value) => {
            complete_value(
                ctx,
                selection,
                selection.ty(),
                value,
                element,
                path,
                branch,
                ambient,
            )
            .await
        }
        Err(error) => {
            report_field_error(
                ctx,
                selection,
                branch,
                element,
                &path,
                error.message,
                codes::RESOLVER_ERROR,
            );
            0
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn complete_list(
    ctx: &Arc<OperationContext>,
    selection: &Arc<Selection>,
    inner: &ast::Type,
    nullable: bool,
    value: ResolvedValue,
    element: ResultId,
    path: Path,
    branch: BranchId,
    ambient: Option<Arc<DeferUsage>>,
) -> usize {
    if value_is_null(&value) {
        write_null(ctx, selection, nullable, element, &path, branch);
        return 0;
    }
    let items: Vec<ResolvedValue> = match value {
        ResolvedValue::List(items) => items,
        ResolvedValue::Leaf(JsonValue::Array(values)) => {
            values.into_iter().map(ResolvedValue::Leaf).collect()
        }
        _ => {
            report_field_error(
                ctx,
                selection,
                branch,
                element,
                &path,
                format!(
                    "Expected a list value for field \"{}.{}\".",
                    selection.parent_type(),
                    selection.field_name()
                ),
                codes::RESOLVER_ERROR,
            );
            return 0;
        }
    };

    let stream = selection
        .stream()
        .filter(|stream| stream.is_active(&ctx.variables));
    let initial_count = stream.map(|s| s.initial_count).unwrap_or(usize::MAX);
    let inner_nullable = !inner.is_non_null();

    let mut immediate: Vec<(ResolvedValue, ResultId, Path)> = Vec::new();
    let mut streamed: Vec<(ResolvedValue, ResultId, Path)> = Vec::new();
    {
        let mut document = ctx.result.lock();
        document.begin_list(element);
        for (index, item) in items.into_iter().enumerate() {
            let child = document.alloc(
                element,
                crate::response::PathSegment::Index(index),
                inner_nullable,
            );
            document.push_list_item(element, child);
            let child_path = path.join_index(index);
            if index >= initial_count {
                document.mark_deferred(child);
                streamed.push((item, child, child_path));
            } else {
                immediate.push((item, child, child_path));
            }
        }
    }

    let mut registered = 0;
    for (item, child, child_path) in immediate {
        registered += complete_value(
            ctx,
            selection,
            inner,
            item,
            child,
            child_path,
            branch,
            ambient.clone(),
        )
        .await;
    }

    if !streamed.is_empty() {
        let label = stream.and_then(|s| s.label.clone());
        let item_elements: Vec<ResultId> = streamed.iter().map(|(_, child, _)| *child).collect();
        let stream_branch = ctx.coordinator.fork_stream(
            &ctx.scheduler,
            branch,
            path.clone(),
            label,
            item_elements,
        );
        ctx.scheduler.register(Box::new(StreamTask {
            ctx: ctx.clone(),
            selection: selection.clone(),
            branch: stream_branch,
            items: streamed,
            ambient,
        }));
    }
    registered
}

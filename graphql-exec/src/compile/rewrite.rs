//! Stage-1 document rewrite.
//!
//! Fragment spreads are expanded into inline fragments at the usage site and
//! nested inline fragments whose type condition already matches the enclosing
//! context are flattened away. Branches excluded by literal `@include`/`@skip`
//! arguments are dropped entirely, and no-op directives (`@include(if: true)`,
//! `@skip(if: false)`, `@defer(if: false)`) are stripped so later stages never
//! see them.

use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::executable;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;

use crate::error::ExecError;

pub(crate) const INCLUDE_DIRECTIVE: &str = "include";
pub(crate) const SKIP_DIRECTIVE: &str = "skip";
pub(crate) const DEFER_DIRECTIVE: &str = "defer";
pub(crate) const STREAM_DIRECTIVE: &str = "stream";
/// Marker carried by selections the compiler itself synthesizes.
pub(crate) const INTERNAL_DIRECTIVE: &str = "__internal";

/// A rewritten selection: only fields and inline fragments survive stage 1.
#[derive(Debug, Clone)]
pub(crate) enum RSelection {
    Field(Arc<RField>),
    Inline(Arc<RInline>),
}

#[derive(Debug)]
pub(crate) struct RField {
    pub(crate) node: Node<executable::Field>,
    pub(crate) children: Vec<RSelection>,
}

#[derive(Debug)]
pub(crate) struct RInline {
    pub(crate) type_condition: Option<Name>,
    pub(crate) directives: executable::DirectiveList,
    pub(crate) children: Vec<RSelection>,
}

pub(crate) struct RewriteOutput {
    pub(crate) selections: Vec<RSelection>,
    pub(crate) has_incremental_parts: bool,
}

pub(crate) struct Rewriter<'a> {
    schema: &'a Valid<Schema>,
    document: &'a Valid<ExecutableDocument>,
    has_incremental_parts: bool,
    fragment_stack: Vec<Name>,
}

impl<'a> Rewriter<'a> {
    pub(crate) fn new(schema: &'a Valid<Schema>, document: &'a Valid<ExecutableDocument>) -> Self {
        Rewriter {
            schema,
            document,
            has_incremental_parts: false,
            fragment_stack: Vec::new(),
        }
    }

    pub(crate) fn rewrite_operation(
        mut self,
        operation: &executable::Operation,
        root_type: &Name,
    ) -> Result<RewriteOutput, ExecError> {
        let selections = self.rewrite_set(&operation.selection_set.selections, root_type)?;
        Ok(RewriteOutput {
            selections,
            has_incremental_parts: self.has_incremental_parts,
        })
    }

    fn rewrite_set(
        &mut self,
        selections: &[executable::Selection],
        context_type: &Name,
    ) -> Result<Vec<RSelection>, ExecError> {
        let mut out = Vec::with_capacity(selections.len());
        for selection in selections {
            match selection {
                executable::Selection::Field(field) => {
                    if statically_excluded(&field.directives) {
                        continue;
                    }
                    if stream_spec(&field.directives).is_some() {
                        self.has_incremental_parts = true;
                    }
                    let field_type = field.definition.ty.inner_named_type();
                    let children = self.rewrite_set(&field.selection_set.selections, field_type)?;
                    out.push(RSelection::Field(Arc::new(RField {
                        node: field.clone(),
                        children,
                    })));
                }
                executable::Selection::FragmentSpread(spread) => {
                    if statically_excluded(&spread.directives) {
                        continue;
                    }
                    let Some(fragment) = self.document.fragments.get(&spread.fragment_name) else {
                        return Err(ExecError::UnknownFragment {
                            name: spread.fragment_name.clone(),
                        });
                    };
                    if self.fragment_stack.contains(&spread.fragment_name) {
                        return Err(ExecError::FragmentCycle {
                            name: spread.fragment_name.clone(),
                        });
                    }
                    let condition = fragment.type_condition();
                    self.check_type_exists(condition)?;
                    self.fragment_stack.push(spread.fragment_name.clone());
                    let children =
                        self.rewrite_set(&fragment.selection_set.selections, condition)?;
                    self.fragment_stack.pop();
                    self.push_inline(
                        &mut out,
                        Some(condition.clone()),
                        &spread.directives,
                        children,
                        context_type,
                    );
                }
                executable::Selection::InlineFragment(inline) => {
                    if statically_excluded(&inline.directives) {
                        continue;
                    }
                    if let Some(condition) = &inline.type_condition {
                        self.check_type_exists(condition)?;
                    }
                    let condition = inline.type_condition.as_ref().unwrap_or(context_type);
                    let children = self.rewrite_set(&inline.selection_set.selections, condition)?;
                    self.push_inline(
                        &mut out,
                        inline.type_condition.clone(),
                        &inline.directives,
                        children,
                        context_type,
                    );
                }
            }
        }
        Ok(out)
    }

    fn push_inline(
        &mut self,
        out: &mut Vec<RSelection>,
        type_condition: Option<Name>,
        directives: &executable::DirectiveList,
        children: Vec<RSelection>,
        context_type: &Name,
    ) {
        let directives = strip_noop_directives(directives);
        if defer_spec(&directives).is_some() {
            self.has_incremental_parts = true;
        }
        let matches_context = match &type_condition {
            None => true,
            Some(condition) => condition == context_type,
        };
        if directives.is_empty() && matches_context {
            out.extend(children);
        } else {
            out.push(RSelection::Inline(Arc::new(RInline {
                type_condition,
                directives,
                children,
            })));
        }
    }

    fn check_type_exists(&self, name: &Name) -> Result<(), ExecError> {
        if self.schema.types.contains_key(name) {
            Ok(())
        } else {
            Err(ExecError::UnknownType { name: name.clone() })
        }
    }
}

/// `true` when the selection can never be included: a literal
/// `@include(if: false)` or `@skip(if: true)`.
fn statically_excluded(directives: &executable::DirectiveList) -> bool {
    literal_if_argument(directives, INCLUDE_DIRECTIVE) == Some(false)
        || literal_if_argument(directives, SKIP_DIRECTIVE) == Some(true)
}

/// Removes directives that can no longer influence execution.
fn strip_noop_directives(directives: &executable::DirectiveList) -> executable::DirectiveList {
    executable::DirectiveList(
        directives
            .iter()
            .filter(|directive| match directive.name.as_str() {
                INCLUDE_DIRECTIVE => literal_if_argument_of(directive) != Some(true),
                SKIP_DIRECTIVE => literal_if_argument_of(directive) != Some(false),
                DEFER_DIRECTIVE => literal_if_argument_of(directive) != Some(false),
                _ => true,
            })
            .cloned()
            .collect(),
    )
}

fn literal_if_argument(directives: &executable::DirectiveList, name: &str) -> Option<bool> {
    literal_if_argument_of(directives.get(name)?)
}

fn literal_if_argument_of(directive: &Node<ast::Directive>) -> Option<bool> {
    match directive.specified_argument_by_name("if")?.as_ref() {
        ast::Value::Boolean(value) => Some(*value),
        _ => None,
    }
}

/// The include/skip conditions on a selection that carry a variable argument,
/// as `(variable, negated)` pairs.
pub(crate) fn variable_conditions(
    directives: &executable::DirectiveList,
) -> impl Iterator<Item = (Name, bool)> + '_ {
    directives.iter().filter_map(|directive| {
        let negated = match directive.name.as_str() {
            INCLUDE_DIRECTIVE => false,
            SKIP_DIRECTIVE => true,
            _ => return None,
        };
        match directive.specified_argument_by_name("if")?.as_ref() {
            ast::Value::Variable(variable) => Some((variable.clone(), negated)),
            _ => None,
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeferSpec {
    pub(crate) label: Option<String>,
    pub(crate) variable: Option<Name>,
}

/// The effective `@defer` on an inline fragment, if any. A literal
/// `if: false` disables the defer; a literal `if: true` is unconditional.
pub(crate) fn defer_spec(directives: &executable::DirectiveList) -> Option<DeferSpec> {
    let directive = directives.get(DEFER_DIRECTIVE)?;
    let variable = match directive.specified_argument_by_name("if") {
        None => None,
        Some(value) => match value.as_ref() {
            ast::Value::Boolean(false) => return None,
            ast::Value::Boolean(true) => None,
            ast::Value::Variable(variable) => Some(variable.clone()),
            _ => None,
        },
    };
    Some(DeferSpec {
        label: string_argument(directive, "label"),
        variable,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamSpec {
    pub(crate) label: Option<String>,
    pub(crate) initial_count: usize,
    pub(crate) variable: Option<Name>,
}

/// The effective `@stream` on a field, if any.
pub(crate) fn stream_spec(directives: &executable::DirectiveList) -> Option<StreamSpec> {
    let directive = directives.get(STREAM_DIRECTIVE)?;
    let variable = match directive.specified_argument_by_name("if") {
        None => None,
        Some(value) => match value.as_ref() {
            ast::Value::Boolean(false) => return None,
            ast::Value::Boolean(true) => None,
            ast::Value::Variable(variable) => Some(variable.clone()),
            _ => None,
        },
    };
    let initial_count = directive
        .specified_argument_by_name("initialCount")
        .and_then(|value| match value.as_ref() {
            ast::Value::Int(value) => value.as_str().parse().ok(),
            _ => None,
        })
        .unwrap_or(0);
    Some(StreamSpec {
        label: string_argument(directive, "label"),
        initial_count,
        variable,
    })
}

pub(crate) fn is_internal(directives: &executable::DirectiveList) -> bool {
    directives.get(INTERNAL_DIRECTIVE).is_some()
}

fn string_argument(directive: &Node<ast::Directive>, name: &str) -> Option<String> {
    match directive.specified_argument_by_name(name)?.as_ref() {
        ast::Value::String(value) => Some(value.clone()),
        _ => None,
    }
}

/// Does an inline fragment's type condition apply to a concrete object type?
pub(crate) fn type_condition_applies(
    schema: &Valid<Schema>,
    condition: &Name,
    object_type: &Name,
) -> bool {
    if condition == object_type {
        return true;
    }
    match schema.types.get(condition) {
        Some(ExtendedType::Interface(_)) => match schema.types.get(object_type) {
            Some(ExtendedType::Object(object)) => {
                object.implements_interfaces.contains(condition)
            }
            _ => false,
        },
        Some(ExtendedType::Union(union)) => union.members.contains(object_type),
        _ => false,
    }
}

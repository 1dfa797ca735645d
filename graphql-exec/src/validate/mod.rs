//! Field-selection-merging validation.
//!
//! An efficient, pooled variant of the "Overlapping Fields Can Be Merged"
//! rule. For every response name reachable in an operation two properties are
//! checked: all occurrences produce the same response shape, and occurrences
//! that can reach the same concrete parent type agree on field name and
//! arguments (and `initialCount` when `@stream` is in play).

use std::collections::HashSet;

use apollo_compiler::ast;
use apollo_compiler::executable;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::Implementers;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use indexmap::IndexMap;

use crate::pool::Pool;
use crate::response::Location;

const STREAM_DIRECTIVE: &str = "stream";

/// One detected merging conflict, with the participating field locations
/// sorted by source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub message: String,
    pub locations: Vec<Location>,
}

#[derive(Clone)]
struct FieldContext {
    /// The declared parent type the field was reached through; possibly an
    /// interface or union.
    parent_type: Name,
    field: Node<executable::Field>,
}

type FieldMap = IndexMap<Name, Vec<FieldContext>>;
type VisitedPairs = HashSet<(usize, usize, u8)>;

/// Both properties track their own visited pairs: a pair can pass one check
/// and still fail the other.
#[derive(Clone, Copy)]
enum PairCheck {
    NameAndArguments = 0,
    ResponseShape = 1,
}

/// The pooled checker. One instance is meant to be shared across operations;
/// scratch allocations are rented per run and recycled afterwards.
pub struct FieldMergingValidator {
    field_maps: Pool<FieldMap>,
    visited_sets: Pool<VisitedPairs>,
    conflict_lists: Pool<Vec<MergeConflict>>,
}

impl Default for FieldMergingValidator {
    fn default() -> Self {
        FieldMergingValidator {
            field_maps: Pool::new(16),
            visited_sets: Pool::new(16),
            conflict_lists: Pool::new(16),
        }
    }
}

impl FieldMergingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates every operation of the document. Returns all conflicts, or
    /// `Ok(())` when fields can be merged.
    pub fn validate(
        &self,
        schema: &Valid<Schema>,
        document: &Valid<ExecutableDocument>,
    ) -> Result<(), Vec<MergeConflict>> {
        let implementers = schema.implementers_map();
        let mut scratch = self.conflict_lists.rent();
        scratch.clear();
        let mut visited = self.visited_sets.rent();
        visited.clear();

        for operation in document.operations.iter() {
            let Some(root_type) = schema.root_operation(operation.operation_type) else {
                continue;
            };
            let mut run = Run {
                validator: self,
                schema,
                document,
                implementers: &implementers,
                visited: &mut visited,
                conflicts: &mut scratch,
            };
            run.check_selections(root_type, &operation.selection_set.selections);
        }

        self.visited_sets.recycle(visited);
        let conflicts: Vec<MergeConflict> = scratch.drain(..).collect();
        self.conflict_lists.recycle(scratch);
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(conflicts)
        }
    }
}

struct Run<'a> {
    validator: &'a FieldMergingValidator,
    schema: &'a Valid<Schema>,
    document: &'a Valid<ExecutableDocument>,
    implementers: &'a apollo_compiler::collections::HashMap<Name, Implementers>,
    visited: &'a mut VisitedPairs,
    conflicts: &'a mut Vec<MergeConflict>,
}

impl Run<'_> {
    fn check_selections(&mut self, parent_type: &Name, selections: &[executable::Selection]) {
        let mut fields = self.validator.field_maps.rent();
        fields.clear();
        let mut seen_fragments = HashSet::new();
        self.collect_fields(parent_type, selections, &mut fields, &mut seen_fragments);

        for (response_name, group) in fields.iter() {
            if group.len() > 1 {
                self.check_same_name_and_arguments(response_name, group);
                self.check_same_response_shape(response_name, group);
            }
            // Recurse into composite children even for singleton groups:
            // sibling conflicts may hide below.
            self.check_children(group);
        }

        fields.clear();
        self.validator.field_maps.recycle(fields);
    }

    /// Collects every field reachable through inline fragments and named
    /// fragments, without type narrowing; the declared parent type travels
    /// with each field.
    fn collect_fields(
        &self,
        parent_type: &Name,
        selections: &[executable::Selection],
        fields: &mut FieldMap,
        seen_fragments: &mut HashSet<Name>,
    ) {
        for selection in selections {
            match selection {
                executable::Selection::Field(field) => {
                    fields
                        .entry(field.response_key().clone())
                        .or_default()
                        .push(FieldContext {
                            parent_type: parent_type.clone(),
                            field: field.clone(),
                        });
                }
                executable::Selection::InlineFragment(inline) => {
                    let fragment_type = inline.type_condition.as_ref().unwrap_or(parent_type);
                    self.collect_fields(
                        fragment_type,
                        &inline.selection_set.selections,
                        fields,
                        seen_fragments,
                    );
                }
                executable::Selection::FragmentSpread(spread) => {
                    if !seen_fragments.insert(spread.fragment_name.clone()) {
                        continue;
                    }
                    if let Some(fragment) = self.document.fragments.get(&spread.fragment_name) {
                        self.collect_fields(
                            fragment.type_condition(),
                            &fragment.selection_set.selections,
                            fields,
                            seen_fragments,
                        );
                    }
                }
            }
        }
    }

    /// Property 2: fields that can reach the same concrete parent type must
    /// agree on name, arguments, and stream directives.
    fn check_same_name_and_arguments(&mut self, response_name: &Name, group: &[FieldContext]) {
        // Group by concrete parent type; abstract-parent fields replicate
        // into every concrete group.
        let mut concrete_groups: IndexMap<Name, Vec<&FieldContext>> = IndexMap::new();
        for context in group {
            for concrete in self.possible_types(&context.parent_type) {
                concrete_groups.entry(concrete).or_default().push(context);
            }
        }

        for (_, members) in concrete_groups.iter() {
            if members.len() < 2 {
                continue;
            }
            let first = members[0];
            for other in &members[1..] {
                if self.already_checked(first, other, PairCheck::NameAndArguments) {
                    continue;
                }
                if first.field.name != other.field.name {
                    self.conflict(
                        format!(
                            "Fields `{response_name}` conflict because `{}` and `{}` are \
                             different fields.",
                            first.field.name, other.field.name
                        ),
                        &[first, other],
                    );
                } else if !arguments_equal(&first.field.arguments, &other.field.arguments) {
                    self.conflict(
                        format!(
                            "Fields `{response_name}` conflict because they have differing \
                             arguments."
                        ),
                        &[first, other],
                    );
                } else if !stream_directives_equal(&first.field, &other.field) {
                    self.conflict(
                        format!(
                            "Fields `{response_name}` conflict because they have differing \
                             stream directives."
                        ),
                        &[first, other],
                    );
                }
            }
        }
    }

    /// Property 1: across all parent types, every pair must produce the same
    /// response shape.
    fn check_same_response_shape(&mut self, response_name: &Name, group: &[FieldContext]) {
        let first = &group[0];
        for other in &group[1..] {
            if self.already_checked(first, other, PairCheck::ResponseShape) {
                continue;
            }
            let a = &first.field.definition.ty;
            let b = &other.field.definition.ty;
            if !self.types_shape_equal(a, b) {
                self.conflict(
                    format!(
                        "Fields `{response_name}` conflict because they return conflicting \
                         types `{a}` and `{b}`.",
                    ),
                    &[first, other],
                );
            }
        }
    }

    /// Unwraps `NonNull`/`List` wrappers in lockstep; leaf types must be
    /// equal, composite types merge (their children are validated by
    /// [`Run::check_children`]).
    fn types_shape_equal(&self, a: &ast::Type, b: &ast::Type) -> bool {
        use ast::Type::*;
        match (a, b) {
            (NonNullNamed(a), NonNullNamed(b)) | (Named(a), Named(b)) => {
                self.named_types_shape_equal(a, b)
            }
            (NonNullList(a), NonNullList(b)) | (List(a), List(b)) => self.types_shape_equal(a, b),
            _ => false,
        }
    }

    fn named_types_shape_equal(&self, a: &Name, b: &Name) -> bool {
        let a_leaf = self.is_leaf_type(a);
        let b_leaf = self.is_leaf_type(b);
        if a_leaf || b_leaf {
            a == b
        } else {
            // Composite types merge shape-wise; child conflicts surface
            // through the recursive child check.
            true
        }
    }

    fn is_leaf_type(&self, name: &Name) -> bool {
        matches!(
            self.schema.types.get(name),
            Some(ExtendedType::Scalar(_) | ExtendedType::Enum(_))
        )
    }

    /// Recurses into the merged child selections of a response-name group.
    fn check_children(&mut self, group: &[FieldContext]) {
        let mut merged: Vec<(Name, Vec<executable::Selection>)> = Vec::new();
        for context in group {
            if context.field.selection_set.selections.is_empty() {
                continue;
            }
            let child_type = context.field.definition.ty.inner_named_type().clone();
            match merged.iter_mut().find(|(ty, _)| *ty == child_type) {
                Some((_, selections)) => {
                    selections.extend(context.field.selection_set.selections.iter().cloned());
                }
                None => merged.push((
                    child_type,
                    context.field.selection_set.selections.to_vec(),
                )),
            }
        }
        // Merging across differently-typed composites is what surfaces
        // cross-fragment conflicts; collect under each declared child type.
        for (child_type, selections) in merged {
            self.check_selections(&child_type, &selections);
        }
    }

    fn possible_types(&self, parent_type: &Name) -> Vec<Name> {
        match self.schema.types.get(parent_type) {
            Some(ExtendedType::Object(_)) => vec![parent_type.clone()],
            Some(ExtendedType::Interface(_)) => self
                .implementers
                .get(parent_type)
                .map(|implementers| implementers.objects.iter().cloned().collect())
                .unwrap_or_default(),
            Some(ExtendedType::Union(union)) => {
                union.members.iter().map(|member| member.name.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    fn already_checked(&mut self, a: &FieldContext, b: &FieldContext, check: PairCheck) -> bool {
        let a_key = &*a.field as *const executable::Field as usize;
        let b_key = &*b.field as *const executable::Field as usize;
        let key = if a_key <= b_key {
            (a_key, b_key, check as u8)
        } else {
            (b_key, a_key, check as u8)
        };
        !self.visited.insert(key)
    }

    fn conflict(&mut self, message: String, participants: &[&FieldContext]) {
        let mut positions: Vec<(usize, Location)> = participants
            .iter()
            .filter_map(|context| {
                let span = context.field.name.location()?;
                let range = span.line_column_range(&self.document.sources)?;
                Some((
                    span.offset(),
                    Location {
                        line: range.start.line,
                        column: range.start.column,
                    },
                ))
            })
            .collect();
        positions.sort();
        self.conflicts.push(MergeConflict {
            message,
            locations: positions.into_iter().map(|(_, location)| location).collect(),
        });
    }
}

/// Deep, order-insensitive AST equality of argument lists.
fn arguments_equal(a: &[Node<ast::Argument>], b: &[Node<ast::Argument>]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<&Node<ast::Argument>> = a.iter().collect();
    let mut b_sorted: Vec<&Node<ast::Argument>> = b.iter().collect();
    a_sorted.sort_by(|x, y| x.name.cmp(&y.name));
    b_sorted.sort_by(|x, y| x.name.cmp(&y.name));
    a_sorted
        .iter()
        .zip(b_sorted.iter())
        .all(|(x, y)| x.name == y.name && values_equal(&x.value, &y.value))
}

fn values_equal(a: &ast::Value, b: &ast::Value) -> bool {
    use ast::Value::*;
    match (a, b) {
        (Null, Null) => true,
        (Boolean(a), Boolean(b)) => a == b,
        (Enum(a), Enum(b)) => a == b,
        (Variable(a), Variable(b)) => a == b,
        (String(a), String(b)) => a == b,
        (Int(a), Int(b)) => a.as_str() == b.as_str(),
        (Float(a), Float(b)) => a.as_str() == b.as_str(),
        (List(a), List(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Object(a), Object(b)) => {
            if a.len() != b.len() {
                return false;
            }
            let mut a_sorted: Vec<&(Name, Node<ast::Value>)> = a.iter().collect();
            let mut b_sorted: Vec<&(Name, Node<ast::Value>)> = b.iter().collect();
            a_sorted.sort_by(|x, y| x.0.cmp(&y.0));
            b_sorted.sort_by(|x, y| x.0.cmp(&y.0));
            a_sorted
                .iter()
                .zip(b_sorted.iter())
                .all(|(x, y)| x.0 == y.0 && values_equal(&x.1, &y.1))
        }
        _ => false,
    }
}

/// `@stream` occurrences in a mergeable group must agree on `initialCount`.
fn stream_directives_equal(a: &executable::Field, b: &executable::Field) -> bool {
    let a_stream = a.directives.get(STREAM_DIRECTIVE);
    let b_stream = b.directives.get(STREAM_DIRECTIVE);
    match (a_stream, b_stream) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            let initial = |d: &Node<ast::Directive>| {
                d.specified_argument_by_name("initialCount")
                    .map(|value| value.as_ref().clone())
            };
            match (initial(a), initial(b)) {
                (None, None) => true,
                (Some(x), Some(y)) => values_equal(&x, &y),
                _ => false,
            }
        }
        _ => false,
    }
}

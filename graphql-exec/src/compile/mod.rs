//! Operation compilation.
//!
//! A parsed and validated document is rewritten (fragments inlined,
//! statically excluded branches dropped), its include/defer conditions are
//! assigned bit indices, and its fields are collected per concrete object
//! type into [`Selection`]s and [`SelectionSet`]s. The compiled [`Operation`]
//! is immutable and shared by every request that executes it; per-request
//! state lives in the operation context.
//!
//! ## Identity
//! Selections and selection sets share one monotonic id space per operation.
//! The ids index into `elements_by_id`, which also backs the declaring-set
//! and declaring-operation back-references without cyclic ownership.

use std::collections::HashMap;
use std::sync::atomic;
use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::executable;
use apollo_compiler::name;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::Node;
use apollo_compiler::Schema;
use indexmap::IndexMap;
use parking_lot::RwLock;
use sha1::Digest;

use crate::ensure;
use crate::error::ExecError;
use crate::execute::resolver::FieldResolver;
use crate::execute::resolver::ResolverRegistry;
use crate::internal_error;
use crate::response::JsonMap;
use crate::response::Path;

mod arguments;
mod defer_scope;
mod flags;
mod rewrite;

pub use arguments::ArgumentTemplate;
pub use defer_scope::primary_defer_usage;
pub use defer_scope::DeferCondition;
pub use defer_scope::DeferMask;
pub use defer_scope::DeferUsage;
pub use flags::IncludeCondition;
pub use flags::IncludeConditionSet;
pub use flags::IncludeFlags;
pub(crate) use rewrite::type_condition_applies;
pub(crate) use rewrite::RField;
pub(crate) use rewrite::RSelection;

pub(crate) const TYPENAME_FIELD: Name = name!("__typename");

// Global storage for the counter used to uniquely identify operations.
static NEXT_OPERATION_ID: atomic::AtomicU64 = atomic::AtomicU64::new(1);

/// Process-wide unique id of a compiled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

impl OperationId {
    fn new() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, atomic::Ordering::AcqRel))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Id of a [`Selection`], unique (and monotonic) within its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionId(pub u32);

/// Id of a [`SelectionSet`], sharing the id space of [`SelectionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionSetId(pub u32);

/// How a selection's resolver is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Inlined into the parent's completion step; never suspends.
    Pure,
    /// A pooled resolver task driving the full resolver pipeline.
    Default,
    /// Like `Default`, but no other task may run concurrently.
    Serial,
}

/// The `@stream` parameters attached to a list selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDirective {
    pub label: Option<String>,
    pub initial_count: usize,
    pub if_variable: Option<Name>,
}

impl StreamDirective {
    pub fn is_active(&self, variables: &JsonMap) -> bool {
        match &self.if_variable {
            None => true,
            Some(variable) => variables
                .get(variable.as_str())
                .and_then(|value| value.as_bool())
                .unwrap_or(false),
        }
    }
}

/// One contributing rewritten field node of a selection.
#[derive(Debug, Clone)]
pub(crate) struct FieldNode {
    pub(crate) field: Arc<RField>,
    /// Include-condition bits accumulated along the path within the declaring
    /// selection set, including the field's own conditions.
    pub(crate) flags: IncludeFlags,
    /// The innermost defer scope this node sits in, if any.
    pub(crate) defer: Option<Arc<DeferUsage>>,
}

/// Where a selection's child selections live.
#[derive(Debug, Clone)]
pub(crate) enum ChildSelections {
    /// Leaf type: no children.
    Leaf,
    /// Concrete object type: compiled eagerly.
    Concrete(SelectionSetId),
    /// Interface/union parent: one selection set per possible concrete type,
    /// materialized lazily through [`Operation::selection_set_for`].
    Abstract,
}

/// A compiled, post-merge field selection.
///
/// Sealed once attached to its [`SelectionSet`]; the only sanctioned mutation
/// afterwards is resolver rebinding through a [`SelectionSetOptimizer`],
/// which produces a replacement selection with a fresh id.
#[derive(Debug, Clone)]
pub struct Selection {
    id: SelectionId,
    response_name: Name,
    field_name: Name,
    parent_type: Name,
    definition: Node<ast::FieldDefinition>,
    path: Path,
    pub(crate) nodes: Vec<FieldNode>,
    include: IncludeConditionSet,
    defer_usages: Vec<Arc<DeferUsage>>,
    defer_mask: DeferMask,
    strategy: ExecutionStrategy,
    arguments: ArgumentTemplate,
    resolver: Option<FieldResolver>,
    is_internal: bool,
    stream: Option<StreamDirective>,
    declaring_set: SelectionSetId,
    pub(crate) children: ChildSelections,
}

impl Selection {
    pub fn id(&self) -> SelectionId {
        self.id
    }

    pub fn response_name(&self) -> &Name {
        &self.response_name
    }

    pub fn field_name(&self) -> &Name {
        &self.field_name
    }

    pub fn parent_type(&self) -> &Name {
        &self.parent_type
    }

    pub fn ty(&self) -> &ast::Type {
        &self.definition.ty
    }

    pub fn definition(&self) -> &Node<ast::FieldDefinition> {
        &self.definition
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The syntax nodes preserved by merging, in document order.
    pub fn syntax_nodes(&self) -> impl Iterator<Item = &Node<executable::Field>> {
        self.nodes.iter().map(|node| &node.field.node)
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn arguments(&self) -> &ArgumentTemplate {
        &self.arguments
    }

    pub fn resolver(&self) -> Option<&FieldResolver> {
        self.resolver.as_ref()
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn stream(&self) -> Option<&StreamDirective> {
        self.stream.as_ref()
    }

    pub fn declaring_set(&self) -> SelectionSetId {
        self.declaring_set
    }

    pub fn include_conditions(&self) -> &IncludeConditionSet {
        &self.include
    }

    pub fn defer_usages(&self) -> &[Arc<DeferUsage>] {
        &self.defer_usages
    }

    pub fn defer_mask(&self) -> DeferMask {
        self.defer_mask
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.children, ChildSelections::Leaf)
    }

    pub fn is_included(&self, flags: IncludeFlags) -> bool {
        self.include.is_included(flags)
    }

    /// The outermost active defer usage for the given runtime flags, or
    /// `None` when the field belongs to the initial response.
    pub fn primary_defer_usage(&self, defer_flags: DeferMask) -> Option<Arc<DeferUsage>> {
        primary_defer_usage(&self.defer_usages, defer_flags)
    }

    pub fn is_deferred(&self, defer_flags: DeferMask) -> bool {
        self.primary_defer_usage(defer_flags).is_some()
    }

    /// Clones this selection with a different resolver bound. The replacement
    /// receives a fresh id when registered by the compiler.
    pub fn rebound(&self, resolver: FieldResolver) -> Selection {
        let strategy = match (self.strategy, &resolver) {
            (ExecutionStrategy::Serial, _) => ExecutionStrategy::Serial,
            (_, FieldResolver::Pure(_)) => ExecutionStrategy::Pure,
            (_, FieldResolver::Pipelined(_)) => ExecutionStrategy::Default,
        };
        Selection {
            resolver: Some(resolver),
            strategy,
            ..self.clone()
        }
    }
}

/// An ordered sequence of selections for one concrete object type at one
/// path.
#[derive(Debug)]
pub struct SelectionSet {
    id: SelectionSetId,
    path: Path,
    type_name: Name,
    selections: Vec<Arc<Selection>>,
    is_conditional: bool,
    has_incremental_parts: bool,
}

impl SelectionSet {
    pub fn id(&self) -> SelectionSetId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn type_name(&self) -> &Name {
        &self.type_name
    }

    pub fn selections(&self) -> &[Arc<Selection>] {
        &self.selections
    }

    /// `true` when any child selection carries include conditions.
    pub fn is_conditional(&self) -> bool {
        self.is_conditional
    }

    /// `true` when any child selection has a defer mask or carries stream.
    pub fn has_incremental_parts(&self) -> bool {
        self.has_incremental_parts
    }
}

#[derive(Debug, Clone)]
pub enum OperationElement {
    Selection(Arc<Selection>),
    SelectionSet(Arc<SelectionSet>),
}

impl OperationElement {
    pub fn id(&self) -> u32 {
        match self {
            OperationElement::Selection(selection) => selection.id().0,
            OperationElement::SelectionSet(set) => set.id().0,
        }
    }
}

/// The id-indexed element arena. Grows when per-concrete-type selection sets
/// are materialized lazily.
#[derive(Debug, Default)]
pub(crate) struct ElementStore {
    slots: RwLock<Vec<Option<OperationElement>>>,
}

impl ElementStore {
    fn reserve(&self) -> u32 {
        let mut slots = self.slots.write();
        slots.push(None);
        (slots.len() - 1) as u32
    }

    fn put(&self, id: u32, element: OperationElement) {
        debug_assert_eq!(element.id(), id);
        self.slots.write()[id as usize] = Some(element);
    }

    pub(crate) fn get(&self, id: u32) -> Option<OperationElement> {
        self.slots.read().get(id as usize)?.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }
}

/// Compile-time hook allowed to replace a selection set's selection array.
pub trait SelectionSetOptimizer: Send + Sync {
    fn optimize(&self, plan: &mut SelectionSetPlan);
}

/// The mutable view handed to [`SelectionSetOptimizer`]s before a selection
/// set is sealed. Every selection left in the plan (original or replacement)
/// is registered in `elements_by_id` when the set seals.
pub struct SelectionSetPlan {
    type_name: Name,
    path: Path,
    selections: Vec<Selection>,
}

impl SelectionSetPlan {
    pub fn type_name(&self) -> &Name {
        &self.type_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    pub fn selection(&self, index: usize) -> &Selection {
        &self.selections[index]
    }

    /// Replaces the selection at `index` with a rebound copy using the given
    /// resolver.
    pub fn rebind_resolver(&mut self, index: usize, resolver: FieldResolver) {
        let replacement = self.selections[index].rebound(resolver);
        self.selections[index] = replacement;
    }

    pub fn retain(&mut self, predicate: impl FnMut(&Selection) -> bool) {
        let mut predicate = predicate;
        self.selections.retain(|selection| predicate(selection));
    }
}

/// The compiled artifact: immutable after compilation (modulo lazily cached
/// per-concrete-type selection sets) and freely shared across requests.
pub struct Operation {
    id: OperationId,
    hash: String,
    name: Option<Name>,
    kind: ast::OperationType,
    schema: Arc<Valid<Schema>>,
    document: Arc<Valid<ExecutableDocument>>,
    root_type: Name,
    root_selection_set: SelectionSetId,
    include_conditions: Vec<IncludeCondition>,
    defer_conditions: Vec<DeferCondition>,
    has_incremental_parts: bool,
    store: ElementStore,
    variants: RwLock<HashMap<(u32, Name), SelectionSetId>>,
    registry: Arc<ResolverRegistry>,
    optimizers: Vec<Arc<dyn SelectionSetOptimizer>>,
    include_index: HashMap<(Name, bool), usize>,
    defer_index: HashMap<Option<Name>, usize>,
}

impl Operation {
    /// Compiles one operation of a validated document.
    pub fn compile(
        schema: Arc<Valid<Schema>>,
        document: Arc<Valid<ExecutableDocument>>,
        operation_name: Option<&str>,
        registry: Arc<ResolverRegistry>,
        optimizers: Vec<Arc<dyn SelectionSetOptimizer>>,
    ) -> Result<Arc<Operation>, ExecError> {
        let operation =
            document
                .operations
                .get(operation_name)
                .map_err(|_| ExecError::UnknownOperation {
                    name: operation_name.map(str::to_owned),
                })?;
        let kind = operation.operation_type;
        let root_type = schema
            .root_operation(kind)
            .ok_or_else(|| internal_error!("no root type for {kind} operations"))?
            .clone();

        let rewritten =
            rewrite::Rewriter::new(&schema, &document).rewrite_operation(operation, &root_type)?;

        let mut conditions = ConditionCollector::default();
        conditions.walk(&rewritten.selections)?;

        let hash = {
            let mut hasher = sha1::Sha1::new();
            hasher.update(document.to_string().as_bytes());
            if let Some(name) = &operation.name {
                hasher.update(name.as_bytes());
            }
            hex::encode(hasher.finalize())
        };

        let store = ElementStore::default();
        let compiler = Compiler {
            schema: &schema,
            registry: &registry,
            optimizers: &optimizers,
            store: &store,
            include_index: &conditions.include_index,
            defer_index: &conditions.defer_index,
        };
        let root_sources = vec![CollectInput {
            selections: &rewritten.selections,
            flags: IncludeFlags::EMPTY,
            defer: None,
        }];
        let root_selection_set = compiler.compile_selection_set(
            &root_type,
            &root_sources,
            &Path::empty(),
            kind == ast::OperationType::Mutation,
        )?;

        tracing::debug!(
            operation = operation_name.unwrap_or("(anonymous)"),
            elements = store.len(),
            has_incremental_parts = rewritten.has_incremental_parts,
            "compiled operation"
        );

        Ok(Arc::new(Operation {
            id: OperationId::new(),
            hash,
            name: operation.name.clone(),
            kind,
            schema,
            document,
            root_type,
            root_selection_set,
            include_conditions: conditions.include_conditions,
            defer_conditions: conditions.defer_conditions,
            has_incremental_parts: rewritten.has_incremental_parts,
            store,
            variants: RwLock::new(HashMap::new()),
            registry,
            optimizers,
            include_index: conditions.include_index,
            defer_index: conditions.defer_index,
        }))
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Content hash of the compiled document, stable across processes.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn name(&self) -> Option<&Name> {
        self.name.as_ref()
    }

    pub fn kind(&self) -> ast::OperationType {
        self.kind
    }

    pub fn schema(&self) -> &Arc<Valid<Schema>> {
        &self.schema
    }

    pub fn document(&self) -> &Arc<Valid<ExecutableDocument>> {
        &self.document
    }

    pub fn root_type(&self) -> &Name {
        &self.root_type
    }

    pub fn has_incremental_parts(&self) -> bool {
        self.has_incremental_parts
    }

    pub fn include_conditions(&self) -> &[IncludeCondition] {
        &self.include_conditions
    }

    pub fn defer_conditions(&self) -> &[DeferCondition] {
        &self.defer_conditions
    }

    /// Evaluates all include conditions against the request variables.
    pub fn include_flags(&self, variables: &JsonMap) -> IncludeFlags {
        self.include_conditions
            .iter()
            .enumerate()
            .fold(IncludeFlags::EMPTY, |flags, (index, condition)| {
                if condition.evaluate(variables) {
                    flags.with_bit(index)
                } else {
                    flags
                }
            })
    }

    /// Evaluates all defer conditions against the request variables.
    pub fn defer_flags(&self, variables: &JsonMap) -> DeferMask {
        self.defer_conditions
            .iter()
            .enumerate()
            .fold(DeferMask::EMPTY, |flags, (index, condition)| {
                if condition.evaluate(variables) {
                    flags.with_bit(index)
                } else {
                    flags
                }
            })
    }

    pub fn element(&self, id: u32) -> Option<OperationElement> {
        self.store.get(id)
    }

    pub fn element_count(&self) -> usize {
        self.store.len()
    }

    pub fn root_selection_set(&self) -> Result<Arc<SelectionSet>, ExecError> {
        self.expect_selection_set(self.root_selection_set)
    }

    pub(crate) fn expect_selection_set(
        &self,
        id: SelectionSetId,
    ) -> Result<Arc<SelectionSet>, ExecError> {
        match self.store.get(id.0) {
            Some(OperationElement::SelectionSet(set)) => Ok(set),
            _ => Err(internal_error!("selection set {} is not registered", id.0)),
        }
    }

    /// The child selection set of `selection` for one concrete object type.
    ///
    /// Sets under abstract parents are compiled on first access and cached.
    pub fn selection_set_for(
        &self,
        selection: &Selection,
        concrete_type: &Name,
    ) -> Result<Arc<SelectionSet>, ExecError> {
        match &selection.children {
            ChildSelections::Leaf => Err(internal_error!(
                "selection \"{}\" has no child selections",
                selection.response_name()
            )),
            ChildSelections::Concrete(id) => self.expect_selection_set(*id),
            ChildSelections::Abstract => {
                let key = (selection.id().0, concrete_type.clone());
                if let Some(id) = self.variants.read().get(&key) {
                    return self.expect_selection_set(*id);
                }
                match self.schema.types.get(concrete_type) {
                    Some(ExtendedType::Object(_)) => {}
                    _ => {
                        return Err(ExecError::UnknownType {
                            name: concrete_type.clone(),
                        })
                    }
                }
                let compiler = Compiler {
                    schema: &self.schema,
                    registry: &self.registry,
                    optimizers: &self.optimizers,
                    store: &self.store,
                    include_index: &self.include_index,
                    defer_index: &self.defer_index,
                };
                let sources: Vec<CollectInput<'_>> = selection
                    .nodes
                    .iter()
                    .map(|node| CollectInput {
                        selections: &node.field.children,
                        flags: IncludeFlags::EMPTY,
                        defer: node.defer.clone(),
                    })
                    .collect();
                let id = compiler.compile_selection_set(
                    concrete_type,
                    &sources,
                    selection.path(),
                    false,
                )?;
                let mut variants = self.variants.write();
                let id = *variants.entry(key).or_insert(id);
                self.expect_selection_set(id)
            }
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("root_type", &self.root_type)
            .field("has_incremental_parts", &self.has_incremental_parts)
            .field("elements", &self.store.len())
            .finish_non_exhaustive()
    }
}

/// Stage 2: discover include and defer conditions in one walk, assigning
/// stable bit indices. Both collections are capped at 64.
#[derive(Default)]
struct ConditionCollector {
    include_conditions: Vec<IncludeCondition>,
    defer_conditions: Vec<DeferCondition>,
    include_index: HashMap<(Name, bool), usize>,
    defer_index: HashMap<Option<Name>, usize>,
}

impl ConditionCollector {
    fn walk(&mut self, selections: &[RSelection]) -> Result<(), ExecError> {
        for selection in selections {
            match selection {
                RSelection::Field(field) => {
                    self.collect_includes(&field.node.directives)?;
                    self.walk(&field.children)?;
                }
                RSelection::Inline(inline) => {
                    self.collect_includes(&inline.directives)?;
                    if let Some(spec) = rewrite::defer_spec(&inline.directives) {
                        self.defer_condition(spec.variable)?;
                    }
                    self.walk(&inline.children)?;
                }
            }
        }
        Ok(())
    }

    fn collect_includes(&mut self, directives: &executable::DirectiveList) -> Result<(), ExecError> {
        for (variable, negated) in rewrite::variable_conditions(directives) {
            let key = (variable.clone(), negated);
            if self.include_index.contains_key(&key) {
                continue;
            }
            if self.include_conditions.len() >= 64 {
                return Err(ExecError::TooManyIncludeConditions);
            }
            self.include_index
                .insert(key, self.include_conditions.len());
            self.include_conditions
                .push(IncludeCondition { variable, negated });
        }
        Ok(())
    }

    fn defer_condition(&mut self, variable: Option<Name>) -> Result<(), ExecError> {
        if self.defer_index.contains_key(&variable) {
            return Ok(());
        }
        if self.defer_conditions.len() >= 64 {
            return Err(ExecError::TooManyDeferConditions);
        }
        self.defer_index
            .insert(variable.clone(), self.defer_conditions.len());
        self.defer_conditions.push(DeferCondition { variable });
        Ok(())
    }
}

/// One contributor to a field collection: a rewritten selection list plus the
/// ambient include flags and defer scope it is reached through.
struct CollectInput<'a> {
    selections: &'a [RSelection],
    flags: IncludeFlags,
    defer: Option<Arc<DeferUsage>>,
}

/// Stages 3 and 4, shared by the initial compilation and lazy
/// per-concrete-type materialization.
struct Compiler<'a> {
    schema: &'a Arc<Valid<Schema>>,
    registry: &'a Arc<ResolverRegistry>,
    optimizers: &'a [Arc<dyn SelectionSetOptimizer>],
    store: &'a ElementStore,
    include_index: &'a HashMap<(Name, bool), usize>,
    defer_index: &'a HashMap<Option<Name>, usize>,
}

impl Compiler<'_> {
    fn compile_selection_set(
        &self,
        type_name: &Name,
        sources: &[CollectInput<'_>],
        path: &Path,
        force_serial: bool,
    ) -> Result<SelectionSetId, ExecError> {
        let set_id = SelectionSetId(self.store.reserve());

        let mut grouped: IndexMap<Name, Vec<FieldNode>> = IndexMap::new();
        for source in sources {
            self.collect_fields(
                type_name,
                source.selections,
                source.flags,
                source.defer.clone(),
                &mut grouped,
            )?;
        }

        let mut plan = SelectionSetPlan {
            type_name: type_name.clone(),
            path: path.clone(),
            selections: Vec::with_capacity(grouped.len()),
        };
        for (response_name, nodes) in grouped {
            let selection =
                self.compile_selection(type_name, response_name, nodes, path, set_id, force_serial)?;
            plan.selections.push(selection);
        }

        for optimizer in self.optimizers {
            optimizer.optimize(&mut plan);
        }

        let mut selections = Vec::with_capacity(plan.selections.len());
        for mut selection in plan.selections {
            let id = SelectionId(self.store.reserve());
            selection.id = id;
            selection.declaring_set = set_id;
            let selection = Arc::new(selection);
            self.store
                .put(id.0, OperationElement::Selection(selection.clone()));
            selections.push(selection);
        }

        let is_conditional = selections
            .iter()
            .any(|selection| !selection.include_conditions().is_always_included());
        let has_incremental_parts = selections.iter().any(|selection| {
            !selection.defer_usages().is_empty() || selection.stream().is_some()
        });
        let set = Arc::new(SelectionSet {
            id: set_id,
            path: path.clone(),
            type_name: type_name.clone(),
            selections,
            is_conditional,
            has_incremental_parts,
        });
        self.store
            .put(set_id.0, OperationElement::SelectionSet(set));
        Ok(set_id)
    }

    /// Stage 3: group contributing field nodes by response name, accumulating
    /// include bits and defer scopes through inline fragments.
    fn collect_fields(
        &self,
        type_name: &Name,
        selections: &[RSelection],
        flags: IncludeFlags,
        defer: Option<Arc<DeferUsage>>,
        grouped: &mut IndexMap<Name, Vec<FieldNode>>,
    ) -> Result<(), ExecError> {
        for selection in selections {
            match selection {
                RSelection::Field(field) => {
                    let field_flags = self.condition_bits(&field.node.directives, flags)?;
                    grouped
                        .entry(field.node.response_key().clone())
                        .or_default()
                        .push(FieldNode {
                            field: field.clone(),
                            flags: field_flags,
                            defer: defer.clone(),
                        });
                }
                RSelection::Inline(inline) => {
                    if let Some(condition) = &inline.type_condition {
                        if !type_condition_applies(self.schema, condition, type_name) {
                            continue;
                        }
                    }
                    let inline_flags = self.condition_bits(&inline.directives, flags)?;
                    let inline_defer = match rewrite::defer_spec(&inline.directives) {
                        Some(spec) => {
                            let index =
                                self.defer_index.get(&spec.variable).copied().ok_or_else(
                                    || internal_error!("defer condition was not collected"),
                                )?;
                            Some(DeferUsage::new(spec.label, index, defer.clone()))
                        }
                        None => defer.clone(),
                    };
                    self.collect_fields(
                        type_name,
                        &inline.children,
                        inline_flags,
                        inline_defer,
                        grouped,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn condition_bits(
        &self,
        directives: &executable::DirectiveList,
        base: IncludeFlags,
    ) -> Result<IncludeFlags, ExecError> {
        let mut flags = base;
        for (variable, negated) in rewrite::variable_conditions(directives) {
            let index = self
                .include_index
                .get(&(variable, negated))
                .copied()
                .ok_or_else(|| internal_error!("include condition was not collected"))?;
            flags = flags.with_bit(index);
        }
        Ok(flags)
    }

    /// Stage 4: merge the contributing nodes of one response name into a
    /// sealed selection.
    fn compile_selection(
        &self,
        parent_type: &Name,
        response_name: Name,
        nodes: Vec<FieldNode>,
        parent_path: &Path,
        declaring_set: SelectionSetId,
        force_serial: bool,
    ) -> Result<Selection, ExecError> {
        let field_name = nodes[0].field.node.name.clone();
        ensure!(
            nodes
                .iter()
                .all(|node| node.field.node.name == field_name),
            "selection-merging should have rejected differing field names for \"{response_name}\"",
        );

        let definition = if field_name == TYPENAME_FIELD {
            nodes[0].field.node.definition.clone()
        } else {
            self.schema
                .type_field(parent_type, &field_name)
                .map_err(|_| ExecError::FieldDoesNotExistOnType {
                    field: field_name.clone(),
                    ty: parent_type.clone(),
                })?
                .node
                .clone()
        };

        let include = IncludeConditionSet::from_patterns(
            nodes.iter().map(|node| node.flags).collect(),
        );

        // If any contributing node is non-deferred the field is delivered
        // with the initial response; otherwise keep only outermost usages.
        let defer_usages: Vec<Arc<DeferUsage>> =
            if nodes.iter().any(|node| node.defer.is_none()) {
                Vec::new()
            } else {
                let mut usages: Vec<Arc<DeferUsage>> = Vec::new();
                for usage in nodes.iter().filter_map(|node| node.defer.clone()) {
                    if !usages.iter().any(|existing| Arc::ptr_eq(existing, &usage)) {
                        usages.push(usage);
                    }
                }
                usages
                    .iter()
                    .filter(|usage| !usages.iter().any(|other| other.is_ancestor_of(usage)))
                    .cloned()
                    .collect()
            };
        let defer_mask = defer_usages
            .iter()
            .fold(DeferMask::EMPTY, |mask, usage| {
                mask.with_bit(usage.condition_index)
            });

        let is_internal = nodes
            .iter()
            .all(|node| rewrite::is_internal(&node.field.node.directives));
        let stream = rewrite::stream_spec(&nodes[0].field.node.directives).map(|spec| {
            StreamDirective {
                label: spec.label,
                initial_count: spec.initial_count,
                if_variable: spec.variable,
            }
        });

        let arguments = ArgumentTemplate::build(&definition, &nodes[0].field.node.arguments)
            .unwrap_or_else(|message| ArgumentTemplate::invalid(message));

        let resolver = self
            .registry
            .get(parent_type.as_str(), field_name.as_str())
            .cloned();
        let strategy = if force_serial
            || self
                .registry
                .is_serial(parent_type.as_str(), field_name.as_str())
        {
            ExecutionStrategy::Serial
        } else if matches!(resolver, Some(FieldResolver::Pure(_))) {
            ExecutionStrategy::Pure
        } else {
            ExecutionStrategy::Default
        };

        let path = parent_path.join_field(&response_name);
        let children = match self.schema.types.get(definition.ty.inner_named_type()) {
            None => {
                return Err(ExecError::UnknownType {
                    name: definition.ty.inner_named_type().clone(),
                })
            }
            Some(ExtendedType::Scalar(_) | ExtendedType::Enum(_)) => ChildSelections::Leaf,
            Some(ExtendedType::Object(_)) => {
                let sources: Vec<CollectInput<'_>> = nodes
                    .iter()
                    .map(|node| CollectInput {
                        selections: &node.field.children,
                        flags: IncludeFlags::EMPTY,
                        defer: node.defer.clone(),
                    })
                    .collect();
                let child_id = self.compile_selection_set(
                    definition.ty.inner_named_type(),
                    &sources,
                    &path,
                    false,
                )?;
                ChildSelections::Concrete(child_id)
            }
            Some(ExtendedType::Interface(_) | ExtendedType::Union(_)) => ChildSelections::Abstract,
            Some(ExtendedType::InputObject(_)) => {
                return Err(internal_error!(
                    "field \"{field_name}\" has input object type \"{}\"",
                    definition.ty.inner_named_type()
                ))
            }
        };

        Ok(Selection {
            // Assigned when the declaring set registers its entries.
            id: SelectionId(u32::MAX),
            response_name,
            field_name,
            parent_type: parent_type.clone(),
            definition,
            path,
            nodes,
            include,
            defer_usages,
            defer_mask,
            strategy,
            arguments,
            resolver,
            is_internal,
            stream,
            declaring_set,
            children,
        })
    }
}

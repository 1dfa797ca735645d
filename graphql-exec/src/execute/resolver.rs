//! Resolver callables and the values they produce.
//!
//! Resolvers are captured at compile time, one handle per selection, as
//! enum-tagged variants: a pure resolver runs inline under its parent's
//! completion step and must not suspend; a pipelined resolver is an async
//! future driven by a resolver task. Fields without a registered resolver
//! fall back to property lookup on JSON-backed parent objects.

use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use apollo_compiler::Name;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::dispatch::BatchDispatcher;
use crate::response::JsonMap;
use crate::response::JsonValue;
use crate::response::Path;

/// The error a resolver reports; recorded as a field error at the
/// selection's path.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverError {
    pub message: String,
}

impl ResolverError {
    pub fn new(message: impl Into<String>) -> Self {
        ResolverError {
            message: message.into(),
        }
    }
}

impl From<&str> for ResolverError {
    fn from(message: &str) -> Self {
        ResolverError::new(message)
    }
}

impl From<String> for ResolverError {
    fn from(message: String) -> Self {
        ResolverError { message }
    }
}

/// A composite value flowing through execution: the concrete object type
/// name plus either JSON data or an opaque application object.
#[derive(Clone)]
pub struct ObjectValue {
    type_name: Name,
    data: ObjectData,
}

#[derive(Clone)]
enum ObjectData {
    Json(Arc<JsonMap>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl ObjectValue {
    pub fn json(type_name: Name, map: JsonMap) -> Self {
        ObjectValue {
            type_name,
            data: ObjectData::Json(Arc::new(map)),
        }
    }

    pub fn opaque<T: Any + Send + Sync>(type_name: Name, value: T) -> Self {
        ObjectValue {
            type_name,
            data: ObjectData::Opaque(Arc::new(value)),
        }
    }

    pub fn type_name(&self) -> &Name {
        &self.type_name
    }

    pub fn as_json(&self) -> Option<&JsonMap> {
        match &self.data {
            ObjectData::Json(map) => Some(map),
            ObjectData::Opaque(_) => None,
        }
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        match &self.data {
            ObjectData::Json(_) => None,
            ObjectData::Opaque(value) => value.downcast_ref(),
        }
    }
}

impl std::fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// The successful return of a resolver.
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    Null,
    Leaf(JsonValue),
    Object(ObjectValue),
    List(Vec<ResolvedValue>),
}

impl ResolvedValue {
    pub fn null() -> Self {
        ResolvedValue::Null
    }

    pub fn leaf(value: impl Into<JsonValue>) -> Self {
        ResolvedValue::Leaf(value.into())
    }

    pub fn object(value: ObjectValue) -> Self {
        ResolvedValue::Object(value)
    }

    pub fn list(items: impl IntoIterator<Item = ResolvedValue>) -> Self {
        ResolvedValue::List(items.into_iter().collect())
    }
}

/// The lightweight context handed to pure resolvers: coerced arguments, the
/// parent object, and the element path. Pure resolvers must not suspend and
/// must not enqueue further work.
pub struct PureResolverContext<'a> {
    pub(crate) parent: &'a ObjectValue,
    pub(crate) arguments: &'a JsonMap,
    pub(crate) path: &'a Path,
}

impl PureResolverContext<'_> {
    pub fn parent(&self) -> &ObjectValue {
        self.parent
    }

    pub fn arguments(&self) -> &JsonMap {
        self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&JsonValue> {
        self.arguments.get(name)
    }

    pub fn path(&self) -> &Path {
        self.path
    }
}

/// The full context handed to pipelined resolvers.
pub struct ResolverContext {
    pub(crate) parent: ObjectValue,
    pub(crate) arguments: Arc<JsonMap>,
    pub(crate) path: Path,
    pub(crate) services: Arc<dyn Any + Send + Sync>,
    pub(crate) dispatcher: Arc<BatchDispatcher>,
    pub(crate) cancellation: CancellationToken,
}

impl ResolverContext {
    pub fn parent(&self) -> &ObjectValue {
        &self.parent
    }

    pub fn arguments(&self) -> &JsonMap {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&JsonValue> {
        self.arguments.get(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The request's scoped service provider, opaque to the core.
    pub fn services<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.services.downcast_ref()
    }

    /// The request's batch dispatcher, for data-loader helpers.
    pub fn dispatcher(&self) -> &Arc<BatchDispatcher> {
        &self.dispatcher
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

pub type PureResolverFn =
    dyn for<'a> Fn(&PureResolverContext<'a>) -> Result<ResolvedValue, ResolverError> + Send + Sync;

pub type PipelineResolverFn = dyn Fn(ResolverContext) -> BoxFuture<'static, Result<ResolvedValue, ResolverError>>
    + Send
    + Sync;

/// The enum-tagged resolver handle captured on a selection.
#[derive(Clone)]
pub enum FieldResolver {
    Pure(Arc<PureResolverFn>),
    Pipelined(Arc<PipelineResolverFn>),
}

impl std::fmt::Debug for FieldResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldResolver::Pure(_) => f.write_str("FieldResolver::Pure"),
            FieldResolver::Pipelined(_) => f.write_str("FieldResolver::Pipelined"),
        }
    }
}

/// Registered resolvers, keyed by `(type name, field name)`.
#[derive(Default)]
pub struct ResolverRegistry {
    fields: HashMap<String, HashMap<String, FieldResolver>>,
    serial: HashSet<(String, String)>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pure resolver: synchronous, suspension-free, eligible for
    /// inlining into the parent's completion step.
    pub fn register_pure(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: impl for<'a> Fn(&PureResolverContext<'a>) -> Result<ResolvedValue, ResolverError>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        self.fields
            .entry(type_name.into())
            .or_default()
            .insert(field_name.into(), FieldResolver::Pure(Arc::new(resolver)));
        self
    }

    /// Registers a pipelined (async) resolver.
    pub fn register<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: F,
    ) -> &mut Self
    where
        F: Fn(ResolverContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResolvedValue, ResolverError>> + Send + 'static,
    {
        self.fields.entry(type_name.into()).or_default().insert(
            field_name.into(),
            FieldResolver::Pipelined(Arc::new(move |ctx| resolver(ctx).boxed())),
        );
        self
    }

    /// Declares a field non-parallel: it executes in the serial lane.
    pub fn mark_serial(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
    ) -> &mut Self {
        self.serial.insert((type_name.into(), field_name.into()));
        self
    }

    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&FieldResolver> {
        self.fields.get(type_name)?.get(field_name)
    }

    pub fn is_serial(&self, type_name: &str, field_name: &str) -> bool {
        self.serial
            .contains(&(type_name.to_owned(), field_name.to_owned()))
    }
}

/// The default resolver: property lookup on JSON-backed parents.
pub(crate) fn default_resolve(
    parent: &ObjectValue,
    field_name: &Name,
) -> Result<ResolvedValue, ResolverError> {
    match parent.as_json() {
        Some(map) => Ok(match map.get(field_name.as_str()) {
            None | Some(JsonValue::Null) => ResolvedValue::Null,
            Some(value) => ResolvedValue::Leaf(value.clone()),
        }),
        None => Err(ResolverError::new(format!(
            "No resolver is defined for field \"{}.{}\".",
            parent.type_name(),
            field_name
        ))),
    }
}

//! GraphQL response types for the execution core.
//!
//! A request produces an [`ExecutionResult`]: a single [`OperationResult`], an
//! [`OperationResultBatch`] for variable batching, or a [`ResponseStream`]
//! whose first element is the initial payload and whose subsequent elements
//! are incremental-delivery payloads.

use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use apollo_compiler::Name;
use futures::stream::BoxStream;
use futures::Stream;
use itertools::Itertools;
use serde::ser::SerializeMap;
use serde::Serialize;
use serde::Serializer;

mod json;

pub use json::JsonWriter;
pub use json::JsonWriterOptions;
pub use json::NullOmission;
pub use json::DEFAULT_MAX_DEPTH;

pub type JsonValue = serde_json_bytes::Value;
pub type JsonMap = serde_json_bytes::Map<serde_json_bytes::ByteString, serde_json_bytes::Value>;

/// Error `extensions.code` values reported by the runtime.
pub mod codes {
    pub const RESOLVER_ERROR: &str = "RESOLVER_ERROR";
    pub const NON_NULL_VIOLATION: &str = "NON_NULL_VIOLATION";
    pub const ARGUMENT_COERCION: &str = "ARGUMENT_COERCION";
}

/// A line/column pair into the original operation document, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

/// One segment of a response path: a response name or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(Name),
    Index(usize),
}

impl PartialOrd for PathSegment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathSegment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PathSegment::Field(a), PathSegment::Field(b)) => a.cmp(b),
            (PathSegment::Index(a), PathSegment::Index(b)) => a.cmp(b),
            // Indices stringify as digits which sort before letters, so a
            // lexicographic ordering puts them first.
            (PathSegment::Index(_), PathSegment::Field(_)) => Ordering::Less,
            (PathSegment::Field(_), PathSegment::Index(_)) => Ordering::Greater,
        }
    }
}

impl Serialize for PathSegment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSegment::Field(name) => serializer.serialize_str(name.as_str()),
            PathSegment::Index(index) => serializer.serialize_u64(*index as u64),
        }
    }
}

/// A response path from the root, using response names and list indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Path(pub Vec<PathSegment>);

impl Path {
    pub fn empty() -> Self {
        Path(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns a new path with `segment` appended.
    pub fn join(&self, segment: PathSegment) -> Self {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.extend(self.0.iter().cloned());
        segments.push(segment);
        Path(segments)
    }

    pub fn join_field(&self, name: &Name) -> Self {
        self.join(PathSegment::Field(name.clone()))
    }

    pub fn join_index(&self, index: usize) -> Self {
        self.join(PathSegment::Index(index))
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                PathSegment::Field(name) => write!(f, "/{name}")?,
                PathSegment::Index(index) => write!(f, "/{index}")?,
            }
        }
        Ok(())
    }
}

/// A field error recorded during execution, in the response `errors` shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Error {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    #[serde(skip_serializing_if = "JsonMap::is_empty")]
    pub extensions: JsonMap,
}

impl Error {
    pub fn new(message: impl Into<String>) -> Self {
        Error {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: JsonMap::new(),
        }
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.extensions
            .insert("code", JsonValue::String(code.into()));
        self
    }

    /// Orders errors for serialization: null paths first, then lexicographic
    /// on path segments.
    pub(crate) fn compare_by_path(&self, other: &Self) -> Ordering {
        match (&self.path, &other.path) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

/// Announces a forthcoming deferred branch in the initial (or an incremental)
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingResult {
    pub id: u32,
    pub path: Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Delivered data for one `@defer` branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncrementalObjectResult {
    pub id: u32,
    #[serde(rename = "subPath", skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,
}

/// Delivered items for one `@stream` branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncrementalListResult {
    pub id: u32,
    pub items: Vec<JsonValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IncrementalResult {
    Object(IncrementalObjectResult),
    List(IncrementalListResult),
}

impl IncrementalResult {
    pub fn id(&self) -> u32 {
        match self {
            IncrementalResult::Object(result) => result.id,
            IncrementalResult::List(result) => result.id,
        }
    }
}

/// Announces the end of a deferred branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedResult {
    pub id: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,
}

/// One payload of a (possibly streaming) GraphQL response.
///
/// `data: None` omits the `data` property entirely (incremental payloads);
/// `data: Some(JsonValue::Null)` serializes `"data": null`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationResult {
    pub data: Option<JsonValue>,
    pub errors: Vec<Error>,
    pub extensions: Option<JsonMap>,
    pub pending: Vec<PendingResult>,
    pub incremental: Vec<IncrementalResult>,
    pub completed: Vec<CompletedResult>,
    pub has_next: Option<bool>,
}

impl OperationResult {
    pub fn is_incremental(&self) -> bool {
        !self.pending.is_empty() || !self.incremental.is_empty() || !self.completed.is_empty()
    }

    /// Errors in serialization order: null paths first, then lexicographic.
    pub fn sorted_errors(&self) -> Vec<&Error> {
        self.errors
            .iter()
            .sorted_by(|a, b| a.compare_by_path(b))
            .collect()
    }

    /// Serializes this payload to UTF-8 JSON with the given writer options.
    pub fn to_json_bytes(
        &self,
        options: &JsonWriterOptions,
    ) -> Result<Vec<u8>, crate::error::ExecError> {
        let mut writer = JsonWriter::new(options.clone());
        writer.write_result(self)?;
        Ok(writer.into_bytes())
    }
}

impl Serialize for OperationResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(data) = &self.data {
            map.serialize_entry("data", data)?;
        }
        if !self.errors.is_empty() {
            map.serialize_entry("errors", &self.sorted_errors())?;
        }
        if let Some(extensions) = &self.extensions {
            if !extensions.is_empty() {
                map.serialize_entry("extensions", extensions)?;
            }
        }
        if !self.pending.is_empty() {
            map.serialize_entry("pending", &self.pending)?;
        }
        if !self.incremental.is_empty() {
            map.serialize_entry("incremental", &self.incremental)?;
        }
        if !self.completed.is_empty() {
            map.serialize_entry("completed", &self.completed)?;
        }
        if let Some(has_next) = self.has_next {
            map.serialize_entry("hasNext", &has_next)?;
        }
        map.end()
    }
}

/// The results of a variable-batching request, in variable-set index order.
#[derive(Debug, Default, Serialize)]
pub struct OperationResultBatch {
    pub results: Vec<OperationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResultKind {
    SubscriptionResult,
    DeferredResult,
    BatchResult,
}

/// A stream of [`OperationResult`]s. The first element is always the initial
/// response; subsequent elements are incremental payloads.
pub struct ResponseStream {
    kind: ExecutionResultKind,
    inner: BoxStream<'static, OperationResult>,
}

impl ResponseStream {
    pub fn new(kind: ExecutionResultKind, inner: BoxStream<'static, OperationResult>) -> Self {
        ResponseStream { kind, inner }
    }

    pub fn kind(&self) -> ExecutionResultKind {
        self.kind
    }
}

impl Stream for ResponseStream {
    type Item = OperationResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// What the executor hands back to the transport.
#[derive(Debug)]
pub enum ExecutionResult {
    Single(OperationResult),
    Batch(OperationResultBatch),
    Stream(ResponseStream),
}

impl ExecutionResult {
    /// Unwraps a single-payload result. Panics on other variants; intended for
    /// tests and callers that already checked the operation shape.
    pub fn expect_single(self) -> OperationResult {
        match self {
            ExecutionResult::Single(result) => result,
            other => panic!("expected a single operation result, got {other:?}"),
        }
    }

    pub fn expect_batch(self) -> OperationResultBatch {
        match self {
            ExecutionResult::Batch(batch) => batch,
            other => panic!("expected a batch result, got {other:?}"),
        }
    }

    pub fn expect_stream(self) -> ResponseStream {
        match self {
            ExecutionResult::Stream(stream) => stream,
            other => panic!("expected a response stream, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::name;

    use super::*;

    #[test]
    fn error_sort_puts_null_paths_first() {
        let a = Error::new("a").with_path(Path::empty().join_field(&name!("user")));
        let b = Error::new("b");
        let c = Error::new("c").with_path(Path::empty().join_field(&name!("account")));
        let result = OperationResult {
            errors: vec![a, b, c],
            ..Default::default()
        };
        let sorted: Vec<&str> = result
            .sorted_errors()
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(sorted, ["b", "c", "a"]);
    }

    #[test]
    fn path_segments_sort_indices_before_fields() {
        let by_index = Path::empty().join_index(0);
        let by_field = Path::empty().join_field(&name!("a"));
        assert!(by_index < by_field);
    }

    #[test]
    fn path_display_is_slash_separated() {
        let path = Path::empty()
            .join_field(&name!("user"))
            .join_index(3)
            .join_field(&name!("name"));
        assert_eq!(path.to_string(), "/user/3/name");
    }
}

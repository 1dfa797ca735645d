use std::sync::Arc;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Schema;
use graphql_exec::Operation;
use graphql_exec::ResolverRegistry;
use serde_json_bytes::Value;

pub const DEFER_DIRECTIVES: &str = r#"
directive @defer(label: String, if: Boolean! = true) on FRAGMENT_SPREAD | INLINE_FRAGMENT
directive @stream(label: String, initialCount: Int! = 0, if: Boolean! = true) on FIELD
"#;

pub fn compile(sdl: &str, query: &str, registry: ResolverRegistry) -> Arc<Operation> {
    let schema =
        Arc::new(Schema::parse_and_validate(sdl, "schema.graphql").expect("valid schema"));
    let document = Arc::new(
        ExecutableDocument::parse_and_validate(&schema, query, "query.graphql")
            .expect("valid document"),
    );
    Operation::compile(schema, document, None, Arc::new(registry), Vec::new()).expect("compiles")
}

/// Unwraps a `json!` object literal into a map.
pub fn object(value: Value) -> serde_json_bytes::Map<serde_json_bytes::ByteString, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other:?}"),
    }
}

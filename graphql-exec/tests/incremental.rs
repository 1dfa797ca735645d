use apollo_compiler::name;
use futures::StreamExt;
use graphql_exec::response::ExecutionResultKind;
use graphql_exec::response::IncrementalResult;
use graphql_exec::response::OperationResult;
use graphql_exec::response::Path;
use graphql_exec::Executor;
use graphql_exec::ObjectValue;
use graphql_exec::OperationRequest;
use graphql_exec::ResolverRegistry;
use pretty_assertions::assert_eq;
use serde_json_bytes::json;

use crate::helpers::compile;
use crate::helpers::object;
use crate::helpers::DEFER_DIRECTIVES;

fn user_schema() -> String {
    format!(
        r#"
        {DEFER_DIRECTIVES}

        type Query {{
          me: User
          tags: [String!]
        }}

        type User {{
          name: String!
          email: String
          bio: String
        }}
        "#
    )
}

fn json_root(value: serde_json_bytes::Value) -> ObjectValue {
    ObjectValue::json(name!("Query"), object(value))
}

async fn collect_stream(
    operation: std::sync::Arc<graphql_exec::Operation>,
    root: serde_json_bytes::Value,
) -> Vec<OperationResult> {
    let stream = Executor::default()
        .execute(operation, OperationRequest::new(json_root(root)))
        .await
        .expect("executes")
        .expect_stream();
    assert_eq!(stream.kind(), ExecutionResultKind::DeferredResult);
    stream.collect().await
}

#[tokio::test]
async fn deferred_fragment_delivers_incrementally() {
    let operation = compile(
        &user_schema(),
        "{ me { name ... @defer { email } } }",
        ResolverRegistry::new(),
    );
    let payloads = collect_stream(
        operation,
        json!({ "me": { "name": "Ada", "email": "a@x" } }),
    )
    .await;
    assert_eq!(payloads.len(), 2);

    let initial = &payloads[0];
    assert_eq!(initial.data, Some(json!({ "me": { "name": "Ada" } })));
    assert_eq!(initial.pending.len(), 1);
    assert_eq!(initial.pending[0].id, 1);
    assert_eq!(initial.pending[0].path, Path::empty().join_field(&name!("me")));
    assert_eq!(initial.has_next, Some(true));
    assert!(initial.incremental.is_empty());

    let increment = &payloads[1];
    assert!(increment.data.is_none());
    assert_eq!(increment.incremental.len(), 1);
    let IncrementalResult::Object(delivered) = &increment.incremental[0] else {
        panic!("expected an object increment");
    };
    assert_eq!(delivered.id, 1);
    assert_eq!(delivered.data, Some(json!({ "email": "a@x" })));
    assert_eq!(increment.completed.len(), 1);
    assert_eq!(increment.completed[0].id, 1);
    assert_eq!(increment.has_next, Some(false));
}

#[tokio::test]
async fn disabled_defer_collapses_into_a_single_payload() {
    // A literal `if: false` compiles the defer away entirely.
    let operation = compile(
        &user_schema(),
        "{ me { name ... @defer(if: false) { email } } }",
        ResolverRegistry::new(),
    );
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({ "me": { "name": "Ada", "email": "a@x" } }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(
        result.data,
        Some(json!({ "me": { "name": "Ada", "email": "a@x" } }))
    );
    assert!(!result.is_incremental());
}

#[tokio::test]
async fn runtime_disabled_defer_keeps_fields_in_the_initial_payload() {
    let operation = compile(
        &user_schema(),
        "query($slow: Boolean!) { me { name ... @defer(if: $slow) { email } } }",
        ResolverRegistry::new(),
    );
    let stream = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({ "me": { "name": "Ada", "email": "a@x" } })))
                .with_variables(object(json!({ "slow": false }))),
        )
        .await
        .expect("executes")
        .expect_stream();
    let payloads: Vec<OperationResult> = stream.collect().await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        payloads[0].data,
        Some(json!({ "me": { "name": "Ada", "email": "a@x" } }))
    );
    assert!(payloads[0].pending.is_empty());
    assert!(payloads[0].has_next.is_none());
}

#[tokio::test]
async fn nested_defer_delivers_parent_before_child() {
    let operation = compile(
        &user_schema(),
        r#"
        {
          me {
            name
            ... @defer(label: "outer") {
              email
              ... @defer(label: "inner") { bio }
            }
          }
        }
        "#,
        ResolverRegistry::new(),
    );
    let payloads = collect_stream(
        operation,
        json!({ "me": { "name": "Ada", "email": "a@x", "bio": "b" } }),
    )
    .await;
    assert_eq!(payloads.len(), 3);

    // Both branches are announced up front.
    let initial = &payloads[0];
    assert_eq!(initial.data, Some(json!({ "me": { "name": "Ada" } })));
    let labels: Vec<Option<&str>> = initial
        .pending
        .iter()
        .map(|pending| pending.label.as_deref())
        .collect();
    assert_eq!(labels, [Some("outer"), Some("inner")]);
    assert_eq!(initial.has_next, Some(true));

    // The outer increment appears first; the inner increment follows.
    let outer = &payloads[1];
    let IncrementalResult::Object(outer_delivered) = &outer.incremental[0] else {
        panic!("expected an object increment");
    };
    assert_eq!(outer_delivered.data, Some(json!({ "email": "a@x" })));
    assert_eq!(outer.has_next, Some(true));

    let inner = &payloads[2];
    let IncrementalResult::Object(inner_delivered) = &inner.incremental[0] else {
        panic!("expected an object increment");
    };
    assert_eq!(inner_delivered.data, Some(json!({ "bio": "b" })));
    assert_eq!(inner.has_next, Some(false));
}

#[tokio::test]
async fn streamed_lists_deliver_remaining_items() {
    let operation = compile(
        &user_schema(),
        r#"{ tags @stream(initialCount: 1, label: "t") }"#,
        ResolverRegistry::new(),
    );
    let payloads = collect_stream(operation, json!({ "tags": ["a", "b", "c"] })).await;
    assert_eq!(payloads.len(), 2);

    let initial = &payloads[0];
    assert_eq!(initial.data, Some(json!({ "tags": ["a"] })));
    assert_eq!(initial.pending.len(), 1);
    assert_eq!(initial.pending[0].label.as_deref(), Some("t"));
    assert_eq!(
        initial.pending[0].path,
        Path::empty().join_field(&name!("tags"))
    );

    let increment = &payloads[1];
    let IncrementalResult::List(delivered) = &increment.incremental[0] else {
        panic!("expected a list increment");
    };
    assert_eq!(delivered.items, vec![json!("b"), json!("c")]);
    assert_eq!(increment.completed[0].id, delivered.id);
    assert_eq!(increment.has_next, Some(false));
}

#[tokio::test]
async fn null_propagation_cancels_a_deferred_branch() {
    let schema = format!(
        r#"
        {DEFER_DIRECTIVES}

        type Query {{
          me: User
        }}

        type User {{
          name: String!
          secret: String!
        }}
        "#
    );
    let mut registry = ResolverRegistry::new();
    registry.register("User", "secret", |_ctx| async {
        Err::<graphql_exec::ResolvedValue, _>(graphql_exec::ResolverError::new("denied"))
    });
    let operation = compile(
        &schema,
        "{ me { name ... @defer { secret } } }",
        registry,
    );
    let payloads = collect_stream(operation, json!({ "me": { "name": "Ada" } })).await;
    assert_eq!(payloads.len(), 2);

    // The branch was cancelled by null propagation: a completed entry with
    // the error, and no incremental data.
    let terminal = &payloads[1];
    assert!(terminal.incremental.is_empty());
    assert_eq!(terminal.completed.len(), 1);
    assert_eq!(terminal.completed[0].errors.len(), 1);
    assert_eq!(terminal.completed[0].errors[0].message, "denied");
    assert_eq!(terminal.has_next, Some(false));
}

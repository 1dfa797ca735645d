use std::sync::Arc;
use std::time::Duration;

use apollo_compiler::name;
use graphql_exec::response::codes;
use graphql_exec::response::Path;
use graphql_exec::ExecError;
use graphql_exec::Executor;
use graphql_exec::ObjectValue;
use graphql_exec::OperationRequest;
use graphql_exec::ResolvedValue;
use graphql_exec::ResolverError;
use graphql_exec::ResolverRegistry;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json_bytes::json;

use crate::helpers::compile;
use crate::helpers::object;

const USER_SCHEMA: &str = r#"
type Query {
  me: User
  echo(x: Int): Int
}

type User {
  name: String!
  email: String
}
"#;

fn json_root(value: serde_json_bytes::Value) -> ObjectValue {
    ObjectValue::json(name!("Query"), object(value))
}

#[tokio::test]
async fn resolves_json_backed_objects_with_the_default_resolver() {
    let operation = compile(USER_SCHEMA, "{ me { name } }", ResolverRegistry::new());
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({ "me": { "name": "Ada", "email": "a@x" } }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.data, Some(json!({ "me": { "name": "Ada" } })));
    assert!(result.errors.is_empty());
    assert!(result.has_next.is_none());
    assert!(!result.is_incremental());
}

#[tokio::test]
async fn pipelined_and_pure_resolvers_compose() {
    struct AppUser {
        name: &'static str,
    }

    let mut registry = ResolverRegistry::new();
    registry.register("Query", "me", |_ctx| async {
        Ok(ResolvedValue::object(ObjectValue::opaque(
            name!("User"),
            AppUser { name: "Grace" },
        )))
    });
    registry.register_pure("User", "name", |ctx| {
        let user = ctx
            .parent()
            .downcast_ref::<AppUser>()
            .ok_or_else(|| ResolverError::new("unexpected parent"))?;
        Ok(ResolvedValue::leaf(user.name))
    });

    let operation = compile(USER_SCHEMA, "{ me { name __typename } }", registry);
    let result = Executor::default()
        .execute(operation, OperationRequest::new(json_root(json!({}))))
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(
        result.data,
        Some(json!({ "me": { "name": "Grace", "__typename": "User" } }))
    );
}

#[tokio::test]
async fn arguments_reach_resolvers() {
    let mut registry = ResolverRegistry::new();
    registry.register("Query", "echo", |ctx| {
        let value = ctx.argument("x").cloned();
        async move { Ok(ResolvedValue::Leaf(value.unwrap_or_default())) }
    });
    let operation = compile(
        USER_SCHEMA,
        "query($v: Int) { literal: echo(x: 3) variable: echo(x: $v) }",
        registry,
    );
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({})))
                .with_variables(object(json!({ "v": 7 }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.data, Some(json!({ "literal": 3, "variable": 7 })));
}

#[tokio::test]
async fn include_and_skip_react_to_variables() {
    let operation = compile(
        USER_SCHEMA,
        "query($with: Boolean!) { me { name email @include(if: $with) } }",
        ResolverRegistry::new(),
    );
    let root = json!({ "me": { "name": "Ada", "email": "a@x" } });
    let executor = Executor::default();

    // The same compiled operation is shared by both requests.
    let with = executor
        .execute(
            operation.clone(),
            OperationRequest::new(json_root(root.clone()))
                .with_variables(object(json!({ "with": true }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(
        with.data,
        Some(json!({ "me": { "name": "Ada", "email": "a@x" } }))
    );

    let without = executor
        .execute(
            operation.clone(),
            OperationRequest::new(json_root(root))
                .with_variables(object(json!({ "with": false }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(without.data, Some(json!({ "me": { "name": "Ada" } })));
}

#[tokio::test]
async fn resolver_errors_null_the_field_and_propagate() {
    const SCHEMA: &str = r#"
    type Query {
      a: B!
    }

    type B {
      b: String!
    }
    "#;
    let mut registry = ResolverRegistry::new();
    registry.register("Query", "a", |_ctx| async {
        Ok(ResolvedValue::object(ObjectValue::json(
            name!("B"),
            object(json!({})),
        )))
    });
    registry.register("B", "b", |_ctx| async {
        Err::<ResolvedValue, _>(ResolverError::new("boom"))
    });

    let operation = compile(SCHEMA, "{ a { b } }", registry);
    let result = Executor::default()
        .execute(operation, OperationRequest::new(json_root(json!({}))))
        .await
        .expect("executes")
        .expect_single();

    // `b` is non-nullable and `a` is non-nullable, so the null bubbles to
    // the root and the whole data becomes null.
    assert_eq!(result.data, Some(serde_json_bytes::Value::Null));
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    assert_eq!(error.message, "boom");
    assert_eq!(
        error.path,
        Some(Path::empty().join_field(&name!("a")).join_field(&name!("b")))
    );
    assert_eq!(
        error.extensions.get("code").and_then(|code| code.as_str()),
        Some(codes::RESOLVER_ERROR)
    );
}

#[tokio::test]
async fn nullable_ancestor_swallows_the_null() {
    const SCHEMA: &str = r#"
    type Query {
      a: B
    }

    type B {
      b: String!
      c: Int
    }
    "#;
    let mut registry = ResolverRegistry::new();
    registry.register("B", "b", |_ctx| async {
        Err::<ResolvedValue, _>(ResolverError::new("boom"))
    });

    let operation = compile(SCHEMA, "{ a { b c } }", registry);
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({ "a": { "c": 5 } }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.data, Some(json!({ "a": null })));
    assert_eq!(result.errors.len(), 1);
}

#[tokio::test]
async fn null_for_non_nullable_field_is_a_violation() {
    const SCHEMA: &str = r#"
    type Query {
      a: B
    }

    type B {
      b: String!
    }
    "#;
    let operation = compile(SCHEMA, "{ a { b } }", ResolverRegistry::new());
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({ "a": {} }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.data, Some(json!({ "a": null })));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(
        result.errors[0].message,
        "Cannot return null for non-nullable field \"B.b\"."
    );
    assert_eq!(
        result.errors[0]
            .extensions
            .get("code")
            .and_then(|code| code.as_str()),
        Some(codes::NON_NULL_VIOLATION)
    );
}

#[tokio::test]
async fn serial_mutation_fields_run_in_document_order() {
    const SCHEMA: &str = r#"
    type Query {
      x: Int
    }

    type Mutation {
      first: Int
      second: Int
    }
    "#;
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ResolverRegistry::new();
    let first_log = log.clone();
    registry.register("Mutation", "first", move |_ctx| {
        let log = first_log.clone();
        async move {
            // The slow field still fully completes before the next serial
            // field starts.
            tokio::time::sleep(Duration::from_millis(20)).await;
            log.lock().push("first");
            Ok(ResolvedValue::leaf(1))
        }
    });
    let second_log = log.clone();
    registry.register("Mutation", "second", move |_ctx| {
        let log = second_log.clone();
        async move {
            log.lock().push("second");
            Ok(ResolvedValue::leaf(2))
        }
    });

    let operation = compile(SCHEMA, "mutation { first second }", registry);
    let result = Executor::default()
        .execute(operation, OperationRequest::new(json_root(json!({}))))
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.data, Some(json!({ "first": 1, "second": 2 })));
    assert_eq!(*log.lock(), vec!["first", "second"]);
}

#[tokio::test]
async fn lists_complete_item_by_item() {
    const SCHEMA: &str = r#"
    type Query {
      users: [User!]
    }

    type User {
      name: String!
    }
    "#;
    let operation = compile(SCHEMA, "{ users { name } }", ResolverRegistry::new());
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(
                json!({ "users": [{ "name": "Ada" }, { "name": "Grace" }] }),
            )),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(
        result.data,
        Some(json!({ "users": [{ "name": "Ada" }, { "name": "Grace" }] }))
    );
}

#[tokio::test]
async fn abstract_types_pick_their_variant_by_typename() {
    const SCHEMA: &str = r#"
    type Query {
      node: Node
    }

    interface Node {
      id: ID!
    }

    type User implements Node {
      id: ID!
      name: String!
    }

    type Admin implements Node {
      id: ID!
      level: Int
    }
    "#;
    let operation = compile(
        SCHEMA,
        "{ node { id ... on User { name } ... on Admin { level } } }",
        ResolverRegistry::new(),
    );
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(
                json!({ "node": { "__typename": "Admin", "id": "1", "level": 9 } }),
            )),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.data, Some(json!({ "node": { "id": "1", "level": 9 } })));
}

#[tokio::test]
async fn extensions_ride_on_the_initial_payload() {
    let operation = compile(USER_SCHEMA, "{ me { name } }", ResolverRegistry::new());
    let result = Executor::default()
        .execute(
            operation,
            OperationRequest::new(json_root(json!({ "me": { "name": "Ada" } })))
                .with_extensions(object(json!({ "traceId": "abc" }))),
        )
        .await
        .expect("executes")
        .expect_single();
    assert_eq!(result.extensions, Some(object(json!({ "traceId": "abc" }))));
}

#[tokio::test]
async fn subscriptions_are_rejected() {
    const SCHEMA: &str = r#"
    type Query {
      x: Int
    }

    type Subscription {
      ticks: Int
    }
    "#;
    let operation = compile(SCHEMA, "subscription { ticks }", ResolverRegistry::new());
    let result = Executor::default()
        .execute(operation, OperationRequest::new(json_root(json!({}))))
        .await;
    assert!(matches!(result, Err(ExecError::SubscriptionsNotSupported)));
}

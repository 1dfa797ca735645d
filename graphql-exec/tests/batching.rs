use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use apollo_compiler::name;
use futures::future::BoxFuture;
use futures::FutureExt;
use graphql_exec::dispatch::Batch;
use graphql_exec::dispatch::BatchDispatcher;
use graphql_exec::dispatch::BatchStamp;
use graphql_exec::dispatch::BatchStatus;
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
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::helpers::compile;
use crate::helpers::object;

const SCHEMA: &str = r#"
type Query {
  echo(x: Int): Int
  load(key: Int): Int
}
"#;

fn json_root() -> ObjectValue {
    ObjectValue::json(name!("Query"), object(json!({})))
}

fn echo_registry() -> ResolverRegistry {
    let mut registry = ResolverRegistry::new();
    registry.register("Query", "echo", |ctx| {
        let value = ctx.argument("x").cloned();
        async move { Ok(ResolvedValue::Leaf(value.unwrap_or_default())) }
    });
    registry
}

#[tokio::test]
async fn variable_batching_returns_results_in_index_order() {
    let operation = compile(SCHEMA, "query($v: Int) { echo(x: $v) }", echo_registry());
    let batch = Executor::default()
        .execute_batch(
            operation,
            vec![
                object(json!({ "v": 1 })),
                object(json!({ "v": 2 })),
                object(json!({ "v": 3 })),
            ],
            OperationRequest::new(json_root()),
        )
        .await
        .expect("executes")
        .expect_batch();
    let data: Vec<_> = batch.results.iter().map(|result| &result.data).collect();
    assert_eq!(
        data,
        vec![
            &Some(json!({ "echo": 1 })),
            &Some(json!({ "echo": 2 })),
            &Some(json!({ "echo": 3 })),
        ]
    );
}

#[tokio::test]
async fn identical_variable_sets_yield_identical_payloads() {
    let operation = compile(SCHEMA, "query($v: Int) { echo(x: $v) }", echo_registry());
    let variables = object(json!({ "v": 5 }));
    let batch = Executor::default()
        .execute_batch(
            operation,
            vec![variables.clone(), variables.clone(), variables],
            OperationRequest::new(json_root()),
        )
        .await
        .expect("executes")
        .expect_batch();
    assert_eq!(batch.results.len(), 3);
    for result in &batch.results {
        assert_eq!(result, &batch.results[0]);
    }
}

#[tokio::test]
async fn subscriptions_cannot_be_batched() {
    const SUB_SCHEMA: &str = r#"
    type Query {
      x: Int
    }

    type Subscription {
      ticks: Int
    }
    "#;
    let operation = compile(SUB_SCHEMA, "subscription { ticks }", ResolverRegistry::new());
    let result = Executor::default()
        .execute_batch(
            operation,
            vec![object(json!({}))],
            OperationRequest::new(json_root()),
        )
        .await;
    assert!(matches!(result, Err(ExecError::SubscriptionsNotBatchable)));
}

/// A minimal data-loader: one batch of keys shared by every caller, resolved
/// in a single dispatch.
struct KeyBatch {
    stamp: BatchStamp,
    keys: Mutex<Vec<(i64, oneshot::Sender<i64>)>>,
    dispatches: Arc<AtomicUsize>,
}

impl Batch for KeyBatch {
    fn size(&self) -> usize {
        self.keys.lock().len()
    }

    fn status(&self) -> BatchStatus {
        BatchStatus::Enqueued
    }

    fn created_at(&self) -> Instant {
        self.stamp.created_at()
    }

    fn modified_at(&self) -> Instant {
        self.stamp.modified_at()
    }

    fn touch(&self) -> bool {
        self.stamp.touch()
    }

    fn dispatch(
        self: Arc<Self>,
        _cancellation: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ResolverError>> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        let keys: Vec<(i64, oneshot::Sender<i64>)> = self.keys.lock().drain(..).collect();
        async move {
            for (key, sender) in keys {
                let _ = sender.send(key * 2);
            }
            Ok(())
        }
        .boxed()
    }
}

struct Loader {
    batch: Mutex<Option<Arc<KeyBatch>>>,
    dispatches: Arc<AtomicUsize>,
}

impl Loader {
    fn new(dispatches: Arc<AtomicUsize>) -> Self {
        Loader {
            batch: Mutex::new(None),
            dispatches,
        }
    }

    async fn load(&self, dispatcher: &Arc<BatchDispatcher>, key: i64) -> i64 {
        let (sender, receiver) = oneshot::channel();
        let (batch, newly_created) = {
            let mut slot = self.batch.lock();
            match slot.as_ref() {
                Some(batch) => (batch.clone(), false),
                None => {
                    let batch = Arc::new(KeyBatch {
                        stamp: BatchStamp::new(),
                        keys: Mutex::new(Vec::new()),
                        dispatches: self.dispatches.clone(),
                    });
                    *slot = Some(batch.clone());
                    (batch, true)
                }
            }
        };
        batch.keys.lock().push((key, sender));
        batch.stamp.modified();
        if newly_created {
            dispatcher.schedule(batch);
        } else {
            dispatcher.begin_dispatch();
        }
        receiver.await.expect("batch dispatched")
    }
}

#[tokio::test]
async fn keys_coalesce_across_variable_sets() {
    let dispatches = Arc::new(AtomicUsize::new(0));
    let loader = Arc::new(Loader::new(dispatches.clone()));

    let mut registry = ResolverRegistry::new();
    registry.register("Query", "load", |ctx| {
        let key = ctx
            .argument("key")
            .and_then(|value| value.as_i64())
            .unwrap_or_default();
        let dispatcher = ctx.dispatcher().clone();
        let loader = ctx
            .services::<Arc<Loader>>()
            .expect("loader registered as a service")
            .clone();
        async move { Ok(ResolvedValue::leaf(loader.load(&dispatcher, key).await)) }
    });

    let operation = compile(SCHEMA, "query($v: Int) { load(key: $v) }", registry);
    let batch = Executor::default()
        .execute_batch(
            operation,
            vec![object(json!({ "v": 1 })), object(json!({ "v": 2 }))],
            OperationRequest::new(json_root()).with_services(Arc::new(loader)),
        )
        .await
        .expect("executes")
        .expect_batch();

    assert_eq!(batch.results[0].data, Some(json!({ "load": 2 })));
    assert_eq!(batch.results[1].data, Some(json!({ "load": 4 })));
    // Both sub-executions coalesced into a single dispatched batch.
    assert_eq!(dispatches.load(Ordering::SeqCst), 1);
}

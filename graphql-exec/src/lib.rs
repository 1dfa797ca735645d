//! The execution core of a GraphQL server.
//!
//! This crate turns a parsed and validated GraphQL operation into a
//! response, including the incremental-delivery extensions (`@defer` and
//! `@stream`):
//!
//! - [`compile`] translates a document into a flattened, indexed plan of
//!   selections and selection sets, with fragments inlined, include/skip
//!   conditions encoded as bit flags, and defer scopes tracked as a parent
//!   chain.
//! - [`validate`] checks the field-selection-merging rule before execution.
//! - [`execute`] drives resolver tasks cooperatively with parallel/serial
//!   discipline and coordinates deferred branches into a well-ordered
//!   result stream.
//! - [`dispatch`] coalesces batched key fetches (DataLoader semantics).
//! - [`response`] carries the payload types and the streaming JSON writer.
//!
//! The lexer/parser, type system, and input coercion are external
//! collaborators provided by `apollo-compiler`; transport, schema assembly,
//! and resolver implementations are out of scope.

pub mod compile;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod response;
pub mod validate;

mod pool;
mod result;

pub use crate::compile::Operation;
pub use crate::error::ExecError;
pub use crate::execute::resolver::ObjectValue;
pub use crate::execute::resolver::ResolvedValue;
pub use crate::execute::resolver::ResolverError;
pub use crate::execute::Executor;
pub use crate::execute::ExecutorConfig;
pub use crate::execute::OperationRequest;
pub use crate::execute::ResolverRegistry;
pub use crate::response::ExecutionResult;
pub use crate::response::OperationResult;
pub use crate::validate::FieldMergingValidator;

const _: () = {
    const fn assert_thread_safe<T: Sync + Send>() {}

    assert_thread_safe::<Executor>();
    assert_thread_safe::<Operation>();
};

use apollo_compiler::Name;

/// Create an internal error.
///
/// # Example
/// ```rust
/// use graphql_exec::internal_error;
/// use graphql_exec::error::ExecError;
/// # fn may_be_none() -> Option<()> { None }
///
/// const NAME: &str = "the thing";
/// let result: Result<(), ExecError> = may_be_none()
///     .ok_or_else(|| internal_error!("Expected {NAME} to be Some"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::ExecError::internal(format!( $( $arg )+ ))
    }
}

/// Break out of the current function, returning an internal error.
///
/// # Example
/// ```rust
/// use graphql_exec::bail;
/// use graphql_exec::error::ExecError;
///
/// fn example() -> Result<(), ExecError> {
///     bail!("Something went horribly wrong");
///     unreachable!()
/// }
/// #
/// # _ = example();
/// ```
#[macro_export]
macro_rules! bail {
    ( $( $arg:tt )+ ) => {
        return Err($crate::internal_error!( $( $arg )+ ).into())
    }
}

/// A safe assertion: in debug mode, it panicks on failure, and in production, it returns an
/// internal error.
///
/// Treat this as an assertion. It must only be used for conditions that *should never happen*
/// in normal operation.
#[macro_export]
macro_rules! ensure {
    ( $expr:expr, $( $arg:tt )+ ) => {
        #[cfg(debug_assertions)]
        {
            if false {
                return Err($crate::error::ExecError::internal("ensure!() must be used in a function that returns a Result").into());
            }
            assert!($expr, $( $arg )+);
        }

        #[cfg(not(debug_assertions))]
        if !$expr {
            $crate::bail!( $( $arg )+ );
        }
    }
}

/// A request-fatal error: the request fails before (or instead of) producing a
/// GraphQL response with partial data.
///
/// Field-level errors never surface through this type; they are recorded in the
/// response's `errors` array instead (see [`crate::response::Error`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("Operation {} was not found in the document.", display_operation_name(.name))]
    UnknownOperation { name: Option<String> },
    #[error("Unknown fragment \"{name}\".")]
    UnknownFragment { name: Name },
    #[error("Fragment \"{name}\" is spread within itself.")]
    FragmentCycle { name: Name },
    #[error("Unknown type \"{name}\".")]
    UnknownType { name: Name },
    #[error("Field \"{field}\" does not exist on type \"{ty}\".")]
    FieldDoesNotExistOnType { field: Name, ty: Name },
    #[error("The operation declares more than 64 @include/@skip conditions.")]
    TooManyIncludeConditions,
    #[error("The operation declares more than 64 @defer conditions.")]
    TooManyDeferConditions,
    #[error("Subscription operations cannot be executed by this executor.")]
    SubscriptionsNotSupported,
    #[error("Variable batching does not support subscription operations.")]
    SubscriptionsNotBatchable,
    #[error("The response exceeds the maximum nesting depth of {limit}.")]
    DepthLimitExceeded { limit: usize },
    #[error("The execution was cancelled.")]
    Cancelled,
    #[error("{message}")]
    Internal { message: String },
}

impl ExecError {
    pub fn internal(message: impl Into<String>) -> Self {
        ExecError::Internal {
            message: message.into(),
        }
    }
}

fn display_operation_name(name: &Option<String>) -> String {
    match name {
        Some(name) => format!("\"{name}\""),
        None => "(anonymous)".to_owned(),
    }
}

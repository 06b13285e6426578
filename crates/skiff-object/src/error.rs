/// Fatal runtime conditions.
///
/// Any of these stops the running VM. Script-level failures that should not
/// abort execution are reported with `Value::Error` instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid operation: {left} {op} {right}")]
    InvalidOperator {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("invalid operation: {op}{operand}")]
    InvalidUnaryOperator { op: &'static str, operand: &'static str },
    #[error("wrong number of arguments: want={want}, got={got}")]
    WrongNumArguments { want: usize, got: usize },
    #[error("wrong number of arguments: want>={want}, got={got}")]
    WrongNumArgumentsVariadic { want: usize, got: usize },
    #[error("invalid type for argument '{name}': expected {expected}, found {found}")]
    InvalidArgumentType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("function does not accept keyword arguments")]
    UnexpectedKeywordArguments,
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("invalid index type: {0}")]
    InvalidIndexType(&'static str),
    #[error("invalid index on error")]
    InvalidIndexOnError,
    #[error("not indexable: {0}")]
    NotIndexable(&'static str),
    #[error("not index-assignable: {0}")]
    NotIndexAssignable(&'static str),
    #[error("not sliceable: {0}")]
    NotSliceable(&'static str),
    #[error("invalid slice index: {0} > {1}")]
    InvalidSliceIndex(i64, i64),
    #[error("not callable: {0}")]
    NotCallable(&'static str),
    #[error("not iterable: {0}")]
    NotIterable(&'static str),
    #[error("division by zero")]
    DivisionByZero,
    #[error("negative shift amount: {0}")]
    NegativeShift(i64),
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("allocation limit exceeded")]
    AllocationLimitExceeded,
    #[error("exceeding string size limit")]
    StringLimit,
    #[error("exceeding bytes size limit")]
    BytesLimit,
    #[error("send on closed channel")]
    SendOnClosedChannel,
    #[error("aborted")]
    Aborted,
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),
    #[error("{0}")]
    Custom(String),
}

impl RuntimeError {
    /// Resource limits a host may want to tune rather than treat as a bug.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            RuntimeError::StackOverflow | RuntimeError::AllocationLimitExceeded
        )
    }
}

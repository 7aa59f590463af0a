/// One-byte error/status code carried through `Result`. The error
/// *value* (any Lua value) lives on the faulting thread; this code only
/// classifies it. `Yield` is a control signal, not a failure: it
/// unwinds a coroutine to the nearest resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    /// Ordinary runtime error.
    Runtime,
    /// Lexer/parser/loader error.
    Syntax,
    /// Allocation would exceed the memory budget.
    Mem,
    /// Error raised while running a `__gc` metamethod.
    GcMetamethod,
    /// Error raised while running the error handler itself.
    ErrErr,
    /// Value-stack or call-depth overflow.
    StackOverflow,
    /// Table index is nil or NaN.
    BadKey,
    /// Indexing a value that is not a table and has no `__index`.
    BadTable,
    /// `__index`/`__newindex` resolved to a non-callable non-table.
    BadIndexMeta,
    /// Metamethod chain exceeded the hop bound.
    MetaLoop,
    /// Arithmetic on an operand that does not coerce to a number.
    BadMath,
    /// Coroutine yield unwinding to the nearest resume.
    Yield,
}

impl LuaError {
    /// Collapse the fine-grained kinds onto the classic status set used
    /// by thread status and the embedding API.
    pub fn status(self) -> LuaError {
        match self {
            LuaError::BadKey
            | LuaError::BadTable
            | LuaError::BadIndexMeta
            | LuaError::MetaLoop
            | LuaError::BadMath
            | LuaError::StackOverflow => LuaError::Runtime,
            other => other,
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LuaError::Runtime => "runtime error",
            LuaError::Syntax => "syntax error",
            LuaError::Mem => "not enough memory",
            LuaError::GcMetamethod => "error in __gc metamethod",
            LuaError::ErrErr => "error in error handling",
            LuaError::StackOverflow => "stack overflow",
            LuaError::BadKey => "invalid table key",
            LuaError::BadTable => "attempt to index a non-table value",
            LuaError::BadIndexMeta => "invalid __index metamethod",
            LuaError::MetaLoop => "metamethod loop",
            LuaError::BadMath => "arithmetic on non-numeric value",
            LuaError::Yield => "yield",
        };
        f.write_str(s)
    }
}

impl std::error::Error for LuaError {}

/// Lifecycle status of one coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Runnable (running, normal, or not yet started).
    Ok,
    /// Suspended at a yield.
    Yielded,
    /// Finished normally; stack drained.
    Dead,
    /// Finished with the given error kind.
    Error(LuaError),
}

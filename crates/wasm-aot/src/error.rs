use crate::wasm::ValueKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WASM parsing error: {0}")]
    WasmParse(#[from] wasmparser::BinaryReaderError),

    #[error("Unsupported WASM feature: {0}")]
    Unsupported(String),

    #[error("Type mismatch: expected {expected}, found {}", display_actual(.actual))]
    TypeMismatch {
        expected: ValueKind,
        actual: Option<ValueKind>,
    },

    #[error("Unsupported opcode: {0}")]
    UnsupportedOpcode(String),

    #[error("function {function}: instruction {index} ({opcode}): {source}")]
    Analysis {
        function: u32,
        index: usize,
        opcode: String,
        #[source]
        source: Box<Error>,
    },

    #[error("code unit for function {function} is {size} bytes, exceeding the {limit} byte limit")]
    CodeTooLarge {
        function: u32,
        size: usize,
        limit: usize,
    },

    #[error(
        "WASM function size exceeds the code unit size limit and cannot be compiled. \
         It can only be run in the interpreter. Either reduce the size of the function \
         or enable the interpreter fallback mode: {} ({size} bytes, limit {limit})",
        fallback_subject(.function, .name)
    )]
    FallbackRequired {
        function: u32,
        name: Option<String>,
        size: usize,
        limit: usize,
    },

    #[error("code unit verification failed for function {function}: {message}")]
    Verification { function: u32, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error(transparent)]
    Trap(#[from] Trap),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `WASM function index: N`, with the name section's name appended when known.
#[must_use]
pub fn describe_function(function: u32, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("WASM function index: {function} (name: {name})"),
        None => format!("WASM function index: {function}"),
    }
}

fn fallback_subject(function: &u32, name: &Option<String>) -> String {
    describe_function(*function, name.as_deref())
}

fn display_actual(actual: &Option<ValueKind>) -> String {
    actual.map_or_else(|| "empty stack".to_string(), |kind| kind.to_string())
}

/// Stable trap categories, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind {
    Unreachable,
    MemoryOutOfBounds,
    TableOutOfBounds,
    UndefinedElement,
    UninitializedElement,
    IndirectCallTypeMismatch,
    UnknownFunction,
    CallStackExhausted,
    IntegerOverflow,
    IntegerDivideByZero,
    InvalidConversion,
    Interrupted,
    Host,
}

/// A WASM-defined runtime fault. Always propagated to the caller of `call`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Trap {
    #[error("Trapped on unreachable instruction")]
    Unreachable,
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("out of bounds table access")]
    TableOutOfBounds,
    #[error("undefined element")]
    UndefinedElement,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("unknown function {0}")]
    UnknownFunction(u32),
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("invalid conversion to integer")]
    InvalidConversion,
    #[error("Thread interrupted")]
    Interrupted,
    #[error("host error: {0}")]
    Host(String),
}

impl Trap {
    #[must_use]
    pub const fn category(&self) -> TrapKind {
        match self {
            Self::Unreachable => TrapKind::Unreachable,
            Self::MemoryOutOfBounds => TrapKind::MemoryOutOfBounds,
            Self::TableOutOfBounds => TrapKind::TableOutOfBounds,
            Self::UndefinedElement => TrapKind::UndefinedElement,
            Self::UninitializedElement => TrapKind::UninitializedElement,
            Self::IndirectCallTypeMismatch => TrapKind::IndirectCallTypeMismatch,
            Self::UnknownFunction(_) => TrapKind::UnknownFunction,
            Self::CallStackExhausted => TrapKind::CallStackExhausted,
            Self::IntegerOverflow => TrapKind::IntegerOverflow,
            Self::IntegerDivideByZero => TrapKind::IntegerDivideByZero,
            Self::InvalidConversion => TrapKind::InvalidConversion,
            Self::Interrupted => TrapKind::Interrupted,
            Self::Host(_) => TrapKind::Host,
        }
    }
}

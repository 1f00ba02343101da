use crate::address::CodeAddress;
use crate::smashable::{ConditionCode, SmashKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmashError {
    /// The backend cannot express this operation as a smashable sequence.
    Unsupported {
        op: &'static str,
        arch: &'static str,
    },
    InvalidTarget,
    InvalidCondition(ConditionCode),
    BufferFull {
        requested: usize,
        available: usize,
    },
    OutOfBounds {
        at: CodeAddress,
        len: usize,
    },
    NotSmashable {
        kind: SmashKind,
        at: CodeAddress,
    },
    Sealed,
    Memory(String),
}

impl std::fmt::Display for SmashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmashError::Unsupported { op, arch } => {
                write!(f, "smashable {op} is not supported on {arch}")
            }
            SmashError::InvalidTarget => write!(f, "null is not a valid smashable target"),
            SmashError::InvalidCondition(cc) => {
                write!(f, "condition '{cc}' cannot guard a smashable jcc")
            }
            SmashError::BufferFull {
                requested,
                available,
            } => write!(
                f,
                "code buffer full: requested {requested} bytes, {available} available",
            ),
            SmashError::OutOfBounds { at, len } => {
                write!(f, "range {at}+{len} lies outside the emitted code")
            }
            SmashError::NotSmashable { kind, at } => {
                write!(f, "no smashable {kind} at {at}")
            }
            SmashError::Sealed => write!(f, "code buffer is finalized and not writable"),
            SmashError::Memory(message) => write!(f, "code memory error: {message}"),
        }
    }
}

impl std::error::Error for SmashError {}

pub type SmashResult<T> = Result<T, SmashError>;

//! Error types shared across the crate.

use crate::engine::InterfaceHandle;
use thiserror::Error;

/// Failures of the wire codec. All of them are caused by the input and can be
/// fixed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("netmask bits are not contiguous")]
    NonContiguousBits,

    #[error("prefix length {0} is out of range 0..=32")]
    PrefixOutOfRange(u32),

    #[error("truncated {what}: need {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("header checksum mismatch: wire {wire:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { wire: u16, computed: u16 },

    #[error("payload of {actual} bytes exceeds the {max}-byte limit of the length field")]
    PayloadTooLarge { max: usize, actual: usize },
}

impl CodecError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::MalformedInput(msg.into())
    }
}

/// Failures raised while talking to the engine or its linear memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine could not allocate {0} bytes")]
    AllocationFailed(usize),

    #[error("foreign memory access out of bounds: {ptr:#x}+{len}")]
    OutOfBounds { ptr: u32, len: usize },

    #[error("engine trapped: {0}")]
    Trap(String),

    #[error("engine module does not export `{0}`")]
    MissingExport(&'static str),

    #[error("engine export `{name}` has the wrong signature: {reason}")]
    ExportMismatch { name: &'static str, reason: String },
}

/// Errors surfaced by the stack and its interfaces.
#[derive(Debug, Error)]
pub enum TapError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("engine did not register interface {0}")]
    RegistrationFailed(InterfaceHandle),

    #[error("engine rejected frame with status {0}")]
    SendFailed(i32),

    #[error("frame source is already being consumed")]
    AlreadyListening,

    #[error("engine is already executing a call")]
    EngineBusy,

    #[error("interface is no longer attached to a stack")]
    Detached,
}

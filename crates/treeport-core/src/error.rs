use std::fmt;

use thiserror::Error;

use crate::DType;

/// Which side of the model an index or name refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Input,
    Output,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoKind::Input => f.write_str("input"),
            IoKind::Output => f.write_str("output"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The artifact set or compute context cannot produce a model.
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("unknown {kind} name `{name}`")]
    UnknownName { kind: IoKind, name: String },

    #[error("{kind} index {index} out of range (model has {count})")]
    IndexOutOfRange {
        kind: IoKind,
        index: usize,
        count: usize,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("type mismatch for `{name}`: expected {expected}, got {got}")]
    TypeMismatch {
        name: String,
        expected: DType,
        got: DType,
    },

    #[error("not ready: {0}")]
    NotReady(String),

    /// An optional capability the backend does not implement. The message
    /// format is fixed so callers can match on it.
    #[error("{op} is not supported by {backend} backend.")]
    NotSupported {
        op: &'static str,
        backend: &'static str,
    },

    #[error("inference failed: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn load<S: Into<String>>(msg: S) -> Self {
        Error::Load(msg.into())
    }

    pub fn shape_mismatch<S: Into<String>>(msg: S) -> Self {
        Error::ShapeMismatch(msg.into())
    }

    pub fn not_ready<S: Into<String>>(msg: S) -> Self {
        Error::NotReady(msg.into())
    }

    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        Error::Runtime(msg.into())
    }

    pub fn not_supported(op: &'static str, backend: &'static str) -> Self {
        Error::NotSupported { op, backend }
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported { .. })
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_supported_message_is_fixed() {
        let err = Error::not_supported("GetInput", "forest");
        assert_eq!(err.to_string(), "GetInput is not supported by forest backend.");
        assert!(err.is_not_supported());
    }

    #[test]
    fn index_error_names_side() {
        let err = Error::IndexOutOfRange {
            kind: IoKind::Output,
            index: 3,
            count: 1,
        };
        assert_eq!(err.to_string(), "output index 3 out of range (model has 1)");
    }

    #[test]
    fn type_mismatch_uses_dtype_names() {
        let err = Error::TypeMismatch {
            name: "data".into(),
            expected: DType::F32,
            got: DType::I64,
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for `data`: expected float32, got int64"
        );
    }
}

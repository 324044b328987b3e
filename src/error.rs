//! Error Taxonomy
//!
//! Every failure the engine can raise. Component, validation and parse errors
//! carry an ancestor trace that grows as the error unwinds through the tree.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::BufferError;
use crate::crypto::CryptoError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Invalid integer literal: {0:?}")]
    InvalidInt(String),

    #[error("Invalid boolean literal: {0:?}")]
    InvalidBool(String),

    #[error("Invalid hex literal: {0:?}")]
    InvalidHex(String),

    #[error("Value {value} does not fit in {size} byte(s) (signed: {signed})")]
    Overflow { value: i128, size: usize, signed: bool },

    #[error("Integer width {0} exceeds 16 bytes")]
    TooWide(usize),

    #[error("Value of {actual} byte(s) exceeds declared size {size}")]
    TooLong { actual: usize, size: usize },

    #[error("Invalid UTF-8 sequence")]
    InvalidUtf8,

    #[error("Cannot convert {from} to {to}")]
    Incompatible { from: &'static str, to: &'static str },
}

/// Ancestor names, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace(pub Vec<String>);

impl Trace {
    pub fn of(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" <- "))
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Parse error: {message} (at {trace})")]
    Parse { message: String, trace: Trace },

    #[error("{message} (at {trace})")]
    Component { message: String, trace: Trace },

    #[error("Unknown property '{property}' on {kind} node '{node}'")]
    UnknownProperty {
        node: String,
        kind: &'static str,
        property: String,
    },

    #[error("Validation failed: {message} (at {trace})")]
    Validate {
        message: String,
        allowed: Vec<String>,
        trace: Trace,
    },

    #[error("Dependency error on '{node}': {message}")]
    Dependency { node: String, message: String },

    #[error("Value {value:#x} from '{source_node}' exceeds the {width}-bit range of '{target}'")]
    RangeExceeded {
        source_node: String,
        target: String,
        value: i128,
        width: u32,
    },

    #[error("File access error on {}: {source}", path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Conversion error in '{node}': {source}")]
    Convert {
        node: String,
        #[source]
        source: ConvertError,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Declaration {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),
}

impl BuildError {
    pub fn parse(node: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            trace: Trace::of(node),
        }
    }

    pub fn component(node: &str, message: impl Into<String>) -> Self {
        Self::Component {
            message: message.into(),
            trace: Trace::of(node),
        }
    }

    pub fn validate(node: &str, message: impl Into<String>, allowed: Vec<String>) -> Self {
        Self::Validate {
            message: message.into(),
            allowed,
            trace: Trace::of(node),
        }
    }

    pub fn dependency(node: &str, message: impl Into<String>) -> Self {
        Self::Dependency {
            node: node.to_string(),
            message: message.into(),
        }
    }

    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub fn convert(node: &str, source: ConvertError) -> Self {
        Self::Convert {
            node: node.to_string(),
            source,
        }
    }

    /// Append an enclosing node to the trace while unwinding.
    pub fn within(mut self, ancestor: &str) -> Self {
        match &mut self {
            Self::Parse { trace, .. }
            | Self::Component { trace, .. }
            | Self::Validate { trace, .. } => {
                if trace.0.last().map(String::as_str) != Some(ancestor) {
                    trace.0.push(ancestor.to_string());
                }
            }
            _ => {}
        }
        self
    }

    pub fn trace(&self) -> Option<&Trace> {
        match self {
            Self::Parse { trace, .. } | Self::Component { trace, .. } | Self::Validate { trace, .. } => {
                Some(trace)
            }
            _ => None,
        }
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Adds the ancestor of a failing call to its trace.
pub trait WithinExt<T> {
    fn within(self, ancestor: &str) -> Result<T>;
}

impl<T> WithinExt<T> for Result<T> {
    fn within(self, ancestor: &str) -> Result<T> {
        self.map_err(|e| e.within(ancestor))
    }
}

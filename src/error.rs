//! Result and Error types for all oligoalign code.
use std::fmt;
use std::io;

#[allow(missing_docs)]
pub type OligoResult<T> = Result<T, OligoError>;

/// Error kinds surfaced by the core (see spec §7).
#[allow(missing_docs)]
#[derive(Debug)]
pub enum OligoError {
    Io(io::Error),
    Format(String),
    Resource(String),
    Option(String),
    Invariant(String),
    Serialize(bincode::Error),
}

impl fmt::Display for OligoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            &OligoError::Io(ref e) => write!(f, "I/O problem: {}", e),
            &OligoError::Format(ref s) => write!(f, "Format error: {}", s),
            &OligoError::Resource(ref s) => write!(f, "Resource error: {}", s),
            &OligoError::Option(ref s) => write!(f, "Invalid configuration: {}", s),
            &OligoError::Invariant(ref s) => write!(f, "Internal invariant violated: {}", s),
            &OligoError::Serialize(ref e) => write!(f, "Unable to serialize/deserialize item: {}", e),
        }
    }
}

impl std::error::Error for OligoError {}

impl From<io::Error> for OligoError {
    fn from(e: io::Error) -> Self {
        OligoError::Io(e)
    }
}

impl From<bincode::Error> for OligoError {
    fn from(e: bincode::Error) -> Self {
        OligoError::Serialize(e)
    }
}

impl From<anyhow::Error> for OligoError {
    fn from(e: anyhow::Error) -> Self {
        OligoError::Format(e.to_string())
    }
}

impl From<serde_json::Error> for OligoError {
    fn from(e: serde_json::Error) -> Self {
        OligoError::Format(e.to_string())
    }
}

/// Asserts an internal invariant. Panics (with a core-dump-worthy message,
/// per spec §7) rather than returning an error, since invariant violations
/// indicate corrupted in-memory state that cannot be recovered from.
macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            panic!("internal invariant violated: {}", format!($($arg)*));
        }
    };
}

pub(crate) use invariant;

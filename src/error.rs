use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// Error kinds surfaced by the engine. The string form of each kind is part
/// of the public interface and is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// key not present
    NotFound,
    /// structural invariant violation (a bug or media corruption)
    Struct,
    /// key too large, or no progress after a split
    Ovflw,
    /// read of a page failed
    Read,
    /// latch protocol failure
    Lock,
    /// hash chain inconsistency
    Hash,
    /// unexpected kill bit observed
    Kill,
    /// mmap of a segment failed
    Map,
    /// write of a page failed
    Write,
    /// unexpected end of file
    Eof,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "notfound",
            ErrorKind::Struct => "struct",
            ErrorKind::Ovflw => "ovflw",
            ErrorKind::Read => "read",
            ErrorKind::Lock => "lock",
            ErrorKind::Hash => "hash",
            ErrorKind::Kill => "kill",
            ErrorKind::Map => "map",
            ErrorKind::Write => "write",
            ErrorKind::Eof => "eof",
        }
    }
}

#[derive(Debug)]
pub struct BlinkError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl BlinkError {
    pub fn new(kind: ErrorKind, msg: &str) -> BlinkError {
        BlinkError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn show_backtrace(&self) {
        let mut backtrace = self.backtrace.clone();
        backtrace.resolve();
        error!("{}\n{:?}", self, backtrace);
    }
}

impl fmt::Display for BlinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.details)
        }
    }
}

impl Error for BlinkError {}

pub type BlinkResult = Result<(), BlinkError>;

use std::{error::Error, fmt};

/// The failure classes surfaced by the engine.
///
/// - `Structure`: an invariant check failed mid-traversal (kill flag where
///   not expected, level mismatch, right-walk off the end).
/// - `Io`: a disk read or write came up short.
/// - `Overflow`: a key exceeds the per-key maximum, or a page cannot be
///   split into two that both honor the record size.
/// - `Atomic`: a batched commit lost track of a key inside its split chain.
/// - `Map`: the pool or metadata area could not be set up at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structure,
    Io,
    Overflow,
    Atomic,
    Map,
}

#[derive(Debug)]
pub struct SmallError {
    kind: ErrorKind,
    details: String,
}

impl SmallError {
    pub fn new(kind: ErrorKind, msg: &str) -> SmallError {
        SmallError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn structure(msg: &str) -> SmallError {
        SmallError::new(ErrorKind::Structure, msg)
    }

    pub fn io(msg: &str) -> SmallError {
        SmallError::new(ErrorKind::Io, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn show_backtrace(&self) {
        let bt = backtrace::Backtrace::new();
        log::error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl Error for SmallError {}

pub type SmallResult = Result<(), SmallError>;

use std::io;

/// Result alias used throughout the broker. Mirrors the `Wait`/`Fatal` split this codebase's
/// network layer already uses for non-blocking I/O: `Wait` means "no progress possible right
/// now", never an error a caller should log or disconnect over.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Eq, PartialEq)]
pub enum BrokerError {
    Wait,
    Fatal(ErrorKind),
}

/// The specific, named failure kinds the validator and transport layer distinguish. Every
/// disconnect-worthy failure maps to exactly one of these so logs and tests can match on it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    UnsupportedVersion,
    UnsupportedFlags,
    BadRequest,
    BadSize,
    BadFdCount,
    UnexpectedRequest,
    BadMode,
    BadKeyLen,
    ArgumentTooLarge,
    Io(io::ErrorKind),
    PairAllocation,
    Multiplexer,
}

impl ErrorKind {
    /// A short, stable, human-readable diagnostic. Used in log records and in test assertions
    /// that check for a specific failure reason without depending on full sentence phrasing.
    pub fn diagnostic(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedVersion => "unsupported protocol version",
            ErrorKind::UnsupportedFlags => "unsupported protocol flags",
            ErrorKind::BadRequest => "unrecognized request kind",
            ErrorKind::BadSize => "payload size does not match request kind",
            ErrorKind::BadFdCount => "descriptor count does not match request kind",
            ErrorKind::UnexpectedRequest => "request not permitted in this context",
            ErrorKind::BadMode => "invalid rendezvous mode",
            ErrorKind::BadKeyLen => "key length out of range",
            ErrorKind::ArgumentTooLarge => "too many descriptors for one frame",
            ErrorKind::Io(_) => "transport error",
            ErrorKind::PairAllocation => "failed to allocate a connected endpoint pair",
            ErrorKind::Multiplexer => "event multiplexer operation failed",
        }
    }
}

impl From<io::Error> for BrokerError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => BrokerError::Wait,
            kind => BrokerError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

/// Analogous to this codebase's `ErrorUtils` trait: lets call sites ask "did this actually fail",
/// treating `Wait` as a non-failure.
pub trait ResultExt {
    fn has_failed(&self) -> bool;
}

impl<T> ResultExt for BrokerResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(BrokerError::Wait))
    }
}

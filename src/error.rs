use std::fmt;

/// Stable, negative error codes mirroring the C ABI this engine's format
/// was distilled from. `InvalidJournal` never crosses the public API; it
/// is resolved internally during open/recovery.
#[derive(Debug)]
pub enum Error {
    NotFound,
    Io(std::io::Error),
    Corrupted(String),
    KeyNotAllowed,
    InvalidJournal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable integer code, matching the original engine's public
    /// error enum. `InvalidJournal` has no public code because it is
    /// never returned to a caller.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound => -1,
            Error::Io(_) => -2,
            Error::Corrupted(_) => -3,
            Error::KeyNotAllowed => -4,
            Error::InvalidJournal(_) => -5,
        }
    }

    pub fn corrupted<S: Into<String>>(msg: S) -> Self {
        Error::Corrupted(msg.into())
    }

    pub fn invalid_journal<S: Into<String>>(msg: S) -> Self {
        Error::InvalidJournal(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "key not found"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Corrupted(msg) => write!(f, "corrupted database: {msg}"),
            Error::KeyNotAllowed => write!(f, "key uses a reserved prefix"),
            Error::InvalidJournal(msg) => write!(f, "invalid journal: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_stable_contract() {
        assert_eq!(Error::NotFound.code(), -1);
        assert_eq!(Error::Io(std::io::Error::other("x")).code(), -2);
        assert_eq!(Error::corrupted("bad marker").code(), -3);
        assert_eq!(Error::KeyNotAllowed.code(), -4);
        assert_eq!(Error::invalid_journal("bad checksum").code(), -5);
    }

    #[test]
    fn invalid_journal_never_equals_a_public_code() {
        let public_codes = [
            Error::NotFound.code(),
            Error::Io(std::io::Error::other("x")).code(),
            Error::corrupted("x").code(),
            Error::KeyNotAllowed.code(),
        ];
        assert!(!public_codes.contains(&Error::invalid_journal("x").code()));
    }
}

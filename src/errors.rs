use std::path::PathBuf;
use std::{fmt, io, result};

use serde_json::Value;

/// Boxed underlying cause carried by per-key errors.
pub type Cause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub enum LarderError {
    /// The store directory failed the writability probe at construction.
    NotWritable { path: PathBuf, source: io::Error },
    /// A file open, read, decode, collision check or `bget` callback failed.
    Read { key: Value, cause: Cause },
    /// An encode, write, rename or fsync failed; side-file cleanup was attempted.
    Write { key: Value, cause: Cause },
    /// An I/O failure in a lifecycle operation not tied to a single key.
    Io(io::Error),
}

impl LarderError {
    pub(crate) fn read(key: &Value, cause: impl Into<Cause>) -> Self {
        LarderError::Read { key: key.clone(), cause: cause.into() }
    }

    pub(crate) fn write(key: &Value, cause: impl Into<Cause>) -> Self {
        LarderError::Write { key: key.clone(), cause: cause.into() }
    }
}

impl fmt::Display for LarderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LarderError::NotWritable { path, source } => {
                write!(f, "store folder {} is not writable: {source}", path.display())
            }
            LarderError::Read { key, cause } => write!(f, "read error for key {key}: {cause}"),
            LarderError::Write { key, cause } => write!(f, "write error for key {key}: {cause}"),
            LarderError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for LarderError {}

macro_rules! err_from_impl {
    ($variant:ident, $err_ty:ty) => {
        impl From<$err_ty> for LarderError {
            fn from(err: $err_ty) -> Self {
                LarderError::$variant(err)
            }
        }
    };
}

err_from_impl!(Io, io::Error);

pub type Result<T> = result::Result<T, LarderError>;

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_display_carries_key_and_cause() {
        let err = LarderError::read(&json!(["users", 42]), io::Error::other("boom"));
        let rendered = err.to_string();
        assert!(rendered.contains("[\"users\",42]"));
        assert!(rendered.contains("boom"));
    }

    #[test]
    fn test_io_conversion() {
        let err: LarderError = io::Error::other("disk gone").into();
        assert!(matches!(err, LarderError::Io(_)));
    }
}

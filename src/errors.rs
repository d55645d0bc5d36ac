//! Closed error taxonomy of the archive core.
//!
//! Every fallible core operation returns [`Error`].  The set of kinds is
//! frozen: callers match on variants, the CLI maps them to process exit
//! codes via [`Error::exit_code`].  I/O retry happens only inside the
//! storage adapter; by the time an `Error` surfaces here it is final.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("unknown chunk '{0}'")]
    UnknownChunk(String),
    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u16),
    #[error("wrong password")]
    WrongPassword,
    #[error("no public signature key")]
    NoPublicSignatureKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("decryption failed: {0}")]
    DecryptFail(String),
    #[error("compression failed: {0}")]
    DeflateFail(String),
    #[error("decompression failed: {0}")]
    InflateFail(String),
    #[error("delta source not found: {0}")]
    DeltaSourceNotFound(String),
    #[error("entries differ: {name} at byte {offset}")]
    EntriesDiffer { name: String, offset: u64 },
    #[error("entry incomplete: {name}, uncovered {uncovered}")]
    EntryIncomplete { name: String, uncovered: String },
    #[error("entry size mismatch for {name}: {expected} vs {actual}")]
    EntrySizeMismatch { name: String, expected: u64, actual: u64 },
    #[error("wrong entry type (expected {expected})")]
    WrongEntryType { expected: &'static str },
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid device block size {0}")]
    InvalidDeviceBlockSize(u64),
    #[error("unexpected end of file")]
    EndOfFile,
    #[error("end of archive")]
    EndOfArchive,
    #[error("insufficient memory: {0}")]
    InsufficientMemory(String),
    #[error("aborted")]
    Aborted,
    #[error("function not supported: {0}")]
    FunctionNotSupported(&'static str),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Process exit code for the CLI.
    ///
    /// 0 ok, 1 generic, 2 usage, 3 I/O, 4 crypto, 5 signature,
    /// 6 entries differ, 128 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::FileNotFound(_) | Error::PermissionDenied(_)
            | Error::EndOfFile | Error::Timeout(_) => 3,
            Error::WrongPassword | Error::DecryptFail(_) => 4,
            Error::InvalidSignature | Error::NoPublicSignatureKey => 5,
            Error::EntriesDiffer { .. } => 6,
            Error::Internal(_) => 128,
            _ => 1,
        }
    }

    /// Per-entry errors are recorded and iteration continues when
    /// `no-stop-on-error` is set; everything else tears the run down.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(
            self,
            Error::EntriesDiffer { .. }
                | Error::EntryIncomplete { .. }
                | Error::EntrySizeMismatch { .. }
                | Error::DecryptFail(_)
                | Error::InflateFail(_)
                | Error::CorruptData(_)
                | Error::DeltaSourceNotFound(_)
                | Error::FileNotFound(_)
                | Error::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::WrongPassword.exit_code(), 4);
        assert_eq!(Error::InvalidSignature.exit_code(), 5);
        assert_eq!(
            Error::EntriesDiffer { name: "/a".into(), offset: 0 }.exit_code(),
            6
        );
        assert_eq!(Error::EndOfArchive.exit_code(), 1);
        assert_eq!(Error::Internal("x".into()).exit_code(), 128);
    }
}

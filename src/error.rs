use std::result::Result as StdResult;
use std::sync::Arc;

use crate::bson::BsonDocument;

/// Failures raised while building BSON or wire frames. These never touch the
/// connection that would have carried the request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("field name contains an interior NUL byte")]
    InvalidFieldName,

    #[error("regex options {0:?} are not an ascending subset of \"ilmsux\"")]
    InvalidRegexOptions(String),

    #[error("value of {0} bytes does not fit an int32 length prefix")]
    ValueTooLarge(usize),

    #[error("frame of {len} bytes exceeds the configured bound of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Failures raised while interpreting BSON or wire frames. On an inbound
/// frame these are fatal to the owning connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input ended in the middle of a field")]
    Truncated,

    #[error("unknown BSON tag 0x{0:02x}")]
    BadTag(u8),

    #[error("field {field:?}: expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("declared length disagrees with the bytes present")]
    LengthMismatch,
}

/// Driver error. `Clone` so that one socket failure can complete every
/// in-flight caller on the connection.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("i/o failure: {0}")]
    Io(Arc<std::io::Error>),

    #[error("write failed: {0}")]
    WriteFailed(Arc<std::io::Error>),

    #[error("read failed: {0}")]
    ReadFailed(Arc<std::io::Error>),

    #[error("connection is not accepting requests")]
    NotReady,

    #[error("driver is shut down")]
    Shutdown,

    #[error("endpoint is unreachable")]
    Unreachable,

    #[error("server no longer knows the cursor")]
    CursorInvalid,

    #[error("server reported a query failure: {0}")]
    ServerError(BsonDocument),

    #[error("request timed out")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T> = StdResult<T, Error>;

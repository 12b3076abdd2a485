use thiserror::Error;

/// The closed set of status codes surfaced by the engine.
///
/// Every fallible operation returns one of these; there is no hidden error
/// channel and no per-handle "last error" slot. `Ok(())` stands in for a
/// success code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurrowError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("i/o error")]
    IoError,

    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("cache is full")]
    CacheFull,

    #[error("database is already open")]
    DatabaseAlreadyOpen,

    #[error("cursor is nil")]
    CursorIsNil,

    #[error("limits reached")]
    LimitsReached,

    #[error("internal error")]
    InternalError,
}

pub type BurrowResult<T> = Result<T, BurrowError>;

impl From<std::io::Error> for BurrowError {
    fn from(_: std::io::Error) -> Self {
        BurrowError::IoError
    }
}

use thiserror::Error;

/// Errors surfaced by the packer.
///
/// `CorruptedData` carries the file position of the failed read. The
/// tail-merge loop relies on that position: a corruption reported at
/// exactly the current end of the live file is the normal end-of-scan
/// signal, anything else is real corruption.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("corrupted data at position {pos} - {reason}")]
    CorruptedData { pos: u64, reason: String },

    #[error("versioned data records are not supported (position {pos})")]
    VersionsUnsupported { pos: u64 },

    #[error("pack time must be non-zero")]
    InvalidPackTime,

    #[error("storage is read-only")]
    ReadOnly,

    #[error("pack already in progress")]
    AlreadyPacking,

    #[error("pack worker failed - {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PackError>;

pub(crate) fn corrupted<S: Into<String>>(pos: u64, reason: S) -> PackError {
    PackError::CorruptedData {
        pos,
        reason: reason.into(),
    }
}

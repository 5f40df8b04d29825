use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty access unit")]
    EmptyAccessUnit,

    #[error("unknown track {0}")]
    UnknownTrack(u32),

    #[error("tracks must be added before the first sample is written")]
    HeaderAlreadyWritten,

    #[error("muxer is already finalized")]
    Finalized,
}

pub type Result<T> = std::result::Result<T, MediaError>;

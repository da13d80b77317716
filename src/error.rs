use crate::{CapturePoint, FaceId, PortId, MAX_NAMES, MIN_FILE_SIZE};

/// Errors returned to control-path callers.
///
/// Buffer or queue exhaustion never shows up here; that is retried inside the
/// writer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("writer not found: {0}")]
    WriterNotFound(String),

    #[error("port not found: {0}")]
    PortNotFound(PortId),

    #[error("port {0} cannot capture at this grab point")]
    PortNotCaptureCapable(PortId),

    #[error("unsupported grab reason: {0:?}")]
    GrabReasonUnsupported(String),

    #[error("face not found: {0}")]
    FaceNotFound(FaceId),

    #[error("invalid direction: {0:?}")]
    InvalidDirection(String),

    #[error("name filter count {0} out of range (expected 1..={})", MAX_NAMES)]
    FilterCountOutOfRange(usize),

    #[error("sample probability {0} out of range [0,1]")]
    ProbabilityOutOfRange(f64),

    #[error("{0} already has a capture source")]
    DuplicateAttachment(CapturePoint),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("writer filename missing")]
    FilenameMissing,

    #[error("max size {0} is below the minimum of {} bytes", MIN_FILE_SIZE)]
    SizeTooSmall(u64),

    #[error("writer is closed")]
    WriterClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

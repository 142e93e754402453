//! Error types for stillcast

use thiserror::Error;

/// Result type alias for stillcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stillcast operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Codec is not available on this system
    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    /// The compression engine refused to construct or configure a session
    #[error("Session init failed: {0}")]
    SessionInit(String),

    /// A submitted frame was rejected by the compression engine
    #[error("Encoding error: {0}")]
    Encode(String),

    /// Malformed length-prefixed access unit
    #[error("Bitstream error: {0}")]
    Bitstream(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// FFmpeg process error
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),
}

impl Error {
    /// Whether this error happened while bringing a session up, as opposed
    /// to mid-stream.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::SessionInit(_) | Error::CodecUnavailable(_) | Error::InvalidInput(_)
        )
    }
}

/// Error code for FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum ErrorCode {
    /// Success
    Ok = 0,
    /// Invalid input parameter
    InvalidInput = 1,
    /// Codec not available
    CodecUnavailable = 2,
    /// Engine refused the session
    SessionInit = 3,
    /// I/O error
    IoError = 4,
    /// Encoding error
    EncodeError = 5,
    /// Submission carried no frames; no task was created
    EmptyInput = 6,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidInput(_) => ErrorCode::InvalidInput,
            Error::CodecUnavailable(_) => ErrorCode::CodecUnavailable,
            Error::SessionInit(_) => ErrorCode::SessionInit,
            Error::Io(_) => ErrorCode::IoError,
            Error::Image(_) => ErrorCode::InvalidInput,
            Error::Encode(_) => ErrorCode::EncodeError,
            Error::Bitstream(_) => ErrorCode::EncodeError,
            Error::Ffmpeg(_) => ErrorCode::EncodeError,
            Error::Platform(_) => ErrorCode::EncodeError,
        }
    }
}

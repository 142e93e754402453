//! stillcast - Serialized H.264 encode queue for bursts of still images
//!
//! Each submission is an ordered list of equally sized RGBA frames. Every
//! frame is held for one second of output at the requested frame rate and
//! the compressed result is written as a raw Annex-B elementary stream:
//! - `TaskQueue`: runs submissions one at a time, in order
//! - `EncodingSession`: one compression engine bound to one output file
//! - `BitstreamWriter`: reframes length-prefixed access units to start codes

pub mod bitstream;
pub mod encoder;
pub mod error;
pub mod ffi;
pub mod image_loader;
pub mod queue;
pub mod session;
pub mod task;

pub use bitstream::BitstreamWriter;
pub use encoder::{Backend, CompressionEngine, EngineFactory, Frame, MediaTime, SessionConfig};
pub use error::{Error, Result};
pub use queue::{QueueConfig, TaskQueue};
pub use session::{EncodingSession, SessionRegistry};
pub use task::{EncodeTask, TaskId, TaskStats, TaskStatus};

/// Check if `backend` can encode on the current system
pub fn available(backend: &Backend) -> Result<()> {
    match backend {
        Backend::Native => encoder::h264::check_available(None),
        Backend::Ffmpeg { path } => encoder::h264::check_ffmpeg_available(path.as_deref()),
        Backend::Loopback => Ok(()),
    }
}

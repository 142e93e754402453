//! H.264 engines with platform-specific implementations

use super::{CompressionEngine, SessionConfig};
use crate::session::Dispatcher;
use crate::Result;
use std::path::Path;

#[cfg(target_os = "macos")]
mod macos;

mod ffmpeg;

/// Check if H.264 encoding is available
#[allow(unused_variables)]
pub fn check_available(ffmpeg_path: Option<&Path>) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        macos::check_available()
    }

    #[cfg(not(target_os = "macos"))]
    {
        ffmpeg::check_available(ffmpeg_path)
    }
}

/// Check if the ffmpeg engine can run, whatever the platform
pub fn check_ffmpeg_available(ffmpeg_path: Option<&Path>) -> Result<()> {
    ffmpeg::check_available(ffmpeg_path)
}

/// Create the native H.264 engine for the current platform
pub fn create_engine(
    config: &SessionConfig,
    dispatcher: Dispatcher,
) -> Result<Box<dyn CompressionEngine>> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::VideoToolboxEngine::new(config, dispatcher)?))
    }

    #[cfg(not(target_os = "macos"))]
    {
        Ok(Box::new(ffmpeg::FfmpegEngine::new(config, dispatcher, None)?))
    }
}

/// Create an ffmpeg-backed engine with an optional custom ffmpeg path
pub fn create_ffmpeg_engine(
    config: &SessionConfig,
    dispatcher: Dispatcher,
    ffmpeg_path: Option<&Path>,
) -> Result<Box<dyn CompressionEngine>> {
    Ok(Box::new(ffmpeg::FfmpegEngine::new(
        config,
        dispatcher,
        ffmpeg_path,
    )?))
}

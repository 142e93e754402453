//! Compression engines

pub mod h264;
pub mod loopback;

use crate::session::Dispatcher;
use crate::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// Raw video frame in RGBA format
///
/// Frames are immutable once built; a task owns its frames until it ends.
#[derive(Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Build a frame from RGBA pixel data (width * height * 4 bytes)
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "Frame geometry {}x{} is empty",
                width, height
            )));
        }
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(Error::InvalidInput(format!(
                "Frame {}x{} needs {} RGBA bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_rgba_image(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGBA pixel data, row-major without padding
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A rational media timestamp: `value / timescale` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }
}

/// Presentation timestamps for the still at `index`
///
/// Each input still is stretched over `fps` encoder time-steps at a
/// timescale of `fps` ticks per second, so one still becomes one second of
/// video: frame `n` gets ticks `n * fps + 1 ..= n * fps + fps`.
pub fn presentation_times(index: u64, fps: u32) -> impl Iterator<Item = MediaTime> {
    let base = index as i64 * fps as i64;
    (1..=fps as i64).map(move |step| MediaTime::new(base + step, fps as i32))
}

/// Sequence and picture parameter sets of an H.264 stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// One compressed access unit as delivered by an engine
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Whether the unit is an IDR frame
    pub keyframe: bool,
    /// Length-prefixed NAL records
    pub data: Vec<u8>,
    /// Parameter sets from the unit's format description, if it has one
    pub parameter_sets: Option<ParameterSets>,
    /// Presentation time the frame was submitted at, when known
    pub pts: Option<MediaTime>,
}

/// Session geometry and rate settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Output frame rate, also the number of time-steps per still
    pub fps: u32,
    /// Explicit average bitrate in kbit/s; derived from geometry when unset
    pub bitrate_kbps: Option<u32>,
}

impl SessionConfig {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate_kbps: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidInput(format!(
                "Invalid geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > i32::MAX as u32 {
            return Err(Error::InvalidInput(format!("Invalid frame rate {}", self.fps)));
        }
        if self.bitrate_kbps == Some(0) {
            return Err(Error::InvalidInput("Bitrate must be positive".to_string()));
        }
        Ok(())
    }
}

/// Fixed encoder properties applied once per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionProperties {
    /// Max frames between keyframes
    pub max_keyframe_interval: u32,
    /// Max seconds between keyframes
    pub max_keyframe_interval_duration: u32,
    pub expected_frame_rate: u32,
    /// Long-run average target in bits per second
    pub average_bit_rate: u64,
    /// Hard ceiling in bits per second over a one-second window
    pub data_rate_limit: u64,
    /// Whether the engine may emit frames out of submission order
    pub allow_frame_reordering: bool,
}

impl CompressionProperties {
    pub fn derive(config: &SessionConfig) -> Self {
        let pixels = config.width as u64 * config.height as u64;
        let average_bit_rate = match config.bitrate_kbps {
            Some(kbps) => (kbps as u64) << 10,
            None => pixels * 3 * 4 * 8,
        };

        Self {
            max_keyframe_interval: config.fps,
            max_keyframe_interval_duration: 1,
            expected_frame_rate: config.fps,
            average_bit_rate,
            data_rate_limit: pixels * 3 * 4,
            allow_frame_reordering: false,
        }
    }
}

/// A stateful compression context bound to one session configuration
///
/// Engines never return compressed data from `encode`; every access unit
/// is handed to the [`Dispatcher`] given at open time, possibly from an
/// engine-owned thread and possibly long after `encode` returned.
pub trait CompressionEngine: Send {
    /// Apply fixed properties and prime the engine
    fn configure(&mut self, properties: &CompressionProperties) -> Result<()>;

    /// Submit one frame at the given presentation time
    fn encode(&mut self, frame: &Frame, pts: MediaTime) -> Result<()>;

    /// Block until every submitted frame has been delivered
    fn complete_frames(&mut self) -> Result<()>;

    /// Tear the context down. Must be idempotent.
    fn invalidate(&mut self);

    /// Short engine name for logs
    fn name(&self) -> &'static str;
}

/// Opens compression engines
pub trait EngineFactory: Send + Sync {
    fn open(&self, config: &SessionConfig, dispatcher: Dispatcher)
        -> Result<Box<dyn CompressionEngine>>;
}

/// Built-in engine selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Backend {
    /// VideoToolbox on macOS, ffmpeg elsewhere
    #[default]
    Native,
    /// ffmpeg with libx264, optionally at an explicit path
    Ffmpeg { path: Option<PathBuf> },
    /// In-process engine producing a synthetic stream
    Loopback,
}

impl EngineFactory for Backend {
    fn open(
        &self,
        config: &SessionConfig,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn CompressionEngine>> {
        match self {
            Backend::Native => h264::create_engine(config, dispatcher),
            Backend::Ffmpeg { path } => {
                h264::create_ffmpeg_engine(config, dispatcher, path.as_deref())
            }
            Backend::Loopback => Ok(Box::new(loopback::LoopbackEngine::new(
                config, dispatcher,
            )?)),
        }
    }
}

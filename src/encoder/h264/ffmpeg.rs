//! H.264 engine using an ffmpeg/libx264 external process
//!
//! Raw RGBA frames go to ffmpeg's stdin; a reader thread scans the Annex-B
//! output on stdout, groups NAL units into access units and hands them to
//! the dispatcher in length-prefixed form, the same shape VideoToolbox
//! produces.

use super::super::{CompressionEngine, CompressionProperties, EncodedSample, Frame, MediaTime};
use super::super::{ParameterSets, SessionConfig};
use crate::bitstream::{
    annexb_units, find_start_code, is_slice, nal_type, nal_unit_type, to_avcc,
    trim_trailing_zeros,
};
use crate::session::Dispatcher;
use crate::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

/// FFmpeg-based H.264 engine
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    config: SessionConfig,
    dispatcher: Dispatcher,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<Result<u64>>>,
    frame_len: usize,
}

impl FfmpegEngine {
    pub fn new(
        config: &SessionConfig,
        dispatcher: Dispatcher,
        ffmpeg_path: Option<&Path>,
    ) -> Result<Self> {
        config.validate()?;
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(Error::SessionInit(format!(
                "libx264 needs even dimensions, got {}x{}",
                config.width, config.height
            )));
        }

        let ffmpeg = find_ffmpeg(ffmpeg_path)?;

        Ok(Self {
            ffmpeg,
            config: config.clone(),
            dispatcher,
            process: None,
            stdin: None,
            reader: None,
            frame_len: config.width as usize * config.height as usize * 4,
        })
    }

    fn command(&self, properties: &CompressionProperties) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .args(["-s", &format!("{}x{}", self.config.width, self.config.height)])
            .args(["-r", &properties.expected_frame_rate.to_string()])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "libx264", "-preset", "veryfast"])
            .args(["-bf", "0"])
            .args(["-g", &properties.max_keyframe_interval.to_string()])
            .args(["-sc_threshold", "0"])
            .args(["-b:v", &properties.average_bit_rate.to_string()])
            .args(["-maxrate", &properties.data_rate_limit.to_string()])
            .args(["-bufsize", &properties.data_rate_limit.to_string()])
            .args(["-pix_fmt", "yuv420p"])
            .args(["-f", "h264", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }

    fn shutdown(&mut self) -> Result<()> {
        // Closing stdin tells ffmpeg the input is over
        drop(self.stdin.take());

        let mut result = Ok(());

        if let Some(reader) = self.reader.take() {
            result = match reader.join() {
                Ok(Ok(units)) => {
                    log::debug!("ffmpeg produced {} access units", units);
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Ffmpeg("Output reader panicked".to_string())),
            };
        }

        if let Some(mut process) = self.process.take() {
            let status = process
                .wait()
                .map_err(|e| Error::Ffmpeg(format!("FFmpeg process error: {}", e)))?;
            if !status.success() && result.is_ok() {
                result = Err(Error::Ffmpeg(format!("FFmpeg exited with {}", status)));
            }
        }

        result
    }
}

impl CompressionEngine for FfmpegEngine {
    fn configure(&mut self, properties: &CompressionProperties) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::SessionInit("Engine already configured".to_string()));
        }

        let mut process = self
            .command(properties)
            .spawn()
            .map_err(|e| Error::SessionInit(format!("Failed to start ffmpeg: {}", e)))?;

        let stdin = process.stdin.take();
        let stdout = process.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = process.kill();
            let _ = process.wait();
            return Err(Error::SessionInit(
                "FFmpeg pipes not available".to_string(),
            ));
        };

        let dispatcher = self.dispatcher.clone();
        let reader = std::thread::Builder::new()
            .name(format!("stillcast-ffmpeg-{}", dispatcher.handle().as_u64()))
            .spawn(move || read_stream(stdout, &dispatcher));

        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(Error::SessionInit(format!(
                    "Failed to start output reader: {}",
                    e
                )));
            }
        };

        self.process = Some(process);
        self.stdin = Some(stdin);
        self.reader = Some(reader);
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, _pts: MediaTime) -> Result<()> {
        // ffmpeg times raw input by arrival order at the configured rate
        if frame.data().len() != self.frame_len {
            return Err(Error::Encode(format!(
                "Frame holds {} bytes, expected {}",
                frame.data().len(),
                self.frame_len
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Encode("FFmpeg stdin not available".to_string()))?;

        // Blocks while the pipe is full
        stdin
            .write_all(frame.data())
            .map_err(|e| Error::Encode(format!("Failed to write frame: {}", e)))
    }

    fn complete_frames(&mut self) -> Result<()> {
        self.shutdown()
    }

    fn invalidate(&mut self) {
        drop(self.stdin.take());
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

impl Drop for FfmpegEngine {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// Groups Annex-B NAL units into access units
#[derive(Default)]
struct AccessUnitAssembler {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    prefix: Vec<Vec<u8>>,
    units: u64,
}

impl AccessUnitAssembler {
    fn push(&mut self, nal: &[u8]) -> Option<EncodedSample> {
        match nal_unit_type(nal) {
            Some(nal_type::SPS) => self.sps = Some(nal.to_vec()),
            Some(nal_type::PPS) => self.pps = Some(nal.to_vec()),
            Some(nal_type::ACCESS_UNIT_DELIMITER) => {}
            _ if is_slice(nal) => return Some(self.complete(nal)),
            _ => self.prefix.push(nal.to_vec()),
        }
        None
    }

    fn complete(&mut self, slice: &[u8]) -> EncodedSample {
        let keyframe = nal_unit_type(slice) == Some(nal_type::IDR_SLICE);
        let data = to_avcc(
            self.prefix
                .iter()
                .map(Vec::as_slice)
                .chain(std::iter::once(slice)),
        );
        self.prefix.clear();
        self.units += 1;

        let parameter_sets = match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) if keyframe => Some(ParameterSets {
                sps: sps.clone(),
                pps: pps.clone(),
            }),
            _ => None,
        };

        EncodedSample {
            keyframe,
            data,
            parameter_sets,
            pts: None,
        }
    }
}

/// Feed every complete NAL unit in `buffer` to `sink`, returning how many
/// bytes were consumed. The unit after the last start code may still be
/// growing and is left in place.
fn drain_complete_nals<F: FnMut(&[u8])>(buffer: &[u8], mut sink: F) -> usize {
    let Some(mut current) = find_start_code(buffer, 0) else {
        return 0;
    };

    while let Some(next) = find_start_code(buffer, current.0 + current.1) {
        let nal = trim_trailing_zeros(&buffer[current.0 + current.1..next.0]);
        if !nal.is_empty() {
            sink(nal);
        }
        current = next;
    }

    current.0
}

fn read_stream<R: Read>(mut stdout: R, dispatcher: &Dispatcher) -> Result<u64> {
    let mut assembler = AccessUnitAssembler::default();
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = vec![0u8; 65536];

    loop {
        let n = match stdout.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                dispatcher.deliver(Err(Error::Ffmpeg(format!(
                    "Failed to read output: {}",
                    e
                ))));
                return Err(Error::Io(e));
            }
        };
        pending.extend_from_slice(&buffer[..n]);

        let consumed = drain_complete_nals(&pending, |nal| {
            if let Some(sample) = assembler.push(nal) {
                dispatcher.deliver(Ok(sample));
            }
        });
        pending.drain(..consumed);
    }

    for nal in annexb_units(&pending) {
        if let Some(sample) = assembler.push(nal) {
            dispatcher.deliver(Ok(sample));
        }
    }

    if !assembler.prefix.is_empty() {
        log::debug!(
            "Discarding {} trailing NAL units without a slice",
            assembler.prefix.len()
        );
    }

    Ok(assembler.units)
}

/// Find ffmpeg executable
fn find_ffmpeg(custom_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = custom_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::CodecUnavailable(format!(
            "FFmpeg not found at: {}",
            path.display()
        )));
    }

    // Try to find ffmpeg in PATH
    let paths = ["ffmpeg", "/usr/bin/ffmpeg", "/usr/local/bin/ffmpeg"];

    for path in paths {
        if Command::new(path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
        {
            return Ok(PathBuf::from(path));
        }
    }

    Err(Error::CodecUnavailable(
        "FFmpeg not found in PATH".to_string(),
    ))
}

/// Check if ffmpeg with H.264 support is available
pub fn check_available(ffmpeg_path: Option<&Path>) -> Result<()> {
    let ffmpeg = find_ffmpeg(ffmpeg_path)?;

    // Check if ffmpeg has libx264 support
    let output = Command::new(&ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| Error::Ffmpeg(format!("Failed to run ffmpeg: {}", e)))?;

    let encoders = String::from_utf8_lossy(&output.stdout);
    if encoders.contains("libx264") {
        Ok(())
    } else {
        Err(Error::CodecUnavailable(
            "FFmpeg does not have libx264 support".to_string(),
        ))
    }
}

//! In-process engine producing a synthetic H.264-shaped stream
//!
//! Nothing is compressed. Every submitted frame comes back, on a worker
//! thread, as one access unit holding a single slice NAL whose body is the
//! presentation time and a digest of the pixels. Keyframes follow the
//! configured keyframe interval and carry synthetic parameter sets. The
//! output has the same shape and timing behavior as a hardware engine,
//! which makes it usable wherever no real encoder is present.

use super::{CompressionEngine, CompressionProperties, EncodedSample, Frame, MediaTime};
use super::{ParameterSets, SessionConfig};
use crate::bitstream::{nal_type, to_avcc};
use crate::session::Dispatcher;
use crate::{Error, Result};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::thread::JoinHandle;

enum Job {
    Frame {
        keyframe: bool,
        pts: MediaTime,
        digest: u32,
    },
    Flush(Sender<()>),
}

/// Synthetic engine backed by a worker thread
pub struct LoopbackEngine {
    config: SessionConfig,
    dispatcher: Dispatcher,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    keyframe_interval: u64,
    submitted: u64,
}

impl LoopbackEngine {
    pub fn new(config: &SessionConfig, dispatcher: Dispatcher) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config: config.clone(),
            dispatcher,
            sender: None,
            worker: None,
            keyframe_interval: config.fps as u64,
            submitted: 0,
        })
    }
}

impl CompressionEngine for LoopbackEngine {
    fn configure(&mut self, properties: &CompressionProperties) -> Result<()> {
        if self.sender.is_some() {
            return Err(Error::SessionInit("Engine already configured".to_string()));
        }

        self.keyframe_interval = properties.max_keyframe_interval.max(1) as u64;

        let (sender, receiver) = unbounded::<Job>();
        let dispatcher = self.dispatcher.clone();
        let parameter_sets = synthetic_parameter_sets(&self.config);

        let worker = std::thread::Builder::new()
            .name(format!("stillcast-loopback-{}", dispatcher.handle().as_u64()))
            .spawn(move || {
                for job in receiver {
                    match job {
                        Job::Frame {
                            keyframe,
                            pts,
                            digest,
                        } => dispatcher.deliver(Ok(EncodedSample {
                            keyframe,
                            data: to_avcc([slice_nal(keyframe, pts, digest).as_slice()]),
                            parameter_sets: keyframe.then(|| parameter_sets.clone()),
                            pts: Some(pts),
                        })),
                        Job::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })?;

        self.sender = Some(sender);
        self.worker = Some(worker);
        Ok(())
    }

    fn encode(&mut self, frame: &Frame, pts: MediaTime) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Encode("Engine not running".to_string()))?;

        let keyframe = self.submitted % self.keyframe_interval == 0;
        sender
            .send(Job::Frame {
                keyframe,
                pts,
                digest: fnv1a(frame.data()),
            })
            .map_err(|_| Error::Encode("Engine worker stopped".to_string()))?;

        self.submitted += 1;
        Ok(())
    }

    fn complete_frames(&mut self) -> Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = bounded(1);
        sender
            .send(Job::Flush(ack_tx))
            .map_err(|_| Error::Encode("Engine worker stopped".to_string()))?;
        ack_rx
            .recv()
            .map_err(|_| Error::Encode("Engine worker stopped before flush".to_string()))
    }

    fn invalidate(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Loopback worker panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.invalidate();
    }
}

fn synthetic_parameter_sets(config: &SessionConfig) -> ParameterSets {
    // Baseline profile, level 3.0, followed by the geometry
    let mut sps_rbsp = vec![0x42, 0xC0, 0x1E];
    sps_rbsp.extend_from_slice(&(config.width as u16).to_be_bytes());
    sps_rbsp.extend_from_slice(&(config.height as u16).to_be_bytes());
    sps_rbsp.push(config.fps.min(255) as u8);

    ParameterSets {
        sps: nal(nal_type::SPS, 3, &sps_rbsp),
        pps: nal(nal_type::PPS, 3, &[0xCE, 0x38]),
    }
}

fn slice_nal(keyframe: bool, pts: MediaTime, digest: u32) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(12);
    rbsp.extend_from_slice(&pts.value.to_be_bytes());
    rbsp.extend_from_slice(&digest.to_be_bytes());

    if keyframe {
        nal(nal_type::IDR_SLICE, 3, &rbsp)
    } else {
        nal(nal_type::NON_IDR_SLICE, 2, &rbsp)
    }
}

/// Header byte, escaped payload and the RBSP stop bit
fn nal(unit_type: u8, ref_idc: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![(ref_idc << 5) | unit_type];
    let mut zeros = 0;
    for &byte in rbsp.iter().chain(std::iter::once(&0x80)) {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |hash, &byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    })
}

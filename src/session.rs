//! Encoding sessions
//!
//! An [`EncodingSession`] binds one compression engine to one output file.
//! Engines report compressed units through a [`Dispatcher`], which carries
//! only the session's [`SessionHandle`]; the live output state is found by
//! looking the handle up in the [`SessionRegistry`]. Units that arrive
//! after a session has been closed find nothing and are dropped.

use crate::bitstream::BitstreamWriter;
use crate::encoder::{
    presentation_times, CompressionEngine, CompressionProperties, EncodedSample, EngineFactory,
    Frame, MediaTime, SessionConfig,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Opaque identifier of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Maps session handles to the output state of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    next_handle: AtomicU64,
    sessions: Mutex<HashMap<SessionHandle, Arc<SessionSink>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<SessionSink>) -> SessionHandle {
        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.sessions).insert(handle, sink);
        handle
    }

    pub fn lookup(&self, handle: SessionHandle) -> Option<Arc<SessionSink>> {
        lock(&self.sessions).get(&handle).cloned()
    }

    pub fn unregister(&self, handle: SessionHandle) -> Option<Arc<SessionSink>> {
        lock(&self.sessions).remove(&handle)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes engine output to the session it belongs to
#[derive(Clone)]
pub struct Dispatcher {
    handle: SessionHandle,
    registry: Weak<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(handle: SessionHandle, registry: Weak<SessionRegistry>) -> Self {
        Self { handle, registry }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Hand one engine result to the owning session.
    ///
    /// Safe to call from any thread, before or after the submitting call
    /// returned.
    pub fn deliver(&self, sample: Result<EncodedSample>) {
        let Some(registry) = self.registry.upgrade() else {
            log::warn!("Registry gone, dropping output for session {}", self.handle);
            return;
        };

        // The registry lock is released before the sink is touched
        let sink = registry.lookup(self.handle);
        match sink {
            Some(sink) => sink.receive(self.handle, sample),
            None => log::warn!("Dropping output for closed session {}", self.handle),
        }
    }
}

/// Counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Units the engine delivered, including failed and dropped ones
    pub units_delivered: u64,
    /// Access units written to the output
    pub units_written: u64,
    /// Units discarded before parameter sets were known or after a failure
    pub units_dropped: u64,
    /// Bytes written to the output, start codes included
    pub bytes_written: u64,
}

/// Output side of a session: the Annex-B writer and its bookkeeping
pub struct SessionSink {
    state: Mutex<SinkState>,
}

struct SinkState {
    writer: BitstreamWriter<File>,
    stats: SessionStats,
    failure: Option<Error>,
    // Stays set after the failure is taken
    failed: bool,
}

impl SessionSink {
    pub fn new(output: File) -> Self {
        Self {
            state: Mutex::new(SinkState {
                writer: BitstreamWriter::new(output),
                stats: SessionStats::default(),
                failure: None,
                failed: false,
            }),
        }
    }

    fn receive(&self, handle: SessionHandle, sample: Result<EncodedSample>) {
        let mut state = lock(&self.state);
        state.stats.units_delivered += 1;
        log::trace!(
            "Session {} received unit {}",
            handle,
            state.stats.units_delivered
        );

        if state.failed {
            state.stats.units_dropped += 1;
            return;
        }

        let result = sample.and_then(|sample| state.write_sample(handle, &sample));
        if let Err(e) = result {
            log::error!("Session {} output failed: {}", handle, e);
            state.failure = Some(e);
            state.failed = true;
        }
    }

    pub fn stats(&self) -> SessionStats {
        let state = lock(&self.state);
        SessionStats {
            bytes_written: state.writer.bytes_written(),
            ..state.stats
        }
    }

    fn flush(&self) -> Result<()> {
        lock(&self.state).writer.flush()
    }

    /// Whether any delivered unit has failed
    pub fn failed(&self) -> bool {
        lock(&self.state).failed
    }

    fn take_failure(&self) -> Option<Error> {
        lock(&self.state).failure.take()
    }
}

impl SinkState {
    fn write_sample(&mut self, handle: SessionHandle, sample: &EncodedSample) -> Result<()> {
        if !self.writer.parameter_sets_written() {
            if !sample.keyframe {
                self.stats.units_dropped += 1;
                log::warn!(
                    "Session {} dropped a delta frame that arrived before any keyframe",
                    handle
                );
                return Ok(());
            }

            let params = sample.parameter_sets.as_ref().ok_or_else(|| {
                Error::Encode("First keyframe carries no parameter sets".to_string())
            })?;
            self.writer.write_parameter_sets(&params.sps, &params.pps)?;
            log::debug!(
                "Session {} wrote parameter sets (sps {} bytes, pps {} bytes)",
                handle,
                params.sps.len(),
                params.pps.len()
            );
        }

        self.writer.write_access_unit(&sample.data)?;
        self.stats.units_written += 1;
        Ok(())
    }
}

/// One compression context bound to a fixed geometry and frame rate
pub struct EncodingSession {
    handle: SessionHandle,
    config: SessionConfig,
    engine: Box<dyn CompressionEngine>,
    registry: Arc<SessionRegistry>,
    sink: Arc<SessionSink>,
    configured: bool,
    closed: bool,
    last_pts: Option<MediaTime>,
    frames_submitted: u64,
}

impl EncodingSession {
    /// Construct a compression context writing to `output`.
    ///
    /// Any refusal, including an invalid configuration, is reported as
    /// [`Error::SessionInit`]; file errors stay [`Error::Io`].
    pub fn open(
        config: &SessionConfig,
        output: File,
        factory: &dyn EngineFactory,
        registry: &Arc<SessionRegistry>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::SessionInit(e.to_string()))?;

        let sink = Arc::new(SessionSink::new(output));
        let handle = registry.register(Arc::clone(&sink));
        let dispatcher = Dispatcher::new(handle, Arc::downgrade(registry));

        let engine = match factory.open(config, dispatcher) {
            Ok(engine) => engine,
            Err(e) => {
                registry.unregister(handle);
                return Err(match e {
                    Error::SessionInit(_) | Error::Io(_) | Error::CodecUnavailable(_) => e,
                    other => Error::SessionInit(other.to_string()),
                });
            }
        };

        log::debug!(
            "Opened {} session {} ({}x{} @ {} fps)",
            engine.name(),
            handle,
            config.width,
            config.height,
            config.fps
        );

        Ok(Self {
            handle,
            config: config.clone(),
            engine,
            registry: Arc::clone(registry),
            sink,
            configured: false,
            closed: false,
            last_pts: None,
            frames_submitted: 0,
        })
    }

    /// Apply the fixed encoder properties. Runs once, before any frame.
    pub fn configure(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionInit("Session already closed".to_string()));
        }
        if self.configured {
            return Err(Error::SessionInit("Session already configured".to_string()));
        }

        let properties = CompressionProperties::derive(&self.config);
        self.engine.configure(&properties).map_err(|e| match e {
            Error::SessionInit(_) => e,
            other => Error::SessionInit(other.to_string()),
        })?;
        self.configured = true;

        log::debug!(
            "Session {} configured: keyframe every {} frames, {} bit/s average, {} bit/s ceiling",
            self.handle,
            properties.max_keyframe_interval,
            properties.average_bit_rate,
            properties.data_rate_limit
        );
        Ok(())
    }

    /// Submit one frame at `pts`. Output arrives later through the registry.
    pub fn encode_frame(&mut self, frame: &Frame, pts: MediaTime) -> Result<()> {
        if self.closed {
            return Err(Error::Encode("Session invalidated".to_string()));
        }
        if !self.configured {
            return Err(Error::Encode("Session not configured".to_string()));
        }
        if self.sink.failed() {
            return Err(self.sink.take_failure().unwrap_or_else(|| {
                Error::Encode("Engine output already failed".to_string())
            }));
        }
        if frame.width() != self.config.width || frame.height() != self.config.height {
            return Err(Error::Encode(format!(
                "Frame {}x{} does not match session geometry {}x{}",
                frame.width(),
                frame.height(),
                self.config.width,
                self.config.height
            )));
        }
        if let Some(last) = self.last_pts {
            if pts.timescale != last.timescale || pts.value <= last.value {
                return Err(Error::Encode(format!(
                    "Presentation time {}/{} does not follow {}/{}",
                    pts.value, pts.timescale, last.value, last.timescale
                )));
            }
        }

        self.engine.encode(frame, pts)?;
        self.last_pts = Some(pts);
        self.frames_submitted += 1;
        Ok(())
    }

    /// Submit the still at `index` at every one of its `fps` time-steps
    pub fn encode_still(&mut self, frame: &Frame, index: u64) -> Result<()> {
        for pts in presentation_times(index, self.config.fps) {
            self.encode_frame(frame, pts)?;
        }
        Ok(())
    }

    /// Wait until the engine has delivered everything submitted so far
    pub fn complete_frames(&mut self) -> Result<()> {
        if self.closed || !self.configured {
            return Ok(());
        }
        self.engine.complete_frames()
    }

    /// Flush in-flight frames, invalidate the engine and release the
    /// output. Idempotent; reports the first asynchronous output failure.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let drained = if self.configured {
            self.engine.complete_frames()
        } else {
            Ok(())
        };
        self.engine.invalidate();
        self.registry.unregister(self.handle);
        let flushed = self.sink.flush();

        log::debug!(
            "Closed session {} after {} submitted frames",
            self.handle,
            self.frames_submitted
        );

        drained?;
        flushed?;
        match self.sink.take_failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Encoder time-steps submitted so far
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    pub fn stats(&self) -> SessionStats {
        self.sink.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for EncodingSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Session {} closed with error: {}", self.handle, e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

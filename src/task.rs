//! Encode tasks: one ordered frame list turned into one output file
//!
//! A task moves through `Waiting → Ready → Encoding → End`. Failures jump
//! straight to `End` from `Waiting` (the session could not be set up) or
//! from `Encoding` (a frame or the output was rejected). Nothing ever
//! leaves `End`.

use crate::encoder::{EngineFactory, Frame, SessionConfig};
use crate::error::ErrorCode;
use crate::session::{EncodingSession, SessionRegistry};
use crate::{Error, Result};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Identity of a task within its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub enum TaskStatus {
    /// Created, no session yet
    Waiting = 0,
    /// Session open and configured, output file open
    Ready = 1,
    /// Frames are being submitted
    Encoding = 2,
    /// Output closed and engine released; terminal
    End = 3,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        *self == TaskStatus::End
    }

    /// Whether `next` is a legal transition from `self`
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Waiting, Ready) | (Ready, Encoding) | (Encoding, End) | (Waiting, End)
        )
    }
}

/// Called synchronously on every status change
pub type StatusObserver = Arc<dyn Fn(TaskId, TaskStatus) + Send + Sync>;

/// Counters collected when a task ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Encoder time-steps submitted (frames × fps on success)
    pub frames_submitted: u64,
    /// Access units written to the output
    pub units_written: u64,
    /// Access units the output discarded
    pub units_dropped: u64,
    /// Bytes in the output file
    pub bytes_written: u64,
}

/// Services a task needs from its queue
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub factory: Arc<dyn EngineFactory>,
    pub registry: Arc<SessionRegistry>,
    pub drain_grace: Duration,
}

struct TaskState {
    status: TaskStatus,
    // Set once the End observers have all run
    settled: bool,
    failure: Option<(ErrorCode, String)>,
    stats: TaskStats,
}

/// One "frame list → file" job
pub struct EncodeTask {
    id: TaskId,
    config: SessionConfig,
    output_path: PathBuf,
    frame_count: usize,
    frames: Mutex<Vec<Frame>>,
    session: Mutex<Option<EncodingSession>>,
    context: TaskContext,
    state: Mutex<TaskState>,
    settled: Condvar,
    observers: Mutex<Vec<StatusObserver>>,
    // Runs after every other observer has seen End
    on_end: Mutex<Option<StatusObserver>>,
}

impl EncodeTask {
    pub(crate) fn new(
        id: TaskId,
        config: SessionConfig,
        frames: Vec<Frame>,
        output_path: PathBuf,
        context: TaskContext,
    ) -> Self {
        Self {
            id,
            config,
            output_path,
            frame_count: frames.len(),
            frames: Mutex::new(frames),
            session: Mutex::new(None),
            context,
            state: Mutex::new(TaskState {
                status: TaskStatus::Waiting,
                settled: false,
                failure: None,
                stats: TaskStats::default(),
            }),
            settled: Condvar::new(),
            observers: Mutex::new(Vec::new()),
            on_end: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.state).status
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Number of stills in the task
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Why the task failed, once it has ended in failure
    pub fn failure(&self) -> Option<String> {
        lock(&self.state)
            .failure
            .as_ref()
            .map(|(_, message)| message.clone())
    }

    /// Error class of the failure, once the task has ended in failure
    pub fn error_code(&self) -> Option<ErrorCode> {
        lock(&self.state).failure.as_ref().map(|(code, _)| *code)
    }

    pub fn is_failed(&self) -> bool {
        lock(&self.state).failure.is_some()
    }

    pub fn stats(&self) -> TaskStats {
        lock(&self.state).stats
    }

    /// Register an observer for later status changes
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(TaskId, TaskStatus) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(observer));
    }

    pub(crate) fn add_observer(&self, observer: StatusObserver) {
        lock(&self.observers).push(observer);
    }

    /// Set the hook run once the task has ended, after all observers
    pub(crate) fn set_on_end(&self, hook: StatusObserver) {
        *lock(&self.on_end) = Some(hook);
    }

    /// Block until the task has ended and every observer has seen it
    pub fn wait(&self) -> TaskStatus {
        let mut state = lock(&self.state);
        while !state.settled {
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.status
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns whether the
    /// task ended in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.state);
        let (state, _) = self
            .settled
            .wait_timeout_while(state, timeout, |state| !state.settled)
            .unwrap_or_else(PoisonError::into_inner);
        state.settled
    }

    /// `Waiting → Ready`: create the output file, open and configure the
    /// session. On failure the task ends and the error is returned.
    pub(crate) fn prepare(&self) -> Result<()> {
        if self.status() != TaskStatus::Waiting {
            return Err(Error::InvalidInput(format!(
                "Task {} already started",
                self.id
            )));
        }

        match self.open_session() {
            Ok(session) => {
                *lock(&self.session) = Some(session);
                self.advance(TaskStatus::Ready);
                Ok(())
            }
            Err(e) => {
                log::warn!("Task {} could not start: {}", self.id, e);
                self.record_failure(&e);
                self.advance(TaskStatus::End);
                Err(e)
            }
        }
    }

    /// `Ready → Encoding → End`: feed every still, drain the engine and
    /// release everything. One failed frame aborts the whole task.
    pub(crate) fn encode(&self) {
        let session = lock(&self.session).take();
        let Some(mut session) = session else {
            log::error!("Task {} has no session to encode with", self.id);
            return;
        };

        self.advance(TaskStatus::Encoding);

        let frames = std::mem::take(&mut *lock(&self.frames));
        let fed = self.feed(&mut session, &frames);
        drop(frames);

        let closed = session.close();
        let result = match fed {
            Ok(()) => closed,
            Err(e) => {
                if let Err(close_error) = closed {
                    log::debug!("Task {} close after failure: {}", self.id, close_error);
                }
                Err(e)
            }
        };

        let session_stats = session.stats();
        {
            let mut state = lock(&self.state);
            state.stats = TaskStats {
                frames_submitted: session.frames_submitted(),
                units_written: session_stats.units_written,
                units_dropped: session_stats.units_dropped,
                bytes_written: session_stats.bytes_written,
            };
        }
        drop(session);

        match result {
            Ok(()) => log::info!(
                "Task {} wrote {} ({} units)",
                self.id,
                self.output_path.display(),
                session_stats.units_written
            ),
            Err(e) => {
                log::warn!("Task {} failed while encoding: {}", self.id, e);
                self.record_failure(&e);
            }
        }

        self.advance(TaskStatus::End);
    }

    /// Both phases back to back, as a queue worker does for tasks it starts
    pub(crate) fn run(&self) {
        if self.prepare().is_ok() {
            self.encode();
        }
    }

    /// Force the task to `End` through legal transitions
    pub(crate) fn abort(&self, error: Error) {
        log::error!("Task {} aborted: {}", self.id, error);
        self.record_failure(&error);

        match self.status() {
            TaskStatus::Waiting => self.advance(TaskStatus::End),
            TaskStatus::Ready => {
                let session = lock(&self.session).take();
                if let Some(mut session) = session {
                    if let Err(close_error) = session.close() {
                        log::debug!("Task {} close after abort: {}", self.id, close_error);
                    }
                }
                drop(std::mem::take(&mut *lock(&self.frames)));
                self.advance(TaskStatus::Encoding);
                self.advance(TaskStatus::End);
            }
            TaskStatus::Encoding => self.advance(TaskStatus::End),
            TaskStatus::End => {}
        }
    }

    fn open_session(&self) -> Result<EncodingSession> {
        let output = create_output(&self.output_path)?;
        let mut session = EncodingSession::open(
            &self.config,
            output,
            self.context.factory.as_ref(),
            &self.context.registry,
        )?;
        session.configure()?;
        Ok(session)
    }

    fn feed(&self, session: &mut EncodingSession, frames: &[Frame]) -> Result<()> {
        for (index, frame) in frames.iter().enumerate() {
            session.encode_still(frame, index as u64)?;
        }
        log::debug!(
            "Task {} submitted {} stills as {} frames",
            self.id,
            frames.len(),
            session.frames_submitted()
        );

        session.complete_frames()?;
        if !self.context.drain_grace.is_zero() {
            std::thread::sleep(self.context.drain_grace);
        }
        Ok(())
    }

    fn record_failure(&self, error: &Error) {
        let mut state = lock(&self.state);
        if state.failure.is_none() {
            state.failure = Some((ErrorCode::from(error), error.to_string()));
        }
    }

    fn advance(&self, next: TaskStatus) {
        {
            let mut state = lock(&self.state);
            if !state.status.can_advance_to(next) {
                log::error!(
                    "Task {} refused transition {:?} -> {:?}",
                    self.id,
                    state.status,
                    next
                );
                return;
            }
            state.status = next;
        }
        log::debug!("Task {} is now {:?}", self.id, next);

        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer(self.id, next);
        }

        if next.is_terminal() {
            lock(&self.state).settled = true;
            self.settled.notify_all();

            let hook = lock(&self.on_end).take();
            if let Some(hook) = hook {
                hook(self.id, next);
            }
        }
    }
}

impl fmt::Debug for EncodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeTask")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("output_path", &self.output_path)
            .field("frames", &self.frame_count)
            .finish()
    }
}

/// Replace whatever is at `path` with a fresh, empty file
fn create_output(path: &Path) -> Result<File> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    Ok(file)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

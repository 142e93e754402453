//! FIFO encode queue
//!
//! At most one task is ever past `Waiting`: the head of the queue. When
//! the head reaches `End`, successful or not, it is removed and the next
//! task is started on a fresh worker thread. The pending list is the only
//! state shared between submitters and workers; its lock is never held
//! while a task runs.

use crate::encoder::{Backend, EngineFactory, Frame, SessionConfig};
use crate::session::SessionRegistry;
use crate::task::{EncodeTask, StatusObserver, TaskContext, TaskId, TaskStatus};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

/// Queue configuration
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Engine used for every task
    pub backend: Backend,
    /// Explicit average bitrate in kbit/s; derived from geometry when unset
    pub bitrate_kbps: Option<u32>,
    /// Fixed wait after the engine reports it drained, before a task ends
    pub drain_grace: Duration,
}

impl QueueConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bitrate_kbps == Some(0) {
            return Err(Error::InvalidInput("Bitrate must be positive".to_string()));
        }
        Ok(())
    }
}

/// Serializes encode tasks into a one-at-a-time pipeline
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    context: TaskContext,
    bitrate_kbps: Option<u32>,
    next_id: AtomicU64,
    pending: Mutex<VecDeque<Arc<EncodeTask>>>,
    idle: Condvar,
    observers: Mutex<Vec<StatusObserver>>,
}

impl TaskQueue {
    /// Create a queue using the configured built-in backend
    pub fn new(config: QueueConfig) -> Result<Self> {
        let factory = Arc::new(config.backend.clone());
        Self::with_factory(factory, config)
    }

    /// Create a queue around any engine factory
    pub fn with_factory(factory: Arc<dyn EngineFactory>, config: QueueConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                context: TaskContext {
                    factory,
                    registry: Arc::new(SessionRegistry::new()),
                    drain_grace: config.drain_grace,
                },
                bitrate_kbps: config.bitrate_kbps,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(VecDeque::new()),
                idle: Condvar::new(),
                observers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Observe every status change of every task submitted from now on
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(TaskId, TaskStatus) + Send + Sync + 'static,
    {
        lock(&self.inner.observers).push(Arc::new(observer));
    }

    /// Queue `frames` for encoding into `output_path`.
    ///
    /// Returns `Ok(None)` without touching the queue when `frames` is
    /// empty. When the queue was idle the task starts right away: its
    /// session is set up on the calling thread, so setup errors are
    /// returned here, and encoding continues on a worker thread.
    pub fn submit<P: AsRef<Path>>(
        &self,
        frames: Vec<Frame>,
        width: u32,
        height: u32,
        fps: u32,
        output_path: P,
    ) -> Result<Option<Arc<EncodeTask>>> {
        if frames.is_empty() {
            log::debug!("Ignoring submission without frames");
            return Ok(None);
        }

        let config = SessionConfig {
            width,
            height,
            fps,
            bitrate_kbps: self.inner.bitrate_kbps,
        };
        config.validate()?;
        if let Some((index, frame)) = frames
            .iter()
            .enumerate()
            .find(|(_, frame)| frame.width() != width || frame.height() != height)
        {
            return Err(Error::InvalidInput(format!(
                "Frame {} is {}x{}, expected {}x{}",
                index,
                frame.width(),
                frame.height(),
                width,
                height
            )));
        }

        // Ids are assigned under the pending lock so they follow queue order
        let (task, start_now) = {
            let mut pending = lock(&self.inner.pending);
            let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            let task = Arc::new(EncodeTask::new(
                id,
                config,
                frames,
                output_path.as_ref().to_path_buf(),
                self.inner.context.clone(),
            ));

            for observer in lock(&self.inner.observers).iter() {
                task.add_observer(Arc::clone(observer));
            }
            let queue = Arc::downgrade(&self.inner);
            task.set_on_end(Arc::new(move |id: TaskId, _: TaskStatus| {
                QueueInner::task_ended(&queue, id);
            }));

            let was_empty = pending.is_empty();
            pending.push_back(Arc::clone(&task));
            (task, was_empty)
        };
        let id = task.id();

        log::info!(
            "Queued task {} ({} frames, {}x{} @ {} fps) -> {}",
            id,
            task.frame_count(),
            width,
            height,
            fps,
            task.output_path().display()
        );

        if start_now {
            task.prepare()?;
            self.inner.spawn_worker(Arc::clone(&task), true);
        }

        Ok(Some(task))
    }

    /// Tasks queued or running
    pub fn len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The head of the queue, the only task that may be running
    pub fn active(&self) -> Option<Arc<EncodeTask>> {
        lock(&self.inner.pending).front().cloned()
    }

    /// Sessions currently registered for engine output
    pub fn live_sessions(&self) -> usize {
        self.inner.context.registry.len()
    }

    /// Block until every queued task has ended
    pub fn wait_idle(&self) {
        let mut pending = lock(&self.inner.pending);
        while !pending.is_empty() {
            pending = self
                .inner
                .idle
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) with an upper bound. Returns
    /// whether the queue drained in time.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let pending = lock(&self.inner.pending);
        let (pending, _) = self
            .inner
            .idle
            .wait_timeout_while(pending, timeout, |pending| !pending.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        pending.is_empty()
    }
}

impl QueueInner {
    fn task_ended(queue: &Weak<QueueInner>, finished: TaskId) {
        let Some(inner) = queue.upgrade() else {
            return;
        };

        let next = {
            let mut pending = lock(&inner.pending);
            match pending.front() {
                Some(head) if head.id() == finished => {
                    pending.pop_front();
                }
                _ => {
                    log::error!("Task {} ended but is not at the head of the queue", finished);
                    return;
                }
            }

            if pending.is_empty() {
                inner.idle.notify_all();
            }
            pending.front().cloned()
        };

        if let Some(next) = next {
            log::debug!("Task {} done, starting task {}", finished, next.id());
            inner.spawn_worker(next, false);
        }
    }

    /// Run a task on its own named thread. `prepared` tasks only need the
    /// encode phase.
    ///
    /// The worker holds the queue until its task has ended, so pending
    /// tasks still run after the last `TaskQueue` handle is dropped.
    fn spawn_worker(self: &Arc<Self>, task: Arc<EncodeTask>, prepared: bool) {
        let worker = Arc::clone(&task);
        let queue = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("stillcast-task-{}", task.id().as_u64()))
            .spawn(move || {
                if prepared {
                    worker.encode();
                } else {
                    worker.run();
                }
                drop(queue);
            });

        if let Err(e) = spawned {
            task.abort(Error::Io(e));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

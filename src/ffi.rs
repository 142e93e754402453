//! FFI (Foreign Function Interface) for C/Go interoperability

use crate::encoder::{Backend, Frame};
use crate::error::ErrorCode;
use crate::{available, EncodeTask, QueueConfig, TaskQueue, TaskStatus};
use libc::{c_char, size_t};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// FFI result structure
#[repr(C)]
pub struct FfiResult {
    pub code: ErrorCode,
    pub message: *mut c_char,
}

impl FfiResult {
    fn ok() -> Self {
        Self {
            code: ErrorCode::Ok,
            message: ptr::null_mut(),
        }
    }

    fn error(code: ErrorCode, message: &str) -> Self {
        let c_message = CString::new(message.replace('\0', "")).unwrap_or_default();
        Self {
            code,
            message: c_message.into_raw(),
        }
    }
}

impl From<crate::Error> for FfiResult {
    fn from(err: crate::Error) -> Self {
        FfiResult::error(ErrorCode::from(&err), &err.to_string())
    }
}

/// Engine selection across the C boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum FfiBackend {
    /// VideoToolbox on macOS, ffmpeg elsewhere
    Native = 0,
    /// ffmpeg subprocess on every platform
    Ffmpeg = 1,
    /// In-process test engine
    Loopback = 2,
}

impl FfiBackend {
    fn into_backend(self, ffmpeg_path: Option<PathBuf>) -> Backend {
        match self {
            FfiBackend::Native => Backend::Native,
            FfiBackend::Ffmpeg => Backend::Ffmpeg { path: ffmpeg_path },
            FfiBackend::Loopback => Backend::Loopback,
        }
    }
}

/// One RGBA frame: `width * height * 4` bytes, row-major
#[repr(C)]
pub struct FfiFrame {
    pub data: *const u8,
    pub len: size_t,
}

/// Opaque queue handle
///
/// Submitted tasks stay reachable by id until `stillcast_task_release`.
pub struct StillcastQueue {
    queue: TaskQueue,
    tasks: Mutex<HashMap<u64, Arc<EncodeTask>>>,
}

impl StillcastQueue {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, Arc<EncodeTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self, task_id: u64) -> Option<Arc<EncodeTask>> {
        self.tasks().get(&task_id).cloned()
    }
}

/// Report a task's status; a task that ended in failure reports its error
unsafe fn task_result(task: &EncodeTask, out_status: *mut TaskStatus) -> FfiResult {
    let status = task.status();
    if !out_status.is_null() {
        *out_status = status;
    }

    match (task.error_code(), task.failure()) {
        (Some(code), Some(message)) if status.is_terminal() => FfiResult::error(code, &message),
        _ => FfiResult::ok(),
    }
}

fn unknown_task(task_id: u64) -> FfiResult {
    FfiResult::error(ErrorCode::InvalidInput, &format!("Unknown task {}", task_id))
}

unsafe fn optional_path(path: *const c_char, what: &str) -> Result<Option<PathBuf>, FfiResult> {
    if path.is_null() {
        return Ok(None);
    }
    match CStr::from_ptr(path).to_str() {
        Ok(s) => Ok(Some(PathBuf::from(s))),
        Err(_) => Err(FfiResult::error(
            ErrorCode::InvalidInput,
            &format!("Invalid {}", what),
        )),
    }
}

/// Check if a backend can encode on this system
///
/// # Safety
/// - `ffmpeg_path` must be a valid null-terminated string or null
#[no_mangle]
pub unsafe extern "C" fn stillcast_available(
    backend: FfiBackend,
    ffmpeg_path: *const c_char,
) -> FfiResult {
    let ffmpeg_path = match optional_path(ffmpeg_path, "ffmpeg path") {
        Ok(path) => path,
        Err(result) => return result,
    };

    match available(&backend.into_backend(ffmpeg_path)) {
        Ok(_) => FfiResult::ok(),
        Err(e) => e.into(),
    }
}

/// Create a queue. Returns null if the queue could not be created.
#[no_mangle]
pub extern "C" fn stillcast_queue_new(backend: FfiBackend) -> *mut StillcastQueue {
    let config = QueueConfig {
        backend: backend.into_backend(None),
        ..Default::default()
    };

    match TaskQueue::new(config) {
        Ok(queue) => Box::into_raw(Box::new(StillcastQueue {
            queue,
            tasks: Mutex::new(HashMap::new()),
        })),
        Err(e) => {
            log::error!("Failed to create queue: {}", e);
            ptr::null_mut()
        }
    }
}

/// Wait for queued work, then free the queue
///
/// # Safety
/// - `queue` must be null or a pointer returned by `stillcast_queue_new`
///   that has not been freed
#[no_mangle]
pub unsafe extern "C" fn stillcast_queue_free(queue: *mut StillcastQueue) {
    if queue.is_null() {
        return;
    }

    let queue = Box::from_raw(queue);
    queue.queue.wait_idle();
}

/// Queue a burst of frames for encoding into `output_path`
///
/// On success the new task's id is stored in `out_task_id` when it is not
/// null. An empty burst returns `EmptyInput` and queues nothing.
///
/// # Safety
/// - `queue` must be a live pointer returned by `stillcast_queue_new`
/// - `frames` must point to `frame_count` valid `FfiFrame`s, each
///   pointing to `len` readable bytes
/// - `output_path` must be a valid null-terminated string
/// - `out_task_id` must be null or valid for writes
#[no_mangle]
pub unsafe extern "C" fn stillcast_queue_submit(
    queue: *const StillcastQueue,
    frames: *const FfiFrame,
    frame_count: size_t,
    width: u32,
    height: u32,
    fps: u32,
    output_path: *const c_char,
    out_task_id: *mut u64,
) -> FfiResult {
    if queue.is_null() {
        return FfiResult::error(ErrorCode::InvalidInput, "Queue is null");
    }

    if frames.is_null() || frame_count == 0 {
        return FfiResult::error(ErrorCode::EmptyInput, "No frames provided");
    }

    let output_path = match optional_path(output_path, "output path") {
        Ok(Some(path)) => path,
        Ok(None) => return FfiResult::error(ErrorCode::InvalidInput, "Output path is null"),
        Err(result) => return result,
    };

    let ffi_frames = slice::from_raw_parts(frames, frame_count);
    let mut owned = Vec::with_capacity(frame_count);
    for (index, frame) in ffi_frames.iter().enumerate() {
        if frame.data.is_null() {
            return FfiResult::error(
                ErrorCode::InvalidInput,
                &format!("Frame {} data is null", index),
            );
        }

        let data = slice::from_raw_parts(frame.data, frame.len).to_vec();
        match Frame::new(width, height, data) {
            Ok(frame) => owned.push(frame),
            Err(e) => return e.into(),
        }
    }

    match (*queue).queue.submit(owned, width, height, fps, output_path) {
        Ok(Some(task)) => {
            let task_id = task.id().as_u64();
            (*queue).tasks().insert(task_id, task);
            if !out_task_id.is_null() {
                *out_task_id = task_id;
            }
            FfiResult::ok()
        }
        Ok(None) => FfiResult::error(ErrorCode::EmptyInput, "No frames provided"),
        Err(e) => e.into(),
    }
}

/// Block until every queued task has ended
///
/// # Safety
/// - `queue` must be null or a live pointer returned by `stillcast_queue_new`
#[no_mangle]
pub unsafe extern "C" fn stillcast_queue_wait_idle(queue: *const StillcastQueue) {
    if let Some(queue) = queue.as_ref() {
        queue.queue.wait_idle();
    }
}

/// Current status of a submitted task, stored in `out_status` when not
/// null. Once the task has ended in failure the result carries the
/// failure's code and message.
///
/// # Safety
/// - `queue` must be a live pointer returned by `stillcast_queue_new`
/// - `out_status` must be null or valid for writes
#[no_mangle]
pub unsafe extern "C" fn stillcast_task_status(
    queue: *const StillcastQueue,
    task_id: u64,
    out_status: *mut TaskStatus,
) -> FfiResult {
    let Some(queue) = queue.as_ref() else {
        return FfiResult::error(ErrorCode::InvalidInput, "Queue is null");
    };

    match queue.task(task_id) {
        Some(task) => task_result(&task, out_status),
        None => unknown_task(task_id),
    }
}

/// Block until a task has ended, then report it like `stillcast_task_status`
///
/// # Safety
/// - `queue` must be a live pointer returned by `stillcast_queue_new`
/// - `out_status` must be null or valid for writes
#[no_mangle]
pub unsafe extern "C" fn stillcast_task_wait(
    queue: *const StillcastQueue,
    task_id: u64,
    out_status: *mut TaskStatus,
) -> FfiResult {
    let Some(queue) = queue.as_ref() else {
        return FfiResult::error(ErrorCode::InvalidInput, "Queue is null");
    };

    match queue.task(task_id) {
        Some(task) => {
            task.wait();
            task_result(&task, out_status)
        }
        None => unknown_task(task_id),
    }
}

/// Forget a task; its id is unknown afterwards
///
/// # Safety
/// - `queue` must be null or a live pointer returned by `stillcast_queue_new`
#[no_mangle]
pub unsafe extern "C" fn stillcast_task_release(queue: *const StillcastQueue, task_id: u64) {
    if let Some(queue) = queue.as_ref() {
        queue.tasks().remove(&task_id);
    }
}

/// Free a result's message string
///
/// # Safety
/// - `result` must point to a valid `FfiResult` that was returned by a stillcast function
#[no_mangle]
pub unsafe extern "C" fn stillcast_free_result(result: *mut FfiResult) {
    if result.is_null() {
        return;
    }

    let result = &mut *result;
    if !result.message.is_null() {
        let _ = CString::from_raw(result.message);
        result.message = ptr::null_mut();
    }
}

/// Get version string
#[no_mangle]
pub extern "C" fn stillcast_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

//! Integration tests for the encode queue

mod common;

use common::*;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stillcast::bitstream::{annexb_units, nal_type, nal_unit_type};
use stillcast::{Backend, Error, QueueConfig, TaskQueue, TaskStatus};
use tempfile::TempDir;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn loopback_config() -> QueueConfig {
    QueueConfig {
        backend: Backend::Loopback,
        ..Default::default()
    }
}

fn logged_queue(queue: &TaskQueue) -> StatusLog {
    let log = StatusLog::default();
    queue.subscribe(log.observer());
    log
}

/// Three screenshots at 2 fps become SPS, PPS and six slices
#[test]
fn test_end_to_end_stream_layout() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("burst.h264");

    let queue = TaskQueue::new(loopback_config()).unwrap();
    let log = logged_queue(&queue);

    let task = queue
        .submit(generate_frames(3, 100, 100), 100, 100, 2, &output)
        .unwrap()
        .expect("task should be created");

    assert_eq!(task.wait(), TaskStatus::End);
    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));
    assert!(task.failure().is_none(), "{:?}", task.failure());

    assert_eq!(
        log.statuses(task.id()),
        vec![TaskStatus::Ready, TaskStatus::Encoding, TaskStatus::End]
    );

    assert!(verify_annexb_header(&output));
    let bytes = std::fs::read(&output).unwrap();
    let types: Vec<u8> = annexb_units(&bytes)
        .map(|nal| nal_unit_type(nal).unwrap())
        .collect();

    assert_eq!(types.len(), 8);
    assert_eq!(types[0], nal_type::SPS);
    assert_eq!(types[1], nal_type::PPS);
    assert!(types[2..]
        .iter()
        .all(|&t| t == nal_type::IDR_SLICE || t == nal_type::NON_IDR_SLICE));
    assert_eq!(types[2], nal_type::IDR_SLICE);

    let stats = task.stats();
    assert_eq!(stats.frames_submitted, 6);
    assert_eq!(stats.units_written, 6);
    assert_eq!(stats.units_dropped, 0);
    assert_eq!(Some(stats.bytes_written), get_file_size(&output));
    assert_eq!(queue.live_sessions(), 0);
}

/// An empty burst creates no task, no file and no status change
#[test]
fn test_empty_submission_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("empty.h264");

    let queue = TaskQueue::new(loopback_config()).unwrap();
    let log = logged_queue(&queue);

    let task = queue.submit(Vec::new(), 100, 100, 2, &output).unwrap();

    assert!(task.is_none());
    assert!(queue.is_empty());
    assert!(queue.active().is_none());
    assert!(!output.exists());
    assert!(log.events().is_empty());
}

/// Tasks run strictly one at a time, in submission order
#[test]
fn test_one_task_at_a_time_in_order() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let queue = TaskQueue::new(loopback_config()).unwrap();
    let log = logged_queue(&queue);

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            queue
                .submit(
                    generate_frames(2, 32, 32),
                    32,
                    32,
                    3,
                    temp_dir.path().join(format!("task_{}.h264", i)),
                )
                .unwrap()
                .unwrap()
        })
        .collect();

    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));

    let mut running = HashSet::new();
    let mut started = Vec::new();
    for (id, status) in log.events() {
        match status {
            TaskStatus::Ready => {
                assert!(running.is_empty(), "task {} started while {:?} ran", id, running);
                running.insert(id);
                started.push(id);
            }
            TaskStatus::End => {
                running.remove(&id);
            }
            _ => assert!(running.contains(&id)),
        }
    }

    let submitted: Vec<_> = tasks.iter().map(|task| task.id()).collect();
    assert_eq!(started, submitted);
    for task in &tasks {
        assert_eq!(task.status(), TaskStatus::End);
        assert!(verify_annexb_header(task.output_path()));
    }
}

/// Later submissions wait behind the running task
#[test]
fn test_later_tasks_wait() {
    let temp_dir = TempDir::new().unwrap();
    let gate = Gate::closed();
    let factory = Arc::new(SelectiveFactory::new(Vec::new()).gated(Arc::clone(&gate)));
    let queue = TaskQueue::with_factory(factory, QueueConfig::default()).unwrap();

    let first = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, temp_dir.path().join("a.h264"))
        .unwrap()
        .unwrap();
    let second = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, temp_dir.path().join("b.h264"))
        .unwrap()
        .unwrap();

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.active().unwrap().id(), first.id());
    assert_ne!(first.status(), TaskStatus::Waiting);
    assert_eq!(second.status(), TaskStatus::Waiting);
    assert!(!temp_dir.path().join("b.h264").exists());

    gate.open();
    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));
    assert_eq!(second.status(), TaskStatus::End);
    assert!(second.failure().is_none());
}

/// A setup failure on an idle queue is returned to the caller
#[test]
fn test_setup_failure_returned_synchronously() {
    let temp_dir = TempDir::new().unwrap();
    let queue = TaskQueue::with_factory(Arc::new(RejectingFactory), QueueConfig::default()).unwrap();
    let log = logged_queue(&queue);

    let result = queue.submit(
        generate_frames(2, 16, 16),
        16,
        16,
        2,
        temp_dir.path().join("out.h264"),
    );

    assert!(matches!(result, Err(Error::SessionInit(_))));
    assert!(queue.is_empty());
    assert_eq!(queue.live_sessions(), 0);

    let events = log.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, TaskStatus::End);
}

/// A task that cannot start ends without affecting its neighbours
#[test]
fn test_queued_setup_failure_is_isolated() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let gate = Gate::closed();
    let factory = Arc::new(SelectiveFactory::new(vec![1]).gated(Arc::clone(&gate)));
    let queue = TaskQueue::with_factory(factory, QueueConfig::default()).unwrap();
    let log = logged_queue(&queue);

    let tasks: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            queue
                .submit(
                    generate_frames(2, 16, 16),
                    16,
                    16,
                    2,
                    temp_dir.path().join(format!("{}.h264", name)),
                )
                .unwrap()
                .unwrap()
        })
        .collect();

    gate.open();
    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));

    assert!(tasks[0].failure().is_none());
    assert_eq!(log.statuses(tasks[1].id()), vec![TaskStatus::End]);
    assert!(tasks[1].failure().unwrap().contains("refused"));
    assert_eq!(
        log.statuses(tasks[2].id()),
        vec![TaskStatus::Ready, TaskStatus::Encoding, TaskStatus::End]
    );
    assert!(tasks[2].failure().is_none());
    assert!(verify_annexb_header(tasks[2].output_path()));
}

/// A frame rejected mid-stream ends that task; the queue keeps going
#[test]
fn test_encode_failure_is_isolated() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let queue =
        TaskQueue::with_factory(Arc::new(FailingFactory { accept: 4 }), QueueConfig::default())
            .unwrap();
    let log = logged_queue(&queue);

    // 1 still at 2 fps fits, 3 stills need 6 submissions
    let counts = [1, 3, 1];
    let tasks: Vec<_> = counts
        .iter()
        .enumerate()
        .map(|(i, &count)| {
            queue
                .submit(
                    generate_frames(count, 16, 16),
                    16,
                    16,
                    2,
                    temp_dir.path().join(format!("{}.h264", i)),
                )
                .unwrap()
                .unwrap()
        })
        .collect();

    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));

    assert!(tasks[0].failure().is_none());
    assert!(tasks[1].failure().unwrap().contains("frame rejected"));
    assert_eq!(
        log.statuses(tasks[1].id()),
        vec![TaskStatus::Ready, TaskStatus::Encoding, TaskStatus::End]
    );
    assert_eq!(tasks[1].stats().frames_submitted, 4);
    assert!(tasks[2].failure().is_none());
    assert_eq!(tasks[2].stats().units_written, 2);
    assert_eq!(queue.live_sessions(), 0);
}

/// Frames that disagree with the declared geometry are refused up front
#[test]
fn test_geometry_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let queue = TaskQueue::new(loopback_config()).unwrap();

    let mut frames = generate_frames(2, 32, 32);
    frames.extend(generate_frames(1, 16, 16));

    let result = queue.submit(frames, 32, 32, 2, temp_dir.path().join("out.h264"));
    assert!(matches!(result, Err(Error::InvalidInput(_))));
    assert!(queue.is_empty());
}

/// Output at an existing path is replaced, not appended to
#[test]
fn test_existing_output_replaced() {
    let temp_dir = TempDir::new().unwrap();
    let output = temp_dir.path().join("out.h264");
    std::fs::write(&output, b"stale data that is not a stream").unwrap();

    let queue = TaskQueue::new(loopback_config()).unwrap();
    let task = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, &output)
        .unwrap()
        .unwrap();
    task.wait();

    assert!(verify_annexb_header(&output));
    assert_eq!(get_file_size(&output), Some(task.stats().bytes_written));
}

/// A configured grace period still ends every task
#[test]
fn test_drain_grace() {
    let temp_dir = TempDir::new().unwrap();
    let queue = TaskQueue::new(QueueConfig {
        backend: Backend::Loopback,
        bitrate_kbps: Some(512),
        drain_grace: Duration::from_millis(20),
    })
    .unwrap();

    let task = queue
        .submit(generate_frames(2, 16, 16), 16, 16, 1, temp_dir.path().join("out.h264"))
        .unwrap()
        .unwrap();

    assert!(task.wait_timeout(IDLE_TIMEOUT));
    assert!(task.failure().is_none());
    assert_eq!(task.config().bitrate_kbps, Some(512));
}

/// An engine error reported through the output callback stops submission
#[test]
fn test_callback_failure_stops_feeding() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let factory = Arc::new(CallbackFailingFactory::default());
    let encode_calls = Arc::clone(&factory.encode_calls);
    let queue = TaskQueue::with_factory(factory, QueueConfig::default()).unwrap();
    let log = logged_queue(&queue);

    let task = queue
        .submit(generate_frames(20, 16, 16), 16, 16, 5, temp_dir.path().join("out.h264"))
        .unwrap()
        .unwrap();

    assert_eq!(task.wait(), TaskStatus::End);
    assert!(task.failure().unwrap().contains("status -12902"));
    assert_eq!(encode_calls.load(Ordering::SeqCst), 1);
    assert_eq!(task.stats().frames_submitted, 1);
    assert_eq!(
        log.statuses(task.id()),
        vec![TaskStatus::Ready, TaskStatus::Encoding, TaskStatus::End]
    );
}

/// Pending work still runs to completion after the queue handle is dropped
#[test]
fn test_dropped_queue_finishes_pending_tasks() {
    let temp_dir = TempDir::new().unwrap();
    let gate = Gate::closed();
    let factory = Arc::new(SelectiveFactory::new(Vec::new()).gated(Arc::clone(&gate)));
    let queue = TaskQueue::with_factory(factory, QueueConfig::default()).unwrap();

    let first = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, temp_dir.path().join("a.h264"))
        .unwrap()
        .unwrap();
    let second = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, temp_dir.path().join("b.h264"))
        .unwrap()
        .unwrap();

    drop(queue);
    gate.open();

    assert!(first.wait_timeout(IDLE_TIMEOUT));
    assert!(second.wait_timeout(IDLE_TIMEOUT));
    assert_eq!(second.status(), TaskStatus::End);
    assert!(second.failure().is_none());
    assert!(verify_annexb_header(temp_dir.path().join("b.h264")));
}

/// Concurrent submitters still get one task at a time, in id order
#[test]
fn test_concurrent_submitters() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(TaskQueue::new(loopback_config()).unwrap());
    let log = logged_queue(&queue);

    let submitters: Vec<_> = (0..4)
        .map(|thread_index| {
            let queue = Arc::clone(&queue);
            let dir = temp_dir.path().to_path_buf();
            thread::spawn(move || {
                (0..3)
                    .map(|i| {
                        queue
                            .submit(
                                generate_frames(2, 16, 16),
                                16,
                                16,
                                2,
                                dir.join(format!("t{}_{}.h264", thread_index, i)),
                            )
                            .unwrap()
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let tasks: Vec<_> = submitters
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));

    let mut running = HashSet::new();
    let mut started = Vec::new();
    for (id, status) in log.events() {
        match status {
            TaskStatus::Ready => {
                assert!(running.is_empty(), "task {} started while {:?} ran", id, running);
                running.insert(id);
                started.push(id);
            }
            TaskStatus::End => {
                running.remove(&id);
            }
            _ => assert!(running.contains(&id)),
        }
    }

    let mut ids: Vec<_> = tasks.iter().map(|task| task.id()).collect();
    ids.sort();
    assert_eq!(started, ids);
    assert!(tasks.iter().all(|task| task.failure().is_none()));
}

/// Observers added after submission see a task end before the next starts
#[test]
fn test_late_observers_see_end_first() {
    let temp_dir = TempDir::new().unwrap();
    let gate = Gate::closed();
    let factory = Arc::new(SelectiveFactory::new(Vec::new()).gated(Arc::clone(&gate)));
    let queue = TaskQueue::with_factory(factory, QueueConfig::default()).unwrap();
    let log = StatusLog::default();

    let first = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, temp_dir.path().join("a.h264"))
        .unwrap()
        .unwrap();
    let second = queue
        .submit(generate_frames(1, 16, 16), 16, 16, 1, temp_dir.path().join("b.h264"))
        .unwrap()
        .unwrap();
    first.subscribe(log.observer());
    second.subscribe(log.observer());

    gate.open();
    assert!(queue.wait_idle_timeout(IDLE_TIMEOUT));

    let events = log.events();
    let first_end = events
        .iter()
        .position(|&event| event == (first.id(), TaskStatus::End))
        .unwrap();
    let second_ready = events
        .iter()
        .position(|&event| event == (second.id(), TaskStatus::Ready))
        .unwrap();
    assert!(first_end < second_ready);
}

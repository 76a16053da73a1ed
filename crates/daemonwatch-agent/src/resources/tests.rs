//! Unit tests for resource tracking

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daemonwatch_common::{
    LookupError, LookupResult, ProcessIdentity, ResourceBackend, ResourceSample, ResourceSource,
    Resources,
};
use parking_lot::Mutex;

use super::{ResourceTask, ResourceTracker};
use crate::daemon::{DaemonState, Task};
use crate::testing::capture_logs;

// ============================================================================
// Test Fixtures
// ============================================================================

fn sample(total_cpu_time: f64) -> ResourceSample {
    ResourceSample {
        total_cpu_time,
        uptime: 100.0,
        memory_bytes: 2048,
        memory_percent: 0.25,
    }
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(5));
    }

    condition()
}

// ============================================================================
// Mock Resource Source
// ============================================================================

/// Replays queued samples per backend, failing once a queue runs dry
#[derive(Default)]
struct MockSource {
    proc_samples: Mutex<VecDeque<Option<ResourceSample>>>,
    ps_samples: Mutex<VecDeque<Option<ResourceSample>>>,
    calls: Mutex<Vec<ResourceBackend>>,
}

impl MockSource {
    fn queue(&self, backend: ResourceBackend, samples: Vec<Option<ResourceSample>>) {
        let queue = match backend {
            ResourceBackend::Proc => &self.proc_samples,
            ResourceBackend::Ps => &self.ps_samples,
        };

        queue.lock().extend(samples);
    }

    fn calls(&self) -> Vec<ResourceBackend> {
        self.calls.lock().clone()
    }
}

impl ResourceSource for MockSource {
    fn sample(&self, backend: ResourceBackend, _pid: u32) -> LookupResult<ResourceSample> {
        self.calls.lock().push(backend);

        let queue = match backend {
            ResourceBackend::Proc => &self.proc_samples,
            ResourceBackend::Ps => &self.ps_samples,
        };

        queue
            .lock()
            .pop_front()
            .flatten()
            .ok_or_else(|| LookupError::parse(backend.name(), "synthetic failure"))
    }
}

fn tracker(rate: Duration, mock: &Arc<MockSource>) -> ResourceTracker {
    ResourceTracker::new(
        rate,
        ProcessIdentity::new(Some(12345), "tor"),
        ResourceBackend::Proc,
        Arc::clone(mock) as Arc<dyn ResourceSource>,
    )
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_usage_is_zero_before_first_sample() {
    let mock = Arc::new(MockSource::default());
    let tracker = tracker(Duration::from_secs(10), &mock);

    assert_eq!(tracker.get_resource_usage(), Resources::default());
    assert_eq!(tracker.backend(), ResourceBackend::Proc);
}

#[test]
fn test_cpu_sample_relative_to_previous() {
    let mock = Arc::new(MockSource::default());
    mock.queue(ResourceBackend::Proc, vec![Some(sample(10.0)), Some(sample(15.0))]);

    let tracker = tracker(Duration::from_millis(100), &mock);
    tracker.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || tracker.run_counter() >= 1));
    let first = tracker.get_resource_usage();
    assert_eq!(first.cpu_sample, 0.0);
    assert_eq!(first.cpu_total, 10.0);
    assert_eq!(first.cpu_average, 0.1);
    assert_eq!(first.memory_bytes, 2048);
    assert_eq!(first.memory_percent, 0.25);

    assert!(wait_for(Duration::from_secs(2), || tracker.run_counter() >= 2));
    let second = tracker.get_resource_usage();
    assert_eq!(second.cpu_sample, 0.5);
    assert_eq!(second.cpu_total, 15.0);
    assert!(second.timestamp >= first.timestamp);
}

#[test]
fn test_falls_back_to_ps() {
    let mock = Arc::new(MockSource::default());
    mock.queue(ResourceBackend::Ps, vec![Some(sample(3.0)), Some(sample(4.0))]);

    let tracker = tracker(Duration::from_millis(5), &mock);
    tracker.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || tracker.run_counter() >= 2));
    assert_eq!(tracker.backend(), ResourceBackend::Ps);
    assert_eq!(tracker.get_resource_usage().cpu_total, 4.0);

    // three proc attempts, then nothing but ps
    let calls = tracker_calls_until_halt(&tracker, &mock);
    assert_eq!(&calls[..3], &[ResourceBackend::Proc; 3]);
    assert!(calls[3..].iter().all(|b| *b == ResourceBackend::Ps));
}

/// Waits for a tracker to give up, providing the lookups it made.
fn tracker_calls_until_halt(tracker: &ResourceTracker, mock: &MockSource) -> Vec<ResourceBackend> {
    assert!(wait_for(Duration::from_secs(2), || tracker.is_halted()));
    tracker.join();
    mock.calls()
}

#[test]
fn test_halts_when_ps_fails() {
    let mock = Arc::new(MockSource::default());
    mock.queue(ResourceBackend::Proc, vec![Some(sample(8.0))]);

    let tracker = tracker(Duration::from_millis(5), &mock);
    tracker.start().unwrap();

    let calls = tracker_calls_until_halt(&tracker, &mock);

    assert_eq!(
        calls,
        vec![
            ResourceBackend::Proc,
            ResourceBackend::Proc,
            ResourceBackend::Proc,
            ResourceBackend::Proc,
            ResourceBackend::Ps,
            ResourceBackend::Ps,
            ResourceBackend::Ps,
        ]
    );

    assert_eq!(tracker.state(), DaemonState::Halted);
    assert!(!tracker.is_alive());
    assert_eq!(tracker.run_counter(), 1);

    // the last sample we took is still what we report
    assert_eq!(tracker.get_resource_usage().cpu_total, 8.0);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(mock.calls().len(), 7);
}

#[test]
fn test_success_resets_failure_count() {
    let mock = Arc::new(MockSource::default());
    mock.queue(
        ResourceBackend::Proc,
        vec![
            None,
            None,
            Some(sample(1.0)),
            None,
            None,
            Some(sample(2.0)),
            None,
            None,
            Some(sample(3.0)),
        ],
    );

    let tracker = tracker(Duration::from_millis(5), &mock);
    tracker.start().unwrap();

    assert!(wait_for(Duration::from_secs(2), || tracker.run_counter() >= 3));
    assert_eq!(tracker.get_resource_usage().cpu_total, 3.0);
    assert_eq!(&mock.calls()[..9], &[ResourceBackend::Proc; 9]);
}

#[test]
fn test_exhaustion_is_logged_with_backend_and_error() {
    let mock = Arc::new(MockSource::default());
    let tracker = tracker(Duration::from_secs(10), &mock);

    let mut task = ResourceTask {
        shared: Arc::clone(&tracker.shared),
        source: Arc::clone(&mock) as Arc<dyn ResourceSource>,
        failure_count: 0,
    };

    let logs = capture_logs(|| {
        for _ in 0..6 {
            assert!(!task.run(tracker.control(), 12345, "tor"));
        }
    });

    let downgrade = logs
        .lines()
        .find(|line| line.contains("falling back to ps"))
        .unwrap();
    assert!(downgrade.contains("tracker=\"resources\""));
    assert!(downgrade.contains("backend=proc"));
    assert!(downgrade.contains("error="));

    let abandon = logs.lines().find(|line| line.contains("giving up")).unwrap();
    assert!(abandon.contains("backend=ps"));
    assert!(abandon.contains("synthetic failure"));

    assert!(logs.contains("parse=true"));
    assert!(tracker.is_halted());
}

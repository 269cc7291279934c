use std::collections::VecDeque;
use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::cache_key::SourceIdentity;
use crate::converter::{ConversionError, ConversionSettings, Converter};
use crate::observability::{self, panic_payload_to_string};

/// Identifies one submitted request. Unique across every worker in the
/// process, so tickets from different kinds never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTag(u64);

impl RequestTag {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct ConversionRequest {
    pub source: SourceIdentity,
    /// Loose-cache path the result is meant for.
    pub destination: String,
    pub settings: ConversionSettings,
    pub source_bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct ConversionResult {
    pub tag: RequestTag,
    pub destination: String,
    pub outcome: Result<Vec<u8>, ConversionError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::ShuttingDown => "shutting down",
            WorkerState::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerTelemetry {
    pub queued: usize,
    pub in_flight: bool,
    pub ready: usize,
    pub completed: usize,
    pub failed: usize,
    pub fault: Option<String>,
}

struct Job {
    tag: RequestTag,
    request: ConversionRequest,
}

struct QueueState {
    entries: VecDeque<Job>,
    results: VecDeque<ConversionResult>,
    in_flight: bool,
    shutdown: bool,
    stopped: bool,
    fault: Option<String>,
}

struct WorkerShared {
    queue: Mutex<QueueState>,
    wake: Condvar,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().expect("conversion queue lock poisoned")
    }
}

/// One background thread running one converter. Requests are served in
/// submission order; results are collected by polling.
pub struct ConversionWorker {
    name: String,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl ConversionWorker {
    pub fn spawn(name: &str, converter: Arc<dyn Converter>) -> std::io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(QueueState {
                entries: VecDeque::new(),
                results: VecDeque::new(),
                in_flight: false,
                shutdown: false,
                stopped: false,
                fault: None,
            }),
            wake: Condvar::new(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });
        let thread_name = format!("convert-{}", name);
        let worker_shared = Arc::clone(&shared);
        let loop_name = thread_name.clone();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(&loop_name, &worker_shared, converter.as_ref()))?;
        debug!(worker = name, "conversion worker started");
        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Never blocks. A stopped worker answers immediately with
    /// `WorkerStopped`.
    pub fn submit(&self, request: ConversionRequest) -> RequestTag {
        let tag = RequestTag::next();
        let mut guard = self.shared.lock();
        if guard.shutdown || guard.stopped {
            guard.results.push_back(ConversionResult {
                tag,
                destination: request.destination,
                outcome: Err(ConversionError::WorkerStopped),
            });
            return tag;
        }
        debug!(worker = %self.name, %tag, destination = %request.destination, "queued conversion");
        guard.entries.push_back(Job { tag, request });
        self.shared.wake.notify_one();
        tag
    }

    /// Pops at most one finished result.
    pub fn poll(&self) -> Option<ConversionResult> {
        self.shared.lock().results.pop_front()
    }

    /// True while a request is queued or being converted.
    pub fn is_busy(&self) -> bool {
        let guard = self.shared.lock();
        !guard.entries.is_empty() || guard.in_flight
    }

    pub fn state(&self) -> WorkerState {
        let guard = self.shared.lock();
        if guard.stopped {
            WorkerState::Stopped
        } else if guard.shutdown {
            WorkerState::ShuttingDown
        } else if !guard.entries.is_empty() || guard.in_flight {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        }
    }

    pub fn telemetry(&self) -> WorkerTelemetry {
        let guard = self.shared.lock();
        WorkerTelemetry {
            queued: guard.entries.len(),
            in_flight: guard.in_flight,
            ready: guard.results.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            fault: guard.fault.clone(),
        }
    }

    /// Stops the thread and waits for it, including any conversion in
    /// progress. Queued requests are answered with `WorkerStopped` and stay
    /// pollable.
    pub fn shutdown(&mut self) {
        {
            let mut guard = self.shared.lock();
            guard.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "conversion thread exited abnormally");
            }
            debug!(worker = %self.name, "conversion worker stopped");
        }
    }
}

impl Drop for ConversionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn next_job(shared: &WorkerShared) -> Option<Job> {
    let mut guard = shared.lock();
    loop {
        if guard.shutdown {
            return None;
        }
        if let Some(job) = guard.entries.pop_front() {
            guard.in_flight = true;
            return Some(job);
        }
        guard = shared.wake.wait(guard).expect("conversion queue lock poisoned");
    }
}

fn worker_loop(name: &str, shared: &WorkerShared, converter: &dyn Converter) {
    while let Some(job) = next_job(shared) {
        let Job { tag, request } = job;
        let converted = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            converter.convert(&request.source_bytes, &request.settings)
        }));
        let (outcome, fault) = match converted {
            Ok(outcome) => (outcome, None),
            Err(payload) => {
                let message = panic_payload_to_string(payload.as_ref());
                (
                    Err(ConversionError::ConverterPanicked(message.clone())),
                    Some(message),
                )
            }
        };
        match &outcome {
            Ok(_) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = name, %tag, source = %request.source.path, "conversion failed: {}", err);
            }
        }

        let mut guard = shared.lock();
        guard.in_flight = false;
        guard.results.push_back(ConversionResult {
            tag,
            destination: request.destination,
            outcome,
        });
        if let Some(message) = fault {
            guard.fault = Some(message.clone());
            drop(guard);
            observability::set_sticky_error(
                name,
                format!("converter panicked on {}, worker stopping: {}", tag, message),
            );
            break;
        }
    }

    let mut guard = shared.lock();
    guard.stopped = true;
    while let Some(job) = guard.entries.pop_front() {
        guard.results.push_back(ConversionResult {
            tag: job.tag,
            destination: job.request.destination,
            outcome: Err(ConversionError::WorkerStopped),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStat;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn request(name: &str, bytes: &[u8]) -> ConversionRequest {
        ConversionRequest {
            source: SourceIdentity::from_stat(
                format!("art/{}.dae", name),
                FileStat {
                    mtime: 1000,
                    size: bytes.len() as u64,
                },
            ),
            destination: format!("cache/art/{}.pmd", name),
            settings: ConversionSettings::new(),
            source_bytes: bytes.to_vec(),
        }
    }

    fn collect(worker: &ConversionWorker, count: usize) -> Vec<ConversionResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < count {
            match worker.poll() {
                Some(result) => results.push(result),
                None => {
                    assert!(Instant::now() < deadline, "timed out waiting for results");
                    thread::sleep(Duration::from_millis(2));
                }
            }
        }
        results
    }

    fn upper(source: &[u8], _: &ConversionSettings) -> Result<Vec<u8>, ConversionError> {
        Ok(source.to_ascii_uppercase())
    }

    #[test]
    fn results_arrive_in_submission_order() {
        let worker = ConversionWorker::spawn("mesh", Arc::new(upper)).unwrap();
        let tags: Vec<RequestTag> = ["r1", "r2", "r3"]
            .iter()
            .map(|name| worker.submit(request(name, name.as_bytes())))
            .collect();
        let results = collect(&worker, 3);
        let seen: Vec<RequestTag> = results.iter().map(|result| result.tag).collect();
        assert_eq!(seen, tags);
        assert_eq!(results[1].outcome, Ok(b"R2".to_vec()));
        assert_eq!(results[2].destination, "cache/art/r3.pmd");
        assert!(worker.poll().is_none());
    }

    #[test]
    fn failed_conversion_keeps_worker_running() {
        let converter = |source: &[u8], _: &ConversionSettings| -> Result<Vec<u8>, ConversionError> {
            if source == b"bad" {
                Err(ConversionError::Failed("malformed".to_string()))
            } else {
                Ok(source.to_vec())
            }
        };
        let worker = ConversionWorker::spawn("texture", Arc::new(converter)).unwrap();
        worker.submit(request("a", b"bad"));
        worker.submit(request("b", b"good"));
        let results = collect(&worker, 2);
        assert_eq!(
            results[0].outcome,
            Err(ConversionError::Failed("malformed".to_string()))
        );
        assert_eq!(results[1].outcome, Ok(b"good".to_vec()));
        let telemetry = worker.telemetry();
        assert_eq!(telemetry.completed, 1);
        assert_eq!(telemetry.failed, 1);
        assert_ne!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn panic_faults_the_worker() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let converter = move |source: &[u8], _: &ConversionSettings| -> Result<Vec<u8>, ConversionError> {
            let _ = release_rx.lock().unwrap().recv();
            if source == b"boom" {
                panic!("corrupt state");
            }
            Ok(source.to_vec())
        };
        let worker = ConversionWorker::spawn("xml", Arc::new(converter)).unwrap();
        let first = worker.submit(request("a", b"boom"));
        let queued = worker.submit(request("b", b"fine"));
        drop(release_tx);

        let results = collect(&worker, 2);
        assert_eq!(results[0].tag, first);
        assert!(matches!(
            results[0].outcome,
            Err(ConversionError::ConverterPanicked(ref message)) if message == "corrupt state"
        ));
        assert_eq!(results[1].tag, queued);
        assert_eq!(results[1].outcome, Err(ConversionError::WorkerStopped));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(worker.telemetry().fault.as_deref(), Some("corrupt state"));

        let late = worker.submit(request("c", b"late"));
        let results = collect(&worker, 1);
        assert_eq!(results[0].tag, late);
        assert_eq!(results[0].outcome, Err(ConversionError::WorkerStopped));
    }

    #[test]
    fn shutdown_waits_for_in_flight_conversion() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let converter = move |source: &[u8], _: &ConversionSettings| -> Result<Vec<u8>, ConversionError> {
            let _ = started_tx.lock().unwrap().send(());
            thread::sleep(Duration::from_millis(50));
            Ok(source.to_vec())
        };
        let mut worker = ConversionWorker::spawn("slow", Arc::new(converter)).unwrap();
        let running = worker.submit(request("a", b"a"));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let pending = worker.submit(request("b", b"b"));
        assert!(worker.is_busy());

        worker.shutdown();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.is_busy());
        let first = worker.poll().unwrap();
        assert_eq!(first.tag, running);
        assert_eq!(first.outcome, Ok(b"a".to_vec()));
        let second = worker.poll().unwrap();
        assert_eq!(second.tag, pending);
        assert_eq!(second.outcome, Err(ConversionError::WorkerStopped));
    }

    #[test]
    fn idle_worker_is_not_busy() {
        let worker = ConversionWorker::spawn("idle", Arc::new(upper)).unwrap();
        assert!(!worker.is_busy());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.name(), "idle");
    }
}

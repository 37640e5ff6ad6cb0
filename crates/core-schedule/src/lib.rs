//! The render scheduler.
//!
//! One worker class per pipeline kind so a zoom storm on the full pipeline
//! can never starve the preview. Queues are bounded; a saturated queue drops
//! the request with a log (the next invalidation re-enqueues), and pending
//! duplicates collapse before a run starts — the worker drains its queue and
//! keeps only the newest timestamp, so a burst of edits amplifies into one
//! render, not a backlog of stale ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use core_image::{DevError, DevResult};
use core_pipeline::PipeKind;

/// Default per-class queue depth. Small on purpose: anything beyond a couple
/// of pending requests is work that coalescing or the drop policy should
/// absorb.
pub const DEFAULT_QUEUE_CAP: usize = 4;

/// A render trigger for one pipeline. The timestamp is the develop clock at
/// request time; when duplicates collapse the newest wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub pipe: PipeKind,
    pub timestamp: u64,
}

/// The work a scheduler worker performs for a collapsed request. The
/// implementor locks the pipeline and executes a full run; the scheduler
/// itself never touches pipeline state.
pub trait RenderJob: Send + Sync + 'static {
    fn run(&self, request: RenderRequest);
}

impl<F: Fn(RenderRequest) + Send + Sync + 'static> RenderJob for F {
    fn run(&self, request: RenderRequest) {
        self(request)
    }
}

/// Counters for tests and status displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub executed: u64,
    pub coalesced: u64,
    pub dropped: u64,
}

struct Shared {
    executed: AtomicU64,
    coalesced: AtomicU64,
    dropped: AtomicU64,
}

pub struct RenderScheduler {
    senders: HashMap<PipeKind, Sender<RenderRequest>>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl RenderScheduler {
    /// Spawn the three worker classes against `job`.
    pub fn spawn(job: Arc<dyn RenderJob>, queue_cap: usize) -> Self {
        let queue_cap = queue_cap.max(1);
        let shared = Arc::new(Shared {
            executed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let mut senders = HashMap::new();
        let mut handles = Vec::new();
        for kind in PipeKind::ALL {
            let (tx, rx) = bounded::<RenderRequest>(queue_cap);
            senders.insert(kind, tx);
            let job = Arc::clone(&job);
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("render-{}", kind.as_str()))
                .spawn(move || worker_loop(kind, rx, job, shared))
                .expect("spawn render worker");
            handles.push(handle);
        }
        info!(target: "schedule", queue_cap, "render workers started");
        Self {
            senders,
            handles,
            shared,
        }
    }

    /// Enqueue a render for `pipe`. A saturated queue drops the request; the
    /// caller treats that as soft failure and relies on the next
    /// invalidation to re-enqueue.
    pub fn request(&self, pipe: PipeKind, timestamp: u64) -> DevResult<()> {
        let sender = self
            .senders
            .get(&pipe)
            .ok_or(DevError::ScheduleSaturated { pipe: pipe.as_str() })?;
        match sender.try_send(RenderRequest { pipe, timestamp }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "schedule", pipe = pipe.as_str(), timestamp, "queue saturated, request dropped");
                Err(DevError::ScheduleSaturated { pipe: pipe.as_str() })
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executed: self.shared.executed.load(Ordering::Relaxed),
            coalesced: self.shared.coalesced.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Disconnect the queues and join every worker. Pending collapsed
    /// requests still run before a worker exits.
    pub fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!(target: "schedule", "render workers joined");
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    kind: PipeKind,
    rx: Receiver<RenderRequest>,
    job: Arc<dyn RenderJob>,
    shared: Arc<Shared>,
) {
    while let Ok(first) = rx.recv() {
        // Collapse everything already queued; the newest timestamp wins.
        let mut request = first;
        while let Ok(next) = rx.try_recv() {
            if next.timestamp >= request.timestamp {
                request = next;
            }
            shared.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        job.run(request);
        shared.executed.fetch_add(1, Ordering::Relaxed);
    }
    debug!(target: "schedule", pipe = kind.as_str(), "worker exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder {
        runs: Mutex<Vec<RenderRequest>>,
        delay: Duration,
        entered: AtomicU64,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(Vec::new()),
                delay,
                entered: AtomicU64::new(0),
            })
        }

        /// Block until at least `n` job invocations have started.
        fn wait_entered(&self, n: u64) {
            while self.entered.load(Ordering::Acquire) < n {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
    }

    impl RenderJob for Recorder {
        fn run(&self, request: RenderRequest) {
            self.entered.fetch_add(1, Ordering::AcqRel);
            std::thread::sleep(self.delay);
            self.runs.lock().unwrap().push(request);
        }
    }

    #[test]
    fn requests_reach_their_worker_class() {
        let rec = Recorder::new(Duration::ZERO);
        let sched = RenderScheduler::spawn(rec.clone(), 4);
        sched.request(PipeKind::Full, 1).unwrap();
        sched.request(PipeKind::Preview, 2).unwrap();
        sched.shutdown();
        let runs = rec.runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|r| r.pipe == PipeKind::Full && r.timestamp == 1));
        assert!(runs.iter().any(|r| r.pipe == PipeKind::Preview && r.timestamp == 2));
    }

    #[test]
    fn pending_duplicates_collapse_to_newest() {
        let rec = Recorder::new(Duration::from_millis(30));
        let sched = RenderScheduler::spawn(rec.clone(), 8);
        // First request occupies the worker; the rest pile up and collapse.
        sched.request(PipeKind::Full, 1).unwrap();
        rec.wait_entered(1);
        for ts in 2..=5 {
            sched.request(PipeKind::Full, ts).unwrap();
        }
        sched.shutdown();
        let runs = rec.runs.lock().unwrap();
        assert_eq!(runs.len(), 2, "burst collapses into one follow-up run");
        assert_eq!(runs[1].timestamp, 5, "newest timestamp wins");
    }

    #[test]
    fn saturated_queue_drops_with_error() {
        let rec = Recorder::new(Duration::from_millis(50));
        let sched = RenderScheduler::spawn(rec.clone(), 1);
        sched.request(PipeKind::Secondary, 1).unwrap();
        rec.wait_entered(1);
        // Worker busy; capacity 1 holds one pending; the next must drop.
        sched.request(PipeKind::Secondary, 2).unwrap();
        let third = sched.request(PipeKind::Secondary, 3);
        assert!(matches!(third, Err(DevError::ScheduleSaturated { .. })));
        assert!(sched.stats().dropped >= 1);
        sched.shutdown();
    }

    #[test]
    fn classes_are_independent() {
        let rec = Recorder::new(Duration::from_millis(40));
        let sched = RenderScheduler::spawn(rec.clone(), 2);
        // Saturate the full class...
        sched.request(PipeKind::Full, 1).unwrap();
        sched.request(PipeKind::Full, 2).unwrap();
        // ...the preview class still accepts immediately.
        assert!(sched.request(PipeKind::Preview, 3).is_ok());
        sched.shutdown();
        let runs = rec.runs.lock().unwrap();
        assert!(runs.iter().any(|r| r.pipe == PipeKind::Preview));
    }
}

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool over a bounded queue. When the queue is full the
/// submitting thread runs the job itself, which naturally paces the
/// directory walkers against slow extraction.
pub(crate) struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = bounded::<Job>(queue_capacity);

        let handles = (0..size)
            .filter_map(|i| {
                let receiver: Receiver<Job> = receiver.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("sift-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                        debug!("worker exiting");
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    // caller-runs submission still makes progress even with
                    // a smaller pool
                    Err(e) => {
                        warn!(error = %e, "failed to spawn worker thread");
                        None
                    }
                }
            })
            .collect();

        Self {
            sender: Some(sender),
            handles,
        }
    }

    pub fn submit(&self, job: Job) {
        let Some(sender) = &self.sender else {
            job();
            return;
        };
        match sender.try_send(job) {
            Ok(()) => {}
            // caller-runs: the full queue pushes work back onto the submitter
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => job(),
        }
    }

    /// Close the queue and wait for the workers to drain it.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
    }
}

/// Countdown latch for awaiting a fan-out of per-file tasks.
#[derive(Default)]
pub(crate) struct TaskLatch {
    state: Mutex<usize>,
    cv: Condvar,
}

impl TaskLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, n: usize) {
        if let Ok(mut count) = self.state.lock() {
            *count += n;
        }
    }

    pub fn done(&self) {
        if let Ok(mut count) = self.state.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.cv.notify_all();
            }
        }
    }

    /// Block until the count reaches zero or `abort` returns true.
    pub fn wait_while(&self, abort: impl Fn() -> bool) {
        let Ok(mut count) = self.state.lock() else {
            return;
        };
        while *count > 0 && !abort() {
            let (guard, _timeout) = match self.cv.wait_timeout(count, Duration::from_millis(100)) {
                Ok(r) => r,
                Err(_) => return,
            };
            count = guard;
        }
    }
}

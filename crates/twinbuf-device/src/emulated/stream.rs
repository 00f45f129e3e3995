//! In-order work queue of the emulated accelerator
//!
//! ```text
//! launch() ──push──▶ [ job | job | job ] ──pop──▶ worker thread
//!                                                  └─ rayon pool: blocks in parallel,
//!                                                     threads of a block in order
//! ```
//!
//! Jobs run one at a time in submission order. A kernel that panics is
//! recorded as a launch failure; the queue keeps going.

use crate::device::Kernel;
use crate::error::{DeviceError, Result};
use crate::launch::{LaunchConfig, ThreadContext};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct Job {
    sequence: u64,
    config: LaunchConfig,
    kernel: Kernel,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Job>,
    /// Jobs queued or executing
    pending: usize,
    next_sequence: u64,
    /// First fault not yet reported through `take_last_error`
    last_error: Option<DeviceError>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    drained: Condvar,
}

pub(crate) struct Stream {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Start the worker thread that executes kernels on `pool`.
    pub(crate) fn spawn(device_name: &str, pool: ThreadPool) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("{device_name}-stream"))
            .spawn(move || run_worker(worker_shared, pool))
            .map_err(|e| DeviceError::Configuration(format!("failed to start device stream: {e}")))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn enqueue(&self, config: LaunchConfig, kernel: Kernel) -> Result<u64> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(DeviceError::StreamClosed);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending += 1;
        state.queue.push_back(Job {
            sequence,
            config,
            kernel,
        });
        drop(state);

        self.shared.work_ready.notify_one();
        Ok(sequence)
    }

    /// Block until every enqueued job has finished.
    pub(crate) fn synchronize(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            if self.worker.as_ref().is_none_or(|w| w.is_finished()) {
                return Err(DeviceError::StreamClosed);
            }
            self.shared.drained.wait(&mut state);
        }
        Ok(())
    }

    pub(crate) fn take_last_error(&self) -> Option<DeviceError> {
        self.shared.state.lock().last_error.take()
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.state.lock().closed = true;
        self.shared.work_ready.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("device stream worker exited abnormally");
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, pool: ThreadPool) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.closed {
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        let start = Instant::now();
        let outcome = execute(&pool, &job);
        let duration_us = start.elapsed().as_micros() as u64;

        let mut state = shared.state.lock();
        match outcome {
            Ok(()) => tracing::trace!(sequence = job.sequence, duration_us, config = %job.config, "kernel complete"),
            Err(err) => {
                tracing::error!(sequence = job.sequence, error = %err, "kernel fault");
                if state.last_error.is_none() {
                    state.last_error = Some(err);
                }
            }
        }
        state.pending -= 1;
        if state.pending == 0 {
            shared.drained.notify_all();
        }
    }
}

fn execute(pool: &ThreadPool, job: &Job) -> Result<()> {
    let config = job.config;
    let kernel = &job.kernel;
    let threads_per_block = config.block.total_threads();

    // Blocks are independent, so they fan out across the pool.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.install(|| {
            (0..config.total_blocks()).into_par_iter().for_each(|block| {
                for thread in 0..threads_per_block {
                    kernel(ThreadContext::from_linear(&config, block, thread));
                }
            })
        })
    }));

    outcome.map_err(|payload| {
        DeviceError::launch(format!(
            "kernel #{} ({}) panicked: {}",
            job.sequence,
            config,
            panic_message(payload.as_ref())
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{BlockDim, GridDim};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn test_every_thread_runs_once() {
        let stream = Stream::spawn("test", test_pool()).unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        let sum = Arc::new(AtomicU64::new(0));

        let config = LaunchConfig::new(GridDim::linear(10), BlockDim::linear(64));
        let (h, s) = (Arc::clone(&hits), Arc::clone(&sum));
        stream
            .enqueue(
                config,
                Arc::new(move |ctx: ThreadContext| {
                    h.fetch_add(1, Ordering::Relaxed);
                    s.fetch_add(ctx.global_linear_index(), Ordering::Relaxed);
                }),
            )
            .unwrap();
        stream.synchronize().unwrap();

        assert_eq!(hits.load(Ordering::Relaxed), 640);
        assert_eq!(sum.load(Ordering::Relaxed), (0..640u64).sum::<u64>());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_jobs_run_in_order() {
        let stream = Stream::spawn("test", test_pool()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..5u32 {
            let log = Arc::clone(&log);
            stream
                .enqueue(
                    LaunchConfig::linear(1, 1),
                    Arc::new(move |_ctx: ThreadContext| log.lock().push(id)),
                )
                .unwrap();
        }
        stream.synchronize().unwrap();

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_kernel_is_recorded() {
        let stream = Stream::spawn("test", test_pool()).unwrap();
        stream
            .enqueue(
                LaunchConfig::linear(128, 64),
                Arc::new(|ctx: ThreadContext| {
                    if ctx.global_linear_index() == 77 {
                        panic!("bad element");
                    }
                }),
            )
            .unwrap();
        stream.synchronize().unwrap();

        match stream.take_last_error() {
            Some(DeviceError::LaunchFailure(msg)) => assert!(msg.contains("bad element"), "{msg}"),
            other => panic!("expected launch failure, got {other:?}"),
        }
        assert!(stream.take_last_error().is_none());

        // The stream keeps executing after a fault.
        let ran = Arc::new(AtomicU64::new(0));
        let r = Arc::clone(&ran);
        stream
            .enqueue(
                LaunchConfig::linear(1, 1),
                Arc::new(move |_ctx: ThreadContext| {
                    r.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_drains_queue() {
        let ran = Arc::new(AtomicU64::new(0));
        {
            let stream = Stream::spawn("test", test_pool()).unwrap();
            for _ in 0..3 {
                let r = Arc::clone(&ran);
                stream
                    .enqueue(
                        LaunchConfig::linear(64, 64),
                        Arc::new(move |_ctx: ThreadContext| {
                            r.fetch_add(1, Ordering::Relaxed);
                        }),
                    )
                    .unwrap();
            }
        }
        assert_eq!(ran.load(Ordering::Relaxed), 192);
    }
}

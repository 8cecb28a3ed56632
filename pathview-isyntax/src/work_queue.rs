//! A small fixed worker pool with a FIFO job queue.
//!
//! The streamer schedules codeblock decompression and tile transforms on
//! this pool. Workers block on a condvar while the queue is empty; the
//! driving thread can also drain jobs inline when the pool is saturated.
//! Results travel back through a separate completion queue that the
//! driver polls once per frame.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    idle_workers: AtomicUsize,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            idle_workers: AtomicUsize::new(0),
        }
    }

    /// Enqueue a job and wake one worker.
    pub(crate) fn submit(&self, job: Job) {
        let mut state = self.state.lock();
        state.jobs.push_back(job);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Number of jobs waiting to be picked up.
    pub(crate) fn entry_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Number of workers currently blocked on an empty queue.
    pub(crate) fn idle_worker_count(&self) -> usize {
        self.idle_workers.load(Ordering::Relaxed)
    }

    /// Pop and run one job on the calling thread. Returns whether a job
    /// was run. Lets the driving thread help out when the pool is
    /// saturated or absent.
    pub fn do_work(&self) -> bool {
        let job = self.state.lock().jobs.pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    fn worker_loop(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    self.idle_workers.fetch_add(1, Ordering::Relaxed);
                    self.wakeup.wait(&mut state);
                    self.idle_workers.fetch_sub(1, Ordering::Relaxed);
                }
            };
            job();
        }
    }
}

/// The worker threads plus their shared queue. Dropping the pool drains
/// nothing: remaining jobs are discarded after the workers finish their
/// current job.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` threads, or logical CPUs minus one when
    /// `None`.
    pub fn new(name: &str, worker_count: Option<usize>) -> Self {
        let worker_count = worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        });
        let queue = Arc::new(WorkQueue::new());
        let workers = (0..worker_count)
            .map(|i| {
                let queue = queue.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || queue.worker_loop())
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { queue, workers }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queue.state.lock().shutdown = true;
        self.wakeup_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl WorkerPool {
    fn wakeup_all(&self) {
        self.queue.wakeup.notify_all();
    }
}

/// A finished tile, handed back to whoever drives the streamer.
pub struct TileCompletion {
    /// Interleaved 4-byte pixels, `tile_width * tile_height` of them.
    pub pixels: Vec<u8>,
    pub scale: i32,
    pub tile_x: i32,
    pub tile_y: i32,
    /// Consumers discard completions whose resource id no longer matches
    /// the active viewport.
    pub resource_id: u32,
}

/// FIFO of completed tiles, polled by the orchestrating thread.
#[derive(Default)]
pub struct CompletionQueue {
    inner: Mutex<VecDeque<TileCompletion>>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, completion: TileCompletion) {
        self.inner.lock().push_back(completion);
    }

    /// Take the oldest completed tile, if any.
    pub fn poll(&self) -> Option<TileCompletion> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

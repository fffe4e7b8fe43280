// src/core/task_service.rs

//! A FIFO task queue drained by dedicated worker threads.
//!
//! The primary worker owns a piece of state `S` and runs every task posted
//! with [`TaskHandle::post`] against it, strictly in submission order. Because
//! only that thread ever touches `S`, the state needs no lock: mutation is
//! serialized by funneling it through the queue. Additional workers form a
//! helper pool for state-less jobs submitted with [`TaskHandle::execute`].

use crate::core::errors::NetError;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{Dispatch, debug, error, info};

/// A unit of work run on the primary worker with exclusive access to its state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// A unit of work that needs no worker state.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message<S> {
    Run(Task<S>),
    Job(Job),
    Stop,
}

enum JobMessage {
    Run(Job),
    Stop,
}

struct Shared {
    name: String,
    stop_requested: AtomicBool,
    /// Number of running helper workers. Zero routes jobs to the primary.
    helpers: AtomicUsize,
}

/// A cloneable, thread-safe handle for posting work to a [`TaskService`].
pub struct TaskHandle<S> {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message<S>>,
    jobs: mpsc::UnboundedSender<JobMessage>,
}

impl<S> Clone for TaskHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<S: 'static> TaskHandle<S> {
    /// Queues `task` for the primary worker. Never blocks.
    ///
    /// Tasks posted before the worker starts wait in the queue. Tasks posted
    /// once the worker has exited are dropped and `ServiceStopped` is returned.
    pub fn post<F>(&self, task: F) -> Result<(), NetError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(task)))
            .map_err(|_| NetError::ServiceStopped(self.shared.name.clone()))
    }

    /// Queues a state-less job, on the helper pool when one is running.
    pub fn execute<F>(&self, job: F) -> Result<(), NetError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let sent = if self.shared.helpers.load(Ordering::Acquire) > 0 {
            self.jobs.send(JobMessage::Run(job)).is_ok()
        } else {
            self.tx.send(Message::Job(job)).is_ok()
        };
        if sent {
            Ok(())
        } else {
            Err(NetError::ServiceStopped(self.shared.name.clone()))
        }
    }

    /// Returns true once shutdown of the owning service has begun.
    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::Acquire)
    }

    pub fn service_name(&self) -> &str {
        &self.shared.name
    }
}

/// The task-execution service: one queue, one state-owning primary worker and
/// an optional pool of helpers.
pub struct TaskService<S> {
    handle: TaskHandle<S>,
    rx: Option<mpsc::UnboundedReceiver<Message<S>>>,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<JobMessage>>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: Send + 'static> TaskService<S> {
    /// Creates the service and its queue. No thread runs until [`start`](Self::start).
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.into(),
            stop_requested: AtomicBool::new(false),
            helpers: AtomicUsize::new(0),
        });
        Self {
            handle: TaskHandle {
                shared,
                tx,
                jobs: jobs_tx,
            },
            rx: Some(rx),
            job_rx: Arc::new(Mutex::new(jobs_rx)),
            workers: Vec::new(),
        }
    }

    pub fn handle(&self) -> TaskHandle<S> {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.handle.shared.name
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.handle.is_stop_requested()
    }

    /// Spawns `worker_count` threads. The first one takes ownership of `state`.
    pub fn start(&mut self, worker_count: usize, state: S) -> Result<(), NetError> {
        if worker_count == 0 {
            return Err(NetError::InvalidWorkerCount(worker_count));
        }
        if self.is_running() {
            return Err(NetError::AlreadyStarted(self.name().to_string()));
        }
        let rx = self
            .rx
            .take()
            .ok_or_else(|| NetError::ServiceStopped(self.name().to_string()))?;

        // Workers log through whatever subscriber the caller is using.
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);

        let shared = self.handle.shared.clone();
        let primary_dispatch = dispatch.clone();
        let primary = thread::Builder::new()
            .name(format!("{}-0", self.name()))
            .spawn(move || {
                tracing::dispatcher::with_default(&primary_dispatch, || {
                    run_primary(shared, rx, state)
                })
            })?;
        self.workers.push(primary);

        for index in 1..worker_count {
            let shared = self.handle.shared.clone();
            let jobs = self.job_rx.clone();
            let helper_dispatch = dispatch.clone();
            let helper = thread::Builder::new()
                .name(format!("{}-{index}", self.name()))
                .spawn(move || {
                    tracing::dispatcher::with_default(&helper_dispatch, || {
                        run_helper(shared, jobs, index)
                    })
                })?;
            self.workers.push(helper);
            self.handle.shared.helpers.fetch_add(1, Ordering::AcqRel);
        }

        info!(
            "Task service '{}' started with {} worker(s).",
            self.name(),
            worker_count
        );
        Ok(())
    }

    /// Raises the stop-requested flag without waiting for the workers.
    pub fn request_stop(&self) {
        self.handle
            .shared
            .stop_requested
            .store(true, Ordering::Release);
    }

    /// Stops the service and joins its workers.
    ///
    /// Every task queued before this call still runs; the stop marker is
    /// queued behind them. Must not be called from one of the service's own
    /// workers.
    pub fn stop(&mut self) -> Result<(), NetError> {
        self.request_stop();
        if self.workers.is_empty() {
            return Ok(());
        }

        let helpers = self.handle.shared.helpers.swap(0, Ordering::AcqRel);
        for _ in 0..helpers {
            let _ = self.handle.jobs.send(JobMessage::Stop);
        }
        if self.handle.tx.send(Message::Stop).is_err() {
            debug!(
                "Task service '{}' primary queue already closed.",
                self.name()
            );
        }

        let name = self.name().to_string();
        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("A worker of task service '{}' panicked.", name);
                result = Err(NetError::WorkerPanicked(name.clone()));
            }
        }
        info!("Task service '{}' stopped.", name);
        result
    }
}

impl<S> Drop for TaskService<S> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.handle
            .shared
            .stop_requested
            .store(true, Ordering::Release);
        let helpers = self.handle.shared.helpers.swap(0, Ordering::AcqRel);
        for _ in 0..helpers {
            let _ = self.handle.jobs.send(JobMessage::Stop);
        }
        let _ = self.handle.tx.send(Message::Stop);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_primary<S>(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Message<S>>, mut state: S) {
    debug!("Primary worker of '{}' running.", shared.name);
    while let Some(message) = rx.blocking_recv() {
        match message {
            Message::Run(task) => run_guarded(&shared.name, || task(&mut state)),
            Message::Job(job) => run_guarded(&shared.name, job),
            Message::Stop => break,
        }
    }
    // Anything posted behind the stop marker is dropped unrun, before the state.
    rx.close();
    drop(rx);
    debug!("Primary worker of '{}' exited.", shared.name);
}

fn run_helper(shared: Arc<Shared>, jobs: Arc<Mutex<mpsc::UnboundedReceiver<JobMessage>>>, index: usize) {
    debug!("Helper worker {} of '{}' running.", index, shared.name);
    loop {
        let message = jobs.lock().blocking_recv();
        match message {
            Some(JobMessage::Run(job)) => run_guarded(&shared.name, job),
            Some(JobMessage::Stop) | None => break,
        }
    }
    debug!("Helper worker {} of '{}' exited.", index, shared.name);
}

/// Runs one task, keeping the worker alive if it panics.
fn run_guarded(name: &str, f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!("A task on service '{}' panicked: {}", name, message);
    }
}

//! Fixed-size named thread pools.
//!
//! Each pool owns N OS threads fed from one shared job queue. A job that
//! panics is logged and the worker keeps going.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::config::Settings;
use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Message sent to a worker thread
enum WorkerTask {
    Run(Job),
    /// Shutdown the worker
    Shutdown,
}

pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<mpsc::Sender<WorkerTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Spawn `size` threads named `tether-<name>-<i>`.
    pub fn new(name: &str, size: usize) -> Arc<Self> {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<WorkerTask>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let thread_name = format!("tether-{}-{}", name, i);
            let spawned = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, &rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!(target: "worker_pool", pool = name, error = %e, "failed to spawn worker"),
            }
        }
        tracing::debug!(target: "worker_pool", pool = name, size, "pool started");
        Arc::new(Self {
            name: name.to_string(),
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender
            .as_ref()
            .ok_or_else(|| PoolError::ShutDown(self.name.clone()))?;
        sender
            .send(WorkerTask::Run(Box::new(job)))
            .map_err(|_| PoolError::ShutDown(self.name.clone()))
    }

    /// Let queued jobs finish, then join every worker.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            for _ in 0..self.size {
                let _ = sender.send(WorkerTask::Shutdown);
            }
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = std::thread::current().id();
        for handle in workers {
            // a job may shut down its own pool
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        tracing::debug!(target: "worker_pool", pool = %self.name, "pool stopped");
    }
}

fn worker_loop(thread_name: &str, rx: &Mutex<mpsc::Receiver<WorkerTask>>) {
    loop {
        let task = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match task {
            Ok(WorkerTask::Run(job)) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!(
                        target: "worker_pool",
                        worker = thread_name,
                        panic = %panic_message(&*panic),
                        "job panicked"
                    );
                }
            }
            Ok(WorkerTask::Shutdown) | Err(_) => break,
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The three pools a server runs with.
#[derive(Clone)]
pub struct WorkerPools {
    /// View procedures.
    pub runtime: Arc<WorkerPool>,
    /// Stop and cleanup hooks.
    pub general: Arc<WorkerPool>,
    /// Channel deliveries.
    pub channels: Arc<WorkerPool>,
}

impl WorkerPools {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            runtime: WorkerPool::new("runtime", settings.runtime_workers),
            general: WorkerPool::new("general", settings.general_workers),
            channels: WorkerPool::new("channels", settings.channel_workers),
        }
    }

    pub fn shutdown(&self) {
        self.runtime.shutdown();
        self.general.shutdown();
        self.channels.shutdown();
    }
}

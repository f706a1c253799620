use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named threads draining a shared job queue.
///
/// Blocking reads and uploads run here so the FUSE session thread stays
/// free to dispatch `release` while a download is in flight.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let shared_rx = Arc::new(Mutex::new(rx));
        let mut threads = Vec::with_capacity(size.max(1));
        for i in 0..size.max(1) {
            let rx = Arc::clone(&shared_rx);
            let handle = std::thread::Builder::new()
                .name(format!("panfs-worker-{}", i))
                .spawn(move || loop {
                    let job = {
                        let guard = rx.lock();
                        match guard.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    job();
                })?;
            threads.push(handle);
        }
        debug!("worker pool started with {} threads", threads.len());
        Ok(Self {
            tx: Some(tx),
            threads,
        })
    }

    /// Queue a job. Runs it inline if the pool is shutting down.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.tx {
            Some(tx) => {
                if let Err(mpsc::SendError(job)) = tx.send(Box::new(job)) {
                    job();
                }
            }
            None => job(),
        }
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

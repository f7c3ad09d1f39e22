use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use log::{debug, error, warn};

use crate::sync::lock;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads running handler invocations.
///
/// `size` workers stay warm. A job submitted while every warm worker is busy gets a thread of its
/// own, so a long-lived streaming handler never holds up other calls.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
    /// Warm workers not yet claimed by a submitted job.
    idle: Arc<AtomicUsize>,
    overflow: AtomicUsize,
}

impl ThreadPool {
    /// Starts `size` warm workers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();
        let idle = Arc::new(AtomicUsize::new(size));

        let receiver = Arc::new(Mutex::new(receiver));
        for id in 0..size {
            workers.push(Worker::spawn(id, Arc::clone(&receiver), Arc::clone(&idle))?);
        }

        Ok(Self {
            workers,
            sender: Some(sender),
            idle,
            overflow: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender.as_ref() else {
            error!("thread pool is shut down, dropping job");
            return;
        };

        let claimed = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| idle.checked_sub(1))
            .is_ok();
        let job: Job = if claimed {
            Box::new(f)
        } else {
            match self.spawn_overflow(f) {
                Ok(()) => return,
                Err((job, e)) => {
                    warn!("no thread for an overflow handler, queueing it: {e}");
                    job
                }
            }
        };

        if sender.send(job).is_err() {
            error!("every worker has exited, dropping job");
        }
    }

    fn spawn_overflow<F>(&self, f: F) -> Result<(), (Job, io::Error)>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.overflow.fetch_add(1, Ordering::Relaxed);
        // Builder::spawn consumes the closure, so it is handed over through a slot to get it back
        // if the thread cannot be started.
        let slot = Arc::new(Mutex::new(Some(Box::new(f) as Job)));
        let taken = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("handler-overflow-{id}"))
            .spawn(move || {
                if let Some(job) = lock(&taken).take() {
                    debug!("overflow handler {id} running");
                    job();
                }
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => match lock(&slot).take() {
                Some(job) => Err((job, e)),
                None => Ok(()),
            },
        }
    }

    /// Stops accepting jobs and waits for the warm workers to finish queued and running jobs.
    /// Overflow threads are not waited for.
    pub fn join(mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            debug!("waiting for worker {}", worker.id);
            if worker.thread.join().is_err() {
                error!("worker {} panicked", worker.id);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Workers drain the queue and exit on their own; in-flight handlers are not waited for.
        drop(self.sender.take());
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn spawn(
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
        idle: Arc<AtomicUsize>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("handler-{id}"))
            .spawn(move || {
                loop {
                    let job = lock(&receiver).recv();
                    match job {
                        Ok(job) => {
                            debug!("worker {id} running a handler");
                            job();
                            idle.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}

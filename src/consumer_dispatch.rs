use crate::errors::*;
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, trace};
use snafu::ResultExt;
use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::{self, Builder, JoinHandle};

/// A unit of consumer work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A pool that runs [`Task`]s on threads other than the connection's I/O thread.
pub trait WorkPool: Send + Sync {
    /// Queues `task`. May block when the pool's queue is full.
    fn enqueue(&self, task: Task) -> Result<()>;

    /// Stops accepting tasks. Tasks already queued or running are allowed to finish.
    fn terminate(&self);
}

/// A fixed set of worker threads fed through a bounded queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl WorkerPool {
    /// Starts `threads` workers sharing a queue that holds up to `queue_depth` tasks.
    pub fn new(threads: usize, queue_depth: usize) -> Result<WorkerPool> {
        let (tx, rx) = bounded::<Task>(queue_depth);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let worker = Builder::new()
                .name(format!("amqp-consumer-{}", i))
                .spawn(move || {
                    for task in rx.iter() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                            error!("consumer task panicked: {}", panic_message(&*payload));
                        }
                    }
                    trace!("consumer worker exiting");
                })
                .context(ForkFailedSnafu)?;
            workers.push(worker);
        }
        Ok(WorkerPool {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }
}

impl WorkPool for WorkerPool {
    fn enqueue(&self, task: Task) -> Result<()> {
        // clone so a full queue doesn't block terminate()
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender
                .send(task)
                .map_err(|_| ConnectionClosedSnafu.build()),
            None => ConnectionClosedSnafu.fail(),
        }
    }

    fn terminate(&self) {
        self.sender.lock().unwrap().take();
        let workers = mem::replace(&mut *self.workers.lock().unwrap(), Vec::new());
        let current = thread::current().id();
        for worker in workers {
            // a task may close the connection from inside the pool
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("consumer worker died");
            }
        }
    }
}

/// Runs consumer callbacks on a [`WorkPool`] on behalf of one connection.
pub struct ConsumerDispatch {
    pool: Box<dyn WorkPool>,
    closed: AtomicBool,
}

impl ConsumerDispatch {
    /// Creates a dispatcher backed by a new [`WorkerPool`].
    pub fn new(threads: usize, queue_depth: usize) -> Result<ConsumerDispatch> {
        Ok(ConsumerDispatch::with_work_pool(Box::new(WorkerPool::new(
            threads,
            queue_depth,
        )?)))
    }

    pub fn with_work_pool(pool: Box<dyn WorkPool>) -> ConsumerDispatch {
        ConsumerDispatch {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    /// Hands `task` to the pool. Fails with `ConnectionClosed` once the connection has closed.
    pub fn add_work<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionClosedSnafu.fail();
        }
        self.pool.enqueue(Box::new(task))
    }

    /// Terminates the pool. Only the first call has any effect.
    pub fn notify_connection_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("terminating consumer dispatch");
            self.pool.terminate();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ConsumerDispatch {
    fn drop(&mut self) {
        self.notify_connection_closed();
    }
}

use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::debug_trace;
use crate::error::KairoError;

/// A result computed on a worker thread, keyed back to the deferred that
/// is waiting for it on the reactor side.
pub(crate) type ThreadOutcome = std::result::Result<Box<dyn Any + Send>, KairoError>;

pub(crate) enum ThreadMessage {
    /// Run a closure in the reactor thread on the next iteration.
    Call(Box<dyn FnOnce() + Send>),
    /// Deliver a worker-thread result to a pending deferred.
    Result { id: u64, outcome: ThreadOutcome },
}

/// The thread-facing half of a reactor: a mio waker plus an injector
/// queue. Cloneable, `Send + Sync`, and safe to use from any thread.
pub(crate) struct ThreadShared {
    waker: mio::Waker,
    sender: Sender<ThreadMessage>,
    receiver: Receiver<ThreadMessage>,
}

impl ThreadShared {
    pub(crate) fn new(waker: mio::Waker) -> ThreadShared {
        let (sender, receiver) = unbounded();
        ThreadShared { waker, sender, receiver }
    }

    pub(crate) fn push(&self, message: ThreadMessage) {
        // A closed channel here means the reactor is gone; nothing to do.
        if self.sender.send(message).is_ok() {
            let _ = self.waker.wake();
        }
    }

    pub(crate) fn drain(&self) -> Vec<ThreadMessage> {
        self.receiver.try_iter().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Cheap `Send + Sync` handle for waking the reactor from other threads.
///
/// This is the only supported way for foreign threads to talk to reactor
/// state: enqueue a closure, which runs in the reactor thread on its next
/// iteration.
#[derive(Clone)]
pub struct ReactorWaker {
    shared: Arc<ThreadShared>,
}

impl ReactorWaker {
    pub(crate) fn new(shared: Arc<ThreadShared>) -> ReactorWaker {
        ReactorWaker { shared }
    }

    /// Enqueue `f` to run in the reactor thread, waking a blocked poll.
    pub fn call_from_thread(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.push(ThreadMessage::Call(Box::new(f)));
    }

    pub(crate) fn deliver_result(&self, id: u64, outcome: ThreadOutcome) {
        self.shared.push(ThreadMessage::Result { id, outcome });
    }
}

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Stop,
}

/// Lazily-grown pool of worker threads for `call_in_thread`.
pub(crate) struct ThreadPool {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    suggested_size: usize,
}

pub(crate) const DEFAULT_POOL_SIZE: usize = 5;

impl ThreadPool {
    pub(crate) fn new() -> ThreadPool {
        let (sender, receiver) = unbounded();
        ThreadPool {
            sender,
            receiver,
            workers: Vec::new(),
            suggested_size: DEFAULT_POOL_SIZE,
        }
    }

    pub(crate) fn dispatch(&mut self, f: Box<dyn FnOnce() + Send>) {
        if self.workers.is_empty() && self.suggested_size > 0 {
            self.grow_to(self.suggested_size);
        }
        // With a zero-sized pool the job runs when the pool is grown again;
        // jobs are never silently dropped.
        let _ = self.sender.send(Job::Run(f));
    }

    /// Resize the pool. Zero drains and joins every worker.
    pub(crate) fn suggest_size(&mut self, size: usize) {
        self.suggested_size = size;
        if self.workers.is_empty() {
            // grown lazily on first dispatch
            return;
        }
        if size > self.workers.len() {
            self.grow_to(size);
        } else if size < self.workers.len() {
            let excess = self.workers.len() - size;
            for _ in 0..excess {
                let _ = self.sender.send(Job::Stop);
            }
            // Join as many workers as were asked to stop; workers exit on
            // the first Stop they pull, so order does not matter.
            for _ in 0..excess {
                if let Some(worker) = self.workers.pop() {
                    let _ = worker.join();
                }
            }
        }
    }

    fn grow_to(&mut self, size: usize) {
        while self.workers.len() < size {
            let receiver = self.receiver.clone();
            let index = self.workers.len();
            let handle = std::thread::Builder::new()
                .name(format!("kairo-worker-{}", index))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        match job {
                            Job::Run(f) => f(),
                            Job::Stop => break,
                        }
                    }
                });
            match handle {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    debug_trace!("Failed to spawn worker thread: {}", e);
                    break;
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(Job::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

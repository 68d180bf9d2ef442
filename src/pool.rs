use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, error};

use crate::error::XnatError;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared stop flag from the driver to the coordinator and the workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed-size pool of named threads fed from one task queue.
pub struct WorkerPool {
    tasks: Option<Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, XnatError> {
        let size = size.max(1);
        let (tasks, receiver) = unbounded::<Task>();
        let threads = (0..size)
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("subject-worker-{index}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            task();
                        }
                    })
                    .map_err(|err| XnatError::Command(format!("spawn worker thread: {err}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(size, "worker pool started");
        Ok(Self {
            tasks: Some(tasks),
            threads,
        })
    }

    pub fn submit<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = bounded(1);
        let flag = Arc::clone(&done);
        let task: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = result_tx.send(result);
            flag.store(true, Ordering::SeqCst);
        });
        if let Some(tasks) = &self.tasks {
            // Workers only stop once `tasks` is dropped, so the send cannot fail here.
            let _ = tasks.send(task);
        }
        TaskHandle {
            done,
            result: result_rx,
        }
    }

    /// Stops accepting tasks and waits for every queued and running task.
    pub fn shutdown(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        self.tasks.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

/// Completion flag and result slot of one submitted task.
pub struct TaskHandle<T> {
    done: Arc<AtomicBool>,
    result: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Waits for the task. A panic inside the task is returned as `Err`.
    pub fn join(self) -> Result<T, Box<dyn Any + Send + 'static>> {
        match self.result.recv() {
            Ok(result) => result,
            Err(_) => Err(Box::new("task was dropped before it ran")),
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

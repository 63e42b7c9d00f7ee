//! Single-worker FIFO task runner.
//!
//! One dedicated thread takes tasks off a bounded queue and runs them one at a
//! time, in submission order. Each submission gets a [`TaskHandle`] with its
//! own cancellation token and a channel for the outcome.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::repository::CancellationToken;
use crate::tasks::error::{TaskError, TaskResult};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct Job {
    id: u64,
    name: String,
    run: Box<dyn FnOnce() + Send>,
}

/// Handle to a queued task.
pub struct TaskHandle<T> {
    id: u64,
    name: String,
    cancel: CancellationToken,
    result: Receiver<TaskResult<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation. A task that has not started yet is skipped; a
    /// running task sees the token and may stop early.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Block until the task finished.
    pub fn wait(self) -> TaskResult<T> {
        self.result.recv().unwrap_or_else(|_| {
            Err(TaskError::WorkerGone {
                name: self.name.clone(),
            })
        })
    }

    /// The outcome, if the task already finished.
    pub fn try_result(&self) -> Option<TaskResult<T>> {
        self.result.try_recv().ok()
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Runs queued tasks on one background thread.
///
/// Dropping the runner closes the queue, lets already-queued tasks finish and
/// joins the worker.
pub struct TaskRunner {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl TaskRunner {
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(capacity.max(1));
        let worker = thread::Builder::new()
            .name("pgvc-tasks".to_string())
            .spawn(move || worker_loop(receiver))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            next_id: AtomicU64::new(0),
        })
    }

    /// tasks waiting to start
    pub fn pending(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.len())
    }

    /// Queue a task, blocking while the queue is full.
    pub fn submit<F, T, E>(&self, name: impl Into<String>, task: F) -> TaskResult<TaskHandle<T>>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display,
    {
        let (job, handle) = self.prepare(name.into(), task);
        let sender = self.sender.as_ref().ok_or_else(|| TaskError::WorkerGone {
            name: handle.name.clone(),
        })?;
        sender.send(job).map_err(|_| TaskError::WorkerGone {
            name: handle.name.clone(),
        })?;
        Ok(handle)
    }

    /// Queue a task, failing with `QueueFull` instead of blocking.
    pub fn try_submit<F, T, E>(&self, name: impl Into<String>, task: F) -> TaskResult<TaskHandle<T>>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display,
    {
        let (job, handle) = self.prepare(name.into(), task);
        let sender = self.sender.as_ref().ok_or_else(|| TaskError::WorkerGone {
            name: handle.name.clone(),
        })?;
        match sender.try_send(job) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => Err(TaskError::QueueFull {
                name: handle.name.clone(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(TaskError::WorkerGone {
                name: handle.name.clone(),
            }),
        }
    }

    fn prepare<F, T, E>(&self, name: String, task: F) -> (Job, TaskHandle<T>)
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let token = cancel.clone();
        let task_name = name.clone();
        let run = Box::new(move || {
            let outcome = if token.is_cancelled() {
                Err(TaskError::Cancelled { name: task_name })
            } else {
                match panic::catch_unwind(AssertUnwindSafe(|| task(&token))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(_)) if token.is_cancelled() => Err(TaskError::Cancelled { name: task_name }),
                    Ok(Err(e)) => Err(TaskError::Failed {
                        name: task_name,
                        message: e.to_string(),
                    }),
                    Err(payload) => Err(TaskError::Panicked {
                        name: task_name,
                        message: panic_message(payload.as_ref()),
                    }),
                }
            };
            // the caller may have dropped its handle
            let _ = result_tx.send(outcome);
        });

        let job = Job {
            id,
            name: name.clone(),
            run,
        };
        let handle = TaskHandle {
            id,
            name,
            cancel,
            result: result_rx,
        };
        (job, handle)
    }

    /// Close the queue, run what is already queued and wait for the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("task worker thread panicked");
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    for job in receiver.iter() {
        let span = tracing::debug_span!("task", id = job.id, name = %job.name);
        let _enter = span.enter();
        tracing::debug!("task started");
        (job.run)();
        tracing::debug!("task finished");
    }
    tracing::debug!("task queue closed, worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_fifo_and_no_overlap() {
        let runner = TaskRunner::new(16).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let order = Arc::clone(&order);
                let running = Arc::clone(&running);
                runner
                    .submit(format!("task-{}", i), move |_| {
                        assert!(!running.swap(true, Ordering::SeqCst), "tasks overlapped");
                        thread::sleep(Duration::from_millis(2));
                        order.lock().unwrap().push(i);
                        running.store(false, Ordering::SeqCst);
                        Ok::<_, String>(i)
                    })
                    .unwrap()
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), i);
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_failure_and_panic_do_not_kill_worker() {
        let runner = TaskRunner::new(4).unwrap();
        let failing = runner
            .submit("failing", |_| Err::<(), _>("disk full"))
            .unwrap();
        let panicking = runner
            .submit("panicking", |_| -> Result<(), String> { panic!("boom") })
            .unwrap();
        let fine = runner.submit("fine", |_| Ok::<_, String>(42)).unwrap();

        assert_eq!(
            failing.wait(),
            Err(TaskError::Failed {
                name: "failing".to_string(),
                message: "disk full".to_string()
            })
        );
        match panicking.wait() {
            Err(TaskError::Panicked { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected panic, got {:?}", other),
        }
        assert_eq!(fine.wait().unwrap(), 42);
    }

    #[test]
    fn test_cancel_before_start() {
        let runner = TaskRunner::new(4).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let blocker = runner
            .submit("blocker", move |_| {
                gate_rx.recv().map_err(|e| e.to_string())
            })
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let queued = runner
            .submit("queued", move |_| {
                ran_clone.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .unwrap();
        queued.cancel();
        gate_tx.send(()).unwrap();

        blocker.wait().unwrap();
        assert!(queued.wait().unwrap_err().is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_running_task_sees_cancellation() {
        let runner = TaskRunner::new(4).unwrap();
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = runner
            .submit("long", move |token: &CancellationToken| {
                started_tx.send(()).map_err(|e| e.to_string())?;
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                Err::<(), _>("stopped".to_string())
            })
            .unwrap();
        started_rx.recv().unwrap();
        handle.cancel();
        assert!(handle.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_try_submit_when_full() {
        let runner = TaskRunner::new(1).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let blocker = runner
            .submit("blocker", move |_| {
                started_tx.send(()).map_err(|e| e.to_string())?;
                gate_rx.recv().map_err(|e| e.to_string())
            })
            .unwrap();
        started_rx.recv().unwrap();

        let queued = runner.try_submit("queued", |_| Ok::<_, String>(())).unwrap();
        let rejected = runner.try_submit("rejected", |_| Ok::<_, String>(()));
        assert!(matches!(rejected, Err(TaskError::QueueFull { .. })));

        gate_tx.send(()).unwrap();
        blocker.wait().unwrap();
        queued.wait().unwrap();
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let runner = TaskRunner::new(8).unwrap();
            for i in 0..5 {
                let counter = Arc::clone(&counter);
                runner
                    .submit(format!("t{}", i), move |_| {
                        thread::sleep(Duration::from_millis(1));
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}

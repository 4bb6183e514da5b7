//! Dedicated processing loop.
//!
//! The engine serializes all mutations to a stack instance on one
//! long-lived worker thread. Lifecycle operations from arbitrary caller
//! threads are marshaled onto that thread before reaching the driver.

use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send>;

/// Long-lived worker thread with a task queue.
///
/// Dropping the loop drains outstanding tasks and joins the thread.
pub struct RunLoop {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl RunLoop {
    /// Spawn the worker thread.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let (id_tx, id_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = id_tx.send(thread::current().id());
                while let Ok(task) = rx.recv() {
                    task();
                }
                debug!("run loop exiting");
            })
            .unwrap_or_else(|e| panic!("failed to spawn run loop thread: {e}"));
        let thread_id = id_rx.recv().unwrap_or_else(|_| thread::current().id());

        Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            thread_id,
        }
    }

    /// Queue a fire-and-forget task. Posting to a stopped loop is a
    /// logged no-op.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => {
                warn!("task posted to stopped run loop, dropping");
                false
            }
        }
    }

    /// Run a task on the loop thread and wait for its result.
    ///
    /// Returns `None` when the loop has stopped. Calls made from the loop
    /// thread itself execute inline to avoid self-deadlock.
    pub fn call<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Some(task());
        }

        let (tx, rx) = mpsc::channel();
        let posted = self.post(move || {
            let _ = tx.send(task());
        });
        if !posted {
            return None;
        }
        rx.recv().ok()
    }

    /// Whether the calling thread is the loop thread.
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        // Drop the sender so the worker drains and exits, then join.
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("run loop thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_post_runs_task() {
        let run_loop = RunLoop::new("test-loop");
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&counter);
        assert!(run_loop.post(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        }));
        // call() behind the post acts as a barrier.
        run_loop.call(|| ()).expect("loop alive");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_returns_value() {
        let run_loop = RunLoop::new("test-loop");
        let result = run_loop.call(|| 21 * 2);
        assert_eq!(result, Some(42));
    }

    #[test]
    fn test_tasks_run_in_order() {
        let run_loop = RunLoop::new("test-loop");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            run_loop.post(move || log.lock().push(i));
        }
        run_loop.call(|| ()).expect("loop alive");
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_call_from_loop_thread_runs_inline() {
        let run_loop = Arc::new(RunLoop::new("test-loop"));
        let inner = Arc::clone(&run_loop);
        let result = run_loop.call(move || inner.call(|| 7));
        assert_eq!(result, Some(Some(7)));
    }

    #[test]
    fn test_drop_joins_thread() {
        let run_loop = RunLoop::new("test-loop");
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&counter);
        run_loop.post(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        });
        drop(run_loop);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_loop_thread() {
        let run_loop = Arc::new(RunLoop::new("test-loop"));
        assert!(!run_loop.on_loop_thread());
        let inner = Arc::clone(&run_loop);
        let inside = run_loop.call(move || inner.on_loop_thread());
        assert_eq!(inside, Some(true));
    }
}

//! A named OS thread that runs a [`crate::scheduler::Scheduler`]'s event
//! loop, with a handshake so `spawn` only returns once the child has
//! recorded its own identity, giving callers a synchronous-looking spawn
//! API without a race on the child's name or tid.

use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

thread_local! {
    static CURRENT_WORKER_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

struct Handshake {
    started: Mutex<Option<i32>>,
    cond: Condvar,
}

/// A single worker thread owned by a scheduler.
pub struct ThreadWorker {
    name: String,
    tid: i32,
    handle: Option<JoinHandle<()>>,
}

impl ThreadWorker {
    /// Spawns `body` on a new, named OS thread and blocks until that
    /// thread has registered its name and kernel tid in its own
    /// thread-local storage, so that e.g. `ThreadWorker::current_name()`
    /// is reliable the instant `spawn` returns.
    pub fn spawn(name: impl Into<String>, body: impl FnOnce() + Send + 'static) -> Self {
        let name = name.into();
        let handshake = Arc::new(Handshake {
            started: Mutex::new(None),
            cond: Condvar::new(),
        });
        let handshake_child = handshake.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                CURRENT_WORKER_NAME.with(|c| *c.borrow_mut() = Some(thread_name.clone()));
                let tid = rustix::thread::gettid().as_raw_nonzero().get();
                {
                    let mut started = handshake_child.started.lock().unwrap();
                    *started = Some(tid);
                    handshake_child.cond.notify_one();
                }
                body();
            })
            .expect("failed to spawn worker thread");

        let mut started = handshake.started.lock().unwrap();
        while started.is_none() {
            started = handshake.cond.wait(started).unwrap();
        }
        let tid = started.unwrap();
        drop(started);

        Self {
            name,
            tid,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kernel tid of this worker's thread, captured once at spawn
    /// time (Linux tids don't change for the life of a thread).
    pub fn id(&self) -> i32 {
        self.tid
    }

    /// Blocks until this worker's thread body returns.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// The name of the `ThreadWorker` running on the calling thread, or
    /// `None` if the calling thread isn't one (e.g. the process's main
    /// thread, or a thread the application spawned itself).
    pub fn current_name() -> Option<String> {
        CURRENT_WORKER_NAME.with(|c| c.borrow().clone())
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn spawn_blocks_until_child_registers_name() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let worker = ThreadWorker::spawn("weftio-test-0", move || {
            ran2.store(true, Ordering::SeqCst);
        });
        assert_eq!(worker.name(), "weftio-test-0");
        worker.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn current_name_reflects_inside_the_worker() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = ThreadWorker::spawn("weftio-test-1", move || {
            tx.send(ThreadWorker::current_name()).unwrap();
        });
        assert_eq!(rx.recv().unwrap().as_deref(), Some("weftio-test-1"));
        worker.join();
    }

    #[test]
    fn id_matches_the_childs_own_gettid() {
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = ThreadWorker::spawn("weftio-test-2", move || {
            tx.send(rustix::thread::gettid().as_raw_nonzero().get())
                .unwrap();
        });
        assert_eq!(worker.id(), rx.recv().unwrap());
        worker.join();
    }
}

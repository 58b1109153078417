//! Single-owner execution of all engine work.
//!
//! The embedded engine is not safe for concurrent or cross-thread use, so one
//! dedicated worker thread owns every engine instance for the lifetime of the
//! process. Callers hand it closures through [`Executor::submit`] and block on
//! a one-shot completion rendezvous. A submission made from the worker itself
//! (a host function defining more bindings mid-dispatch) runs inline instead
//! of enqueueing, which is what keeps reentrant definitions from deadlocking
//! against the worker's own queue.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct Executor {
    queue: Sender<Job>,
    owner: ThreadId,
}

static EXECUTOR: OnceLock<Executor> = OnceLock::new();

/// The process-wide engine owner, started on first use.
pub(crate) fn global() -> &'static Executor {
    EXECUTOR.get_or_init(|| {
        let (queue, jobs) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("script-engine".to_string())
            .spawn(move || {
                debug!("script engine worker started");
                for job in jobs {
                    job();
                }
            })
            .unwrap_or_else(|err| panic!("failed to start script engine worker: {err}"));
        Executor {
            queue,
            owner: handle.thread().id(),
        }
    })
}

impl Executor {
    /// Run `work` on the engine owner and return its result.
    ///
    /// Blocks the calling thread until the owner has finished the item; work
    /// items execute strictly in submission order. Panics raised inside the
    /// item are carried back and resumed on the calling thread, leaving the
    /// worker alive.
    pub(crate) fn submit<R, F>(&self, work: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if thread::current().id() == self.owner {
            return work();
        }
        let (done, completed) = bounded(1);
        let job: Job = Box::new(move || {
            let _ = done.send(catch_unwind(AssertUnwindSafe(work)));
        });
        if self.queue.send(job).is_err() {
            panic!("script engine worker is gone");
        }
        match completed.recv() {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => resume_unwind(payload),
            Err(_) => panic!("script engine worker dropped a submission"),
        }
    }
}

// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Background execution of operations that would otherwise block the
//! reactor thread: closing files (slow when the descriptor is the last
//! reference to an unlinked file), fsync, and freeing large heap graphs.
//!
//! The design is intentionally simple: one FIFO queue and one dedicated
//! worker thread per job kind. Jobs of the same kind run in submission
//! order, oldest first. There is no completion callback; a submitter that
//! needs to observe progress polls [`Workers::pending`] or blocks in
//! [`Workers::wait_step`].

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::metrics::*;

pub mod metrics;

// The `libc` crate does not expose these glibc pthread cancellation
// functions on this target; declare them locally with the same
// signatures glibc provides.
extern "C" {
    fn pthread_setcancelstate(state: libc::c_int, oldstate: *mut libc::c_int) -> libc::c_int;
    fn pthread_setcanceltype(kind: libc::c_int, oldtype: *mut libc::c_int) -> libc::c_int;
}

const PTHREAD_CANCEL_ENABLE: libc::c_int = 0;
const PTHREAD_CANCEL_ASYNCHRONOUS: libc::c_int = 1;

/// Worker stacks are raised to tolerate deep I/O library call chains.
const THREAD_STACK_SIZE: usize = 4 * 1024 * 1024;

const THREAD_PREFIX: &str = "bg";

/// The background job kinds. One queue and one worker exists per kind; the
/// discriminants are the stable ids exposed to introspection surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum JobKind {
    CloseFile = 0,
    Fsync = 1,
    LazyFree = 2,
}

pub const NUM_JOB_KINDS: usize = 3;

impl JobKind {
    fn name(self) -> &'static str {
        match self {
            JobKind::CloseFile => "close",
            JobKind::Fsync => "fsync",
            JobKind::LazyFree => "lazyfree",
        }
    }
}

/// A unit of background work. The lazy-free payload carries the heap graph
/// to destroy as a closure, so this crate needs no knowledge of the value
/// types being freed.
pub enum Task {
    /// `close(2)` the descriptor.
    CloseFile(RawFd),
    /// Sync the descriptor's data to stable storage.
    Fsync(RawFd),
    /// Drop a detached heap graph.
    LazyFree(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    pub fn kind(&self) -> JobKind {
        match self {
            Task::CloseFile(_) => JobKind::CloseFile,
            Task::Fsync(_) => JobKind::Fsync,
            Task::LazyFree(_) => JobKind::LazyFree,
        }
    }

    fn execute(self) {
        match self {
            Task::CloseFile(fd) => unsafe {
                libc::close(fd);
            },
            Task::Fsync(fd) => sync_file(fd),
            Task::LazyFree(free) => free(),
        }
    }
}

/// Partial-metadata sync where the platform offers it.
#[cfg(target_os = "linux")]
fn sync_file(fd: RawFd) {
    unsafe {
        libc::fdatasync(fd);
    }
}

#[cfg(not(target_os = "linux"))]
fn sync_file(fd: RawFd) {
    unsafe {
        libc::fsync(fd);
    }
}

enum Message {
    Run(Job),
    Exit,
}

struct Job {
    queued: Instant,
    task: Task,
}

struct Queue {
    jobs: Mutex<VecDeque<Message>>,
    newjob: Condvar,
    step: Condvar,
    /// Written under the queue lock, read lock-free for cheap
    /// introspection. A job counts as pending from submission until its
    /// execution finishes.
    pending: AtomicU64,
}

impl Queue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            newjob: Condvar::new(),
            step: Condvar::new(),
            pending: AtomicU64::new(0),
        }
    }
}

/// The worker pool: three queues, three threads, started at construction
/// and stopped by [`Workers::shutdown`] (or, on a crash path only,
/// [`Workers::kill_all`]).
pub struct Workers {
    queues: [Arc<Queue>; NUM_JOB_KINDS],
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl Workers {
    pub fn new() -> Self {
        let queues = [
            Arc::new(Queue::new()),
            Arc::new(Queue::new()),
            Arc::new(Queue::new()),
        ];

        let mut threads = Vec::with_capacity(NUM_JOB_KINDS);
        for (i, kind) in [JobKind::CloseFile, JobKind::Fsync, JobKind::LazyFree]
            .into_iter()
            .enumerate()
        {
            let queue = queues[i].clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}_{}", THREAD_PREFIX, kind.name()))
                .stack_size(THREAD_STACK_SIZE)
                .spawn(move || worker(kind, queue))
                .expect("failed to spawn background worker");
            threads.push(Some(handle));
        }

        Self {
            queues,
            threads: Mutex::new(threads),
        }
    }

    /// Enqueues a job on the queue for its kind and returns immediately.
    /// Thread-safe.
    pub fn submit(&self, task: Task) {
        let kind = task.kind();
        let queue = &self.queues[kind as usize];
        let mut jobs = queue.jobs.lock();
        jobs.push_back(Message::Run(Job {
            queued: Instant::now(),
            task,
        }));
        let pending_now = queue.pending.fetch_add(1, Ordering::Relaxed) + 1;
        queue.newjob.notify_one();
        drop(jobs);
        record_submit(kind, pending_now);
    }

    /// Snapshot of the number of jobs pending (queued or executing) for a
    /// kind.
    pub fn pending(&self, kind: JobKind) -> u64 {
        self.queues[kind as usize].pending.load(Ordering::Relaxed)
    }

    /// If jobs are pending for `kind`, blocks until the worker signals one
    /// completion. Returns the updated pending count; callers wanting to
    /// drain a queue call this in a loop.
    pub fn wait_step(&self, kind: JobKind) -> u64 {
        let queue = &self.queues[kind as usize];
        let mut jobs = queue.jobs.lock();
        let mut val = queue.pending.load(Ordering::Relaxed);
        if val != 0 {
            queue.step.wait(&mut jobs);
            val = queue.pending.load(Ordering::Relaxed);
        }
        val
    }

    /// Orderly stop: each queue drains the jobs already submitted, then its
    /// worker exits and is joined.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock();
        if threads.iter().all(Option::is_none) {
            return;
        }

        for queue in &self.queues {
            let mut jobs = queue.jobs.lock();
            jobs.push_back(Message::Exit);
            queue.newjob.notify_one();
        }

        for handle in threads.iter_mut() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }

    /// Kills the worker threads in an unclean way. Only for crash handling,
    /// where other threads must stop touching memory before a forced dump;
    /// queued jobs are abandoned.
    pub fn kill_all(&self) {
        let mut threads = self.threads.lock();
        for (kind, handle) in threads.iter_mut().enumerate() {
            if let Some(handle) = handle.take() {
                let tid = handle.as_pthread_t() as libc::pthread_t;
                unsafe {
                    if libc::pthread_cancel(tid) == 0 {
                        libc::pthread_join(tid, std::ptr::null_mut());
                        warn!("background worker #{} terminated", kind);
                    }
                }
                // the thread is gone; its join state was consumed by the
                // raw join above
                std::mem::forget(handle);
            }
        }
    }
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker(kind: JobKind, queue: Arc<Queue>) {
    // Make the thread killable at any time by kill_all.
    unsafe {
        pthread_setcancelstate(PTHREAD_CANCEL_ENABLE, std::ptr::null_mut());
        pthread_setcanceltype(PTHREAD_CANCEL_ASYNCHRONOUS, std::ptr::null_mut());
    }

    // Block SIGALRM so the process-wide watchdog timer only ever interrupts
    // the reactor thread.
    unsafe {
        let mut sigset: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut sigset);
        libc::sigaddset(&mut sigset, libc::SIGALRM);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &sigset, std::ptr::null_mut()) != 0 {
            warn!("can't mask SIGALRM in background worker");
        }
    }

    debug!("background worker for {} jobs started", kind.name());

    loop {
        let mut jobs = queue.jobs.lock();
        let message = loop {
            if let Some(message) = jobs.pop_front() {
                break message;
            }
            queue.newjob.wait(&mut jobs);
        };
        drop(jobs);

        let job = match message {
            Message::Exit => break,
            Message::Run(job) => job,
        };

        trace!(
            "{} job executing after {:?} in queue",
            kind.name(),
            job.queued.elapsed()
        );
        job.task.execute();

        let jobs = queue.jobs.lock();
        let pending_now = queue.pending.fetch_sub(1, Ordering::Relaxed) - 1;
        queue.step.notify_all();
        drop(jobs);
        record_complete(kind, pending_now);
    }

    debug!("background worker for {} jobs stopped", kind.name());
}

common::metrics::test_no_duplicates!();

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::fd::IntoRawFd;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn jobs_of_one_kind_run_in_submission_order() {
        let workers = Workers::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..100 {
            let seen = seen.clone();
            workers.submit(Task::LazyFree(Box::new(move || {
                seen.lock().unwrap().push(i);
            })));
        }

        while workers.wait_step(JobKind::LazyFree) != 0 {}
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn pending_counts_until_execution_completes() {
        let workers = Workers::new();
        assert_eq!(workers.pending(JobKind::LazyFree), 0);

        let (release_tx, release_rx) = mpsc::channel::<()>();
        workers.submit(Task::LazyFree(Box::new(move || {
            release_rx.recv().unwrap();
        })));

        // the job is executing (or queued) until we release it
        assert_eq!(workers.pending(JobKind::LazyFree), 1);
        assert_eq!(workers.pending(JobKind::Fsync), 0);

        release_tx.send(()).unwrap();
        while workers.wait_step(JobKind::LazyFree) != 0 {}
        assert_eq!(workers.pending(JobKind::LazyFree), 0);
    }

    #[test]
    fn fsync_and_close_run_against_a_real_file() {
        let workers = Workers::new();

        let path = std::env::temp_dir().join(format!("bgtask_test_{}", std::process::id()));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(b"payload").unwrap();
        let fd = file.into_raw_fd();

        workers.submit(Task::Fsync(fd));
        while workers.wait_step(JobKind::Fsync) != 0 {}

        workers.submit(Task::CloseFile(fd));
        while workers.wait_step(JobKind::CloseFile) != 0 {}

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn per_queue_metrics_track_submissions_and_completions() {
        // counters are process-wide, so assert on deltas
        let submits = BGTASK_FSYNC_SUBMIT.value();
        let completes = BGTASK_FSYNC_COMPLETE.value();

        let workers = Workers::new();
        for _ in 0..5 {
            workers.submit(Task::Fsync(-1));
        }
        assert!(BGTASK_FSYNC_SUBMIT.value() >= submits + 5);

        // completion is recorded after the pending count drops, so give
        // the worker a bounded window to catch up
        for _ in 0..5000 {
            if BGTASK_FSYNC_COMPLETE.value() >= completes + 5 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(BGTASK_FSYNC_COMPLETE.value() >= completes + 5);
    }

    #[test]
    fn shutdown_drains_queued_jobs_first() {
        let workers = Workers::new();
        let ran = Arc::new(StdMutex::new(0));

        for _ in 0..10 {
            let ran = ran.clone();
            workers.submit(Task::LazyFree(Box::new(move || {
                std::thread::sleep(Duration::from_millis(1));
                *ran.lock().unwrap() += 1;
            })));
        }

        workers.shutdown();
        assert_eq!(*ran.lock().unwrap(), 10);
        // a second shutdown is a no-op
        workers.shutdown();
    }

    #[test]
    fn no_ordering_across_queues() {
        // jobs on different queues proceed independently: a stalled
        // lazy-free queue does not hold up fsync completion
        let workers = Workers::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        workers.submit(Task::LazyFree(Box::new(move || {
            release_rx.recv().unwrap();
        })));

        // the fsync queue is separate; an invalid descriptor fails silently
        // inside the worker and completion still signals
        workers.submit(Task::Fsync(-1));
        while workers.pending(JobKind::Fsync) != 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        release_tx.send(()).unwrap();
        while workers.wait_step(JobKind::LazyFree) != 0 {}
    }
}

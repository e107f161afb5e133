// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A single-threaded event loop multiplexing I/O readiness and timers.
//!
//! File events are registered per descriptor with a Readable/Writable mask
//! and dispatched in readable-then-writable order; setting the Barrier bit
//! inverts that order for one descriptor, which is what a caller wants when
//! it must flush (say, fsync) before accepting more input. Time events are
//! millisecond-resolution callbacks that reschedule themselves by returning
//! the next delay.
//!
//! The kernel readiness source is [`mio::Poll`], which picks the best
//! backend for the platform. Everything runs on the thread that owns the
//! [`EventLoop`]; callbacks receive `&mut EventLoop` and may freely
//! register and deregister events on the loop that is dispatching them.

use std::cell::RefCell;
use std::mem;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use log::{error, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::metrics::*;

pub mod metrics;
mod time;

pub use time::{TimeFinalizer, TimeProc};
pub(crate) use time::TimeEvent;

/// File event mask bits.
pub type Mask = u32;
pub const NONE: Mask = 0;
pub const READABLE: Mask = 1;
pub const WRITABLE: Mask = 2;
/// With Writable, invert the dispatch order: fire the write callback before
/// the read callback within one tick.
pub const BARRIER: Mask = 4;

/// Flags accepted by [`EventLoop::process`].
pub type Flags = u32;
pub const FILE_EVENTS: Flags = 1;
pub const TIME_EVENTS: Flags = 2;
pub const ALL_EVENTS: Flags = FILE_EVENTS | TIME_EVENTS;
/// Return as soon as possible instead of blocking for the next event.
pub const DONT_WAIT: Flags = 4;
pub const CALL_AFTER_SLEEP: Flags = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file descriptor {0} outside the configured capacity")]
    OutOfRange(RawFd),
    #[error("capacity too small for the registered descriptors")]
    ResizeRejected,
    #[error("no time event with id {0}")]
    NoSuchTimeEvent(i64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A file event callback. Shared through `Rc<RefCell<..>>` so the loop can
/// invoke it while handing itself to the callback mutably; registering the
/// same callback for Readable and Writable makes the loop fire it only once
/// per tick.
pub type FileProc = Rc<RefCell<dyn FnMut(&mut EventLoop, RawFd, Mask)>>;

/// Wraps a closure as a [`FileProc`].
pub fn file_proc(f: impl FnMut(&mut EventLoop, RawFd, Mask) + 'static) -> FileProc {
    Rc::new(RefCell::new(f))
}

type Hook = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

#[derive(Default)]
struct FileEvent {
    mask: Mask,
    rproc: Option<FileProc>,
    wproc: Option<FileProc>,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    /// Registration slots indexed by raw file descriptor.
    file_events: Vec<FileEvent>,
    /// Scratch for readiness gathered by one backend poll.
    fired: Vec<(RawFd, Mask)>,
    /// Highest registered descriptor, -1 when none.
    maxfd: RawFd,
    pub(crate) time_events: Vec<TimeEvent>,
    pub(crate) next_time_id: i64,
    /// Wall-clock seconds at the last time-event pass, to detect the system
    /// clock moving backwards.
    pub(crate) last_time: u64,
    stop: bool,
    before_sleep: Option<Hook>,
    after_sleep: Option<Hook>,
}

impl EventLoop {
    /// Creates a loop able to monitor descriptors `0..setsize`.
    pub fn new(setsize: usize) -> Result<Self, Error> {
        let mut file_events = Vec::new();
        file_events.resize_with(setsize, FileEvent::default);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(setsize.max(1)),
            file_events,
            fired: Vec::new(),
            maxfd: -1,
            time_events: Vec::new(),
            next_time_id: 0,
            last_time: wall_clock().0,
            stop: false,
            before_sleep: None,
            after_sleep: None,
        })
    }

    pub fn setsize(&self) -> usize {
        self.file_events.len()
    }

    /// Changes the monitored-descriptor capacity. Refused if a descriptor
    /// at or above the new capacity is still registered.
    pub fn resize_setsize(&mut self, setsize: usize) -> Result<(), Error> {
        if setsize == self.file_events.len() {
            return Ok(());
        }
        if self.maxfd >= setsize as RawFd {
            return Err(Error::ResizeRejected);
        }
        self.file_events.resize_with(setsize, FileEvent::default);
        self.events = Events::with_capacity(setsize.max(1));
        Ok(())
    }

    /// Registers (or merges into an existing registration) the mask for
    /// `fd`. The callback is stored for each of Readable and Writable named
    /// in the mask; Barrier is a modifier and needs no callback of its own.
    pub fn add_file(&mut self, fd: RawFd, mask: Mask, proc_: FileProc) -> Result<(), Error> {
        if fd < 0 || fd as usize >= self.file_events.len() {
            return Err(Error::OutOfRange(fd));
        }

        let old_kernel = self.file_events[fd as usize].mask & (READABLE | WRITABLE);
        let merged = self.file_events[fd as usize].mask | mask;
        let new_kernel = merged & (READABLE | WRITABLE);

        if new_kernel != old_kernel {
            let interest = interest_for(new_kernel);
            let mut source = SourceFd(&fd);
            if old_kernel == NONE {
                self.poll
                    .registry()
                    .register(&mut source, Token(fd as usize), interest)?;
            } else {
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), interest)?;
            }
        }

        let fe = &mut self.file_events[fd as usize];
        fe.mask = merged;
        if mask & READABLE != 0 {
            fe.rproc = Some(proc_.clone());
        }
        if mask & WRITABLE != 0 {
            fe.wproc = Some(proc_);
        }
        if fd > self.maxfd {
            self.maxfd = fd;
        }
        Ok(())
    }

    /// Removes the given bits from the registration. Removing Writable also
    /// clears Barrier.
    pub fn remove_file(&mut self, fd: RawFd, mask: Mask) {
        if fd < 0 || fd as usize >= self.file_events.len() {
            return;
        }
        if self.file_events[fd as usize].mask == NONE {
            return;
        }

        let mut mask = mask;
        if mask & WRITABLE != 0 {
            mask |= BARRIER;
        }

        let old_kernel = self.file_events[fd as usize].mask & (READABLE | WRITABLE);
        let new_mask = self.file_events[fd as usize].mask & !mask;
        let new_kernel = new_mask & (READABLE | WRITABLE);

        if new_kernel != old_kernel {
            let mut source = SourceFd(&fd);
            let result = if new_kernel == NONE {
                self.poll.registry().deregister(&mut source)
            } else {
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), interest_for(new_kernel))
            };
            if let Err(e) = result {
                warn!("failed to update backend registration for fd {}: {}", fd, e);
            }
        }

        let fe = &mut self.file_events[fd as usize];
        fe.mask = new_mask;
        if new_mask & READABLE == 0 {
            fe.rproc = None;
        }
        if new_mask & WRITABLE == 0 {
            fe.wproc = None;
        }

        if fd == self.maxfd && new_mask == NONE {
            let mut j = self.maxfd - 1;
            while j >= 0 && self.file_events[j as usize].mask == NONE {
                j -= 1;
            }
            self.maxfd = j;
        }
    }

    /// The currently registered mask for `fd`, NONE when unregistered.
    pub fn file_mask(&self, fd: RawFd) -> Mask {
        if fd < 0 || fd as usize >= self.file_events.len() {
            return NONE;
        }
        self.file_events[fd as usize].mask
    }

    /// Processes one batch of events per the flag bits and returns the
    /// number of events dispatched.
    pub fn process(&mut self, flags: Flags) -> usize {
        let mut processed = 0;

        if flags & ALL_EVENTS == 0 {
            return 0;
        }

        // Poll the kernel when there are descriptors to watch, or sleep
        // until the nearest timer even without any.
        if self.maxfd != -1 || (flags & TIME_EVENTS != 0 && flags & DONT_WAIT == 0) {
            let timeout = if flags & TIME_EVENTS != 0 && flags & DONT_WAIT == 0 {
                match self.nearest_deadline() {
                    Some((when_sec, when_ms)) => {
                        let (now_sec, now_ms) = wall_clock();
                        let ms = (when_sec as i64 - now_sec as i64) * 1000
                            + (when_ms as i64 - now_ms as i64);
                        Some(Duration::from_millis(ms.max(0) as u64))
                    }
                    None => None,
                }
            } else if flags & DONT_WAIT != 0 {
                Some(Duration::ZERO)
            } else {
                None
            };

            self.poll_kernel(timeout);

            if flags & CALL_AFTER_SLEEP != 0 {
                if let Some(hook) = self.after_sleep.clone() {
                    let mut cb = hook.borrow_mut();
                    (&mut *cb)(self);
                }
            }

            let fired = mem::take(&mut self.fired);
            processed += self.dispatch_fired(&fired);
            self.fired = fired;
        }

        if flags & TIME_EVENTS != 0 {
            processed += self.process_time_events();
        }

        processed
    }

    /// Runs `process` until [`EventLoop::stop`] is called, invoking the
    /// before-sleep hook ahead of every pass.
    pub fn run(&mut self) {
        self.stop = false;
        while !self.stop {
            if let Some(hook) = self.before_sleep.clone() {
                let mut cb = hook.borrow_mut();
                (&mut *cb)(self);
            }
            self.process(ALL_EVENTS | CALL_AFTER_SLEEP);
        }
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// The before-sleep hook is the conventional place to flush pending
    /// writes before the loop blocks in the kernel.
    pub fn set_before_sleep(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.before_sleep = Some(Rc::new(RefCell::new(f)));
    }

    pub fn set_after_sleep(&mut self, f: impl FnMut(&mut EventLoop) + 'static) {
        self.after_sleep = Some(Rc::new(RefCell::new(f)));
    }

    fn poll_kernel(&mut self, timeout: Option<Duration>) {
        self.fired.clear();
        REACTOR_POLL.increment();

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            // interrupted and spurious wake-ups are absorbed; the caller
            // retries on the next tick
            if e.kind() != std::io::ErrorKind::Interrupted {
                error!("event backend poll error: {}", e);
            }
            return;
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let mut mask = NONE;
            if event.is_readable() {
                mask |= READABLE;
            }
            if event.is_writable() {
                mask |= WRITABLE;
            }
            // errors and hang-ups surface as writable so the write path
            // observes the peer close
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                mask |= WRITABLE;
            }
            if mask != NONE {
                self.fired.push((fd, mask));
            }
        }
    }

    fn dispatch_fired(&mut self, fired: &[(RawFd, Mask)]) -> usize {
        let mut processed = 0;

        for &(fd, mask) in fired {
            let invert = match self.file_events.get(fd as usize) {
                Some(fe) => fe.mask & BARRIER != 0,
                None => continue,
            };

            let mut fired_count = 0;
            let mut called: Option<FileProc> = None;

            // The registration is re-read before every callback: the
            // previous callback may have changed or dropped it.
            if !invert {
                if let Some(rp) = self.runnable_proc(fd, mask, READABLE) {
                    let mut cb = rp.borrow_mut();
                    (&mut *cb)(self, fd, mask);
                    drop(cb);
                    fired_count += 1;
                    called = Some(rp);
                    REACTOR_FILE_EVENT.increment();
                }
            }

            if let Some(wp) = self.runnable_proc(fd, mask, WRITABLE) {
                let duplicate = called.as_ref().map(|p| Rc::ptr_eq(p, &wp)).unwrap_or(false);
                if fired_count == 0 || !duplicate {
                    let mut cb = wp.borrow_mut();
                    (&mut *cb)(self, fd, mask);
                    drop(cb);
                    fired_count += 1;
                    called = Some(wp);
                    REACTOR_FILE_EVENT.increment();
                }
            }

            // the inverted readable event, fired after the write side
            if invert {
                if let Some(rp) = self.runnable_proc(fd, mask, READABLE) {
                    let duplicate = called.as_ref().map(|p| Rc::ptr_eq(p, &rp)).unwrap_or(false);
                    if fired_count == 0 || !duplicate {
                        let mut cb = rp.borrow_mut();
                        (&mut *cb)(self, fd, mask);
                        drop(cb);
                        REACTOR_FILE_EVENT.increment();
                    }
                }
            }

            processed += 1;
        }

        processed
    }

    /// The callback for `which` on `fd` if it is registered and named in
    /// the fired mask.
    fn runnable_proc(&self, fd: RawFd, fired_mask: Mask, which: Mask) -> Option<FileProc> {
        let fe = self.file_events.get(fd as usize)?;
        if fe.mask & fired_mask & which == 0 {
            return None;
        }
        if which == READABLE {
            fe.rproc.clone()
        } else {
            fe.wproc.clone()
        }
    }
}

fn interest_for(kernel_mask: Mask) -> Interest {
    match (kernel_mask & READABLE != 0, kernel_mask & WRITABLE != 0) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("registering empty interest"),
    }
}

/// Wall-clock time as (seconds, milliseconds). The reactor needs a clock
/// that can move backwards so skew is observable; a monotonic clock would
/// hide exactly the condition the time-event pass recovers from.
pub(crate) fn wall_clock() -> (u64, u64) {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_millis() as u64),
        Err(_) => (0, 0),
    }
}

common::metrics::test_no_duplicates!();

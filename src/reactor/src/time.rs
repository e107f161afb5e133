// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Time events: millisecond-resolution callbacks owned by the event loop.
//!
//! Creation is O(1). Deletion marks the event with a tombstone id; the next
//! time-event pass splices tombstones out and runs their finalizers. A
//! callback returns `Some(ms)` to be rescheduled that many milliseconds
//! ahead, or `None` to be removed. The nearest-deadline search is a linear
//! scan, which has been fine in practice with the handful of timers a
//! server keeps; an ordered structure could replace it without changing any
//! of this surface.

use std::cell::RefCell;
use std::rc::Rc;

use crate::metrics::REACTOR_TIME_EVENT;
use crate::{wall_clock, Error, EventLoop};

/// Id carried by events scheduled for deletion.
pub(crate) const DELETED_EVENT_ID: i64 = -1;

/// A time event callback: receives the loop and its own id, returns the
/// next delay in milliseconds or None to stop firing.
pub type TimeProc = Rc<RefCell<dyn FnMut(&mut EventLoop, i64) -> Option<u64>>>;

/// Runs on the reactor thread when a deleted event is reaped.
pub type TimeFinalizer = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;

pub(crate) struct TimeEvent {
    pub(crate) id: i64,
    pub(crate) when_sec: u64,
    pub(crate) when_ms: u64,
    proc_: TimeProc,
    finalizer: Option<TimeFinalizer>,
}

fn add_ms_to_now(ms: u64) -> (u64, u64) {
    let (now_sec, now_ms) = wall_clock();
    let mut when_sec = now_sec + ms / 1000;
    let mut when_ms = now_ms + ms % 1000;
    if when_ms >= 1000 {
        when_sec += 1;
        when_ms -= 1000;
    }
    (when_sec, when_ms)
}

impl EventLoop {
    /// Schedules `proc_` to fire `after_ms` milliseconds from now. Returns
    /// the event id.
    pub fn create_time(
        &mut self,
        after_ms: u64,
        proc_: impl FnMut(&mut EventLoop, i64) -> Option<u64> + 'static,
    ) -> i64 {
        self.create_time_with_finalizer(after_ms, proc_, None)
    }

    /// Like [`EventLoop::create_time`], with a finalizer that runs on the
    /// reactor thread once the event is removed.
    pub fn create_time_with_finalizer(
        &mut self,
        after_ms: u64,
        proc_: impl FnMut(&mut EventLoop, i64) -> Option<u64> + 'static,
        finalizer: Option<TimeFinalizer>,
    ) -> i64 {
        let id = self.next_time_id;
        self.next_time_id += 1;
        let (when_sec, when_ms) = add_ms_to_now(after_ms);
        self.time_events.push(TimeEvent {
            id,
            when_sec,
            when_ms,
            proc_: Rc::new(RefCell::new(proc_)),
            finalizer,
        });
        id
    }

    /// Marks the event deleted. It is actually removed, and its finalizer
    /// run, during the next time-event pass.
    pub fn delete_time(&mut self, id: i64) -> Result<(), Error> {
        for te in &mut self.time_events {
            if te.id == id {
                te.id = DELETED_EVENT_ID;
                return Ok(());
            }
        }
        Err(Error::NoSuchTimeEvent(id))
    }

    /// Deadline of the soonest event, as wall-clock (seconds, ms).
    pub(crate) fn nearest_deadline(&self) -> Option<(u64, u64)> {
        self.time_events
            .iter()
            .map(|te| (te.when_sec, te.when_ms))
            .min()
    }

    pub(crate) fn process_time_events(&mut self) -> usize {
        let mut processed = 0;

        // If the system clock was moved to the future and then set back,
        // events would be delayed for a long stretch. Detect the skew and
        // make everything due now: firing early is less dangerous than
        // firing late.
        let now_sec = wall_clock().0;
        if now_sec < self.last_time {
            for te in &mut self.time_events {
                te.when_sec = 0;
            }
        }
        self.last_time = now_sec;

        // Events created by callbacks during this pass have ids beyond this
        // snapshot and are not fired until the next pass.
        let max_id = self.next_time_id - 1;

        let mut i = 0;
        while i < self.time_events.len() {
            if self.time_events[i].id == DELETED_EVENT_ID {
                let finalizer = self.time_events[i].finalizer.clone();
                self.time_events.remove(i);
                if let Some(f) = finalizer {
                    let mut cb = f.borrow_mut();
                    (&mut *cb)(self);
                }
                continue;
            }

            if self.time_events[i].id > max_id {
                i += 1;
                continue;
            }

            let (now_sec, now_ms) = wall_clock();
            let te = &self.time_events[i];
            if now_sec > te.when_sec || (now_sec == te.when_sec && now_ms >= te.when_ms) {
                let id = te.id;
                let proc_ = te.proc_.clone();
                let retval = {
                    let mut cb = proc_.borrow_mut();
                    (&mut *cb)(self, id)
                };
                processed += 1;
                REACTOR_TIME_EVENT.increment();

                // the callback may have added or deleted events; find this
                // one again by id before touching it
                if let Some(te) = self.time_events.iter_mut().find(|te| te.id == id) {
                    match retval {
                        Some(ms) => {
                            let (when_sec, when_ms) = add_ms_to_now(ms);
                            te.when_sec = when_sec;
                            te.when_ms = when_ms;
                        }
                        None => te.id = DELETED_EVENT_ID,
                    }
                }
            }
            i += 1;
        }

        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DONT_WAIT, TIME_EVENTS};

    #[test]
    fn due_event_fires_and_reschedules() {
        let mut el = EventLoop::new(4).unwrap();
        let hits = Rc::new(RefCell::new(0));

        let seen = hits.clone();
        el.create_time(0, move |_, _| {
            *seen.borrow_mut() += 1;
            Some(0)
        });

        el.process(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*hits.borrow(), 1);
        el.process(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn event_returning_none_stops_firing() {
        let mut el = EventLoop::new(4).unwrap();
        let hits = Rc::new(RefCell::new(0));

        let seen = hits.clone();
        el.create_time(0, move |_, _| {
            *seen.borrow_mut() += 1;
            None
        });

        el.process(TIME_EVENTS | DONT_WAIT);
        el.process(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*hits.borrow(), 1);
        assert!(el.time_events.is_empty());
    }

    #[test]
    fn distant_event_does_not_fire_early() {
        let mut el = EventLoop::new(4).unwrap();
        let hits = Rc::new(RefCell::new(0));

        let seen = hits.clone();
        el.create_time(60_000, move |_, _| {
            *seen.borrow_mut() += 1;
            None
        });

        el.process(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn deleted_event_is_reaped_and_finalized() {
        let mut el = EventLoop::new(4).unwrap();
        let finalized = Rc::new(RefCell::new(false));

        let id = el.create_time_with_finalizer(
            60_000,
            |_, _| None,
            Some({
                let finalized = finalized.clone();
                Rc::new(RefCell::new(move |_: &mut EventLoop| {
                    *finalized.borrow_mut() = true;
                }))
            }),
        );

        el.delete_time(id).unwrap();
        assert!(el.delete_time(id).is_err());

        el.process(TIME_EVENTS | DONT_WAIT);
        assert!(*finalized.borrow());
        assert!(el.time_events.is_empty());
    }

    #[test]
    fn callback_created_events_wait_for_the_next_pass() {
        let mut el = EventLoop::new(4).unwrap();
        let children = Rc::new(RefCell::new(0));

        let spawned = children.clone();
        el.create_time(0, move |el, _| {
            let counter = spawned.clone();
            el.create_time(0, move |_, _| {
                *counter.borrow_mut() += 1;
                None
            });
            None
        });

        el.process(TIME_EVENTS | DONT_WAIT);
        // the child was created mid-pass and must not fire until the next
        assert_eq!(*children.borrow(), 0);
        el.process(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*children.borrow(), 1);
    }

    #[test]
    fn clock_skew_fires_pending_events_immediately() {
        let mut el = EventLoop::new(4).unwrap();
        let hits = Rc::new(RefCell::new(0));

        let seen = hits.clone();
        el.create_time(10_000, move |_, _| {
            *seen.borrow_mut() += 1;
            None
        });

        // pretend the last pass observed a wall clock far in the future,
        // as happens when the system clock is stepped backwards
        el.last_time = wall_clock().0 + 30;

        el.process(TIME_EVENTS | DONT_WAIT);
        assert_eq!(*hits.borrow(), 1);
    }
}

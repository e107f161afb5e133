// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metriken::*;

use crate::JobKind;

#[metric(
    name = "bgtask_close_submit",
    description = "number of jobs submitted to the close-file queue"
)]
pub static BGTASK_CLOSE_SUBMIT: Counter = Counter::new();

#[metric(
    name = "bgtask_close_complete",
    description = "number of jobs completed by the close-file worker"
)]
pub static BGTASK_CLOSE_COMPLETE: Counter = Counter::new();

#[metric(
    name = "bgtask_close_pending",
    description = "jobs queued or executing on the close-file queue"
)]
pub static BGTASK_CLOSE_PENDING: Gauge = Gauge::new();

#[metric(
    name = "bgtask_fsync_submit",
    description = "number of jobs submitted to the fsync queue"
)]
pub static BGTASK_FSYNC_SUBMIT: Counter = Counter::new();

#[metric(
    name = "bgtask_fsync_complete",
    description = "number of jobs completed by the fsync worker"
)]
pub static BGTASK_FSYNC_COMPLETE: Counter = Counter::new();

#[metric(
    name = "bgtask_fsync_pending",
    description = "jobs queued or executing on the fsync queue"
)]
pub static BGTASK_FSYNC_PENDING: Gauge = Gauge::new();

#[metric(
    name = "bgtask_lazyfree_submit",
    description = "number of jobs submitted to the lazy-free queue"
)]
pub static BGTASK_LAZYFREE_SUBMIT: Counter = Counter::new();

#[metric(
    name = "bgtask_lazyfree_complete",
    description = "number of jobs completed by the lazy-free worker"
)]
pub static BGTASK_LAZYFREE_COMPLETE: Counter = Counter::new();

#[metric(
    name = "bgtask_lazyfree_pending",
    description = "jobs queued or executing on the lazy-free queue"
)]
pub static BGTASK_LAZYFREE_PENDING: Gauge = Gauge::new();

pub(crate) fn record_submit(kind: JobKind, pending_now: u64) {
    match kind {
        JobKind::CloseFile => {
            BGTASK_CLOSE_SUBMIT.increment();
            BGTASK_CLOSE_PENDING.set(pending_now as i64);
        }
        JobKind::Fsync => {
            BGTASK_FSYNC_SUBMIT.increment();
            BGTASK_FSYNC_PENDING.set(pending_now as i64);
        }
        JobKind::LazyFree => {
            BGTASK_LAZYFREE_SUBMIT.increment();
            BGTASK_LAZYFREE_PENDING.set(pending_now as i64);
        }
    }
}

pub(crate) fn record_complete(kind: JobKind, pending_now: u64) {
    match kind {
        JobKind::CloseFile => {
            BGTASK_CLOSE_COMPLETE.increment();
            BGTASK_CLOSE_PENDING.set(pending_now as i64);
        }
        JobKind::Fsync => {
            BGTASK_FSYNC_COMPLETE.increment();
            BGTASK_FSYNC_PENDING.set(pending_now as i64);
        }
        JobKind::LazyFree => {
            BGTASK_LAZYFREE_COMPLETE.increment();
            BGTASK_LAZYFREE_PENDING.set(pending_now as i64);
        }
    }
}

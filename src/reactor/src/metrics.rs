// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metriken::*;

#[metric(
    name = "reactor_poll",
    description = "number of times the reactor polled the kernel readiness backend"
)]
pub static REACTOR_POLL: Counter = Counter::new();

#[metric(
    name = "reactor_file_event",
    description = "number of file events dispatched"
)]
pub static REACTOR_FILE_EVENT: Counter = Counter::new();

#[metric(
    name = "reactor_time_event",
    description = "number of time events dispatched"
)]
pub static REACTOR_TIME_EVENT: Counter = Counter::new();

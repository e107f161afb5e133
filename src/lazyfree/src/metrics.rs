// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metriken::*;

#[metric(
    name = "lazyfree_pending",
    description = "objects handed to the background free queue and not yet destroyed"
)]
pub static LAZYFREE_PENDING: Gauge = Gauge::new();

#[metric(
    name = "lazyfree_offload",
    description = "values whose destruction was offloaded to the background workers"
)]
pub static LAZYFREE_OFFLOAD: Counter = Counter::new();

#[metric(
    name = "lazyfree_inline",
    description = "values destroyed inline because they were small or shared"
)]
pub static LAZYFREE_INLINE: Counter = Counter::new();

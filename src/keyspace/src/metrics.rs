// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metriken::*;

#[metric(
    name = "keyspace_grow",
    description = "number of times a table began growing into a larger table"
)]
pub static KEYSPACE_GROW: Counter = Counter::new();

#[metric(
    name = "keyspace_shrink",
    description = "number of times a table began shrinking into a smaller table"
)]
pub static KEYSPACE_SHRINK: Counter = Counter::new();

#[metric(
    name = "keyspace_rehash_bucket",
    description = "number of buckets migrated by incremental rehashing"
)]
pub static KEYSPACE_REHASH_BUCKET: Counter = Counter::new();

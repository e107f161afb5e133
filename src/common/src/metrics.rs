// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Process-wide metrics shared by every crate in the workspace, and the
//! test macro each crate uses to guard the flat metric namespace.

use std::time::{SystemTime, UNIX_EPOCH};

use metriken::*;

/// Creates a test that verifies that no two metrics have the same name.
/// Every crate in the workspace invokes this at its root: metric names
/// live in one flat namespace, and each crate's test binary links its own
/// dependency subset, so the checks overlap but none is redundant.
#[macro_export]
#[rustfmt::skip]
macro_rules! test_no_duplicates {
    () => {
        #[cfg(test)]
        mod __metrics_tests {
            #[test]
            fn assert_no_duplicate_metric_names() {
                use std::collections::HashSet;
                use metriken::*;

                let mut seen = HashSet::new();
                for metric in metrics().static_metrics() {
                    let name = metric.name();
                    assert!(seen.insert(name), "found duplicate metric name '{}'", name);
                }
            }
        }
    };
}

pub use test_no_duplicates;

#[metric(name = "pid", description = "the process id")]
pub static PID: Gauge = Gauge::new();

#[metric(
    name = "startup_unix_seconds",
    description = "wall-clock time the process initialized its metrics, as a unix timestamp"
)]
pub static STARTUP_UNIX_SECONDS: Gauge = Gauge::new();

pub fn init() {
    PID.set(std::process::id().into());
    STARTUP_UNIX_SECONDS.set(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    );
}

test_no_duplicates!();

//! Operation counters and their Prometheus text rendering.
//!
//! Counters only ever increase and are bumped by the control server on
//! every acquire/run/release (and their failures); gauges are sampled at
//! scrape time from the pool and active registry.  Rendering is the plain
//! text exposition format — one `# TYPE` line, one sample line.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub acquire_total: AtomicU64,
    pub acquire_errors_total: AtomicU64,
    pub release_total: AtomicU64,
    pub run_total: AtomicU64,
    pub run_errors_total: AtomicU64,
}

/// Point-in-time gauge values supplied by the scrape handler.
#[derive(Debug, Clone, Copy)]
pub struct Gauges {
    pub active_vms: u64,
    pub pool_warm: u64,
    pub pool_booting: u64,
    pub uptime_seconds: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the scrape body.
    pub fn render(&self, gauges: Gauges) -> String {
        let mut out = String::with_capacity(640);
        counter(&mut out, "carapace_acquire_total", &self.acquire_total);
        counter(
            &mut out,
            "carapace_acquire_errors_total",
            &self.acquire_errors_total,
        );
        counter(&mut out, "carapace_release_total", &self.release_total);
        counter(&mut out, "carapace_run_total", &self.run_total);
        counter(&mut out, "carapace_run_errors_total", &self.run_errors_total);
        gauge(&mut out, "carapace_active_vms", gauges.active_vms);
        gauge(&mut out, "carapace_pool_warm", gauges.pool_warm);
        gauge(&mut out, "carapace_pool_booting", gauges.pool_booting);
        gauge(&mut out, "carapace_uptime_seconds", gauges.uptime_seconds);
        out
    }
}

fn counter(out: &mut String, name: &str, value: &AtomicU64) {
    writeln!(out, "# TYPE {name} counter").expect("writing to String cannot fail");
    writeln!(out, "{name} {}", value.load(Ordering::Relaxed))
        .expect("writing to String cannot fail");
}

fn gauge(out: &mut String, name: &str, value: u64) {
    writeln!(out, "# TYPE {name} gauge").expect("writing to String cannot fail");
    writeln!(out, "{name} {value}").expect("writing to String cannot fail");
}

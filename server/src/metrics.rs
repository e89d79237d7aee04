//! Operational counters for the HTTP surface.
//!
//! Plain atomics, snapshotted on demand. `code_space_exhausted` is the
//! alarm counter: it stays at zero in any healthy deployment, so a nonzero
//! value is worth paging on.

use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct OpsMetrics {
    scores_accepted: AtomicU64,
    scores_rejected: AtomicU64,
    rate_limited: AtomicU64,
    codes_issued: AtomicU64,
    codes_redeemed: AtomicU64,
    finalize_runs: AtomicU64,
    code_space_exhausted: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct OpsMetricsSnapshot {
    pub scores_accepted: u64,
    pub scores_rejected: u64,
    pub rate_limited: u64,
    pub codes_issued: u64,
    pub codes_redeemed: u64,
    pub finalize_runs: u64,
    pub code_space_exhausted: u64,
}

impl OpsMetrics {
    pub fn snapshot(&self) -> OpsMetricsSnapshot {
        OpsMetricsSnapshot {
            scores_accepted: self.scores_accepted.load(Ordering::Relaxed),
            scores_rejected: self.scores_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            codes_issued: self.codes_issued.load(Ordering::Relaxed),
            codes_redeemed: self.codes_redeemed.load(Ordering::Relaxed),
            finalize_runs: self.finalize_runs.load(Ordering::Relaxed),
            code_space_exhausted: self.code_space_exhausted.load(Ordering::Relaxed),
        }
    }

    pub fn inc_scores_accepted(&self) {
        self.scores_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scores_rejected(&self) {
        self.scores_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_codes_issued(&self) {
        self.codes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_codes_issued(&self, count: u64) {
        self.codes_issued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_codes_redeemed(&self) {
        self.codes_redeemed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_finalize_runs(&self) {
        self.finalize_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_code_space_exhausted(&self) {
        self.code_space_exhausted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Render a snapshot in the Prometheus text exposition format.
pub fn render_prometheus(snapshot: &OpsMetricsSnapshot) -> String {
    let mut out = String::new();
    append_counter(&mut out, "dreamrun_server_scores_accepted_total", snapshot.scores_accepted);
    append_counter(&mut out, "dreamrun_server_scores_rejected_total", snapshot.scores_rejected);
    append_counter(&mut out, "dreamrun_server_rate_limited_total", snapshot.rate_limited);
    append_counter(&mut out, "dreamrun_server_codes_issued_total", snapshot.codes_issued);
    append_counter(&mut out, "dreamrun_server_codes_redeemed_total", snapshot.codes_redeemed);
    append_counter(&mut out, "dreamrun_server_finalize_runs_total", snapshot.finalize_runs);
    append_counter(
        &mut out,
        "dreamrun_server_code_space_exhausted_total",
        snapshot.code_space_exhausted,
    );
    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

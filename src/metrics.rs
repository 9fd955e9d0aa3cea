// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Process-local metrics registry with Prometheus text exposition.
//!
//! Counters and gauges are plain atomics; histograms use fixed buckets.
//! The /metrics handler renders the registry plus live gauges sampled at
//! scrape time (warm-pool sizes, online nodes).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Histogram over fixed millisecond buckets.
pub struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

const DURATION_BOUNDS_MS: &[u64] = &[10, 50, 100, 250, 500, 1000, 2500, 5000, 15000, 60000];

impl Histogram {
    pub fn new(bounds: &'static [u64]) -> Self {
        Self {
            bounds,
            buckets: (0..bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value_ms: u64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value_ms <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        out.push_str(&format!("# TYPE {} histogram\n", name));
        for (i, bound) in self.bounds.iter().enumerate() {
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bound,
                self.buckets[i].load(Ordering::Relaxed)
            ));
        }
        let count = self.count.load(Ordering::Relaxed);
        out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, count));
        out.push_str(&format!("{}_sum {}\n", name, self.sum.load(Ordering::Relaxed)));
        out.push_str(&format!("{}_count {}\n", name, count));
    }
}

pub struct Metrics {
    pub sessions_created: Counter,
    pub sessions_terminated: Counter,
    pub sessions_failed: Counter,
    pub sessions_reaped: Counter,
    pub sessions_migrated: Counter,

    pub executions_submitted: Counter,
    pub executions_completed: Counter,
    pub executions_failed: Counter,
    pub executions_crashed: Counter,
    pub executions_retried: Counter,
    pub callbacks_deduplicated: Counter,

    pub placements_warm: Counter,
    pub placements_affinity: Counter,
    pub placements_load: Counter,
    pub placements_exhausted: Counter,

    pub active_sessions: Gauge,
    pub online_nodes: Gauge,

    pub execution_duration_ms: Histogram,
    pub scheduling_latency_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_created: Counter::default(),
            sessions_terminated: Counter::default(),
            sessions_failed: Counter::default(),
            sessions_reaped: Counter::default(),
            sessions_migrated: Counter::default(),
            executions_submitted: Counter::default(),
            executions_completed: Counter::default(),
            executions_failed: Counter::default(),
            executions_crashed: Counter::default(),
            executions_retried: Counter::default(),
            callbacks_deduplicated: Counter::default(),
            placements_warm: Counter::default(),
            placements_affinity: Counter::default(),
            placements_load: Counter::default(),
            placements_exhausted: Counter::default(),
            active_sessions: Gauge::default(),
            online_nodes: Gauge::default(),
            execution_duration_ms: Histogram::new(DURATION_BOUNDS_MS),
            scheduling_latency_ms: Histogram::new(DURATION_BOUNDS_MS),
        }
    }

    /// Prometheus text exposition; `warm_pool_sizes` is sampled by the
    /// caller at scrape time.
    pub fn render(&self, warm_pool_sizes: &[(String, usize)]) -> String {
        let mut out = String::with_capacity(4096);

        let counters: &[(&str, &Counter, &str)] = &[
            ("noxrun_sessions_created_total", &self.sessions_created, "Sessions created"),
            ("noxrun_sessions_terminated_total", &self.sessions_terminated, "Sessions terminated"),
            ("noxrun_sessions_failed_total", &self.sessions_failed, "Sessions failed"),
            ("noxrun_sessions_reaped_total", &self.sessions_reaped, "Sessions reaped by idle/lifetime policy"),
            ("noxrun_sessions_migrated_total", &self.sessions_migrated, "Persistent sessions migrated after eviction"),
            ("noxrun_executions_submitted_total", &self.executions_submitted, "Executions submitted"),
            ("noxrun_executions_completed_total", &self.executions_completed, "Executions completed"),
            ("noxrun_executions_failed_total", &self.executions_failed, "Executions failed"),
            ("noxrun_executions_crashed_total", &self.executions_crashed, "Executions crashed on heartbeat timeout"),
            ("noxrun_executions_retried_total", &self.executions_retried, "Execution retries spawned"),
            ("noxrun_callbacks_deduplicated_total", &self.callbacks_deduplicated, "Result callbacks deduplicated by idempotency key"),
            ("noxrun_placements_warm_total", &self.placements_warm, "Placements served from the warm pool"),
            ("noxrun_placements_affinity_total", &self.placements_affinity, "Placements via template affinity"),
            ("noxrun_placements_load_total", &self.placements_load, "Placements via load balancing"),
            ("noxrun_placements_exhausted_total", &self.placements_exhausted, "Placement requests with no schedulable node"),
        ];

        for (name, counter, help) in counters {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, counter.get()));
        }

        let gauges: &[(&str, &Gauge, &str)] = &[
            ("noxrun_active_sessions", &self.active_sessions, "Sessions in creating or running"),
            ("noxrun_online_nodes", &self.online_nodes, "Runtime nodes currently online"),
        ];
        for (name, gauge, help) in gauges {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} gauge\n{} {}\n", name, help, name, name, gauge.get()));
        }

        out.push_str("# HELP noxrun_warm_pool_size Warm containers per template\n# TYPE noxrun_warm_pool_size gauge\n");
        for (template_id, size) in warm_pool_sizes {
            out.push_str(&format!(
                "noxrun_warm_pool_size{{template=\"{}\"}} {}\n",
                template_id, size
            ));
        }

        self.execution_duration_ms.render("noxrun_execution_duration_ms", &mut out);
        self.scheduling_latency_ms.render("noxrun_scheduling_latency_ms", &mut out);

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let m = Metrics::new();
        m.sessions_created.inc();
        m.sessions_created.add(2);
        assert_eq!(m.sessions_created.get(), 3);
        m.active_sessions.set(7);
        assert_eq!(m.active_sessions.get(), 7);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = Histogram::new(DURATION_BOUNDS_MS);
        h.observe(5);
        h.observe(80);
        h.observe(70000);
        let mut out = String::new();
        h.render("t", &mut out);
        assert!(out.contains("t_bucket{le=\"10\"} 1\n"));
        assert!(out.contains("t_bucket{le=\"100\"} 2\n"));
        assert!(out.contains("t_bucket{le=\"60000\"} 2\n"));
        assert!(out.contains("t_bucket{le=\"+Inf\"} 3\n"));
        assert!(out.contains("t_count 3\n"));
    }

    #[test]
    fn test_render_exposition_shape() {
        let m = Metrics::new();
        m.placements_warm.inc();
        let text = m.render(&[("tmpl_py".to_string(), 4)]);
        assert!(text.contains("# TYPE noxrun_placements_warm_total counter"));
        assert!(text.contains("noxrun_placements_warm_total 1"));
        assert!(text.contains("noxrun_warm_pool_size{template=\"tmpl_py\"} 4"));
        assert!(text.contains("# TYPE noxrun_execution_duration_ms histogram"));
    }
}

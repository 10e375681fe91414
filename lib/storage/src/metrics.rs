//! Minimal metrics registry: a call counter and a latency histogram per remote-function name
//! (SPEC_FULL.md §4.3/§6). No scrape server is started here -- exposing `render()` over HTTP is
//! the out-of-scope HTTP layer's job.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

const LATENCY_BUCKETS_MS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

#[derive(Debug, Default)]
struct FunctionStats {
    calls: u64,
    errors: u64,
    bucket_counts: Vec<u64>,
    sum_ms: f64,
}

impl FunctionStats {
    fn new() -> Self {
        Self { calls: 0, errors: 0, bucket_counts: vec![0; LATENCY_BUCKETS_MS.len() + 1], sum_ms: 0.0 }
    }

    fn observe(&mut self, latency: Duration, ok: bool) {
        self.calls += 1;
        if !ok {
            self.errors += 1;
        }
        let ms = latency.as_secs_f64() * 1000.0;
        self.sum_ms += ms;
        let bucket = LATENCY_BUCKETS_MS.iter().position(|&b| ms <= b).unwrap_or(LATENCY_BUCKETS_MS.len());
        self.bucket_counts[bucket] += 1;
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    functions: Mutex<HashMap<&'static str, FunctionStats>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self { functions: Mutex::new(HashMap::new()) }
    }

    pub fn record(&self, function: &'static str, latency: Duration, ok: bool) {
        self.functions.lock().entry(function).or_insert_with(FunctionStats::new).observe(latency, ok);
    }

    /// Renders the registry as Prometheus text exposition format.
    pub fn render(&self) -> String {
        let functions = self.functions.lock();
        let mut out = String::new();
        out.push_str("# TYPE clusternode_rpc_calls_total counter\n");
        for (name, stats) in functions.iter() {
            out.push_str(&format!("clusternode_rpc_calls_total{{function=\"{name}\"}} {}\n", stats.calls));
        }
        out.push_str("# TYPE clusternode_rpc_errors_total counter\n");
        for (name, stats) in functions.iter() {
            out.push_str(&format!("clusternode_rpc_errors_total{{function=\"{name}\"}} {}\n", stats.errors));
        }
        out.push_str("# TYPE clusternode_rpc_latency_ms histogram\n");
        for (name, stats) in functions.iter() {
            let mut cumulative = 0u64;
            for (i, &bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                cumulative += stats.bucket_counts[i];
                out.push_str(&format!(
                    "clusternode_rpc_latency_ms_bucket{{function=\"{name}\",le=\"{bound}\"}} {cumulative}\n"
                ));
            }
            cumulative += stats.bucket_counts[LATENCY_BUCKETS_MS.len()];
            out.push_str(&format!(
                "clusternode_rpc_latency_ms_bucket{{function=\"{name}\",le=\"+Inf\"}} {cumulative}\n"
            ));
            out.push_str(&format!("clusternode_rpc_latency_ms_sum{{function=\"{name}\"}} {}\n", stats.sum_ms));
            out.push_str(&format!("clusternode_rpc_latency_ms_count{{function=\"{name}\"}} {}\n", stats.calls));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_errors_separately() {
        let metrics = Metrics::new();
        metrics.record("SearchPoints", Duration::from_millis(12), true);
        metrics.record("SearchPoints", Duration::from_millis(900), false);

        let rendered = metrics.render();
        assert!(rendered.contains("clusternode_rpc_calls_total{function=\"SearchPoints\"} 2"));
        assert!(rendered.contains("clusternode_rpc_errors_total{function=\"SearchPoints\"} 1"));
    }
}

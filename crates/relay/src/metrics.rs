use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Route label used for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

#[derive(Debug, Default, Clone, Copy)]
struct RouteStats {
    requests: u64,
    errors: u64,
    latency_ms_sum: u64,
}

/// Process-wide relay counters, rendered in Prometheus text format.
#[derive(Default)]
pub struct RelayMetrics {
    // Keyed by (method, route template) so shard ids never become labels.
    routes: Mutex<BTreeMap<(String, String), RouteStats>>,
    rejected_updates: Mutex<BTreeMap<String, u64>>,
    relayed_updates: AtomicU64,
    rollbacks: AtomicU64,
    data_loss_resets: AtomicU64,
    presence_messages: AtomicU64,
    sync_requests: AtomicU64,
    snapshot_failures: AtomicU64,
    active_rooms: AtomicU64,
    active_connections: AtomicU64,
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, route: &str, status_code: u16, latency_ms: u64) {
        let mut routes = self.routes.lock().expect("metrics lock poisoned");
        let stats = routes.entry((method.to_ascii_uppercase(), route.to_owned())).or_default();
        stats.requests += 1;
        stats.latency_ms_sum = stats.latency_ms_sum.saturating_add(latency_ms);
        if status_code >= 400 {
            stats.errors += 1;
        }
    }

    pub fn record_rejected_update(&self, reason: &str) {
        let mut rejected = self.rejected_updates.lock().expect("metrics lock poisoned");
        *rejected.entry(reason.to_owned()).or_insert(0) += 1;
    }

    pub fn record_relayed_update(&self) {
        self.relayed_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_data_loss_reset(&self) {
        self.data_loss_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presence_message(&self) {
        self.presence_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_request(&self) {
        self.sync_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_rooms(&self, value: usize) {
        self.active_rooms.store(value as u64, Ordering::Relaxed);
    }

    pub fn set_active_connections(&self, value: usize) {
        self.active_connections.store(value as u64, Ordering::Relaxed);
    }

    pub fn rejected_updates(&self, reason: &str) -> u64 {
        let rejected = self.rejected_updates.lock().expect("metrics lock poisoned");
        rejected.get(reason).copied().unwrap_or(0)
    }

    pub fn relayed_updates(&self) -> u64 {
        self.relayed_updates.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn data_loss_resets(&self) -> u64 {
        self.data_loss_resets.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let routes = self.routes.lock().expect("metrics lock poisoned").clone();
        let per_route: [(&str, &str, fn(&RouteStats) -> u64); 3] = [
            ("relay_http_requests_total", "HTTP requests by route.", |s| s.requests),
            ("relay_http_errors_total", "HTTP responses with status >= 400 by route.", |s| {
                s.errors
            }),
            ("relay_http_latency_ms_sum", "Summed HTTP latency in milliseconds by route.", |s| {
                s.latency_ms_sum
            }),
        ];
        for (name, help, value_of) in per_route {
            write_header(&mut out, name, "counter", help);
            for ((method, route), stats) in &routes {
                let _ = writeln!(
                    out,
                    "{name}{{method=\"{}\",route=\"{}\"}} {}",
                    escape_label(method),
                    escape_label(route),
                    value_of(stats)
                );
            }
        }

        write_header(
            &mut out,
            "relay_rejected_updates_total",
            "counter",
            "Binary frames refused before apply, by reason.",
        );
        for (reason, count) in self.rejected_updates.lock().expect("metrics lock poisoned").iter() {
            let _ = writeln!(
                out,
                "relay_rejected_updates_total{{reason=\"{}\"}} {count}",
                escape_label(reason)
            );
        }

        let scalars = [
            ("relay_relayed_updates_total", "counter", "Updates forwarded to room peers.", &self.relayed_updates),
            ("relay_rollbacks_total", "counter", "Updates rolled back after a failed apply.", &self.rollbacks),
            ("relay_data_loss_resets_total", "counter", "Rooms reset after a failed rollback.", &self.data_loss_resets),
            ("relay_presence_messages_total", "counter", "Presence messages relayed.", &self.presence_messages),
            ("relay_sync_requests_total", "counter", "Sync requests answered with full state.", &self.sync_requests),
            ("relay_snapshot_failures_total", "counter", "Snapshot load or save failures.", &self.snapshot_failures),
            ("relay_active_rooms", "gauge", "Rooms with at least one member.", &self.active_rooms),
            ("relay_active_connections", "gauge", "Open websocket connections.", &self.active_connections),
        ];
        for (name, kind, help, value) in scalars {
            write_header(&mut out, name, kind, help);
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }

        out
    }
}

fn write_header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_route_and_room_counters() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("get", "/healthz", 200, 3);
        metrics.record_http_request("GET", "/v1/shards/{shard_id}/ws", 400, 5);
        metrics.record_http_request("GET", "/v1/shards/{shard_id}/ws", 101, 2);
        metrics.record_rejected_update("too_short");
        metrics.record_rejected_update("too_short");
        metrics.record_rejected_update("text_contamination");
        metrics.record_relayed_update();
        metrics.record_rollback();
        metrics.record_data_loss_reset();
        metrics.record_presence_message();
        metrics.record_sync_request();
        metrics.set_active_rooms(2);
        metrics.set_active_connections(5);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains("relay_http_requests_total{method=\"GET\",route=\"/healthz\"} 1"));
        assert!(rendered
            .contains("relay_http_requests_total{method=\"GET\",route=\"/v1/shards/{shard_id}/ws\"} 2"));
        assert!(rendered
            .contains("relay_http_errors_total{method=\"GET\",route=\"/v1/shards/{shard_id}/ws\"} 1"));
        assert!(rendered
            .contains("relay_http_latency_ms_sum{method=\"GET\",route=\"/v1/shards/{shard_id}/ws\"} 7"));
        assert!(rendered.contains("relay_rejected_updates_total{reason=\"too_short\"} 2"));
        assert!(rendered.contains("relay_rejected_updates_total{reason=\"text_contamination\"} 1"));
        assert!(rendered.contains("relay_relayed_updates_total 1"));
        assert!(rendered.contains("relay_rollbacks_total 1"));
        assert!(rendered.contains("relay_data_loss_resets_total 1"));
        assert!(rendered.contains("relay_presence_messages_total 1"));
        assert!(rendered.contains("relay_sync_requests_total 1"));
        assert!(rendered.contains("# TYPE relay_active_rooms gauge"));
        assert!(rendered.contains("relay_active_rooms 2"));
        assert!(rendered.contains("relay_active_connections 5"));
        assert_eq!(metrics.rejected_updates("too_short"), 2);
        assert_eq!(metrics.rejected_updates("oversized"), 0);
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}

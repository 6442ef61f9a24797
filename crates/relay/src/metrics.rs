use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use globechat_common::protocol::ws::NotificationKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_connections_opened_total: AtomicU64,
    ws_connections_active: AtomicI64,
    ws_connections_closed_total: Mutex<HashMap<String, u64>>,
    ws_control_frames_total: Mutex<HashMap<String, u64>>,
    notifications_total: Mutex<HashMap<String, u64>>,
    notification_deliveries_total: AtomicU64,
    notification_evictions_total: AtomicU64,
    expired_threads_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<RelayMetrics> = OnceLock::new();

/// Process-wide registry, created on first use.
pub fn global() -> &'static RelayMetrics {
    GLOBAL_METRICS.get_or_init(RelayMetrics::default)
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    global().record_http_request(method, path, status_code, latency_ms);
}

pub fn record_connection_opened() {
    global().record_connection_opened();
}

pub fn record_connection_closed(reason: &str) {
    global().record_connection_closed(reason);
}

pub fn record_control_frame(frame_type: &str) {
    global().record_control_frame(frame_type);
}

pub fn record_notification(kind: NotificationKind, delivered: u64, evicted: u64) {
    global().record_notification(kind, delivered, evicted);
}

pub fn record_expired_threads(count: u64) {
    global().expired_threads_total.fetch_add(count, Ordering::Relaxed);
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_connection_opened(&self) {
        self.ws_connections_opened_total.fetch_add(1, Ordering::Relaxed);
        self.ws_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self, reason: &str) {
        self.ws_connections_active.fetch_sub(1, Ordering::Relaxed);
        increment_counter(&self.ws_connections_closed_total, &normalize_label(reason), 1);
    }

    pub fn record_control_frame(&self, frame_type: &str) {
        increment_counter(&self.ws_control_frames_total, &normalize_label(frame_type), 1);
    }

    pub fn record_notification(&self, kind: NotificationKind, delivered: u64, evicted: u64) {
        increment_counter(&self.notifications_total, &kind.as_str().to_string(), 1);
        self.notification_deliveries_total.fetch_add(delivered, Ordering::Relaxed);
        self.notification_evictions_total.fetch_add(evicted, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_endpoint_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_endpoint_lines(
            &mut output,
            "relay_request_errors_total",
            &self.request_errors_total,
        );

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_endpoint_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_endpoint_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP ws_connections_opened_total Total accepted WebSocket connections.\n");
        output.push_str("# TYPE ws_connections_opened_total counter\n");
        output.push_str(&format!(
            "ws_connections_opened_total {}\n",
            self.ws_connections_opened_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP ws_connections_active Currently open WebSocket connections.\n");
        output.push_str("# TYPE ws_connections_active gauge\n");
        output.push_str(&format!(
            "ws_connections_active {}\n",
            self.ws_connections_active.load(Ordering::Relaxed).max(0)
        ));

        output.push_str(
            "# HELP ws_connections_closed_total Closed WebSocket connections by reason.\n",
        );
        output.push_str("# TYPE ws_connections_closed_total counter\n");
        append_label_lines(
            &mut output,
            "ws_connections_closed_total",
            "reason",
            &self.ws_connections_closed_total,
        );

        output.push_str("# HELP ws_control_frames_total Client control frames applied by type.\n");
        output.push_str("# TYPE ws_control_frames_total counter\n");
        append_label_lines(
            &mut output,
            "ws_control_frames_total",
            "type",
            &self.ws_control_frames_total,
        );

        output.push_str("# HELP notifications_total Room notifications dispatched by type.\n");
        output.push_str("# TYPE notifications_total counter\n");
        append_label_lines(&mut output, "notifications_total", "type", &self.notifications_total);

        output.push_str(
            "# HELP notification_deliveries_total Frames queued to room members.\n",
        );
        output.push_str("# TYPE notification_deliveries_total counter\n");
        output.push_str(&format!(
            "notification_deliveries_total {}\n",
            self.notification_deliveries_total.load(Ordering::Relaxed)
        ));

        output.push_str(
            "# HELP notification_evictions_total Members removed from a room after a failed delivery.\n",
        );
        output.push_str("# TYPE notification_evictions_total counter\n");
        output.push_str(&format!(
            "notification_evictions_total {}\n",
            self.notification_evictions_total.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP expired_threads_total Threads removed by the expiry sweep.\n");
        output.push_str("# TYPE expired_threads_total counter\n");
        output.push_str(&format!(
            "expired_threads_total {}\n",
            self.expired_threads_total.load(Ordering::Relaxed)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    let normalized_segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.chars().all(|character| character.is_ascii_digit()) {
                "{number}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>();

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment_counter<K>(map: &Mutex<HashMap<K, u64>>, key: &K, delta: u64)
where
    K: Clone + Eq + std::hash::Hash,
{
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_endpoint_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use globechat_common::protocol::ws::NotificationKind;

    use super::{normalize_endpoint, RelayMetrics};

    #[test]
    fn render_prometheus_includes_http_and_room_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("get", "/v1/threads/123/messages", 200, 15);
        metrics.record_http_request("GET", "/v1/threads/123/messages", 404, 25);
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed("normal");
        metrics.record_control_frame("join");
        metrics.record_control_frame("join");
        metrics.record_control_frame("leave");
        metrics.record_notification(NotificationKind::NewMessage, 3, 1);
        metrics.record_notification(NotificationKind::DeleteThread, 0, 0);

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains(
            "relay_request_rate_total{method=\"GET\",endpoint=\"/v1/threads/{number}/messages\"} 2"
        ));
        assert!(rendered.contains(
            "relay_request_errors_total{method=\"GET\",endpoint=\"/v1/threads/{number}/messages\"} 1"
        ));
        assert!(rendered.contains("ws_connections_opened_total 2"));
        assert!(rendered.contains("ws_connections_active 1"));
        assert!(rendered.contains("ws_connections_closed_total{reason=\"normal\"} 1"));
        assert!(rendered.contains("ws_control_frames_total{type=\"join\"} 2"));
        assert!(rendered.contains("ws_control_frames_total{type=\"leave\"} 1"));
        assert!(rendered.contains("notifications_total{type=\"new-message\"} 1"));
        assert!(rendered.contains("notifications_total{type=\"delete-thread\"} 1"));
        assert!(rendered.contains("notification_deliveries_total 3"));
        assert!(rendered.contains("notification_evictions_total 1"));
        assert!(rendered.contains("expired_threads_total 0"));
    }

    #[test]
    fn endpoint_ids_are_collapsed() {
        assert_eq!(normalize_endpoint(""), "/");
        assert_eq!(normalize_endpoint("/"), "/");
        assert_eq!(normalize_endpoint("/v1/messages/42"), "/v1/messages/{number}");
        assert_eq!(normalize_endpoint("/v1/ws"), "/v1/ws");
    }

    #[test]
    fn blank_labels_are_reported_as_unknown() {
        let metrics = RelayMetrics::default();
        metrics.record_control_frame("  ");
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("ws_control_frames_total{type=\"unknown\"} 1"));
    }
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_messages_total: Mutex<HashMap<String, u64>>,
    rooms_active: AtomicI64,
    connections_active: AtomicI64,
    decode_errors_total: AtomicU64,
    merge_errors_total: AtomicU64,
    broadcasts_delivered_total: AtomicU64,
    broadcasts_dropped_total: AtomicU64,
}

const MESSAGE_KINDS: [&str; 4] = ["sync_request", "sync_response", "sync_update", "awareness"];
const KNOWN_ENDPOINTS: [&str; 3] = ["/", "/healthz", "/metrics"];
const DOCUMENT_ENDPOINT_LABEL: &str = "/{document}";
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut ws_messages_total = HashMap::new();
        for kind in MESSAGE_KINDS {
            ws_messages_total.insert(kind.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_messages_total: Mutex::new(ws_messages_total),
            rooms_active: AtomicI64::new(0),
            connections_active: AtomicI64::new(0),
            decode_errors_total: AtomicU64::new(0),
            merge_errors_total: AtomicU64::new(0),
            broadcasts_delivered_total: AtomicU64::new(0),
            broadcasts_dropped_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_message(kind: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(kind);
    }
}

pub fn increment_decode_errors() {
    if let Some(metrics) = global_metrics() {
        metrics.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn increment_merge_errors() {
    if let Some(metrics) = global_metrics() {
        metrics.merge_errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_broadcast(delivered: u64, dropped: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_broadcast(delivered, dropped);
    }
}

pub fn room_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.rooms_active.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn room_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.rooms_active.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_active.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
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

    pub fn record_ws_message(&self, kind: &str) {
        let mut guard = self.ws_messages_total.lock().expect("metrics map lock poisoned");
        let value = guard.entry(normalize_message_kind(kind)).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn record_broadcast(&self, delivered: u64, dropped: u64) {
        self.broadcasts_delivered_total.fetch_add(delivered, Ordering::Relaxed);
        self.broadcasts_dropped_total.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_messages_total Decoded websocket protocol messages by kind.\n");
        output.push_str("# TYPE relay_ws_messages_total counter\n");
        append_message_kind_lines(&mut output, &self.ws_messages_total);

        append_gauge(
            &mut output,
            "relay_rooms_active",
            "Rooms with at least one live connection.",
            self.rooms_active.load(Ordering::Relaxed).max(0),
        );
        append_gauge(
            &mut output,
            "relay_connections_active",
            "Open websocket connections.",
            self.connections_active.load(Ordering::Relaxed).max(0),
        );
        append_counter(
            &mut output,
            "relay_decode_errors_total",
            "Frames discarded because a message failed to decode.",
            self.decode_errors_total.load(Ordering::Relaxed),
        );
        append_counter(
            &mut output,
            "relay_merge_errors_total",
            "Updates rejected by the document.",
            self.merge_errors_total.load(Ordering::Relaxed),
        );
        append_counter(
            &mut output,
            "relay_broadcasts_delivered_total",
            "Broadcast frames queued for a connection.",
            self.broadcasts_delivered_total.load(Ordering::Relaxed),
        );
        append_counter(
            &mut output,
            "relay_broadcasts_dropped_total",
            "Broadcast frames dropped for slow or closed connections.",
            self.broadcasts_dropped_total.load(Ordering::Relaxed),
        );

        output
    }
}

// Document ids are unbounded; collapse them so label cardinality stays fixed.
fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    if KNOWN_ENDPOINTS.contains(&path) {
        path.to_string()
    } else {
        DOCUMENT_ENDPOINT_LABEL.to_string()
    }
}

fn normalize_message_kind(kind: &str) -> String {
    let normalized = kind.trim().to_ascii_lowercase();
    if MESSAGE_KINDS.contains(&normalized.as_str()) {
        normalized
    } else {
        "unknown".to_string()
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
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

fn append_message_kind_lines(output: &mut String, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_kind, _), (right_kind, _)| left_kind.cmp(right_kind));

    for (kind, value) in entries {
        output.push_str(&format!(
            "relay_ws_messages_total{{kind=\"{}\"}} {value}\n",
            escape_label_value(kind),
        ));
    }
}

fn append_gauge(output: &mut String, metric_name: &str, help: &str, value: i64) {
    output.push_str(&format!("# HELP {metric_name} {help}\n# TYPE {metric_name} gauge\n"));
    output.push_str(&format!("{metric_name} {value}\n"));
}

fn append_counter(output: &mut String, metric_name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {metric_name} {help}\n# TYPE {metric_name} counter\n"));
    output.push_str(&format!("{metric_name} {value}\n"));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct ChatMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    ws_connections_active: AtomicI64,
    rooms_active: AtomicI64,
    rooms_spawned_total: AtomicU64,
    rooms_evicted_total: AtomicU64,
    rooms_crashed_total: AtomicU64,
    fanout_dropped_total: AtomicU64,
    sequence_gap_count: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<ChatMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<ChatMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<ChatMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn ws_connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.ws_connections_active.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn ws_connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.ws_connections_active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn room_spawned() {
    if let Some(metrics) = global_metrics() {
        metrics.room_spawned();
    }
}

pub fn room_evicted() {
    if let Some(metrics) = global_metrics() {
        metrics.room_evicted();
    }
}

pub fn room_crashed() {
    if let Some(metrics) = global_metrics() {
        metrics.room_crashed();
    }
}

pub fn increment_fanout_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.fanout_dropped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_sequence_gap_count() {
    if let Some(metrics) = global_metrics() {
        metrics.sequence_gap_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl ChatMetrics {
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

    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        let normalized_endpoint = normalize_ws_endpoint(endpoint);
        increment_label_counter(&self.ws_rate_total, &normalized_endpoint, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized_endpoint, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized_endpoint, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized_endpoint, 1);
        }
    }

    pub fn room_spawned(&self) {
        self.rooms_spawned_total.fetch_add(1, Ordering::SeqCst);
        self.rooms_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn room_evicted(&self) {
        self.rooms_evicted_total.fetch_add(1, Ordering::SeqCst);
        self.rooms_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn room_crashed(&self) {
        self.rooms_crashed_total.fetch_add(1, Ordering::SeqCst);
        self.rooms_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP chat_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE chat_request_rate_total counter\n");
        append_counter_lines(&mut output, "chat_request_rate_total", &self.request_rate_total);

        output.push_str("# HELP chat_request_errors_total Total HTTP error responses by endpoint.\n");
        output.push_str("# TYPE chat_request_errors_total counter\n");
        append_counter_lines(&mut output, "chat_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP chat_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE chat_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "chat_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP chat_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE chat_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "chat_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP chat_ws_rate_total Total websocket actions by frame type.\n");
        output.push_str("# TYPE chat_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "chat_ws_rate_total", &self.ws_rate_total);

        output.push_str("# HELP chat_ws_errors_total Total failed websocket actions by frame type.\n");
        output.push_str("# TYPE chat_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "chat_ws_errors_total", &self.ws_errors_total);

        output.push_str("# HELP chat_ws_duration_ms_sum Sum of websocket action latency in milliseconds by frame type.\n");
        output.push_str("# TYPE chat_ws_duration_ms_sum counter\n");
        append_label_counter_lines(&mut output, "chat_ws_duration_ms_sum", &self.ws_duration_sum_ms);

        output.push_str("# HELP chat_ws_duration_ms_count Count of websocket latency samples by frame type.\n");
        output.push_str("# TYPE chat_ws_duration_ms_count counter\n");
        append_label_counter_lines(&mut output, "chat_ws_duration_ms_count", &self.ws_duration_count);

        append_gauge(
            &mut output,
            "chat_ws_connections_active",
            "Open websocket connections.",
            self.ws_connections_active.load(Ordering::SeqCst),
        );
        append_gauge(
            &mut output,
            "chat_rooms_active",
            "Rooms with a live actor.",
            self.rooms_active.load(Ordering::SeqCst).max(0),
        );
        append_counter(
            &mut output,
            "chat_rooms_spawned_total",
            "Room actors started.",
            self.rooms_spawned_total.load(Ordering::SeqCst),
        );
        append_counter(
            &mut output,
            "chat_rooms_evicted_total",
            "Room actors evicted after their grace period.",
            self.rooms_evicted_total.load(Ordering::SeqCst),
        );
        append_counter(
            &mut output,
            "chat_rooms_crashed_total",
            "Room actors that ended unexpectedly.",
            self.rooms_crashed_total.load(Ordering::SeqCst),
        );
        append_counter(
            &mut output,
            "chat_fanout_dropped_total",
            "Room events dropped for a recipient whose queue was full.",
            self.fanout_dropped_total.load(Ordering::SeqCst),
        );
        append_counter(
            &mut output,
            "sequence_gap_count",
            "Total detected sequence gaps.",
            self.sequence_gap_count.load(Ordering::SeqCst),
        );

        output
    }
}

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_ws_endpoint(endpoint: &str) -> String {
    let normalized = endpoint.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = lock(map);
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
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

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{endpoint=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_gauge(output: &mut String, name: &str, help: &str, value: i64) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
}

fn append_counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

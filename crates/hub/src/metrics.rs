use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct HubMetrics {
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    active_connections: AtomicI64,
    open_rooms: AtomicI64,
    notifications_dispatched_total: AtomicU64,
    notifications_delivered_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<HubMetrics>> = OnceLock::new();

impl Default for HubMetrics {
    fn default() -> Self {
        Self {
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            active_connections: AtomicI64::new(0),
            open_rooms: AtomicI64::new(0),
            notifications_dispatched_total: AtomicU64::new(0),
            notifications_delivered_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<HubMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<HubMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_event(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_event(event, is_error, latency_ms);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_opened();
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.connection_closed();
    }
}

pub fn set_open_rooms(count: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.set_open_rooms(count);
    }
}

pub fn record_notification_dispatch(delivered: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_notification_dispatch(delivered);
    }
}

impl HubMetrics {
    pub fn record_ws_event(&self, event: &str, is_error: bool, latency_ms: u64) {
        let label = normalize_event_label(event);
        increment_label_counter(&self.ws_rate_total, &label, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &label, latency_ms);
        increment_label_counter(&self.ws_duration_count, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_open_rooms(&self, count: i64) {
        self.open_rooms.store(count.max(0), Ordering::SeqCst);
    }

    pub fn record_notification_dispatch(&self, delivered: u64) {
        self.notifications_dispatched_total.fetch_add(1, Ordering::SeqCst);
        self.notifications_delivered_total.fetch_add(delivered, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP hub_ws_rate_total Total websocket events by type.\n");
        output.push_str("# TYPE hub_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "hub_ws_rate_total", &self.ws_rate_total);

        output.push_str("# HELP hub_ws_errors_total Total websocket event errors by type.\n");
        output.push_str("# TYPE hub_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "hub_ws_errors_total", &self.ws_errors_total);

        output.push_str(
            "# HELP hub_ws_duration_ms_sum Sum of websocket event latency in milliseconds by type.\n",
        );
        output.push_str("# TYPE hub_ws_duration_ms_sum counter\n");
        append_label_counter_lines(&mut output, "hub_ws_duration_ms_sum", &self.ws_duration_sum_ms);

        output.push_str(
            "# HELP hub_ws_duration_ms_count Count of websocket latency samples by type.\n",
        );
        output.push_str("# TYPE hub_ws_duration_ms_count counter\n");
        append_label_counter_lines(&mut output, "hub_ws_duration_ms_count", &self.ws_duration_count);

        output.push_str("# HELP hub_active_connections Currently connected websocket peers.\n");
        output.push_str("# TYPE hub_active_connections gauge\n");
        output.push_str(&format!(
            "hub_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP hub_open_rooms Document rooms with at least one member.\n");
        output.push_str("# TYPE hub_open_rooms gauge\n");
        output.push_str(&format!("hub_open_rooms {}\n", self.open_rooms.load(Ordering::SeqCst)));

        output.push_str(
            "# HELP hub_notifications_dispatched_total Dispatch calls accepted (including zero-recipient no-ops).\n",
        );
        output.push_str("# TYPE hub_notifications_dispatched_total counter\n");
        output.push_str(&format!(
            "hub_notifications_dispatched_total {}\n",
            self.notifications_dispatched_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP hub_notifications_delivered_total Notification events delivered to connections.\n",
        );
        output.push_str("# TYPE hub_notifications_delivered_total counter\n");
        output.push_str(&format!(
            "hub_notifications_delivered_total {}\n",
            self.notifications_delivered_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_event_label(event: &str) -> String {
    let normalized = event.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    if guard.is_empty() {
        return;
    }

    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{event=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

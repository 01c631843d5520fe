// planner-assistant/crates/planner-assistant/src/metrics.rs

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static TURN_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static TOOL_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static TURN_DURATION: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let turns = TURN_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("chat_turns_total", "Completed chat turns by outcome"),
            &["outcome"],
        )
        .expect("static metric definition")
    });

    let tools = TOOL_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("tool_calls_total", "Tool calls by tool and status"),
            &["tool", "status"],
        )
        .expect("static metric definition")
    });

    let sessions = ACTIVE_SESSIONS.get_or_init(|| {
        IntGauge::new("active_chat_sessions", "Open chat WebSocket connections")
            .expect("static metric definition")
    });

    let duration = TURN_DURATION.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "chat_turn_duration_seconds",
            "Wall time of a chat turn from user message to terminal event",
        ))
        .expect("static metric definition")
    });

    REGISTRY.register(Box::new(turns.clone())).ok();
    REGISTRY.register(Box::new(tools.clone())).ok();
    REGISTRY.register(Box::new(sessions.clone())).ok();
    REGISTRY.register(Box::new(duration.clone())).ok();
}

pub fn inc_turn(outcome: &str) {
    if let Some(counter) = TURN_COUNTER.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_tool_call(tool: &str, success: bool) {
    if let Some(counter) = TOOL_COUNTER.get() {
        let status = if success { "ok" } else { "failed" };
        counter.with_label_values(&[tool, status]).inc();
    }
}

pub fn inc_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.inc();
    }
}

pub fn dec_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.dec();
    }
}

pub fn observe_turn_duration(seconds: f64) {
    if let Some(histogram) = TURN_DURATION.get() {
        histogram.observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

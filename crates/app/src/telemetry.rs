//! Prometheus metrics
//!
//! The exporter serves `/metrics` on its own listener. [`MetricsBridge`]
//! turns bus traffic into counters; without an installed recorder the
//! `metrics` macros are no-ops, so the bridge is always attached.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use avatar_core::{AppEvent, EventBus, Subscription};

use crate::AppError;

/// Listener address of the installed exporter
static METRICS_ADDR: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder and its HTTP listener
///
/// Must be called from within a Tokio runtime. A second call is a no-op.
pub fn init_metrics(port: u16) -> Result<SocketAddr, AppError> {
    if let Some(addr) = METRICS_ADDR.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AppError::Metrics(e.to_string()))?;

    register_default_metrics();
    Ok(*METRICS_ADDR.get_or_init(|| addr))
}

pub fn metrics_address() -> Option<SocketAddr> {
    METRICS_ADDR.get().copied()
}

/// Register every series at zero so dashboards see them before traffic
pub fn register_default_metrics() {
    gauge!("avatar_speaking").set(0.0);
    gauge!("avatar_connected").set(0.0);

    for backend in ["catalog", "cloud", "local"] {
        counter!("avatar_speech_total", "backend" => backend).absolute(0);
        counter!("avatar_speech_errors_total", "backend" => backend).absolute(0);
    }
    counter!("avatar_tts_fallback_total").absolute(0);

    for event in ["connected", "disconnected", "error", "max_reconnects"] {
        counter!("avatar_ws_events_total", "event" => event).absolute(0);
    }
    for event in ["start", "end"] {
        counter!("avatar_presentation_total", "event" => event).absolute(0);
    }
    counter!("avatar_speak_ignored_total").absolute(0);
}

pub fn record_presentation(event: &'static str) {
    counter!("avatar_presentation_total", "event" => event).increment(1);
}

pub fn record_speak_ignored() {
    counter!("avatar_speak_ignored_total").increment(1);
}

/// Bus subscriptions that feed the metrics recorder
pub struct MetricsBridge {
    subscriptions: Vec<Subscription>,
    started: Arc<Mutex<HashMap<u64, Instant>>>,
}

impl MetricsBridge {
    pub fn attach(bus: &EventBus) -> Self {
        let started: Arc<Mutex<HashMap<u64, Instant>>> = Arc::default();
        let mut subscriptions = Vec::new();

        let pending = started.clone();
        subscriptions.push(bus.on(AppEvent::SPEECH_START, move |event| {
            if let AppEvent::SpeechStart { generation, .. } = event {
                pending.lock().insert(*generation, Instant::now());
                gauge!("avatar_speaking").set(1.0);
            }
        }));

        let pending = started.clone();
        subscriptions.push(bus.on(AppEvent::SPEECH_END, move |event| {
            if let AppEvent::SpeechEnd {
                generation,
                backend,
            } = event
            {
                counter!("avatar_speech_total", "backend" => backend.as_str()).increment(1);
                if let Some(at) = pending.lock().remove(generation) {
                    histogram!("avatar_speech_duration_seconds", "backend" => backend.as_str())
                        .record(at.elapsed().as_secs_f64());
                }
                gauge!("avatar_speaking").set(0.0);
            }
        }));

        let pending = started.clone();
        subscriptions.push(bus.on(AppEvent::SPEECH_ERROR, move |event| {
            if let AppEvent::SpeechError {
                generation,
                backend,
                ..
            } = event
            {
                counter!("avatar_speech_errors_total", "backend" => backend.as_str())
                    .increment(1);
                pending.lock().remove(generation);
            }
        }));

        subscriptions.push(bus.on(AppEvent::SPEECH_FALLBACK, |_| {
            counter!("avatar_tts_fallback_total").increment(1);
        }));

        subscriptions.push(bus.on(AppEvent::WS_CONNECTED, |_| {
            counter!("avatar_ws_events_total", "event" => "connected").increment(1);
            gauge!("avatar_connected").set(1.0);
        }));
        subscriptions.push(bus.on(AppEvent::WS_DISCONNECTED, |_| {
            counter!("avatar_ws_events_total", "event" => "disconnected").increment(1);
            gauge!("avatar_connected").set(0.0);
        }));
        subscriptions.push(bus.on(AppEvent::WS_ERROR, |_| {
            counter!("avatar_ws_events_total", "event" => "error").increment(1);
        }));
        subscriptions.push(bus.on(AppEvent::WS_MAX_RECONNECTS, |_| {
            counter!("avatar_ws_events_total", "event" => "max_reconnects").increment(1);
        }));

        Self {
            subscriptions,
            started,
        }
    }

    /// Speech requests that started but have not ended or failed
    pub fn in_flight(&self) -> usize {
        self.started.lock().len()
    }

    pub fn detach(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.started.lock().clear();
    }
}

impl Drop for MetricsBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

//! Prometheus metrics for the register poller.
//!
//! This module provides metrics for poll cycles, register values,
//! writes and bridge clients.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use regpoll_core::{CycleOutcome, RegisterKey, WriteEvent};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Cycle Metrics
// ============================================================================

/// Completed poll cycles by outcome
pub static CYCLES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("regpoll_cycles_total", "Completed poll cycles by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Register values served stale (cache or reused snapshot)
pub static STALE_READS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "regpoll_stale_reads_total",
        "Register values served from cache instead of a fresh read",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Current outcome (0=none,1=success,2=partial,3=failed)
pub static OUTCOME_STATE: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "regpoll_outcome_state",
        "Current outcome (0=none,1=success,2=partial,3=failed)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Register Metrics
// ============================================================================

/// Last published value per register
pub static REGISTER_VALUE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("regpoll_register_value", "Last published raw register value"),
        &["register"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Whether a register's published value is stale (1) or fresh (0)
pub static REGISTER_STALE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "regpoll_register_stale",
            "Register value is stale (1) or fresh (0)",
        ),
        &["register"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Write and Bridge Metrics
// ============================================================================

/// Write attempts by result
pub static WRITES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("regpoll_writes_total", "Register write attempts by result"),
        &["result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Connected bridge clients
pub static BRIDGE_CLIENTS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("regpoll_bridge_clients", "Connected bridge clients").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Update outcome-derived metrics after a cycle.
pub fn record_outcome(outcome: &CycleOutcome, registers: &[RegisterKey]) {
    CYCLES.with_label_values(&[outcome.status()]).inc();
    let state = match outcome {
        CycleOutcome::Success { .. } => 1,
        CycleOutcome::Partial { stale, .. } => {
            STALE_READS.inc_by(stale.len() as u64);
            2
        }
        CycleOutcome::Failed(_) => 3,
    };
    OUTCOME_STATE.set(state);

    if let Some(snapshot) = outcome.snapshot() {
        for (key, value) in snapshot.iter() {
            let label = key.to_string();
            REGISTER_VALUE
                .with_label_values(&[label.as_str()])
                .set(i64::from(value));
        }
    }
    for key in registers {
        let label = key.to_string();
        REGISTER_STALE
            .with_label_values(&[label.as_str()])
            .set(i64::from(outcome.is_stale(*key)));
    }
}

pub fn record_write(event: &WriteEvent) {
    let result = if event.result.is_ok() { "ok" } else { "error" };
    WRITES.with_label_values(&[result]).inc();
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let path = request.url().to_string();

            match path.as_str() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once consumers have data to show
                    let state = OUTCOME_STATE.get();
                    if state == 1 || state == 2 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    LazyLock::force(&CYCLES);
    let _ = STALE_READS.get();
    let _ = OUTCOME_STATE.get();
    LazyLock::force(&REGISTER_VALUE);
    LazyLock::force(&REGISTER_STALE);
    LazyLock::force(&WRITES);
    let _ = BRIDGE_CLIENTS.get();
}

#[cfg(test)]
mod tests {
    use super::*;
    use regpoll_core::Snapshot;
    use std::collections::BTreeSet;

    #[test]
    fn partial_outcome_marks_stale_registers() {
        let snapshot: Snapshot = [(7001, 12), (7002, 55)].into_iter().collect();
        let outcome = CycleOutcome::Partial {
            snapshot,
            stale: BTreeSet::from([7002]),
        };
        let before = STALE_READS.get();

        record_outcome(&outcome, &[7001, 7002]);

        assert_eq!(STALE_READS.get(), before + 1);
        assert_eq!(REGISTER_VALUE.with_label_values(&["7002"]).get(), 55);
        assert_eq!(REGISTER_STALE.with_label_values(&["7001"]).get(), 0);
        assert_eq!(REGISTER_STALE.with_label_values(&["7002"]).get(), 1);
    }
}

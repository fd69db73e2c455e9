use regpoll_core::{Coordinator, Transport};
use regpoll_io::metrics::{init_metrics, record_outcome, record_write, serve_metrics};
use std::thread;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Follows completed cycles and write attempts and mirrors them into metrics.
pub fn spawn_metrics_updater<T: Transport>(
    coordinator: &Coordinator<T>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let registers = coordinator.registers().to_vec();
    let mut outcomes = coordinator.subscribe();
    let mut writes = coordinator.write_events();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = outcomes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(outcome) = outcomes.borrow_and_update().as_ref() {
                        record_outcome(outcome, &registers);
                    }
                }
                event = writes.recv() => match event {
                    Ok(event) => record_write(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Metrics updater lagged behind write events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Metrics updater stopped");
    })
}

use crate::cycle::{CycleEngine, CycleStats};
use crate::register::CycleOutcome;
use crate::transport::Transport;
use futures::FutureExt;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    OnDemand,
}

/// Requests an out-of-band cycle. Requests made while a cycle is running
/// collapse into a single follow-up cycle.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    notify: Arc<Notify>,
}

impl RefreshHandle {
    pub fn request(&self) {
        self.notify.notify_one();
    }
}

/// Drives the cycle engine on a fixed interval plus on-demand triggers.
///
/// The engine is owned by the single task running [`Scheduler::run`], so two
/// cycles can never overlap.
pub struct Scheduler<T: Transport> {
    engine: CycleEngine<T>,
    interval: Duration,
    reset_interval_on_refresh: bool,
    refresh: Arc<Notify>,
    outcomes: watch::Sender<Option<CycleOutcome>>,
    shutdown: CancellationToken,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(engine: CycleEngine<T>, interval: Duration, reset_interval_on_refresh: bool) -> Self {
        let (outcomes, _) = watch::channel(None);
        Self {
            engine,
            interval,
            reset_interval_on_refresh,
            refresh: Arc::new(Notify::new()),
            outcomes,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn refresh_handle(&self) -> RefreshHandle {
        RefreshHandle {
            notify: Arc::clone(&self.refresh),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CycleOutcome>> {
        self.outcomes.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until the shutdown token fires. An in-flight cycle always
    /// finishes first.
    pub async fn run(mut self) -> CycleStats {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut on_demand_cycles = 0u64;

        loop {
            let mut trigger = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => Trigger::Interval,
                _ = self.refresh.notified() => Trigger::OnDemand,
            };

            // Fold whatever else is already pending into this cycle.
            match trigger {
                Trigger::Interval => {
                    if self.refresh.notified().now_or_never().is_some() {
                        trigger = Trigger::OnDemand;
                    }
                }
                Trigger::OnDemand => {
                    let _ = ticker.tick().now_or_never();
                }
            }

            debug!("starting {:?} poll cycle", trigger);
            let outcome = self.engine.run_cycle().await;
            self.outcomes.send_replace(Some(outcome));

            if trigger == Trigger::OnDemand {
                on_demand_cycles += 1;
                if self.reset_interval_on_refresh {
                    ticker.reset();
                }
            }
        }

        let mut stats = self.engine.stats().clone();
        stats.on_demand_cycles = on_demand_cycles;
        info!(
            "scheduler stopped after {} cycles ({} on demand)",
            stats.cycles_executed, stats.on_demand_cycles
        );
        stats
    }
}

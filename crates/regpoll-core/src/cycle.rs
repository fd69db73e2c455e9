//! Poll cycle engine.
//!
//! One cycle walks `Idle -> Connecting -> Reading -> Idle` and resolves to a
//! [`CycleOutcome`]:
//!
//! - connect fails: reuse the last good snapshot as `Partial`, else `Failed`
//! - a read fails and the cache has the key: serve the cached value, keep going
//! - a read fails and the cache lacks the key: abort, resolve as a connect failure
//!
//! The session is released before the outcome is produced on every path.

use crate::cache::Cache;
use crate::error::{CycleFailed, ReadError};
use crate::reader::RegisterReader;
use crate::register::{CycleOutcome, RegisterKey, RegisterValue, Snapshot};
use crate::session::ConnectionManager;
use crate::transport::Transport;
use log::{debug, error, warn};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Connecting,
    Reading,
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles_executed: u64,
    pub successes: u64,
    pub partials: u64,
    pub failures: u64,
    /// Register values served from cache or a reused snapshot.
    pub stale_reads: u64,
    pub on_demand_cycles: u64,
}

pub struct CycleEngine<T: Transport> {
    connections: Arc<ConnectionManager<T>>,
    reader: RegisterReader,
    registers: Vec<RegisterKey>,
    cache: Cache,
    last_good: Option<Snapshot>,
    state: CycleState,
    stats: CycleStats,
}

impl<T: Transport> CycleEngine<T> {
    pub fn new(
        connections: Arc<ConnectionManager<T>>,
        reader: RegisterReader,
        registers: Vec<RegisterKey>,
    ) -> Self {
        Self {
            connections,
            reader,
            registers,
            cache: Cache::new(),
            last_good: None,
            state: CycleState::Idle,
            stats: CycleStats::default(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn registers(&self) -> &[RegisterKey] {
        &self.registers
    }

    /// Last `Success` or `Partial` snapshot, if any cycle produced one.
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_good.as_ref()
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.state = CycleState::Connecting;

        let outcome = match self.connections.acquire().await {
            Err(err) => {
                warn!("{}", err);
                self.fall_back(CycleFailed::Unreachable(err))
            }
            Ok(mut session) => {
                self.state = CycleState::Reading;

                let mut values: Vec<(RegisterKey, RegisterValue)> =
                    Vec::with_capacity(self.registers.len());
                let mut stale = BTreeSet::new();
                let mut fatal: Option<ReadError> = None;
                let cache = &mut self.cache;

                self.reader
                    .read_each(&mut session, &self.registers, |key, result| match result {
                        Ok(value) => {
                            cache.store(key, value);
                            values.push((key, value));
                            ControlFlow::Continue(())
                        }
                        Err(err) => match cache.get(key) {
                            Some(cached) => {
                                warn!("{}; keeping last value {}", err, cached);
                                values.push((key, cached));
                                stale.insert(key);
                                ControlFlow::Continue(())
                            }
                            None => {
                                fatal = Some(err);
                                ControlFlow::Break(())
                            }
                        },
                    })
                    .await;
                session.release().await;

                match fatal {
                    Some(err) => self.fall_back(CycleFailed::NoFallback(err)),
                    None => {
                        let snapshot: Snapshot = values.into_iter().collect();
                        self.last_good = Some(snapshot.clone());
                        if stale.is_empty() {
                            CycleOutcome::Success { snapshot }
                        } else {
                            CycleOutcome::Partial { snapshot, stale }
                        }
                    }
                }
            }
        };

        self.record(&outcome);
        self.state = CycleState::Idle;
        outcome
    }

    /// Whole-device fallback: the prior snapshot unchanged, or nothing.
    fn fall_back(&self, cause: CycleFailed) -> CycleOutcome {
        match &self.last_good {
            Some(prior) => {
                warn!("poll failed ({}); returning last snapshot", cause);
                CycleOutcome::Partial {
                    snapshot: prior.clone(),
                    stale: prior.keys().collect(),
                }
            }
            None => {
                error!("poll failed with no prior data: {}", cause);
                CycleOutcome::Failed(cause)
            }
        }
    }

    fn record(&mut self, outcome: &CycleOutcome) {
        self.stats.cycles_executed += 1;
        match outcome {
            CycleOutcome::Success { .. } => self.stats.successes += 1,
            CycleOutcome::Partial { stale, .. } => {
                self.stats.partials += 1;
                self.stats.stale_reads += stale.len() as u64;
            }
            CycleOutcome::Failed(_) => self.stats.failures += 1,
        }
        debug!(
            "cycle {} finished: {}",
            self.stats.cycles_executed,
            outcome.status()
        );
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::error::Fault;
    use crate::register::RegisterSpace;
    use crate::sim::SimulatedDevice;
    use std::time::Duration;

    const REGISTERS: [RegisterKey; 3] = [3044, 3066, 3078];

    fn engine(device: &SimulatedDevice) -> CycleEngine<SimulatedDevice> {
        let timeout = Duration::from_secs(2);
        CycleEngine::new(
            Arc::new(ConnectionManager::new(device.clone(), timeout)),
            RegisterReader::new(RegisterSpace::Input, timeout),
            REGISTERS.to_vec(),
        )
    }

    fn snapshot(values: &[(RegisterKey, RegisterValue)]) -> Snapshot {
        values.iter().copied().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_read_is_served_from_cache() {
        let device = SimulatedDevice::with_registers([(3044, 10), (3066, 55), (3078, 0)]);
        let mut engine = engine(&device);

        let first = engine.run_cycle().await;
        assert_eq!(
            first,
            CycleOutcome::Success {
                snapshot: snapshot(&[(3044, 10), (3066, 55), (3078, 0)]),
            }
        );
        assert_eq!(engine.cache().len(), 3);

        device.set(3044, 12);
        device.set(3066, 60);
        device.set(3078, 1);
        device.hang_reads(3066, true);

        let second = engine.run_cycle().await;
        assert_eq!(
            second,
            CycleOutcome::Partial {
                snapshot: snapshot(&[(3044, 12), (3066, 55), (3078, 1)]),
                stale: BTreeSet::from([3066]),
            }
        );
        assert_eq!(engine.cache().get(3044), Some(12));
        assert_eq!(engine.cache().get(3066), Some(55));
        assert_eq!(device.active_sessions(), 0);
        assert_eq!(engine.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn first_cycle_without_fallback_fails() {
        let device = SimulatedDevice::with_registers([(3044, 10), (3066, 55), (3078, 0)]);
        device.fail_reads(3066, true);
        let mut engine = engine(&device);

        let outcome = engine.run_cycle().await;
        match outcome {
            CycleOutcome::Failed(CycleFailed::NoFallback(err)) => {
                assert_eq!(err.key, 3066);
                assert!(matches!(err.cause, Fault::Exception(_)));
            }
            other => panic!("expected failed cycle, got {:?}", other),
        }

        // Remaining reads were skipped and the session was still closed.
        assert_eq!(device.reads(), 2);
        assert_eq!(device.closes(), 1);
        assert_eq!(device.active_sessions(), 0);
        assert!(engine.last_snapshot().is_none());
        // The read that succeeded before the abort still lands in the cache.
        assert_eq!(engine.cache().get(3044), Some(10));
    }

    #[tokio::test]
    async fn unreachable_device_reuses_prior_snapshot() {
        let device = SimulatedDevice::with_registers([(3044, 10), (3066, 55), (3078, 0)]);
        let mut engine = engine(&device);

        let first = engine.run_cycle().await;
        let prior = first.snapshot().cloned().unwrap();

        device.set_reachable(false);
        let second = engine.run_cycle().await;
        match second {
            CycleOutcome::Partial { snapshot, stale } => {
                assert_eq!(snapshot, prior);
                assert_eq!(stale, BTreeSet::from(REGISTERS));
            }
            other => panic!("expected partial, got {:?}", other),
        }
        assert_eq!(engine.stats().partials, 1);
        assert_eq!(engine.stats().stale_reads, 3);
    }

    #[tokio::test]
    async fn unreachable_before_any_data_fails() {
        let device = SimulatedDevice::new();
        device.set_reachable(false);
        let mut engine = engine(&device);

        let outcome = engine.run_cycle().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailed::Unreachable(_))
        ));
        assert_eq!(engine.stats().failures, 1);
        assert_eq!(engine.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn recovers_after_failed_first_cycle() {
        let device = SimulatedDevice::with_registers([(3044, 10), (3078, 0)]);
        let mut engine = engine(&device);

        assert!(matches!(
            engine.run_cycle().await,
            CycleOutcome::Failed(_)
        ));

        device.set(3066, 55);
        let outcome = engine.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Success { .. }));
        assert!(outcome.snapshot().unwrap().covers_exactly(&REGISTERS));
        assert_eq!(engine.stats().cycles_executed, 2);
    }
}

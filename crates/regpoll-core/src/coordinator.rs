//! Public handle over a running poller.
//!
//! The creator owns the [`Coordinator`] and hands references (usually an
//! `Arc`) to consumers. Dropping it stops the scheduler after the current
//! cycle.

use crate::config::PollConfig;
use crate::cycle::{CycleEngine, CycleStats};
use crate::error::{ConfigError, WriteError};
use crate::reader::RegisterReader;
use crate::register::{CycleOutcome, RegisterKey, RegisterValue};
use crate::scheduler::{RefreshHandle, Scheduler};
use crate::session::ConnectionManager;
use crate::transport::Transport;
use crate::writer::{WriteEvent, WritePath};
use log::info;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read-only view handed to consumers that display values.
pub trait OutcomeSource: Send + Sync {
    /// Latest completed cycle, `None` before the first one finishes.
    fn current_outcome(&self) -> Option<CycleOutcome>;

    fn request_refresh(&self);
}

pub struct Coordinator<T: Transport> {
    registers: Vec<RegisterKey>,
    endpoint: String,
    outcomes: watch::Receiver<Option<CycleOutcome>>,
    refresh: RefreshHandle,
    writer: WritePath<T>,
    shutdown: CancellationToken,
}

impl<T: Transport> Coordinator<T> {
    /// Validates `config` and starts the scheduler on the current tokio
    /// runtime. The first cycle starts immediately.
    pub fn spawn(
        transport: T,
        config: PollConfig,
    ) -> Result<(Self, JoinHandle<CycleStats>), ConfigError> {
        config.validate()?;

        let endpoint = transport.endpoint();
        let connections = Arc::new(ConnectionManager::new(transport, config.read_timeout));
        let reader = RegisterReader::new(config.space, config.read_timeout);
        let engine = CycleEngine::new(
            Arc::clone(&connections),
            reader,
            config.registers.clone(),
        );
        let scheduler = Scheduler::new(
            engine,
            config.interval,
            config.reset_interval_on_refresh,
        );

        let outcomes = scheduler.subscribe();
        let refresh = scheduler.refresh_handle();
        let shutdown = scheduler.shutdown_token();
        let writer = WritePath::new(
            connections,
            config.space,
            config.read_timeout,
            refresh.clone(),
        );

        info!(
            "polling {} {} registers at {} every {:?}",
            config.registers.len(),
            config.space.as_str(),
            endpoint,
            config.interval
        );
        let handle = tokio::spawn(scheduler.run());

        Ok((
            Self {
                registers: config.registers,
                endpoint,
                outcomes,
                refresh,
                writer,
                shutdown,
            },
            handle,
        ))
    }

    pub fn registers(&self) -> &[RegisterKey] {
        &self.registers
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn current_outcome(&self) -> Option<CycleOutcome> {
        self.outcomes.borrow().clone()
    }

    /// Change notifications for every completed cycle.
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleOutcome>> {
        self.outcomes.clone()
    }

    pub fn request_refresh(&self) {
        self.refresh.request();
    }

    pub async fn write(&self, key: RegisterKey, value: RegisterValue) -> Result<(), WriteError> {
        self.writer.write(key, value).await
    }

    pub async fn toggle(&self, key: RegisterKey) -> Result<RegisterValue, WriteError> {
        self.writer.toggle(key).await
    }

    pub fn write_events(&self) -> broadcast::Receiver<WriteEvent> {
        self.writer.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl<T: Transport> OutcomeSource for Coordinator<T> {
    fn current_outcome(&self) -> Option<CycleOutcome> {
        Coordinator::current_outcome(self)
    }

    fn request_refresh(&self) {
        Coordinator::request_refresh(self)
    }
}

impl<T: Transport> Drop for Coordinator<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

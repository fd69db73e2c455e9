use crate::error::{Fault, WriteError};
use crate::register::{RegisterKey, RegisterSpace, RegisterValue};
use crate::scheduler::RefreshHandle;
use crate::session::ConnectionManager;
use crate::transport::Transport;
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WRITE_EVENT_CAPACITY: usize = 64;

/// Reported to observers after every write attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    pub key: RegisterKey,
    /// Value sent to the device; `None` when a toggle failed before writing.
    pub value: Option<RegisterValue>,
    pub result: Result<(), WriteError>,
}

/// Single writes over their own session, followed by a refresh request.
///
/// The cache is never touched here: the follow-up cycle reads back whatever
/// the device actually accepted.
pub struct WritePath<T: Transport> {
    connections: Arc<ConnectionManager<T>>,
    space: RegisterSpace,
    timeout: Duration,
    refresh: RefreshHandle,
    events: broadcast::Sender<WriteEvent>,
}

impl<T: Transport> WritePath<T> {
    pub fn new(
        connections: Arc<ConnectionManager<T>>,
        space: RegisterSpace,
        timeout: Duration,
        refresh: RefreshHandle,
    ) -> Self {
        let (events, _) = broadcast::channel(WRITE_EVENT_CAPACITY);
        Self {
            connections,
            space,
            timeout,
            refresh,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WriteEvent> {
        self.events.subscribe()
    }

    pub async fn write(&self, key: RegisterKey, value: RegisterValue) -> Result<(), WriteError> {
        let result = self.write_once(key, value).await;
        self.finish(key, Some(value), result.clone());
        result
    }

    /// Flips a 0/1 register: writes 0 when it reads 1, otherwise 1.
    ///
    /// Read and write share one session. Returns the value written.
    pub async fn toggle(&self, key: RegisterKey) -> Result<RegisterValue, WriteError> {
        match self.toggle_once(key).await {
            Ok(value) => {
                self.finish(key, Some(value), Ok(()));
                Ok(value)
            }
            Err((value, err)) => {
                self.finish(key, value, Err(err.clone()));
                Err(err)
            }
        }
    }

    async fn write_once(&self, key: RegisterKey, value: RegisterValue) -> Result<(), WriteError> {
        let mut session = self.connections.acquire().await.map_err(|err| WriteError {
            key,
            cause: Fault::Unreachable(err.to_string()),
        })?;
        let result = self.bounded(key, session.write(key, value)).await;
        session.release().await;
        result
    }

    async fn toggle_once(
        &self,
        key: RegisterKey,
    ) -> Result<RegisterValue, (Option<RegisterValue>, WriteError)> {
        let mut session = self.connections.acquire().await.map_err(|err| {
            (
                None,
                WriteError {
                    key,
                    cause: Fault::Unreachable(err.to_string()),
                },
            )
        })?;

        let result = match self.bounded(key, session.read(self.space, key)).await {
            Ok(current) => {
                let next = if current == 1 { 0 } else { 1 };
                self.bounded(key, session.write(key, next))
                    .await
                    .map(|()| next)
                    .map_err(|err| (Some(next), err))
            }
            Err(err) => Err((None, err)),
        };
        session.release().await;
        result
    }

    async fn bounded<V>(
        &self,
        key: RegisterKey,
        op: impl Future<Output = Result<V, Fault>>,
    ) -> Result<V, WriteError> {
        match timeout(self.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(WriteError { key, cause }),
            Err(_elapsed) => Err(WriteError {
                key,
                cause: Fault::Timeout(self.timeout),
            }),
        }
    }

    fn finish(
        &self,
        key: RegisterKey,
        value: Option<RegisterValue>,
        result: Result<(), WriteError>,
    ) {
        match &result {
            Ok(()) => {
                info!("wrote {:?} to register {}", value, key);
                self.refresh.request();
            }
            Err(err) => warn!("{}", err),
        }
        // No subscribers is fine.
        let _ = self.events.send(WriteEvent { key, value, result });
    }
}

//! Scoped device sessions.
//!
//! Every poll cycle and every write opens its own session through the same
//! [`ConnectionManager`]. The manager holds one device lock, so at most one
//! session exists at any instant even though each operation connects fresh.

use crate::error::{ConnectionError, Fault};
use crate::register::{RegisterKey, RegisterSpace, RegisterValue};
use crate::transport::Transport;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

pub struct ConnectionManager<T: Transport> {
    transport: T,
    device_lock: Mutex<()>,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, connect_timeout: Duration) -> Self {
        Self {
            transport,
            device_lock: Mutex::new(()),
            connect_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Waits for the device lock, then opens a fresh session.
    ///
    /// The lock is held until the returned guard is released or dropped.
    pub async fn acquire(&self) -> Result<Session<'_, T>, ConnectionError> {
        let permit = self.device_lock.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let connected = match timeout(self.connect_timeout, self.transport.connect()).await {
            Ok(Ok(session)) => session,
            Ok(Err(cause)) => return Err(self.connection_error(cause)),
            Err(_elapsed) => return Err(self.connection_error(Fault::Timeout(self.connect_timeout))),
        };

        debug!("session {} opened to {}", id, self.transport.endpoint());
        Ok(Session {
            transport: &self.transport,
            inner: Some(connected),
            id,
            _permit: permit,
        })
    }

    fn connection_error(&self, cause: Fault) -> ConnectionError {
        ConnectionError {
            endpoint: self.transport.endpoint(),
            cause,
        }
    }
}

/// An open device session. Released on every exit path.
pub struct Session<'a, T: Transport> {
    transport: &'a T,
    inner: Option<T::Session>,
    id: u64,
    _permit: MutexGuard<'a, ()>,
}

impl<'a, T: Transport> Session<'a, T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn read(
        &mut self,
        space: RegisterSpace,
        key: RegisterKey,
    ) -> Result<RegisterValue, Fault> {
        let session = self.inner.as_mut().ok_or(Fault::Closed)?;
        self.transport.read_register(session, space, key).await
    }

    pub async fn write(&mut self, key: RegisterKey, value: RegisterValue) -> Result<(), Fault> {
        let session = self.inner.as_mut().ok_or(Fault::Closed)?;
        self.transport.write_register(session, key, value).await
    }

    /// Graceful close. The device lock is freed when `self` goes out of scope.
    pub async fn release(mut self) {
        if let Some(session) = self.inner.take() {
            self.transport.close(session).await;
            debug!("session {} released", self.id);
        }
    }
}

impl<T: Transport> Drop for Session<'_, T> {
    fn drop(&mut self) {
        // Aborted paths: dropping the transport session closes its socket.
        if self.inner.take().is_some() {
            warn!("session {} dropped without graceful close", self.id);
        }
    }
}

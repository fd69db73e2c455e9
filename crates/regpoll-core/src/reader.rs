use crate::error::{Fault, ReadError};
use crate::register::{RegisterKey, RegisterSpace, RegisterValue};
use crate::session::Session;
use crate::transport::Transport;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::timeout;

/// Sequential single-register reads over one session.
#[derive(Debug, Clone, Copy)]
pub struct RegisterReader {
    space: RegisterSpace,
    read_timeout: Duration,
}

impl RegisterReader {
    pub fn new(space: RegisterSpace, read_timeout: Duration) -> Self {
        Self {
            space,
            read_timeout,
        }
    }

    pub fn space(&self) -> RegisterSpace {
        self.space
    }

    /// One bounded read. A timeout is reported like any other failure.
    pub async fn read<T: Transport>(
        &self,
        session: &mut Session<'_, T>,
        key: RegisterKey,
    ) -> Result<RegisterValue, ReadError> {
        match timeout(self.read_timeout, session.read(self.space, key)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(ReadError { key, cause }),
            Err(_elapsed) => Err(ReadError {
                key,
                cause: Fault::Timeout(self.read_timeout),
            }),
        }
    }

    /// Reads `keys` in order, handing each result to `visit`.
    ///
    /// Stops early when `visit` breaks. Returns how many keys were attempted.
    pub async fn read_each<T, F>(
        &self,
        session: &mut Session<'_, T>,
        keys: &[RegisterKey],
        mut visit: F,
    ) -> usize
    where
        T: Transport,
        F: FnMut(RegisterKey, Result<RegisterValue, ReadError>) -> ControlFlow<()>,
    {
        let mut attempted = 0;
        for &key in keys {
            attempted += 1;
            let result = self.read(session, key).await;
            if visit(key, result).is_break() {
                break;
            }
        }
        attempted
    }
}

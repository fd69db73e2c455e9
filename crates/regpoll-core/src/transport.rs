use crate::error::Fault;
use crate::register::{RegisterKey, RegisterSpace, RegisterValue};
use std::future::Future;

/// Connect/read/write/close primitives over one physical session.
///
/// Dropping a `Session` must release its underlying resources; `close` is the
/// graceful path and never fails.
pub trait Transport: Send + Sync + 'static {
    type Session: Send;

    /// Human-readable device address, used in logs and errors.
    fn endpoint(&self) -> String;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, Fault>> + Send;

    fn read_register(
        &self,
        session: &mut Self::Session,
        space: RegisterSpace,
        key: RegisterKey,
    ) -> impl Future<Output = Result<RegisterValue, Fault>> + Send;

    fn write_register(
        &self,
        session: &mut Self::Session,
        key: RegisterKey,
        value: RegisterValue,
    ) -> impl Future<Output = Result<(), Fault>> + Send;

    fn close(&self, session: Self::Session) -> impl Future<Output = ()> + Send;
}

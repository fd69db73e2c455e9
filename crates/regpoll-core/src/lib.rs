pub mod cache;
pub mod config;
pub mod coordinator;
pub mod cycle;
pub mod error;
pub mod reader;
pub mod register;
pub mod scheduler;
pub mod session;
#[cfg(feature = "simulation")]
pub mod sim;
pub mod transport;
pub mod writer;

pub use cache::Cache;
pub use config::PollConfig;
pub use coordinator::{Coordinator, OutcomeSource};
pub use cycle::{CycleEngine, CycleState, CycleStats};
pub use error::{ConfigError, ConnectionError, CycleFailed, Fault, ReadError, WriteError};
pub use reader::RegisterReader;
pub use register::{CycleOutcome, RegisterKey, RegisterSpace, RegisterValue, Snapshot, WriteRequest};
pub use scheduler::{RefreshHandle, Scheduler, Trigger};
pub use session::{ConnectionManager, Session};
#[cfg(feature = "simulation")]
pub use sim::{SimSession, SimulatedDevice};
pub use transport::Transport;
pub use writer::{WriteEvent, WritePath};

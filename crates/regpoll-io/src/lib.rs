pub mod bridge;
pub mod metrics;
pub mod modbus;
pub mod protocol;

pub use bridge::{run_bridge, serve_listener, BridgeConfig, BridgeError};
pub use metrics::{init_metrics, record_outcome, record_write, serve_metrics};
pub use modbus::{ModbusConfig, ModbusTransport, DEFAULT_PORT};
pub use protocol::{IncomingMessage, OutcomeMsg, ProtocolVersion, WriteResultMsg};

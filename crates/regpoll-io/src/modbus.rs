//! Modbus TCP transport.
//!
//! One `tokio-modbus` client context per session. Input registers are read
//! with function 0x04, holding registers with 0x03, writes use 0x06.

use regpoll_core::{Fault, RegisterKey, RegisterSpace, RegisterValue, Transport};
use std::io;
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 502;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    /// Unit (slave) identifier addressed on the gateway.
    pub unit_id: u8,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            unit_id: 1,
        }
    }
}

pub struct ModbusTransport {
    config: ModbusConfig,
}

impl ModbusTransport {
    pub fn new(config: ModbusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    async fn resolve(&self) -> Result<SocketAddr, Fault> {
        lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| Fault::Unreachable(format!("cannot resolve {}: {}", self.config.host, e)))?
            .next()
            .ok_or_else(|| Fault::Unreachable(format!("no address for {}", self.config.host)))
    }
}

fn classify(err: io::Error) -> Fault {
    match err.kind() {
        io::ErrorKind::InvalidData => Fault::Malformed(err.to_string()),
        // Exception responses surface as `Other`.
        io::ErrorKind::Other => Fault::Exception(err.to_string()),
        _ => Fault::Io(err.to_string()),
    }
}

impl Transport for ModbusTransport {
    type Session = Context;

    fn endpoint(&self) -> String {
        format!(
            "{}:{} (unit {})",
            self.config.host, self.config.port, self.config.unit_id
        )
    }

    async fn connect(&self) -> Result<Context, Fault> {
        let addr = self.resolve().await?;
        let ctx = tcp::connect_slave(addr, Slave(self.config.unit_id))
            .await
            .map_err(|e| Fault::Unreachable(e.to_string()))?;
        debug!(addr = %addr, unit = self.config.unit_id, "Modbus TCP connected");
        Ok(ctx)
    }

    async fn read_register(
        &self,
        session: &mut Context,
        space: RegisterSpace,
        key: RegisterKey,
    ) -> Result<RegisterValue, Fault> {
        let words = match space {
            RegisterSpace::Input => session.read_input_registers(key, 1).await,
            RegisterSpace::Holding => session.read_holding_registers(key, 1).await,
        }
        .map_err(classify)?;

        words
            .first()
            .copied()
            .ok_or_else(|| Fault::Malformed(format!("empty response for register {}", key)))
    }

    async fn write_register(
        &self,
        session: &mut Context,
        key: RegisterKey,
        value: RegisterValue,
    ) -> Result<(), Fault> {
        session
            .write_single_register(key, value)
            .await
            .map_err(classify)
    }

    async fn close(&self, mut session: Context) {
        if let Err(e) = session.disconnect().await {
            debug!(error = %e, "Modbus disconnect failed; dropping connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regpoll_core::ConnectionManager;
    use std::time::Duration;

    #[test]
    fn endpoint_names_host_port_and_unit() {
        let transport = ModbusTransport::new(ModbusConfig {
            host: "192.168.40.70".to_string(),
            port: 8899,
            unit_id: 1,
        });
        assert_eq!(transport.endpoint(), "192.168.40.70:8899 (unit 1)");
    }

    #[test]
    fn exception_and_framing_errors_are_classified() {
        let exception = classify(io::Error::new(io::ErrorKind::Other, "Illegal data address"));
        assert!(matches!(exception, Fault::Exception(_)));
        let framing = classify(io::Error::new(io::ErrorKind::InvalidData, "bad header"));
        assert!(matches!(framing, Fault::Malformed(_)));
        let reset = classify(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(matches!(reset, Fault::Io(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = ConnectionManager::new(
            ModbusTransport::new(ModbusConfig {
                host: "127.0.0.1".to_string(),
                port,
                unit_id: 1,
            }),
            Duration::from_secs(2),
        );
        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err.cause, Fault::Unreachable(_) | Fault::Timeout(_)));
    }
}

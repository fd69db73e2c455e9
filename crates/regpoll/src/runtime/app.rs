use crate::infra::audit::{record_events, AuditClock, AuditEventType, AuditLogger};
use crate::runtime::config::{ConfigError, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use regpoll_core::{
    Coordinator, CycleStats, Fault, RegisterKey, RegisterSpace, RegisterValue, SimSession,
    SimulatedDevice, Transport,
};
use regpoll_io::bridge::{run_bridge, BridgeConfig, BridgeError};
use regpoll_io::modbus::ModbusTransport;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid poll configuration: {0}")]
    Poll(#[from] regpoll_core::ConfigError),

    #[error("failed to open audit log {}: {source}", path.display())]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
}

enum DeviceTransport {
    Simulated(SimulatedDevice),
    Modbus(ModbusTransport),
}

enum DeviceSession {
    Simulated(SimSession),
    Modbus(<ModbusTransport as Transport>::Session),
}

impl Transport for DeviceTransport {
    type Session = DeviceSession;

    fn endpoint(&self) -> String {
        match self {
            Self::Simulated(d) => d.endpoint(),
            Self::Modbus(m) => m.endpoint(),
        }
    }

    async fn connect(&self) -> Result<DeviceSession, Fault> {
        match self {
            Self::Simulated(d) => d.connect().await.map(DeviceSession::Simulated),
            Self::Modbus(m) => m.connect().await.map(DeviceSession::Modbus),
        }
    }

    async fn read_register(
        &self,
        session: &mut DeviceSession,
        space: RegisterSpace,
        key: RegisterKey,
    ) -> Result<RegisterValue, Fault> {
        match (self, session) {
            (Self::Simulated(d), DeviceSession::Simulated(s)) => {
                d.read_register(s, space, key).await
            }
            (Self::Modbus(m), DeviceSession::Modbus(s)) => m.read_register(s, space, key).await,
            _ => Err(Fault::Closed),
        }
    }

    async fn write_register(
        &self,
        session: &mut DeviceSession,
        key: RegisterKey,
        value: RegisterValue,
    ) -> Result<(), Fault> {
        match (self, session) {
            (Self::Simulated(d), DeviceSession::Simulated(s)) => {
                d.write_register(s, key, value).await
            }
            (Self::Modbus(m), DeviceSession::Modbus(s)) => m.write_register(s, key, value).await,
            _ => Err(Fault::Closed),
        }
    }

    async fn close(&self, session: DeviceSession) {
        match (self, session) {
            (Self::Simulated(d), DeviceSession::Simulated(s)) => d.close(s).await,
            (Self::Modbus(m), DeviceSession::Modbus(s)) => m.close(s).await,
            _ => {}
        }
    }
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "regpoll stopped with an error");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), RuntimeError> {
    // Held until exit so the rolling file is flushed.
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    config.validate()?;

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("regpoll")
        .build()
        .map_err(RuntimeError::Runtime)?;

    runtime.block_on(serve(config))
}

fn build_transport(config: &RuntimeConfig) -> DeviceTransport {
    if config.simulate {
        info!("Using simulated device");
        DeviceTransport::Simulated(SimulatedDevice::with_registers(
            config.registers.iter().map(|&key| (key, 0)),
        ))
    } else {
        let modbus = config.modbus_config();
        info!(host = %modbus.host, port = modbus.port, unit = modbus.unit_id, "Using Modbus TCP device");
        DeviceTransport::Modbus(ModbusTransport::new(modbus))
    }
}

fn init_audit_logger(audit_path: Option<&Path>) -> Result<Option<Arc<AuditLogger>>, RuntimeError> {
    audit_path
        .map(|path| {
            let logger =
                AuditLogger::new(path, AuditClock::new()).map_err(|source| RuntimeError::Audit {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!(path = %path.display(), "Audit logging enabled");
            Ok(Arc::new(logger))
        })
        .transpose()
}

async fn run_limit(run_seconds: Option<u64>) {
    match run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            tokio::time::sleep(Duration::from_secs(seconds)).await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn serve(config: RuntimeConfig) -> Result<(), RuntimeError> {
    let audit_logger = init_audit_logger(config.audit_path.as_deref())?;
    let (coordinator, scheduler) =
        Coordinator::spawn(build_transport(&config), config.poll_config())?;
    let coordinator = Arc::new(coordinator);
    let shutdown = CancellationToken::new();

    if let Some(ref logger) = audit_logger {
        let _ = logger.log_event(
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "endpoint": coordinator.endpoint(),
                "registers": coordinator.registers(),
                "space": config.space.as_str(),
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": config.metrics_addr.is_some(),
            }),
        );
    }

    let metrics_task = telemetry::spawn_metrics_updater(&coordinator, shutdown.child_token());
    let audit_task = audit_logger.as_ref().map(|logger| {
        tokio::spawn(record_events(
            Arc::clone(logger),
            coordinator.subscribe(),
            coordinator.write_events(),
            shutdown.child_token(),
        ))
    });

    let bridge_task = if config.bridge_enabled {
        let bridge_config = BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            require_handshake: config.require_handshake,
        };
        let coordinator = Arc::clone(&coordinator);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            let result = run_bridge(coordinator, bridge_config, shutdown.child_token()).await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        }))
    } else {
        info!("Bridge disabled");
        None
    };

    info!(endpoint = %coordinator.endpoint(), "regpoll running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "Cannot listen for interrupts, shutting down"),
        },
        _ = run_limit(config.run_seconds) => {}
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    coordinator.shutdown();

    let stats: CycleStats = scheduler.await?;
    let bridge_result = match bridge_task {
        Some(task) => task.await?,
        None => Ok(()),
    };
    metrics_task.await?;
    if let Some(task) = audit_task {
        task.await?;
    }

    info!(
        cycles_executed = stats.cycles_executed,
        successes = stats.successes,
        partials = stats.partials,
        failures = stats.failures,
        stale_reads = stats.stale_reads,
        on_demand_cycles = stats.on_demand_cycles,
        "Run complete"
    );

    if let Some(ref logger) = audit_logger {
        let _ = logger.log_event(
            AuditEventType::SystemShutdown,
            serde_json::json!({
                "cycles_executed": stats.cycles_executed,
                "failures": stats.failures,
                "stale_reads": stats.stale_reads,
            }),
        );
    }

    bridge_result.map_err(RuntimeError::from)
}

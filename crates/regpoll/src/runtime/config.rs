use regpoll_core::{PollConfig, RegisterKey, RegisterSpace};
use regpoll_io::{ModbusConfig, DEFAULT_PORT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing value for {0}")]
    MissingValue(String),

    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown argument {0}")]
    UnknownArgument(String),

    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("--host is required unless --simulate is set")]
    MissingHost,

    #[error(transparent)]
    Poll(#[from] regpoll_core::ConfigError),
}

/// Settings loadable from a `--config` JSON file. CLI flags win.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
    registers: Option<Vec<RegisterKey>>,
    space: Option<RegisterSpace>,
    interval_secs: Option<u64>,
    read_timeout_ms: Option<u64>,
    reset_on_refresh: Option<bool>,
    simulate: Option<bool>,
    bind_addr: Option<String>,
    bridge_enabled: Option<bool>,
    require_handshake: Option<bool>,
    json_logs: Option<bool>,
    log_dir: Option<PathBuf>,
    metrics_addr: Option<String>,
    audit_log: Option<PathBuf>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub host: Option<String>,
    pub port: u16,
    pub unit_id: u8,
    pub registers: Vec<RegisterKey>,
    pub space: RegisterSpace,
    pub interval_secs: u64,
    pub read_timeout_ms: u64,
    pub reset_on_refresh: bool,
    pub simulate: bool,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub require_handshake: bool,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub run_seconds: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            host: None,
            port: DEFAULT_PORT,
            unit_id: 1,
            registers: Vec::new(),
            space: RegisterSpace::Input,
            interval_secs: 30,
            read_timeout_ms: 2_000,
            reset_on_refresh: false,
            simulate: false,
            bind_addr: "127.0.0.1:7010".to_string(),
            bridge_enabled: true,
            require_handshake: false,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            run_seconds: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parse<T: FromStr>(flag: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw.to_string(),
    })
}

fn parse_registers(flag: &str, raw: &str) -> Result<Vec<RegisterKey>, ConfigError> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse(flag, part))
        .collect()
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();

        // File values first so flags on the command line override them.
        if let Some(pos) = args.iter().position(|a| a == "--config") {
            let path = PathBuf::from(value(args, pos, "--config")?);
            cfg.apply_file(FileConfig::load(&path)?);
        }

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--config" => {
                    i += 1;
                }
                "--host" => {
                    cfg.host = Some(value(args, i, flag)?.to_string());
                    i += 1;
                }
                "--port" => {
                    cfg.port = parse(flag, value(args, i, flag)?)?;
                    i += 1;
                }
                "--unit" => {
                    cfg.unit_id = parse(flag, value(args, i, flag)?)?;
                    i += 1;
                }
                "--registers" => {
                    cfg.registers = parse_registers(flag, value(args, i, flag)?)?;
                    i += 1;
                }
                "--holding" => {
                    cfg.space = RegisterSpace::Holding;
                }
                "--interval-secs" => {
                    cfg.interval_secs = parse(flag, value(args, i, flag)?)?;
                    i += 1;
                }
                "--read-timeout-ms" => {
                    cfg.read_timeout_ms = parse(flag, value(args, i, flag)?)?;
                    i += 1;
                }
                "--reset-on-refresh" => {
                    cfg.reset_on_refresh = true;
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--bind" => {
                    cfg.bind_addr = value(args, i, flag)?.to_string();
                    i += 1;
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--require-handshake" => {
                    cfg.require_handshake = true;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--metrics-addr" => {
                    cfg.metrics_addr = Some(value(args, i, flag)?.to_string());
                    i += 1;
                }
                "--audit-log" => {
                    cfg.audit_path = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--run-seconds" => {
                    cfg.run_seconds = Some(parse(flag, value(args, i, flag)?)?);
                    i += 1;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => return Err(ConfigError::UnknownArgument(other.to_string())),
            }
            i += 1;
        }
        Ok(cfg)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if file.host.is_some() {
            self.host = file.host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(unit_id) = file.unit_id {
            self.unit_id = unit_id;
        }
        if let Some(registers) = file.registers {
            self.registers = registers;
        }
        if let Some(space) = file.space {
            self.space = space;
        }
        if let Some(secs) = file.interval_secs {
            self.interval_secs = secs;
        }
        if let Some(ms) = file.read_timeout_ms {
            self.read_timeout_ms = ms;
        }
        if let Some(reset) = file.reset_on_refresh {
            self.reset_on_refresh = reset;
        }
        if let Some(simulate) = file.simulate {
            self.simulate = simulate;
        }
        if let Some(bind_addr) = file.bind_addr {
            self.bind_addr = bind_addr;
        }
        if let Some(enabled) = file.bridge_enabled {
            self.bridge_enabled = enabled;
        }
        if let Some(required) = file.require_handshake {
            self.require_handshake = required;
        }
        if let Some(json) = file.json_logs {
            self.json_logs = json;
        }
        if file.log_dir.is_some() {
            self.log_dir = file.log_dir;
        }
        if file.metrics_addr.is_some() {
            self.metrics_addr = file.metrics_addr;
        }
        if file.audit_log.is_some() {
            self.audit_path = file.audit_log;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.simulate && self.host.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingHost);
        }
        self.poll_config().validate()?;
        Ok(())
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            registers: self.registers.clone(),
            space: self.space,
            interval: Duration::from_secs(self.interval_secs),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            reset_interval_on_refresh: self.reset_on_refresh,
        }
    }

    pub fn modbus_config(&self) -> ModbusConfig {
        ModbusConfig {
            host: self.host.clone().unwrap_or_default(),
            port: self.port,
            unit_id: self.unit_id,
        }
    }

    pub fn print_help() {
        println!(
            r#"regpoll - Modbus TCP register poller

USAGE:
    regpoll [OPTIONS] --registers <LIST> (--host <HOST> | --simulate)

DEVICE:
    --host <HOST>           Modbus TCP gateway host
    --port <PORT>           Modbus TCP port [default: 502]
    --unit <ID>             Unit (slave) id [default: 1]
    --simulate              Poll an in-memory simulated device instead of hardware

POLLING:
    --registers <LIST>      Comma-separated register addresses (e.g. 3044,3066,3078)
    --holding               Poll holding registers instead of input registers
    --interval-secs <SECS>  Poll interval [default: 30]
    --read-timeout-ms <MS>  Per connect/read/write timeout [default: 2000]
    --reset-on-refresh      Restart the interval timer after an on-demand refresh

BRIDGE:
    --bind <ADDR>           Bridge TCP bind address [default: 127.0.0.1:7010]
    --no-bridge             Disable the consumer bridge
    --require-handshake     Require a hello message before refresh/write/toggle

OBSERVABILITY:
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write JSON logs to a daily rolling file in PATH
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file

OTHER:
    --config <PATH>         Load settings from a JSON file (flags override it)
    --run-seconds <SECS>    Run for a fixed duration then exit
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,regpoll_core=trace)

EXAMPLES:
    # Poll three input registers every 30 s
    regpoll --host 192.168.40.70 --port 8899 --registers 3044,3066,3078

    # Simulated device with metrics, short run
    regpoll --simulate --registers 7001,7002 --metrics-addr 0.0.0.0:9090 --run-seconds 10
"#
        );
    }
}

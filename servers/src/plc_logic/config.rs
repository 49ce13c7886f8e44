use clap::Parser;
use lib_common::PlcConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Overlay of optional settings gathered from the config file, environment
/// variables, and CLI arguments. `merge` layers one overlay over another;
/// unresolved fields fall back to the defaults in `resolve`.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "PLC telemetry gateway", version)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverlay {
    #[clap(long, env = "PLC_PORT", help = "Port to listen on for UI client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "PLC_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PLC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PLC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PLC_ENDPOINT_URL", help = "Acquisition endpoint WebSocket URL.")]
    pub endpoint_url: Option<String>,

    #[clap(long, env = "PLC_RECONNECT_DELAY_MS", help = "Fixed delay in milliseconds between reconnect attempts.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "PLC_REQUEST_TIMEOUT_MS", help = "Deadline in milliseconds for read/write requests.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "PLC_HISTORY_CAP", help = "Maximum number of samples retained in the history window.")]
    pub history_cap: Option<usize>,

    #[clap(long, env = "PLC_BASE_REGISTER", help = "Register assumed for telemetry frames that omit one.")]
    pub base_register: Option<u16>,

    #[clap(long, env = "PLC_REDIS_URL", help = "Redis URL for the persisted sample store.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "PLC_REDIS_KEY_PREFIX", help = "Key prefix for sample-store entries.")]
    pub redis_key_prefix: Option<String>,

    #[clap(long, env = "PLC_HISTORY_REFRESH_SECONDS", help = "Interval in seconds between persisted-history refreshes.")]
    pub history_refresh_seconds: Option<u64>,

    #[clap(long, env = "PLC_DATAFLOW_CHECK_INTERVAL_SECONDS", help = "Interval in seconds between dataflow checks.")]
    pub dataflow_check_interval_seconds: Option<u64>,

    #[clap(long, env = "PLC_DATAFLOW_INACTIVITY_THRESHOLD_SECONDS", help = "Seconds of no telemetry before the dataflow is considered stalled.")]
    pub dataflow_inactivity_threshold_seconds: Option<u64>,

    #[clap(long, env = "PLC_TYPE", help = "PLC addressing mode: tcp or serial.")]
    pub plc_type: Option<String>,

    #[clap(long, env = "PLC_IP", help = "PLC IP address (tcp mode).")]
    pub plc_ip: Option<String>,

    #[clap(long, env = "PLC_TCP_PORT", help = "PLC TCP port (tcp mode).")]
    pub plc_port: Option<u16>,

    #[clap(long, env = "PLC_COM_PORT", help = "PLC serial port (serial mode).")]
    pub plc_com_port: Option<String>,

    #[clap(long, env = "PLC_BAUD_RATE", help = "PLC serial baud rate (serial mode).")]
    pub plc_baud_rate: Option<u32>,

    #[clap(long, env = "PLC_SLAVE", help = "Modbus slave id.")]
    pub plc_slave: Option<u8>,

    #[clap(long, env = "PLC_TIMEOUT_MS", help = "Endpoint-side PLC request timeout in milliseconds.")]
    pub plc_timeout_ms: Option<u64>,

    #[clap(long, env = "PLC_POLL_INTERVAL_MS", help = "Endpoint-side polling interval in milliseconds.")]
    pub plc_poll_interval_ms: Option<u64>,
}

impl ConfigOverlay {
    // Merge two overlays, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: ConfigOverlay) -> ConfigOverlay {
        ConfigOverlay {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            endpoint_url: other.endpoint_url.or(self.endpoint_url),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            history_cap: other.history_cap.or(self.history_cap),
            base_register: other.base_register.or(self.base_register),
            redis_url: other.redis_url.or(self.redis_url),
            redis_key_prefix: other.redis_key_prefix.or(self.redis_key_prefix),
            history_refresh_seconds: other.history_refresh_seconds.or(self.history_refresh_seconds),
            dataflow_check_interval_seconds: other
                .dataflow_check_interval_seconds
                .or(self.dataflow_check_interval_seconds),
            dataflow_inactivity_threshold_seconds: other
                .dataflow_inactivity_threshold_seconds
                .or(self.dataflow_inactivity_threshold_seconds),
            plc_type: other.plc_type.or(self.plc_type),
            plc_ip: other.plc_ip.or(self.plc_ip),
            plc_port: other.plc_port.or(self.plc_port),
            plc_com_port: other.plc_com_port.or(self.plc_com_port),
            plc_baud_rate: other.plc_baud_rate.or(self.plc_baud_rate),
            plc_slave: other.plc_slave.or(self.plc_slave),
            plc_timeout_ms: other.plc_timeout_ms.or(self.plc_timeout_ms),
            plc_poll_interval_ms: other.plc_poll_interval_ms.or(self.plc_poll_interval_ms),
        }
    }
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub endpoint_url: String,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub history_cap: usize,
    pub base_register: u16,
    pub redis_url: String,
    pub redis_key_prefix: String,
    pub history_refresh_seconds: u64,
    pub dataflow_check_interval_seconds: u64,
    pub dataflow_inactivity_threshold_seconds: u64,
    /// PLC addressing forwarded to the endpoint on connect, when present.
    pub plc: Option<PlcConfig>,
}

pub fn resolve(overlay: ConfigOverlay) -> Config {
    // Addressing is only forwarded when the operator configured a target;
    // serial wins only when no IP is given, matching the form's behavior.
    let plc = if overlay.plc_ip.is_some() || overlay.plc_com_port.is_some() {
        let mode = overlay
            .plc_type
            .clone()
            .unwrap_or_else(|| if overlay.plc_ip.is_some() { "tcp" } else { "serial" }.to_string());
        Some(PlcConfig {
            mode,
            ip: overlay.plc_ip,
            port: overlay.plc_port.or(Some(502)),
            com_port: overlay.plc_com_port,
            baud_rate: overlay.plc_baud_rate,
            slave: overlay.plc_slave.or(Some(1)),
            timeout: overlay.plc_timeout_ms,
            poll_interval: overlay.plc_poll_interval_ms,
        })
    } else {
        None
    };

    Config {
        port: overlay.port.unwrap_or(9002),
        log_dir: overlay.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: overlay.log_level.unwrap_or_else(|| "info".to_string()),
        endpoint_url: overlay
            .endpoint_url
            .unwrap_or_else(|| "ws://localhost:5000/ws".to_string()),
        reconnect_delay_ms: overlay.reconnect_delay_ms.unwrap_or(5000),
        request_timeout_ms: overlay.request_timeout_ms.unwrap_or(5000),
        history_cap: overlay.history_cap.unwrap_or(100),
        base_register: overlay.base_register.unwrap_or(0x6304),
        redis_url: overlay
            .redis_url
            .unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
        redis_key_prefix: overlay.redis_key_prefix.unwrap_or_else(|| "plc".to_string()),
        history_refresh_seconds: overlay.history_refresh_seconds.unwrap_or(60),
        dataflow_check_interval_seconds: overlay.dataflow_check_interval_seconds.unwrap_or(10),
        dataflow_inactivity_threshold_seconds: overlay
            .dataflow_inactivity_threshold_seconds
            .unwrap_or(60),
        plc,
    }
}

pub fn load_config() -> Config {
    // 1. Parse CLI to get a potential config_path override early
    let cli_args = ConfigOverlay::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_plc.conf"));

    // 2. Load from the config file if present
    let mut overlay = ConfigOverlay::default();
    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<ConfigOverlay>(&config_str) {
                Ok(file_overlay) => overlay = overlay.merge(file_overlay),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. Environment variables and CLI arguments override the file
    resolve(overlay.merge(cli_args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_observed_constants() {
        let config = resolve(ConfigOverlay::default());
        assert_eq!(config.port, 9002);
        assert_eq!(config.endpoint_url, "ws://localhost:5000/ws");
        assert_eq!(config.reconnect_delay_ms, 5000);
        assert_eq!(config.request_timeout_ms, 5000);
        assert_eq!(config.history_cap, 100);
        assert_eq!(config.base_register, 0x6304);
        assert!(config.plc.is_none());
    }

    #[test]
    fn later_overlay_wins_field_by_field() {
        let file: ConfigOverlay = serde_json::from_str(
            r#"{"port": 9100, "endpointUrl": "ws://bridge:5000/ws", "historyCap": 50}"#,
        )
        .unwrap();
        let cli = ConfigOverlay {
            port: Some(9200),
            ..Default::default()
        };

        let config = resolve(file.merge(cli));
        assert_eq!(config.port, 9200);
        assert_eq!(config.endpoint_url, "ws://bridge:5000/ws");
        assert_eq!(config.history_cap, 50);
    }

    #[test]
    fn tcp_addressing_is_built_when_an_ip_is_given() {
        let overlay: ConfigOverlay =
            serde_json::from_str(r#"{"plcIp": "192.168.1.10", "plcSlave": 3}"#).unwrap();
        let plc = resolve(overlay).plc.expect("addressing expected");
        assert_eq!(plc.mode, "tcp");
        assert_eq!(plc.ip.as_deref(), Some("192.168.1.10"));
        assert_eq!(plc.port, Some(502));
        assert_eq!(plc.slave, Some(3));
    }

    #[test]
    fn serial_addressing_is_built_from_the_com_port() {
        let overlay: ConfigOverlay =
            serde_json::from_str(r#"{"plcComPort": "/dev/ttyUSB0", "plcBaudRate": 19200}"#)
                .unwrap();
        let plc = resolve(overlay).plc.expect("addressing expected");
        assert_eq!(plc.mode, "serial");
        assert_eq!(plc.com_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(plc.baud_rate, Some(19200));
    }
}

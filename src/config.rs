//! Configuration loading and defaults (§6 ambient stack).
//!
//! Resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BRIDGE_SSID`, `BRIDGE_PWD` (the two most
//!    operationally relevant fields — join credentials change more often
//!    than anything else here, mirroring `SCTL_API_KEY`/`SCTL_LISTEN`).
//! 2. **Config file** — path via `--config <path>`, or `bridge.toml` in CWD.
//! 3. **Compiled defaults** — see each field's default value below.
//!
//! ```toml
//! [uart]
//! port = "/dev/ttyUSB0"          # omit to autodetect
//! baud = 115200                  # omit to autodetect
//! candidate_ports = ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]
//! candidate_bauds = [115200, 9600, 230400, 57600]
//! max_line_bytes = 512
//!
//! [wifi]
//! ssid = "my-network"
//! password = "my-password"
//! mode = 1                       # AT+CWMODE
//! static_ip = false
//! ip = "192.168.1.50"
//! gateway = "192.168.1.1"
//! netmask = "255.255.255.0"
//!
//! [tcp]
//! role = "client"                # "client" dials out, "server" listens
//! host = "203.0.113.10"
//! port = 9000
//! multiplex = false
//! transparent = false
//!
//! [rates]
//! bytes_per_sec = 4096
//! msgs_per_sec = 10
//! inter_cmd_gap_ms = 20
//!
//! [send]
//! window_size = 8
//! max_inflight_sends = 1
//! msg_ack_timeout_ms = 5000
//! max_retries = 3
//!
//! [watchdog]
//! check_interval_ms = 2000
//! idle_ms = 10000
//! max_fails_before_hard = 3
//! reset_pin = 17                 # omit to disable hard reset
//!
//! [send_at]
//! max_bytes = 4096
//! chunk_size = 256
//! max_line = 512
//! ```

use serde::Deserialize;

use crate::error::BridgeError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub uart: UartConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub rates: RatesConfig,
    #[serde(default)]
    pub send: SendConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub send_at: SendAtConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory `backups/copy-<filename>` is written under (default `.`).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// UART port selection and autodetect candidates (C2, §4.2).
#[derive(Debug, Clone, Deserialize)]
pub struct UartConfig {
    /// Explicit port path. If unset, autodetect tries `candidate_ports`.
    pub port: Option<String>,
    /// Explicit baud rate. If unset, autodetect tries `candidate_bauds`.
    pub baud: Option<u32>,
    #[serde(default = "default_candidate_ports")]
    pub candidate_ports: Vec<String>,
    #[serde(default = "default_candidate_bauds")]
    pub candidate_bauds: Vec<u32>,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

/// Wi-Fi join and optional static IP configuration (C9).
#[derive(Debug, Clone, Deserialize)]
pub struct WifiConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    /// `AT+CWMODE` value: 1 (station) or 3 (station + AP).
    #[serde(default = "default_wifi_mode")]
    pub mode: u8,
    #[serde(default)]
    pub static_ip: bool,
    pub ip: Option<String>,
    pub gateway: Option<String>,
    pub netmask: Option<String>,
}

/// TCP peer role (client dials, server listens) and transparent mode.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_tcp_role")]
    pub role: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default)]
    pub multiplex: bool,
    #[serde(default)]
    pub transparent: bool,
}

impl TcpConfig {
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.role.eq_ignore_ascii_case("server")
    }
}

/// Byte/message rate limiters (C1, §3).
#[derive(Debug, Clone, Deserialize)]
pub struct RatesConfig {
    #[serde(default = "default_bytes_per_sec")]
    pub bytes_per_sec: u64,
    #[serde(default = "default_msgs_per_sec")]
    pub msgs_per_sec: u64,
    #[serde(default = "default_inter_cmd_gap_ms")]
    pub inter_cmd_gap_ms: u64,
}

/// Send pipeline and ack/retry tracker tuning (C6, C7).
#[derive(Debug, Clone, Deserialize)]
pub struct SendConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_max_inflight_sends")]
    pub max_inflight_sends: usize,
    #[serde(default = "default_msg_ack_timeout_ms")]
    pub msg_ack_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Watchdog escalation tuning (C8).
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_check_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_watchdog_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_max_fails_before_hard")]
    pub max_fails_before_hard: u32,
    /// GPIO line driven low/high for hard reset. Unset disables hard reset;
    /// the ladder then stops at soft recovery (§4.8).
    pub reset_pin: Option<u32>,
}

/// Byte-budgeted reader tuning (§9 "byte-budget reader").
#[derive(Debug, Clone, Deserialize)]
pub struct SendAtConfig {
    #[serde(default = "default_send_at_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_send_at_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_send_at_max_line")]
    pub max_line: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    ".".to_string()
}
fn default_candidate_ports() -> Vec<String> {
    vec!["/dev/ttyUSB0".into(), "/dev/ttyUSB1".into(), "/dev/ttyUSB2".into()]
}
fn default_candidate_bauds() -> Vec<u32> {
    vec![115200, 9600, 230400, 57600]
}
fn default_max_line_bytes() -> usize {
    512
}
fn default_wifi_mode() -> u8 {
    1
}
fn default_tcp_role() -> String {
    "client".to_string()
}
fn default_tcp_port() -> u16 {
    9000
}
fn default_bytes_per_sec() -> u64 {
    4096
}
fn default_msgs_per_sec() -> u64 {
    10
}
fn default_inter_cmd_gap_ms() -> u64 {
    20
}
fn default_window_size() -> usize {
    8
}
fn default_max_inflight_sends() -> usize {
    1
}
fn default_msg_ack_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_watchdog_check_ms() -> u64 {
    2000
}
fn default_watchdog_idle_ms() -> u64 {
    10_000
}
fn default_max_fails_before_hard() -> u32 {
    3
}
fn default_send_at_max_bytes() -> usize {
    4096
}
fn default_send_at_chunk_size() -> usize {
    256
}
fn default_send_at_max_line() -> usize {
    512
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: None,
            candidate_ports: default_candidate_ports(),
            candidate_bauds: default_candidate_bauds(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            mode: default_wifi_mode(),
            static_ip: false,
            ip: None,
            gateway: None,
            netmask: None,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            role: default_tcp_role(),
            host: String::new(),
            port: default_tcp_port(),
            multiplex: false,
            transparent: false,
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            bytes_per_sec: default_bytes_per_sec(),
            msgs_per_sec: default_msgs_per_sec(),
            inter_cmd_gap_ms: default_inter_cmd_gap_ms(),
        }
    }
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_inflight_sends: default_max_inflight_sends(),
            msg_ack_timeout_ms: default_msg_ack_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_watchdog_check_ms(),
            idle_ms: default_watchdog_idle_ms(),
            max_fails_before_hard: default_max_fails_before_hard(),
            reset_pin: None,
        }
    }
}

impl Default for SendAtConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_send_at_max_bytes(),
            chunk_size: default_send_at_chunk_size(),
            max_line: default_send_at_max_line(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uart: UartConfig::default(),
            wifi: WifiConfig::default(),
            tcp: TcpConfig::default(),
            rates: RatesConfig::default(),
            send: SendConfig::default(),
            watchdog: WatchdogConfig::default(),
            send_at: SendAtConfig::default(),
            logging: LoggingConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self, BridgeError> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| BridgeError::Config(format!("reading {p}: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| BridgeError::Config(format!("parsing {p}: {e}")))?
        } else if std::path::Path::new("bridge.toml").exists() {
            let content = std::fs::read_to_string("bridge.toml")
                .map_err(|e| BridgeError::Config(format!("reading bridge.toml: {e}")))?;
            toml::from_str(&content)
                .map_err(|e| BridgeError::Config(format!("parsing bridge.toml: {e}")))?
        } else {
            Config::default()
        };

        if let Ok(ssid) = std::env::var("BRIDGE_SSID") {
            config.wifi.ssid = ssid;
        }
        if let Ok(pwd) = std::env::var("BRIDGE_PWD") {
            config.wifi.password = pwd;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_candidate_lists() {
        let cfg = Config::default();
        assert_eq!(cfg.uart.candidate_ports.len(), 3);
        assert_eq!(cfg.uart.candidate_bauds, vec![115200, 9600, 230400, 57600]);
    }

    #[test]
    fn env_overrides_win_over_defaults() {
        std::env::set_var("BRIDGE_SSID", "test-ssid");
        std::env::set_var("BRIDGE_PWD", "test-pwd");
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.wifi.ssid, "test-ssid");
        assert_eq!(cfg.wifi.password, "test-pwd");
        std::env::remove_var("BRIDGE_SSID");
        std::env::remove_var("BRIDGE_PWD");
    }

    #[test]
    fn missing_config_file_returns_error_not_panic() {
        let err = Config::load(Some("/nonexistent/path.toml")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}

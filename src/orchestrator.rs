//! C9: the connection orchestrator (§4.9). Drives the modem from cold boot
//! through the fixed AT sequence in §6's command table. Step-by-step
//! progress is logged via `tracing::info!`, matching the teacher's
//! `tracing` usage throughout `lte.rs`/the old `modem.rs` rather than bare
//! stdout (§7: "orchestrator reports step-by-step progress").

use std::sync::Arc;

use tracing::{error, info};

use crate::at_engine::{AtEngine, OK_ALREADY_OR_ERROR, OK_ALREADY_OR_FAIL, OK_ONLY, PROMPT_ONLY};
use crate::clock::TokenBucket;
use crate::config::{Config, TcpConfig, WifiConfig};
use crate::state::{ConnectionState, LinkState};
use crate::tokens::SharedTokens;
use crate::uart::UartPort;

const STEP_TIMEOUT_MS: u64 = 8_000;
const CWJAP_TIMEOUT_MS: u64 = 20_000;

pub struct Orchestrator {
    pub at: Arc<AtEngine>,
    pub uart: Arc<UartPort>,
    pub link: Arc<LinkState>,
    pub tokens: SharedTokens,
    pub msg_bucket: Arc<TokenBucket>,
}

impl Orchestrator {
    /// Run the full cold-boot sequence (§4.9). Returns the terminal
    /// `ConnectionState` reached, or `None` on the first failed step —
    /// callers clear `TRANSPARENT_MODE/READY` on failure.
    pub async fn connect(&self, cfg: &Config) -> Option<ConnectionState> {
        info!("orchestrator: starting connection sequence");

        self.step("AT", OK_ONLY, STEP_TIMEOUT_MS).await?;
        self.step("ATE0", OK_ONLY, STEP_TIMEOUT_MS).await?;
        info!("orchestrator: modem responsive (AtReady)");

        self.join_wifi(&cfg.wifi).await?;
        info!("orchestrator: wifi joined");

        if cfg.wifi.static_ip {
            if let (Some(ip), Some(gw), Some(mask)) =
                (&cfg.wifi.ip, &cfg.wifi.gateway, &cfg.wifi.netmask)
            {
                let cmd = format!(r#"AT+CIPSTA="{ip}","{gw}","{mask}""#);
                self.step(&cmd, OK_ONLY, STEP_TIMEOUT_MS).await?;
            }
        }

        let mux_flag = u8::from(cfg.tcp.multiplex);
        self.step(&format!("AT+CIPMUX={mux_flag}"), OK_ONLY, STEP_TIMEOUT_MS).await?;

        let state = self.open_tcp(&cfg.tcp).await?;
        info!("orchestrator: tcp open");

        if cfg.tcp.transparent && !cfg.tcp.is_server() {
            self.step("AT+CIPMODE=1", OK_ONLY, STEP_TIMEOUT_MS).await?;
            let outcome = self.step("AT+CIPSEND", PROMPT_ONLY, STEP_TIMEOUT_MS).await?;
            if outcome == ">" {
                self.link.set_transparent(true, true);
                info!("orchestrator: transparent mode ready");
                return Some(ConnectionState::Transparent);
            }
        }

        let _ = state;
        Some(ConnectionState::Normal)
    }

    async fn join_wifi(&self, wifi: &WifiConfig) -> Option<()> {
        self.step(&format!("AT+CWMODE={}", wifi.mode), OK_ONLY, STEP_TIMEOUT_MS).await?;
        let cmd = format!(r#"AT+CWJAP="{}","{}""#, wifi.ssid, wifi.password);
        self.step(&cmd, OK_ALREADY_OR_FAIL, CWJAP_TIMEOUT_MS).await?;
        Some(())
    }

    async fn open_tcp(&self, tcp: &TcpConfig) -> Option<ConnectionState> {
        if tcp.is_server() {
            self.step(&format!("AT+CIPSERVER=1,{}", tcp.port), OK_ONLY, STEP_TIMEOUT_MS).await?;
        } else {
            let cmd = format!(r#"AT+CIPSTART="TCP","{}",{}"#, tcp.host, tcp.port);
            self.step(&cmd, OK_ALREADY_OR_ERROR, STEP_TIMEOUT_MS).await?;
        }
        Some(ConnectionState::TcpOpen)
    }

    /// Issue one step and log the outcome. Returns `None` (propagated via
    /// `?` at call sites) on failure so the whole sequence aborts per §4.9.
    async fn step(&self, cmd: &str, expect: &[&'static str], timeout_ms: u64) -> Option<&'static str> {
        match self
            .at
            .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, cmd, expect, timeout_ms, false)
            .await
        {
            Ok(token) => {
                info!(cmd, token, "orchestrator step ok");
                Some(token)
            }
            Err(e) => {
                error!(cmd, error = %e, "orchestrator step failed, aborting sequence");
                self.link.set_transparent(false, false);
                None
            }
        }
    }
}

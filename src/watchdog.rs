//! C8: the link watchdog (§4.8). Detects the idle-RX-while-TX condition and
//! escalates: escape → probe → soft counter → hard reset. Soft-counter
//! reset-on-success mirrors the teacher's `supervisor.rs::run_supervisor`
//! exponential-backoff-with-reset-on-stability loop (stable uptime resets
//! backoff to 1; here, a successful probe resets `CONSEC_FAILS` to 0).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::at_engine::{AtEngine, OK_ONLY};
use crate::clock::TokenBucket;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::state::LinkState;
use crate::tokens::SharedTokens;
use crate::uart::UartPort;

/// A GPIO line the watchdog drives for a hard reset. Implementations live
/// outside the engine (pin wiring is explicitly out of scope, §1); the
/// watchdog only needs to pulse it low then high.
pub trait ResetPin: Send + Sync {
    fn set_low(&self);
    fn set_high(&self);
}

/// No-op reset pin used when no hardware line is configured — the ladder
/// then stops at soft recovery (§4.8 step 4).
pub struct NoResetPin;

impl ResetPin for NoResetPin {
    fn set_low(&self) {}
    fn set_high(&self) {}
}

pub struct Watchdog {
    pub at: Arc<AtEngine>,
    pub uart: Arc<UartPort>,
    pub link: Arc<LinkState>,
    pub tokens: SharedTokens,
    pub msg_bucket: Arc<TokenBucket>,
    pub reset_pin: Option<Arc<dyn ResetPin>>,
    pub max_fails_before_hard: u32,
    pub check_interval_ms: u64,
    pub idle_ms: u64,
}

impl Watchdog {
    /// Run the periodic check forever (§4.8).
    pub async fn run(&self, cfg: &Config) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.check_interval_ms));
        loop {
            ticker.tick().await;
            self.check_once(cfg).await;
        }
    }

    async fn check_once(&self, cfg: &Config) {
        let tx_age = self.link.tx_age_ms();
        let rx_age = self.link.rx_age_ms();

        if !(tx_age < self.idle_ms && rx_age > self.idle_ms) {
            return;
        }

        warn!(tx_age, rx_age, "watchdog: link idle while transmitting, escalating");
        self.escape().await;
        let probe_ok = self.probe(cfg).await;

        if probe_ok {
            self.link.record_probe_success();
            info!("watchdog: soft recovery succeeded");
            return;
        }

        let fails = self.link.record_probe_failure();
        warn!(fails, "watchdog: probe failed");

        if fails >= self.max_fails_before_hard {
            if let Some(pin) = &self.reset_pin {
                self.hard_reset(pin.as_ref(), cfg).await;
            } else {
                warn!("watchdog: hard reset threshold reached but no reset pin configured, staying on soft recovery");
            }
        }
    }

    /// Step 1: write `+++` and wait 1.2s (§4.8).
    async fn escape(&self) {
        let _ = self.uart.write(b"+++").await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
    }

    /// Step 2: reopen via the transparent-mode ladder if transparent was
    /// active, else a bare `AT` probe.
    async fn probe(&self, cfg: &Config) -> bool {
        if self.link.is_transparent_ready() && cfg.tcp.transparent {
            return self.probe_transparent(cfg).await;
        }
        self.at
            .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, "AT", OK_ONLY, 5_000, false)
            .await
            .is_ok()
    }

    async fn probe_transparent(&self, cfg: &Config) -> bool {
        let steps: &[(&str, &[&'static str])] = &[
            ("AT", OK_ONLY),
            ("AT+CIPMODE=1", OK_ONLY),
            ("AT+CIPMODE?", OK_ONLY),
        ];
        for (cmd, expect) in steps {
            if self
                .at
                .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, cmd, expect, 5_000, false)
                .await
                .is_err()
            {
                self.link.set_transparent(false, false);
                return false;
            }
        }

        let start_cmd = format!(r#"AT+CIPSTART="TCP","{}",{}"#, cfg.tcp.host, cfg.tcp.port);
        if self
            .at
            .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, &start_cmd, crate::at_engine::OK_ALREADY_OR_ERROR, 8_000, false)
            .await
            .is_err()
        {
            self.link.set_transparent(false, false);
            return false;
        }

        let prompt_ok = self
            .at
            .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, "AT+CIPSEND", crate::at_engine::PROMPT_ONLY, 5_000, false)
            .await
            .is_ok();
        if prompt_ok {
            self.link.set_transparent(true, true);
        } else {
            self.link.set_transparent(false, false);
        }
        prompt_ok
    }

    /// Step 4: toggle the enable pin and rerun the full connection sequence
    /// via C9 (§4.8).
    async fn hard_reset(&self, pin: &dyn ResetPin, cfg: &Config) {
        error!("watchdog: escalating to hard reset");
        pin.set_low();
        tokio::time::sleep(Duration::from_millis(300)).await;
        pin.set_high();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let orchestrator = Orchestrator {
            at: self.at.clone(),
            uart: self.uart.clone(),
            link: self.link.clone(),
            tokens: self.tokens.clone(),
            msg_bucket: self.msg_bucket.clone(),
        };
        if orchestrator.connect(cfg).await.is_some() {
            self.link.record_probe_success();
            info!("watchdog: hard reset recovered the link");
        } else {
            error!("watchdog: hard reset did not recover the link");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_reset_pin_is_a_harmless_no_op() {
        let pin = NoResetPin;
        pin.set_low();
        pin.set_high();
    }
}

//! C6: the windowed, rate-limited outbound send pipeline (§4.6).
//!
//! Two interlocked limits bound contention intentionally (§9): the
//! in-flight semaphore (`MAX_INFLIGHT_SENDS`) bounds UART/modem buffer
//! pressure, and the pending window (`WINDOW_SIZE`) bounds outstanding
//! server-side work. Neither is folded into the other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::activity::OutcomeLog;
use crate::at_engine::{AtEngine, OK_ONLY, PROMPT_ONLY};
use crate::clock::TokenBucket;
use crate::pending::PendingSet;
use crate::state::LinkState;
use crate::tokens::SharedTokens;
use crate::uart::UartPort;

/// Pacing delay after a successful send, to prevent modem frame
/// interleaving (§4.6 step 8).
const POST_SEND_PACING_MS: u64 = 15;

pub struct OutboundItem {
    pub id: i64,
    pub payload: Vec<u8>,
}

/// Shared resources the send pipeline needs, assembled by `bridge.rs`.
pub struct SendPipeline {
    pub at: Arc<AtEngine>,
    pub uart: Arc<UartPort>,
    pub link: Arc<LinkState>,
    pub tokens: SharedTokens,
    pub msg_bucket: Arc<TokenBucket>,
    pub byte_bucket: Arc<TokenBucket>,
    pub pending: Arc<tokio::sync::Mutex<PendingSet>>,
    pub inflight: Arc<Semaphore>,
    pub outcomes: Arc<OutcomeLog>,
    pub multiplex: bool,
    pub link_id: u8,
    pub send_timeout_ms: u64,
    /// Re-enqueue target for the ack/retry tracker (C7) and for this
    /// pipeline's own failed-send path is the same FIFO queue (§4.7: "the
    /// outbound queue is FIFO; retries are appended at the tail").
    pub outbound: mpsc::Sender<OutboundItem>,
}

impl SendPipeline {
    /// Drain `outbound` forever, sending one message at a time per the
    /// window/semaphore/rate limits (§4.6).
    pub async fn run(&self, mut outbound: mpsc::Receiver<OutboundItem>) {
        while let Some(item) = outbound.recv().await {
            self.send_one(item).await;
        }
    }

    /// Poll interval while blocked on window back-pressure (§4.6 step 1).
    const WINDOW_POLL_MS: u64 = 25;

    async fn send_one(&self, item: OutboundItem) {
        while self.pending.lock().await.is_full() {
            tokio::time::sleep(Duration::from_millis(Self::WINDOW_POLL_MS)).await;
        }
        let _permit = self.inflight.acquire().await.expect("semaphore never closed");

        self.msg_bucket.consume(1).await;
        self.byte_bucket.consume(item.payload.len() as u64).await;

        if self.link.is_transparent_ready() {
            return self.send_transparent(item).await;
        }

        let cmd = if self.multiplex {
            format!("AT+CIPSEND={},{}", self.link_id, item.payload.len())
        } else {
            format!("AT+CIPSEND={}", item.payload.len())
        };

        let prompt = self
            .at
            .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, &cmd, PROMPT_ONLY, self.send_timeout_ms, false)
            .await;
        if let Err(e) = prompt {
            warn!(id = item.id, error = %e, "cipsend prompt not observed, dropping send attempt");
            self.outcomes
                .error_q
                .push(self.link.now_ms(), format!("send {}: no > prompt ({e})", item.id))
                .await;
            return;
        }

        if let Err(e) = self.uart.write(&item.payload).await {
            warn!(id = item.id, error = %e, "payload write failed");
            self.outcomes.error_q.push(self.link.now_ms(), format!("send {}: write failed ({e})", item.id)).await;
            return;
        }
        self.link.mark_tx();

        match self.at.wait_token(&self.tokens, "SEND OK", self.send_timeout_ms).await {
            Ok(()) => {
                let now = self.link.now_ms();
                self.pending.lock().await.mark_sent(item.id, now);
                self.outcomes.success_q.push(now, format!("sent {}", item.id)).await;
                tokio::time::sleep(Duration::from_millis(POST_SEND_PACING_MS)).await;
            }
            Err(e) => {
                warn!(id = item.id, error = %e, "no SEND OK observed, not tracking for ack");
                self.outcomes.error_q.push(self.link.now_ms(), format!("send {}: no SEND OK ({e})", item.id)).await;
            }
        }
    }

    /// Transparent mode bypasses `CIPSEND` entirely; on failure, demote to
    /// normal mode via the AT engine (§4.6 "Transparent mode variant").
    async fn send_transparent(&self, item: OutboundItem) {
        if let Err(e) = self.uart.write(&item.payload).await {
            warn!(id = item.id, error = %e, "transparent write failed, demoting to normal mode");
            self.link.set_transparent(false, false);
            let _ = self
                .at
                .send_at(&self.uart, &self.link, &self.tokens, &self.msg_bucket, "AT+CIPMODE=0", OK_ONLY, self.send_timeout_ms, false)
                .await;
            self.outcomes.error_q.push(self.link.now_ms(), format!("send {}: transparent write failed ({e})", item.id)).await;
            return;
        }
        self.link.mark_tx();
        let now = self.link.now_ms();
        self.pending.lock().await.mark_sent(item.id, now);
        self.outcomes.success_q.push(now, format!("sent {} (transparent)", item.id)).await;
        info!(id = item.id, "transparent payload written");
    }
}

//! Assembles C1–C9 into one running engine (§2, §5 ambient stack).
//!
//! Mirrors how the teacher's `main.rs` builds `AppState` and spawns the
//! tunnel client task, the sweep task, and the relay dead-device sweep task
//! as independent `tokio::spawn`s coordinated through shared `Arc` state —
//! here the tasks are the UART reader (C4), the send pipeline (C6), the
//! ack/retry tracker (C7), and the watchdog (C8), with C9 run once up front.
//!
//! Per §5, the whole engine is meant to run on a single-worker
//! current-thread runtime (`#[tokio::main(flavor = "current_thread")]` in
//! the two binaries) so that "no shared memory crosses threads" holds
//! without extra synchronization beyond what the spec names.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ack_tracker::{AckTracker, PayloadCache};
use crate::activity::OutcomeLog;
use crate::at_engine::AtEngine;
use crate::clock::TokenBucket;
use crate::config::Config;
use crate::demux::{Demux, Inbound};
use crate::error::BridgeError;
use crate::message::{Message, TestMessage};
use crate::orchestrator::Orchestrator;
use crate::pending::PendingSet;
use crate::send_pipeline::{OutboundItem, SendPipeline};
use crate::state::{ConnectionState, LinkState};
use crate::tokens::TokenRegistry;
use crate::uart::UartPort;
use crate::watchdog::{ResetPin, Watchdog};

/// The running engine's public surface: `send`, the inbound message
/// channel, and task handles for shutdown (§1 "the core exposes them
/// `send(payload)`, an inbound message channel, and a lifecycle handle").
pub struct Bridge {
    link: Arc<LinkState>,
    pending: Arc<Mutex<PendingSet>>,
    payloads: Arc<PayloadCache>,
    outcomes: Arc<OutcomeLog>,
    outbound: mpsc::Sender<OutboundItem>,
    next_id: AtomicI64,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Open the UART (explicit or autodetected), run the connection
    /// orchestrator once, and spawn the reader/send/ack/watchdog tasks.
    /// Returns the bridge handle plus the inbound message channel.
    pub async fn start(cfg: Config, reset_pin: Option<Arc<dyn ResetPin>>) -> Result<(Self, mpsc::Receiver<Inbound>), BridgeError> {
        let uart = Arc::new(match (&cfg.uart.port, cfg.uart.baud) {
            (Some(port), Some(baud)) => UartPort::open(port, baud)?,
            _ => UartPort::autodetect(&cfg.uart.candidate_ports, &cfg.uart.candidate_bauds).await?,
        });

        let link = Arc::new(LinkState::new());
        let tokens = Arc::new(Mutex::new(TokenRegistry::new()));
        let msg_bucket = Arc::new(TokenBucket::new(cfg.rates.msgs_per_sec));
        let byte_bucket = Arc::new(TokenBucket::new(cfg.rates.bytes_per_sec));
        let at = Arc::new(AtEngine::new(cfg.rates.inter_cmd_gap_ms));
        let outcomes = Arc::new(OutcomeLog::new(256));
        let pending = Arc::new(Mutex::new(PendingSet::new(cfg.send.window_size)));
        let payloads = Arc::new(PayloadCache::new());
        let inflight = Arc::new(tokio::sync::Semaphore::new(cfg.send.max_inflight_sends));

        let orchestrator = Orchestrator {
            at: at.clone(),
            uart: uart.clone(),
            link: link.clone(),
            tokens: tokens.clone(),
            msg_bucket: msg_bucket.clone(),
        };
        let connected = orchestrator.connect(&cfg).await;
        match connected {
            Some(state) => info!(?state, "bridge: connection sequence complete"),
            None => warn!("bridge: connection sequence failed at startup, watchdog will retry"),
        }

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundItem>(256);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(256);
        let (app_tx, app_rx) = mpsc::channel::<Inbound>(256);

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(reader_loop(
            uart.clone(),
            link.clone(),
            tokens.clone(),
            inbound_tx,
            cfg.uart.max_line_bytes,
        )));

        tasks.push(tokio::spawn(inbound_router(
            inbound_rx,
            app_tx,
            pending.clone(),
            payloads.clone(),
        )));

        let send_pipeline = SendPipeline {
            at: at.clone(),
            uart: uart.clone(),
            link: link.clone(),
            tokens: tokens.clone(),
            msg_bucket: msg_bucket.clone(),
            byte_bucket,
            pending: pending.clone(),
            inflight,
            outcomes: outcomes.clone(),
            multiplex: cfg.tcp.multiplex,
            link_id: 0,
            send_timeout_ms: 8_000,
            outbound: outbound_tx.clone(),
        };
        tasks.push(tokio::spawn(async move { send_pipeline.run(outbound_rx).await }));

        let ack_tracker = AckTracker {
            pending: pending.clone(),
            payloads: payloads.clone(),
            link: link.clone(),
            outcomes: outcomes.clone(),
            outbound: outbound_tx.clone(),
            ack_timeout_ms: cfg.send.msg_ack_timeout_ms,
            max_retries: cfg.send.max_retries,
            check_interval_ms: 1_000,
        };
        tasks.push(tokio::spawn(async move { ack_tracker.run().await }));

        let watchdog = Watchdog {
            at,
            uart,
            link: link.clone(),
            tokens,
            msg_bucket,
            reset_pin,
            max_fails_before_hard: cfg.watchdog.max_fails_before_hard,
            check_interval_ms: cfg.watchdog.check_interval_ms,
            idle_ms: cfg.watchdog.idle_ms,
        };
        let watchdog_cfg = cfg.clone();
        tasks.push(tokio::spawn(async move { watchdog.run(&watchdog_cfg).await }));

        Ok((
            Self { link, pending, payloads, outcomes, outbound: outbound_tx, next_id: AtomicI64::new(1), tasks },
            app_rx,
        ))
    }

    /// Allocate the next application-level Id (monotonic for this process).
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a `Test` request envelope for `payload`, cache it for retry,
    /// and enqueue it on the send pipeline. Returns `None` for empty
    /// payloads (the checksum is undefined there, §6).
    pub async fn send_test(&self, payload: &[u8]) -> Option<i64> {
        let id = self.next_id();
        let msg = TestMessage::request(id, payload)?;
        let mut bytes = serde_json::to_vec(&Message::Test(msg)).ok()?;
        bytes.extend_from_slice(b"\r\n");
        self.enqueue(id, bytes).await;
        Some(id)
    }

    /// Low-level enqueue for callers that build their own envelope (e.g.
    /// the `Files` sub-protocol demo consumer).
    pub async fn enqueue(&self, id: i64, payload: Vec<u8>) {
        self.payloads.remember(id, payload.clone()).await;
        let _ = self.outbound.send(OutboundItem { id, payload }).await;
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        if self.link.is_transparent_ready() {
            ConnectionState::Transparent
        } else {
            ConnectionState::Normal
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[must_use]
    pub fn outcomes(&self) -> &OutcomeLog {
        &self.outcomes
    }

    /// Abort every spawned task (§5 "task cancellation is used only at
    /// shutdown; handlers must treat cancellation as a clean exit").
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// C4's task: the sole UART reader. Pumps bytes into the demux, which
/// resolves tokens and forwards decoded messages onto `inbound_tx`.
async fn reader_loop(
    uart: Arc<UartPort>,
    link: Arc<LinkState>,
    tokens: crate::tokens::SharedTokens,
    inbound_tx: mpsc::Sender<Inbound>,
    max_line_bytes: usize,
) {
    let mut demux = Demux::new(max_line_bytes);
    loop {
        match uart.read(4096).await {
            Ok(bytes) if !bytes.is_empty() => {
                demux.feed(&bytes, &link, &tokens, &inbound_tx).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "uart read error in reader loop");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

/// Routes every decoded inbound message to the ack/retry tracker (to clear
/// `pending` on a `Test` reply) and then forwards it to the application.
async fn inbound_router(
    mut inbound_rx: mpsc::Receiver<Inbound>,
    app_tx: mpsc::Sender<Inbound>,
    pending: Arc<Mutex<PendingSet>>,
    payloads: Arc<PayloadCache>,
) {
    while let Some((link_id, message)) = inbound_rx.recv().await {
        if let Message::Test(test) = &message {
            if test.rsp_received_ok {
                pending.lock().await.acknowledge(test.id);
                payloads.forget(test.id).await;
            }
        }
        if app_tx.send((link_id, message)).await.is_err() {
            break;
        }
    }
}

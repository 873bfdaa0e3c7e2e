//! Shared, lock-free link state mutated by exactly one task each (§5):
//! `LAST_TX_MS`/`LAST_RX_MS` by the AT engine and send pipeline, `CONSEC_FAILS`
//! by the watchdog, and the transparent-mode flags by the orchestrator and
//! send pipeline. Atomics are used instead of a mutex since the cooperative
//! single-threaded model only needs visibility, not exclusion.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic reference point all `*_ms` timestamps are relative to.
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let ms = self.epoch.elapsed().as_millis() as u64;
        ms
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state machine (§3): `Cold -> AtReady -> WifiJoined -> TcpOpen ->
/// (Normal | Transparent)`. Every transition is idempotent on repeated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Cold,
    AtReady,
    WifiJoined,
    TcpOpen,
    Normal,
    Transparent,
}

/// Shared link timestamps, failure counters, and mode flags.
pub struct LinkState {
    pub clock: Clock,
    pub last_tx_ms: AtomicU64,
    pub last_rx_ms: AtomicU64,
    pub consec_fails: AtomicU32,
    pub transparent_mode: AtomicBool,
    pub transparent_ready: AtomicBool,
}

impl LinkState {
    #[must_use]
    pub fn new() -> Self {
        let clock = Clock::new();
        let now = clock.now_ms();
        Self {
            clock,
            last_tx_ms: AtomicU64::new(now),
            last_rx_ms: AtomicU64::new(now),
            consec_fails: AtomicU32::new(0),
            transparent_mode: AtomicBool::new(false),
            transparent_ready: AtomicBool::new(false),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn mark_tx(&self) {
        self.last_tx_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn mark_rx(&self) {
        self.last_rx_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn tx_age_ms(&self) -> u64 {
        self.now_ms().saturating_sub(self.last_tx_ms.load(Ordering::Relaxed))
    }

    pub fn rx_age_ms(&self) -> u64 {
        self.now_ms().saturating_sub(self.last_rx_ms.load(Ordering::Relaxed))
    }

    pub fn is_transparent_ready(&self) -> bool {
        self.transparent_ready.load(Ordering::Relaxed)
    }

    pub fn set_transparent(&self, mode: bool, ready: bool) {
        self.transparent_mode.store(mode, Ordering::Relaxed);
        self.transparent_ready.store(ready, Ordering::Relaxed);
    }

    pub fn consec_fails(&self) -> u32 {
        self.consec_fails.load(Ordering::Relaxed)
    }

    pub fn record_probe_failure(&self) -> u32 {
        self.consec_fails.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_probe_success(&self) {
        self.consec_fails.store(0, Ordering::Relaxed);
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

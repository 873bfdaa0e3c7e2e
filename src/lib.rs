#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! uartbridge library — a cooperative, single-threaded UART⇄AT⇄TCP bridge
//! for ESP-AT Wi-Fi modems.
//!
//! This library re-exports the building blocks assembled by `bridge::Bridge`:
//! - `uart` — non-blocking serial port (C2)
//! - `tokens` — pending-token registry (C3)
//! - `demux` — UART reader/demultiplexer (C4)
//! - `at_engine` — serialized AT command engine (C5)
//! - `send_pipeline` — windowed, rate-limited outbound sends (C6)
//! - `ack_tracker` / `pending` — ack/retry tracking (C7)
//! - `watchdog` — idle-link detection and reset escalation (C8)
//! - `orchestrator` — cold-boot AT sequence (C9)
//! - `clock` — monotonic clock and token-bucket rate limiting (C1)
//! - `config` — configuration loading
//! - `activity` — in-memory success/error logs
//! - `message` / `checksum` — the application wire envelope

pub mod ack_tracker;
pub mod activity;
pub mod at_engine;
pub mod bridge;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod demux;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod pending;
pub mod send_pipeline;
pub mod state;
pub mod tokens;
pub mod uart;
pub mod watchdog;

// Re-export key types at crate root for convenience.
pub use activity::OutcomeLog;
pub use bridge::Bridge;
pub use config::Config;
pub use error::BridgeError;
pub use state::{ConnectionState, LinkState};

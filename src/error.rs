//! Engine error taxonomy (§7): Transport-timeout, Protocol-error,
//! Frame-corruption, Decode-error, Link-idle, and Autodetect-fatal are all
//! locally recoverable except the last, so a flat match-based enum is used
//! instead of `anyhow`-style dynamic errors — mirroring the teacher's
//! `ConnectError { Permanent, Transient }` split in `tunnel/client.rs`
//! (fatal vs. retryable), without needing arbitrary-source chaining since
//! every variant here is a leaf.

use std::fmt;

#[derive(Debug)]
pub enum BridgeError {
    /// An expected AT token did not arrive within its budget.
    TransportTimeout { command: String, timeout_ms: u64 },
    /// The modem replied with `ERROR`, `FAIL`, or `SEND FAIL`.
    Protocol { command: String, token: &'static str },
    /// No (port, baud) candidate in the configured set responded to `AT`.
    AutodetectFatal,
    /// A UART I/O error from the underlying file descriptor.
    Io(std::io::Error),
    /// Configuration could not be loaded or parsed.
    Config(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::TransportTimeout { command, timeout_ms } => {
                write!(f, "timeout waiting for reply to `{command}` after {timeout_ms}ms")
            }
            BridgeError::Protocol { command, token } => {
                write!(f, "modem rejected `{command}` with {token}")
            }
            BridgeError::AutodetectFatal => {
                write!(f, "no uart/baud candidate responded to AT")
            }
            BridgeError::Io(e) => write!(f, "uart io error: {e}"),
            BridgeError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e)
    }
}

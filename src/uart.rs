//! C2: the UART port abstraction (§4.2). Non-blocking read/write of bytes
//! over a raw serial fd, plus best-effort autodetect across a configured
//! (port, baud) candidate set.
//!
//! Grounded on the teacher's `modem.rs::configure_termios` for raw-mode
//! termios setup (`cfmakeraw`, explicit baud, `CLOCAL|CREAD`, no hardware
//! flow control) — reused almost verbatim. The teacher drives its fd from a
//! dedicated blocking `std::thread` (`modem_thread`); this module instead
//! keeps the fd `O_NONBLOCK` and polls it from the single cooperative loop
//! via `tokio::io::unix::AsyncFd`, per §5's single-threaded requirement.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::tokens::TokenRegistry;

/// A non-blocking serial port, polled cooperatively via `AsyncFd`.
pub struct UartPort {
    inner: AsyncFd<OwnedFd>,
}

impl UartPort {
    /// Open `path` at `baud` and configure it 8N1 raw, non-blocking.
    pub fn open(path: &str, baud: u32) -> Result<Self, BridgeError> {
        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| BridgeError::Io(std::io::Error::from(e)))?;
        // SAFETY: `fd` was just opened above and is owned by nobody else yet.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        configure_termios(owned.as_raw_fd(), baud)?;
        flush(owned.as_raw_fd())?;
        let inner = AsyncFd::new(owned).map_err(BridgeError::Io)?;
        info!(port = path, baud, "uart opened");
        Ok(Self { inner })
    }

    /// True if at least one byte is currently available to read.
    pub async fn any(&self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_millis(0), self.inner.readable()).await,
            Ok(Ok(_))
        )
    }

    /// Read up to `max` bytes. Awaits readiness, then performs one
    /// non-blocking read; returns an empty vec on a spurious wakeup.
    pub async fn read(&self, max: usize) -> Result<Vec<u8>, BridgeError> {
        loop {
            let mut guard = self.inner.readable().await.map_err(BridgeError::Io)?;
            let mut buf = vec![0u8; max];
            match guard.try_io(|inner| {
                // SAFETY: fd stays open and owned by `self.inner` for the call.
                let bfd = unsafe { BorrowedFd::borrow_raw(inner.get_ref().as_raw_fd()) };
                unistd::read(bfd.as_raw_fd(), &mut buf)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            }) {
                Ok(Ok(0)) => return Ok(Vec::new()),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(BridgeError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write `bytes` to the port. Fire-and-forget per §5; retries internally
    /// on `EWOULDBLOCK` by awaiting writability.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut offset = 0;
        while offset < bytes.len() {
            let mut guard = self.inner.writable().await.map_err(BridgeError::Io)?;
            match guard.try_io(|inner| {
                let bfd = unsafe { BorrowedFd::borrow_raw(inner.get_ref().as_raw_fd()) };
                unistd::write(bfd, &bytes[offset..])
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            }) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(BridgeError::Io(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Write a CRLF-terminated AT command line.
    pub async fn write_line(&self, cmd: &str) -> Result<(), BridgeError> {
        self.write(format!("{cmd}\r\n").as_bytes()).await
    }

    /// Probe every (port, baud) candidate: open, flush, escape with `+++`,
    /// wait ~1.2s, write bare `AT`, and await `OK`/`ERROR` within 700ms.
    /// Returns the first responsive pair, or `AutodetectFatal` if none
    /// answer (§4.2).
    pub async fn autodetect(ports: &[String], bauds: &[u32]) -> Result<Self, BridgeError> {
        for port in ports {
            for &baud in bauds {
                match Self::probe(port, baud).await {
                    Ok(uart) => return Ok(uart),
                    Err(e) => debug!(port, baud, error = %e, "autodetect candidate unresponsive"),
                }
            }
        }
        Err(BridgeError::AutodetectFatal)
    }

    async fn probe(port: &str, baud: u32) -> Result<Self, BridgeError> {
        let uart = Self::open(port, baud)?;
        uart.write(b"+++").await?;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let _ = uart.read(256).await;
        uart.write_line("AT").await?;

        let mut tokens = TokenRegistry::new();
        let mut waiter = tokens.register(&["OK", "ERROR"]);
        let deadline = tokio::time::sleep(Duration::from_millis(700));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => {
                    return Err(BridgeError::TransportTimeout {
                        command: "AT".into(),
                        timeout_ms: 700,
                    });
                }
                bytes = uart.read(256) => {
                    let bytes = bytes?;
                    for line in String::from_utf8_lossy(&bytes).split("\r\n") {
                        if line == "OK" || line == "ERROR" {
                            tokens.resolve(line);
                        }
                    }
                    if waiter.try_recv().is_ok() {
                        return Ok(uart);
                    }
                }
            }
        }
    }
}

fn configure_termios(fd: RawFd, baud: u32) -> Result<(), BridgeError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut tio = termios::tcgetattr(borrowed).map_err(|e| BridgeError::Io(std::io::Error::from(e)))?;

    termios::cfmakeraw(&mut tio);

    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate).map_err(|e| BridgeError::Io(std::io::Error::from(e)))?;
    termios::cfsetospeed(&mut tio, rate).map_err(|e| BridgeError::Io(std::io::Error::from(e)))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
        .map_err(|e| BridgeError::Io(std::io::Error::from(e)))?;
    Ok(())
}

fn baud_rate(baud: u32) -> Result<termios::BaudRate, BridgeError> {
    use termios::BaudRate;
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        _ => {
            warn!(baud, "unrecognized baud rate, falling back to 115200");
            BaudRate::B115200
        }
    })
}

fn flush(fd: RawFd) -> Result<(), BridgeError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    termios::tcflush(borrowed, termios::FlushArg::TCIOFLUSH)
        .map_err(|e| BridgeError::Io(std::io::Error::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_baud_falls_back_without_panicking() {
        assert_eq!(baud_rate(123_456).unwrap(), termios::BaudRate::B115200);
    }

    #[test]
    fn known_bauds_map_correctly() {
        assert_eq!(baud_rate(9600).unwrap(), termios::BaudRate::B9600);
        assert_eq!(baud_rate(115200).unwrap(), termios::BaudRate::B115200);
    }
}

//! `bridge-server`: listens for the TCP peer and drives both demo
//! sub-protocols carried over the bridge's inbound channel — echoing `Test`
//! replies and persisting `Files` transfers to `backups/copy-<filename>`
//! with a terminal checksum check, grounded on
//! `original_source/src/uart_tcp_server.py::handle_files`.

use std::sync::Arc;

use clap::Parser;
use uartbridge::bridge::Bridge;
use uartbridge::config::Config;

#[derive(Parser, Debug)]
#[command(name = "bridge-server", about = "UART-AT-TCP bridge, server role")]
struct Args {
    /// Path to a bridge.toml config file. Falls back to ./bridge.toml, then
    /// compiled defaults.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let cfg = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cfg.logging.level))
        .init();

    let data_dir = cfg.data_dir.clone();
    let (bridge, inbound) = Bridge::start(cfg, None).await?;
    let bridge = Arc::new(bridge);

    dispatch::run(bridge.clone(), inbound, data_dir).await;

    bridge.shutdown();
    Ok(())
}

/// Dispatches every inbound message to the matching demo handler: `Test`
/// gets echoed back with `RspReceivedOK: true`; `Files` is handed to
/// [`files`]. Ported from `recv_queue_processor`'s `Category` branch.
mod dispatch {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tracing::info;

    use super::files;
    use uartbridge::bridge::Bridge;
    use uartbridge::demux::Inbound;
    use uartbridge::message::Message;

    pub async fn run(bridge: Arc<Bridge>, mut inbound: mpsc::Receiver<Inbound>, data_dir: String) {
        let mut transfers = files::Transfers::new(data_dir);
        while let Some((_link_id, message)) = inbound.recv().await {
            match message {
                Message::Test(test) => {
                    let id = test.id;
                    let reply = test.into_reply();
                    let mut bytes = match serde_json::to_vec(&Message::Test(reply)) {
                        Ok(b) => b,
                        Err(e) => {
                            tracing::warn!(id, error = %e, "failed to encode test reply");
                            continue;
                        }
                    };
                    bytes.extend_from_slice(b"\r\n");
                    bridge.enqueue(id, bytes).await;
                    info!(id, "echoed test reply");
                }
                Message::Files(msg) => {
                    transfers.handle(msg).await;
                }
            }
        }
    }
}

/// The `Files` three-step transfer protocol (§3 "Files sub-protocol").
/// Header opens `backups/copy-<FileName>` and starts a running checksum;
/// Content appends decoded bytes to both the file and the checksum input;
/// End compares the checksum against `HashData` and logs the outcome.
mod files {
    use std::collections::HashMap;

    use base64::Engine as _;
    use tokio::fs;
    use tokio::io::AsyncWriteExt;
    use tracing::{error, info, warn};

    use uartbridge::checksum;
    use uartbridge::message::{FilesMessage, Step};

    struct Transfer {
        file: fs::File,
        accumulated: Vec<u8>,
    }

    /// One open transfer per file name. Files is not multiplexed across
    /// links in this demo (the same limitation as the original
    /// MicroPython server, which kept a single `fout`/`_in_hash_md5` pair).
    pub struct Transfers {
        data_dir: String,
        open: HashMap<String, Transfer>,
    }

    impl Transfers {
        #[must_use]
        pub fn new(data_dir: String) -> Self {
            Self { data_dir, open: HashMap::new() }
        }

        pub async fn handle(&mut self, msg: FilesMessage) {
            match msg.step {
                Step::Header => self.on_header(&msg.file_name).await,
                Step::Content => self.on_content(&msg).await,
                Step::End => self.on_end(&msg).await,
            }
        }

        async fn on_header(&mut self, file_name: &str) {
            let dir = format!("{}/backups", self.data_dir);
            if let Err(e) = fs::create_dir_all(&dir).await {
                error!(file_name, error = %e, "could not create backups dir");
                return;
            }
            let path = format!("{dir}/copy-{file_name}");
            match fs::File::create(&path).await {
                Ok(file) => {
                    self.open.insert(file_name.to_string(), Transfer { file, accumulated: Vec::new() });
                    info!(file_name, path, "file transfer started");
                }
                Err(e) => error!(file_name, path, error = %e, "could not create destination file"),
            }
        }

        async fn on_content(&mut self, msg: &FilesMessage) {
            let Some(transfer) = self.open.get_mut(&msg.file_name) else {
                warn!(file_name = msg.file_name, "content for a file with no open header, dropping");
                return;
            };
            let Some(data_b64) = &msg.file_data else {
                warn!(file_name = msg.file_name, "content step missing FileData");
                return;
            };
            let Ok(chunk) = base64::engine::general_purpose::STANDARD.decode(data_b64) else {
                warn!(file_name = msg.file_name, "content step has invalid base64, dropping chunk");
                return;
            };
            if let Err(e) = transfer.file.write_all(&chunk).await {
                error!(file_name = msg.file_name, error = %e, "write failed");
            }
            transfer.accumulated.extend_from_slice(&chunk);
            if let Some(pct) = msg.progress_percentage {
                info!(file_name = msg.file_name, pct, "transfer progress");
            }
        }

        async fn on_end(&mut self, msg: &FilesMessage) {
            let Some(mut transfer) = self.open.remove(&msg.file_name) else {
                warn!(file_name = msg.file_name, "end for a file with no open header, dropping");
                return;
            };
            let _ = transfer.file.flush().await;

            let expected = msg.hash_data.as_deref().unwrap_or_default();
            let actual = checksum::checksum_base64(&transfer.accumulated).unwrap_or_default();
            if actual == expected {
                info!(file_name = msg.file_name, "file copy ok");
            } else {
                error!(file_name = msg.file_name, expected, actual, "file copy checksum mismatch");
            }
        }
    }
}

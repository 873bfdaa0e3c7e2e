//! `bridge-client`: dials out to the TCP peer and drives the `Test` message
//! exchange in fixed-size batches, mirroring
//! `original_source/src/uart_tcp_client.py`'s `BATCH_SIZE = 25` batching
//! loop (wait for every message in a batch to ack, or time out, before
//! starting the next batch).

use std::sync::Arc;

use clap::Parser;
use uartbridge::bridge::Bridge;
use uartbridge::config::Config;

#[derive(Parser, Debug)]
#[command(name = "bridge-client", about = "UART-AT-TCP bridge, client role")]
struct Args {
    /// Path to a bridge.toml config file. Falls back to ./bridge.toml, then
    /// compiled defaults.
    #[arg(long)]
    config: Option<String>,
    /// Number of demo Test messages to send (0 disables the demo generator).
    #[arg(long, default_value_t = 0)]
    demo_count: u32,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let cfg = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cfg.logging.level))
        .init();

    let (bridge, inbound) = Bridge::start(cfg, None).await?;
    let bridge = Arc::new(bridge);

    if args.demo_count > 0 {
        test_gen::run(bridge.clone(), inbound, args.demo_count).await;
    } else {
        drop(inbound);
        tokio::signal::ctrl_c().await?;
    }

    bridge.shutdown();
    Ok(())
}

/// Demo consumer: batches of `Test` requests, each batch waited-on before the
/// next starts. Ported from the Python source's batch-tracking dict/event
/// pair into a shared `HashMap<batch, HashMap<id, bool>>` guarded by a
/// tokio `Mutex` plus a polling wait (no direct `asyncio.Event` analogue).
mod test_gen {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use uartbridge::bridge::Bridge;
    use uartbridge::demux::Inbound;
    use uartbridge::message::Message;

    const BATCH_SIZE: u32 = 25;
    const BATCH_TIMEOUT_MS: u64 = 30_000;

    pub async fn run(bridge: Arc<Bridge>, mut inbound: mpsc::Receiver<Inbound>, total: u32) {
        let outstanding: Arc<Mutex<HashMap<i64, bool>>> = Arc::new(Mutex::new(HashMap::new()));

        let ack_task = {
            let outstanding = outstanding.clone();
            tokio::spawn(async move {
                while let Some((_link_id, message)) = inbound.recv().await {
                    if let Message::Test(test) = &message {
                        if test.rsp_received_ok {
                            if let Some(done) = outstanding.lock().await.get_mut(&test.id) {
                                *done = true;
                            }
                        }
                    }
                }
            })
        };

        let mut sent = 0u32;
        let mut batch_num = 1u32;
        while sent < total {
            let batch_end = (sent + BATCH_SIZE).min(total);
            info!(batch_num, from = sent + 1, to = batch_end, "starting batch");

            {
                let mut map = outstanding.lock().await;
                map.clear();
            }

            for _ in sent..batch_end {
                let payload = format!("demo-payload-{sent}");
                if let Some(id) = bridge.send_test(payload.as_bytes()).await {
                    outstanding.lock().await.insert(id, false);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                sent += 1;
            }

            info!(batch_num, "batch queued, waiting for processing");
            let deadline = tokio::time::Instant::now() + Duration::from_millis(BATCH_TIMEOUT_MS);
            loop {
                let all_done = outstanding.lock().await.values().all(|&done| done);
                if all_done {
                    info!(batch_num, "batch complete");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    let missing: Vec<i64> = outstanding
                        .lock()
                        .await
                        .iter()
                        .filter(|(_, &done)| !done)
                        .map(|(&id, _)| id)
                        .collect();
                    warn!(batch_num, ?missing, "batch timeout, missing acks");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            batch_num += 1;
        }

        ack_task.abort();
    }
}

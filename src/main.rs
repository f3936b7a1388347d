//! Entry point for the `paftp` demo.
//!
//! Wires a publisher and a subscriber endpoint back-to-back over in-process
//! datagram channels — optionally through a lossy relay — runs a round-trip
//! transfer, and prints a summary.  All protocol work is delegated to
//! library modules; `main.rs` owns only process setup (logging, argument
//! parsing) and the demo wiring.

use anyhow::{ensure, Result};
use bytes::Bytes;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use paftp::driver::{self, PaftpSession};
use paftp::state::Role;
use paftp::timer::TimerConfig;
use paftp::transport::Session;

/// Reliable message transport demo over an in-process datagram link.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Number of messages to round-trip.
    #[arg(short, long, default_value_t = 4)]
    messages: usize,

    /// Size of each message in bytes.
    #[arg(short, long, default_value_t = 600)]
    size: usize,

    /// Probability that the relay drops a datagram.
    #[arg(short, long, default_value_t = 0.0)]
    loss: f64,

    /// Seed for the relay's random number generator.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// Forward datagrams, dropping each with probability `loss`.
fn lossy_relay(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Bytes>,
    loss: f64,
    seed: u64,
) {
    tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        while let Some(datagram) = rx.recv().await {
            if rng.gen_bool(loss) {
                log::warn!("[relay] dropped a {}-byte datagram", datagram.len());
                continue;
            }
            if tx.send(datagram).is_err() {
                break;
            }
        }
    });
}

/// Connect the two endpoints, either directly or through lossy relays.
fn wire(loss: f64, seed: u64) -> (PaftpSession, PaftpSession) {
    let session = Session {
        id: 1,
        peer_id: 2,
        peer_addr: [0x02, 0x00, 0x5e, 0x10, 0x20, 0x30],
    };

    let (sub_out_tx, sub_out_rx) = mpsc::unbounded_channel();
    let (pub_in_tx, pub_in_rx) = mpsc::unbounded_channel();
    let (pub_out_tx, pub_out_rx) = mpsc::unbounded_channel();
    let (sub_in_tx, sub_in_rx) = mpsc::unbounded_channel();

    lossy_relay(sub_out_rx, pub_in_tx, loss, seed);
    lossy_relay(pub_out_rx, sub_in_tx, loss, seed.wrapping_add(1));

    let publisher = driver::spawn(
        Role::Publisher,
        session.clone(),
        pub_out_tx,
        pub_in_rx,
        TimerConfig::default(),
    );
    let subscriber = driver::spawn(
        Role::Subscriber,
        session,
        sub_out_tx,
        sub_in_rx,
        TimerConfig::default(),
    );
    (publisher, subscriber)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    ensure!(
        (0.0..1.0).contains(&cli.loss),
        "loss must be in [0.0, 1.0)"
    );

    let (publisher, mut subscriber) = wire(cli.loss, cli.seed);

    subscriber.connected().await?;
    log::info!("handshake complete");

    // Echo task: the publisher bounces every message back.
    let count = cli.messages;
    let echo = tokio::spawn(async move {
        let mut publisher = publisher;
        for _ in 0..count {
            match publisher.recv().await {
                Some(message) => {
                    log::info!("publisher received {} bytes, echoing", message.len());
                    if publisher.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        publisher.close().await
    });

    for i in 0..cli.messages {
        let payload: Vec<u8> = (0..cli.size).map(|b| (b as u8).wrapping_add(i as u8)).collect();
        let message = Bytes::from(payload);
        subscriber.send(message.clone()).await?;

        let reply = subscriber
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed mid-transfer"))?;
        ensure!(reply == message, "echo {i} did not match");
        println!("message {i}: {} bytes round-tripped", reply.len());
    }

    let sub_reason = subscriber.close().await;
    let pub_reason = echo.await?;
    println!(
        "done: {} messages of {} bytes (close reasons: subscriber {:?}, publisher {:?})",
        cli.messages, cli.size, sub_reason, pub_reason
    );
    Ok(())
}

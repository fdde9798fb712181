//! Two-process throughput and correctness tester for a queue directory.
//!
//! `queue-tester send <folder>` pushes random payloads whose left half
//! equals their right half; `queue-tester receive <folder>` pulls and
//! deletes them, checking that invariant and reporting any corruption.
//! Exists to validate cross-process locking under load — not part of
//! the queue engine itself.

use clap::{Parser, Subcommand};
use queue::{QueueParams, open_queue_dir};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

const BATCH_SIZE: u64 = 1_000_000;
const MIN_HALF_LEN: usize = 4;
const MAX_HALF_LEN: usize = 512;

#[derive(Parser, Debug)]
#[command(name = "queue-tester")]
#[command(about = "Send/receive load generator for a persistent queue directory")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Queue visibility timeout in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    visibility_ms: u64,

    /// Queue retention period in milliseconds.
    #[arg(long, default_value_t = 600_000)]
    retention_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push `count` messages with left-half==right-half payloads.
    Send {
        folder: PathBuf,
        #[arg(long, default_value_t = 1_000_000)]
        count: u64,
    },
    /// Pull and delete `count` messages, verifying and reporting corruption.
    Receive {
        folder: PathBuf,
        #[arg(long, default_value_t = 1_000_000)]
        count: u64,
        #[arg(long, default_value_t = 20_000)]
        pull_timeout_ms: u64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")))
        .init();

    let args = Args::parse();
    let params = match QueueParams::new(args.visibility_ms, args.retention_ms) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("invalid queue parameters: {e}");
            std::process::exit(1);
        }
    };

    let result = match args.command {
        Command::Send { folder, count } => run_send(&folder, params, count),
        Command::Receive {
            folder,
            count,
            pull_timeout_ms,
        } => run_receive(&folder, params, count, pull_timeout_ms),
    };

    if let Err(e) = result {
        eprintln!("queue-tester: {e}");
        std::process::exit(1);
    }
}

/// Builds a payload of random length whose second half duplicates its
/// first half, so a receiver can detect torn or corrupted reads without
/// needing a checksum.
fn random_mirrored_payload() -> Vec<u8> {
    let half_len = fastrand::usize(MIN_HALF_LEN..=MAX_HALF_LEN);
    let half: Vec<u8> = (0..half_len).map(|_| fastrand::u8(..)).collect();
    let mut body = half.clone();
    body.extend_from_slice(&half);
    body
}

fn is_mirrored(body: &[u8]) -> bool {
    if body.len() % 2 != 0 {
        return false;
    }
    let half = body.len() / 2;
    body[..half] == body[half..]
}

fn run_send(folder: &PathBuf, params: QueueParams, count: u64) -> queue::Result<()> {
    let mut q = open_queue_dir(folder, params)?;

    info!(folder = %folder.display(), count, "send: starting");
    let start = Instant::now();
    let mut batch_start = start;

    for i in 1..=count {
        let body = random_mirrored_payload();
        q.push(0, &body)?;

        if i % BATCH_SIZE == 0 {
            let rate = BATCH_SIZE as f64 / batch_start.elapsed().as_secs_f64();
            info!(sent = i, rate_per_sec = rate as u64, "send: batch complete");
            batch_start = Instant::now();
        }
    }

    let elapsed = start.elapsed();
    info!(
        sent = count,
        elapsed_secs = elapsed.as_secs_f64(),
        rate_per_sec = (count as f64 / elapsed.as_secs_f64()) as u64,
        "send: done"
    );
    Ok(())
}

fn run_receive(folder: &PathBuf, params: QueueParams, count: u64, pull_timeout_ms: u64) -> queue::Result<()> {
    let mut q = open_queue_dir(folder, params)?;

    info!(folder = %folder.display(), count, "receive: starting");
    let start = Instant::now();
    let mut batch_start = start;
    let mut received = 0u64;
    let mut corrupted = 0u64;

    while received < count {
        let Some(message) = q.pull(pull_timeout_ms)? else {
            continue;
        };
        if !is_mirrored(&message.body) {
            corrupted += 1;
            tracing::error!(message_id = message.message_id, "receive: corrupted message");
        }
        q.delete(&message)?;
        received += 1;

        if received % BATCH_SIZE == 0 {
            let rate = BATCH_SIZE as f64 / batch_start.elapsed().as_secs_f64();
            info!(received, corrupted, rate_per_sec = rate as u64, "receive: batch complete");
            batch_start = Instant::now();
        }
    }

    let elapsed = start.elapsed();
    info!(
        received,
        corrupted,
        elapsed_secs = elapsed.as_secs_f64(),
        rate_per_sec = (received as f64 / elapsed.as_secs_f64()) as u64,
        "receive: done"
    );
    Ok(())
}

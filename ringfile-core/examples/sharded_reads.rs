//! Random reads of one file spread over several event loops.
//!
//! Usage: cargo run --example sharded_reads -- [reads] [--blocking]
//!
//! The executor is sized for the machine (one pinned loop per core, minus one
//! on larger machines). With `--blocking` the rings complete reads
//! synchronously instead of going through io_uring.

use anyhow::{ensure, Result};
use rand::Rng;
use ringfile_core::{provider, ExecutorConfig, IoExecutor, RingConfig};
use std::io::Write;
use std::time::Instant;
use tracing::info;

const FILE_SIZE: usize = 8 * 1024 * 1024;
const READ_SIZE: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let blocking = args.iter().any(|a| a == "--blocking");
    let reads: usize = args
        .iter()
        .find_map(|a| a.parse().ok())
        .unwrap_or(10_000);

    let path = std::env::temp_dir().join(format!("ringfile-sharded-{}", uuid::Uuid::new_v4()));
    let mut content = vec![0u8; FILE_SIZE];
    rand::thread_rng().fill(&mut content[..]);
    std::fs::File::create(&path)?.write_all(&content)?;

    let config = ExecutorConfig::for_system(RingConfig::buffered(256)?);
    let native = if blocking {
        provider::blocking()
    } else {
        provider::instance()
    };
    info!(
        "Running {} reads over {} event loops with the {} provider",
        reads,
        config.event_loops,
        native.name()
    );
    let executor = IoExecutor::with_provider(config, native)?;
    let reader = executor.open_for_reading(&path)?;

    let mut rng = rand::thread_rng();
    let offsets: Vec<usize> = (0..reads)
        .map(|_| rng.gen_range(0..FILE_SIZE - READ_SIZE))
        .collect();

    let start = Instant::now();
    let mut futures = Vec::with_capacity(reads);
    for &offset in &offsets {
        futures.push(reader.read_async(offset as u64, READ_SIZE)?);
    }
    let results = futures::future::join_all(futures).await;
    let elapsed = start.elapsed();

    for (offset, result) in offsets.iter().zip(results) {
        let buf = result?;
        ensure!(
            &buf[..] == &content[*offset..*offset + READ_SIZE],
            "mismatch at offset {}",
            offset
        );
    }

    println!(
        "{} reads of {} bytes in {:?} ({:.0} reads/s)",
        reads,
        READ_SIZE,
        elapsed,
        reads as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    reader.close()?;
    executor.close();
    std::fs::remove_file(&path)?;
    Ok(())
}

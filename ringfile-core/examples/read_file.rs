//! Reads a file in chunks through an I/O executor and prints a summary.
//!
//! Usage: cargo run --example read_file -- <path> [--direct] [--chunk BYTES]

use anyhow::{bail, Context, Result};
use ringfile_core::{provider, IoExecutor, RingConfig};
use std::time::Instant;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let mut path = None;
    let mut direct = false;
    let mut chunk = 64 * 1024;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--direct" => direct = true,
            "--chunk" => {
                chunk = args
                    .next()
                    .context("--chunk needs a value")?
                    .parse()
                    .context("invalid --chunk value")?
            }
            _ => path = Some(arg),
        }
    }
    let Some(path) = path else {
        bail!("usage: read_file <path> [--direct] [--chunk BYTES]");
    };

    if !provider::is_available() {
        bail!("no native I/O provider: {:?}", provider::instance());
    }

    let config = if direct {
        RingConfig::direct(128)?
    } else {
        RingConfig::buffered(128)?
    };
    let executor = IoExecutor::single_threaded(config)?;
    let reader = executor
        .open_for_reading(&path)
        .with_context(|| format!("failed to open {path}"))?;
    let len = std::fs::metadata(&path)?.len();

    let start = Instant::now();
    let futures = (0..len)
        .step_by(chunk)
        .map(|offset| reader.read_async(offset, chunk))
        .collect::<ringfile_core::Result<Vec<_>>>()?;

    let mut total = 0;
    let mut lines = 0;
    for future in futures {
        let buf = future.wait()?;
        total += buf.len();
        lines += buf.iter().filter(|&&b| b == b'\n').count();
    }
    let elapsed = start.elapsed();

    println!("Read {} bytes ({} lines) from {} in {:?}", total, lines, path, elapsed);
    println!(
        "Throughput: {:.1} MiB/s",
        total as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    reader.close()?;
    executor.close();
    Ok(())
}

//! Checks whether io_uring rings can be used in this environment.
//!
//! Prints the kernel version, probes ring creation for each configuration
//! flag, and performs a real read through an executor.

use anyhow::Result;
use ringfile_core::provider::{self, NativeProvider, UringProvider};
use ringfile_core::{IoExecutor, RingConfig};
use std::io::Write;
use std::process::Command;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    println!("Checking io_uring support...");

    if let Ok(output) = Command::new("uname").arg("-r").output() {
        let version = String::from_utf8_lossy(&output.stdout);
        println!("Kernel version: {}", version.trim());
    }

    let uring = match UringProvider::probe() {
        Ok(p) => {
            println!("✅ io_uring rings can be created");
            p
        }
        Err(e) => {
            println!("❌ io_uring unavailable: {}", e);
            println!("   Selected provider: {:?}", provider::instance());
            return Ok(());
        }
    };

    let configs = [
        ("buffered", RingConfig::buffered(32)?),
        ("direct", RingConfig::direct(32)?),
        ("SQ polling", RingConfig::builder(32).with_sq_polling().build()?),
        (
            "I/O polling",
            RingConfig::builder(32)
                .with_direct_io()
                .with_io_polling()
                .build()?,
        ),
    ];
    for (name, config) in configs {
        match uring.create_ring(&config) {
            Ok((mut backend, _)) => {
                backend.destroy();
                println!("✅ {} ring", name);
            }
            Err(e) => println!("⚠️ {} ring: {}", name, e),
        }
    }

    let path = std::env::temp_dir().join("ringfile_check_io_uring");
    let content = b"ringfile io_uring check\n";
    std::fs::File::create(&path)?.write_all(content)?;

    let executor = IoExecutor::single_threaded(RingConfig::buffered(8)?)?;
    let reader = executor.open_for_reading(&path)?;
    let buf = reader.read_async(0, content.len())?.wait()?;
    if &buf[..] == content {
        println!("✅ Read through io_uring returned the expected content");
    } else {
        println!("❌ Unexpected content: {:?}", String::from_utf8_lossy(&buf));
    }

    reader.close()?;
    executor.close();
    let _ = std::fs::remove_file(&path);
    Ok(())
}

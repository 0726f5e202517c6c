//! Responder side: expose a buffer through a revocable window, print every
//! write that lands, then revoke remote access and exit.

use anyhow::Context;
use clap::Parser;
use log::info;

use windward::ibverbs::device_context::Mtu;
use windward::ibverbs::memory_window::MemoryWindowKind;
use windward::session::{Responder, SessionConfig};

#[derive(Parser)]
#[command(name = "windward-serve", about = "Accept one-sided writes into a published buffer")]
struct Args {
    /// TCP port to accept the bootstrap connection on.
    #[arg(long, default_value_t = windward::exchange::DEFAULT_PORT)]
    port: u16,

    /// Size in bytes of the exposed buffer.
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// Path MTU in bytes (256, 512, 1024, 2048 or 4096).
    #[arg(long, default_value_t = 4096, value_parser = parse_mtu)]
    mtu: u32,

    /// Bind the window as type 2 (posted bind) instead of type 1.
    #[arg(long)]
    type2: bool,

    /// Number of writes to accept before revoking the window.
    #[arg(long, default_value_t = 1)]
    writes: u32,
}

fn parse_mtu(s: &str) -> Result<u32, String> {
    let size: u32 = s.parse().map_err(|_| format!("not a number: {s}"))?;
    Mtu::from_payload_size(size)
        .map(|_| size)
        .ok_or_else(|| format!("unsupported MTU size: {size}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = SessionConfig {
        port: args.port,
        buffer_len: args.size,
        mtu: Mtu::from_payload_size(args.mtu).context("unsupported MTU")?,
        window_kind: if args.type2 {
            MemoryWindowKind::Type2
        } else {
            MemoryWindowKind::Type1
        },
        ..Default::default()
    };

    let mut responder = Responder::accept(config).context("session bring-up failed")?;

    for _ in 0..args.writes {
        let write = responder.recv().context("waiting for write failed")?;
        let len = write.byte_len as usize;
        info!(
            "received {len} bytes, immediate {:?}",
            write.immediate
        );
        println!("buffer: {}", String::from_utf8_lossy(&responder.buffer()[..len]));
    }

    responder.revoke().context("revoking the window failed")?;
    println!("window revoked, remote key invalidated");

    Ok(())
}

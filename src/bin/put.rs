//! Initiator side: connect to a responder, then push a payload into its
//! published window with write-with-immediate.

use anyhow::Context;
use clap::Parser;
use log::info;

use windward::ibverbs::device_context::Mtu;
use windward::session::{Initiator, SessionConfig};

#[derive(Parser)]
#[command(name = "windward-put", about = "Push payloads into a responder's published buffer")]
struct Args {
    /// Responder address, host or host:port.
    addr: String,

    /// TCP port of the responder's bootstrap channel, used when `addr`
    /// carries no port.
    #[arg(long, default_value_t = windward::exchange::DEFAULT_PORT)]
    port: u16,

    /// Size in bytes of the local staging buffer.
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// Path MTU in bytes (256, 512, 1024, 2048 or 4096).
    #[arg(long, default_value_t = 4096, value_parser = parse_mtu)]
    mtu: u32,

    /// Payload to write.
    #[arg(long, default_value = "hello from windward")]
    message: String,

    /// Immediate value attached to the write.
    #[arg(long, default_value_t = 20241012)]
    immediate: u32,

    /// Number of times to write the payload.
    #[arg(long, default_value_t = 1)]
    count: u32,
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

    let addr = if args.addr.contains(':') {
        args.addr.clone()
    } else {
        format!("{}:{}", args.addr, args.port)
    };

    let config = SessionConfig {
        port: args.port,
        buffer_len: args.size,
        mtu: Mtu::from_payload_size(args.mtu).context("unsupported MTU")?,
        ..Default::default()
    };

    let mut initiator = Initiator::connect(&addr, config).context("session bring-up failed")?;

    for i in 0..args.count {
        initiator
            .write(args.message.as_bytes(), args.immediate.wrapping_add(i))
            .with_context(|| format!("write {} of {} failed", i + 1, args.count))?;
        info!("write {} of {} confirmed", i + 1, args.count);
    }

    println!("wrote {} bytes x{}", args.message.len(), args.count);
    Ok(())
}

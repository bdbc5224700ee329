//! Example: Bridging a ClipX amplifier to NATS
//!
//! Run with: cargo run --example clipx_bridge --features nats -- 192.168.17.200
//!
//! This example demonstrates:
//! - Building connection parameters from a device preset
//! - Publishing input data as JSON on a NATS subject
//! - Accepting output data from a control subject
//! - Reading the bridge counters while it runs
//!
//! Log output is controlled with `RUST_LOG`, e.g. `RUST_LOG=eip_bridge=debug`.

use std::sync::Arc;
use std::time::Duration;

use eip_bridge::{
    devices, BridgeConfig, ConnectionParameters, DataEncoding, EipBridge, NatsBus, OutputFormat,
};
use tracing_subscriber::EnvFilter;

fn main() -> eip_bridge::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("eip_bridge=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let device = args.next().unwrap_or_else(|| "192.168.17.200".to_string());
    let nats_url = args
        .next()
        .unwrap_or_else(|| "nats://localhost:4222".to_string());

    // =========================================================================
    // Configure
    // =========================================================================

    let params = ConnectionParameters::new(device)
        .with_preset(devices::CLIPX)
        .with_sizes(0, 166)
        .with_rpi(2000)
        .with_receive_port(2222);

    let config = BridgeConfig::new(params, nats_url.as_str(), "plant.clipx.input")
        .with_format(OutputFormat::Structured {
            data: DataEncoding::Words,
        });

    // =========================================================================
    // Run
    // =========================================================================

    let bus = Arc::new(NatsBus::from_config(&config)?.with_name("clipx-bridge"));
    let mut bridge = EipBridge::new(config, bus)?;
    bridge.start()?;

    for _ in 0..30 {
        std::thread::sleep(Duration::from_secs(1));
        println!("{}", bridge);
    }

    bridge.stop();
    let stats = bridge.stats();
    println!(
        "received={} published={} reconnects={} dropped={} publish_errors={}",
        stats.received, stats.published, stats.reconnects, stats.protocol_errors, stats.publish_errors
    );
    Ok(())
}

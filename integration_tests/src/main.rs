//! Integration tests for the BLE echo firmware.
//!
//! Run after flashing the firmware: connects over BLE as the initiator and
//! checks that text comes back intact.

mod ble_client;
mod tests;

use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use ble_client::EchoClient;
use ble_echo_firmware::config::gatt::ADVERTISED_NAME;
use ble_echo_firmware::session::SessionConfig;
use tests::{print_results, run_all_tests};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for the BLE echo firmware")]
struct Args {
    /// BLE device name to scan for
    #[arg(short, long, default_value = ADVERTISED_NAME)]
    name: String,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,

    /// Abort a transfer if a frame is not acknowledged within this many milliseconds
    #[arg(long, default_value = "5000")]
    ack_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    println!("{}", "BLE Echo Integration Tests".bold());
    println!("Device: \"{}\"", args.name);
    println!();

    println!("Scanning for device...");
    let config = SessionConfig::default().with_ack_timeout_ms(Some(args.ack_timeout_ms));
    let mut client = EchoClient::connect_by_name(
        &args.name,
        Duration::from_secs(args.scan_timeout),
        config,
    )
    .await?;
    println!("{}", "Connected!".green());

    println!("\nRunning tests...\n");

    let results = run_all_tests(&mut client).await;
    print_results(&results);

    client.disconnect().await?;

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

//! Interactive echo client.
//!
//! Each line read from stdin is sent to the echo server; the reassembled
//! echo is printed when it comes back.

mod ble_client;

use std::time::Duration;

use clap::{Parser, ValueEnum};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};

use ble_client::EchoClient;
use ble_echo_firmware::config::gatt::ADVERTISED_NAME;
use ble_echo_firmware::config::protocol::MAX_FRAME_SIZE;
use ble_echo_firmware::protocol::TextEncoding;
use ble_echo_firmware::session::SessionConfig;

#[derive(Clone, Copy, ValueEnum)]
enum Encoding {
    Ascii,
    Utf8,
}

impl From<Encoding> for TextEncoding {
    fn from(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Ascii => TextEncoding::Ascii,
            Encoding::Utf8 => TextEncoding::Utf8,
        }
    }
}

#[derive(Parser)]
#[command(name = "echo-client")]
#[command(about = "Send lines to a BLE echo server and print the echo")]
struct Args {
    /// BLE device name to scan for
    #[arg(short, long, default_value = ADVERTISED_NAME)]
    name: String,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,

    /// Bytes per frame, at most one attribute value (244)
    #[arg(long, default_value_t = MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Encoding used to decode echoed frames
    #[arg(long, value_enum, default_value = "ascii")]
    encoding: Encoding,

    /// Per-frame acknowledgement timeout in milliseconds (0 waits forever)
    #[arg(long, default_value = "5000")]
    ack_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ack_timeout = (args.ack_timeout_ms > 0).then_some(args.ack_timeout_ms);
    let config = SessionConfig::default()
        .with_max_frame_size(args.max_frame_size)
        .with_encoding(args.encoding.into())
        .with_ack_timeout_ms(ack_timeout);

    println!("Scanning for \"{}\"...", args.name);
    let mut client = EchoClient::connect_by_name(
        &args.name,
        Duration::from_secs(args.scan_timeout),
        config,
    )
    .await?;
    println!("{}", "Connected. Type a line to send it, Ctrl-D to quit.".green());

    let wait = Duration::from_millis(args.ack_timeout_ms.max(1_000)) * 4;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }

        if let Err(e) = client.send(&line, wait).await {
            println!("{} {}", "send failed:".red(), e);
            continue;
        }
        match client.next_message(wait).await {
            Ok(echo) => println!("{} {}", "echo:".cyan(), echo),
            Err(e) => println!("{} {}", "no echo:".red(), e),
        }
    }

    client.disconnect().await?;
    Ok(())
}

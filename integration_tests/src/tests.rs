//! Integration test cases.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use colored::Colorize;

use ble_echo_firmware::config::protocol::{MAX_FRAME_SIZE, TERMINATOR};
use ble_echo_firmware::session::SendError;

use crate::ble_client::EchoClient;

/// Time allowed for one message to be sent and echoed
const ECHO_TIMEOUT: Duration = Duration::from_secs(10);

/// Test result.
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

/// Run a test and print its result as it happens.
async fn run_test<'a, F, Fut>(name: &str, client: &'a mut EchoClient, test_fn: F) -> TestResult
where
    F: FnOnce(&'a mut EchoClient) -> Fut,
    Fut: Future<Output = Result<()>> + 'a,
{
    print!("  {} ... ", name);
    std::io::Write::flush(&mut std::io::stdout()).ok();

    match test_fn(client).await {
        Ok(()) => {
            println!("{}", "PASS".green().bold());
            TestResult {
                name: name.to_string(),
                passed: true,
                message: None,
            }
        }
        Err(e) => {
            println!("{}", "FAIL".red().bold());
            println!("    {}", e.to_string().red());
            TestResult {
                name: name.to_string(),
                passed: false,
                message: Some(e.to_string()),
            }
        }
    }
}

/// Run all tests and return results.
pub async fn run_all_tests(client: &mut EchoClient) -> Vec<TestResult> {
    let mut results = Vec::new();

    results.push(run_test("Short message echoes in one frame", client, test_single_frame).await);
    client.settle(Duration::from_millis(200)).await;
    results.push(run_test("Exact frame boundary", client, test_exact_boundary).await);
    client.settle(Duration::from_millis(200)).await;
    results.push(run_test("Multi-frame message reassembles", client, test_multi_frame).await);
    client.settle(Duration::from_millis(200)).await;
    results.push(run_test("Back-to-back messages stay ordered", client, test_back_to_back).await);
    client.settle(Duration::from_millis(200)).await;
    results.push(run_test("Concurrent send is rejected", client, test_concurrent_send).await);
    client.settle(Duration::from_millis(200)).await;
    results.push(run_test("Outbox read returns last frame", client, test_read_outbox).await);

    results
}

/// Print test results summary.
pub fn print_results(results: &[TestResult]) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "Test Results".bold());
    println!("{}", "=".repeat(60));

    let mut passed = 0;
    let mut failed = 0;

    for result in results {
        if result.passed {
            println!("  {} {}", "[PASS]".green().bold(), result.name);
            passed += 1;
        } else {
            println!("  {} {}", "[FAIL]".red().bold(), result.name);
            if let Some(msg) = &result.message {
                println!("         {}", msg.red());
            }
            failed += 1;
        }
    }

    println!("{}", "-".repeat(60));
    println!(
        "  Total: {} passed, {} failed",
        passed.to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );
    println!("{}", "=".repeat(60));
}

/// Send `text` and check the reassembled echo matches it.
async fn echo(client: &mut EchoClient, text: &str) -> Result<()> {
    client.clear();
    client.send(text, ECHO_TIMEOUT).await?;
    let echoed = client.next_message(ECHO_TIMEOUT).await?;
    ensure!(echoed == text, "Expected echo {:?}, got {:?}", text, echoed);
    Ok(())
}

fn frames_for(text: &str) -> usize {
    (text.len() + TERMINATOR.len()).div_ceil(MAX_FRAME_SIZE)
}

// --- Individual Tests ---

async fn test_single_frame(client: &mut EchoClient) -> Result<()> {
    echo(client, "hi").await?;

    let fragments = &client.delegate().fragments;
    ensure!(
        fragments.first().map(String::as_str) == Some("hi\n\0"),
        "Expected one \"hi\\n\\0\" notification, got {:?}",
        fragments
    );
    Ok(())
}

async fn test_exact_boundary(client: &mut EchoClient) -> Result<()> {
    let text = "abcdefghijklmnopqr";
    ensure!(frames_for(text) == 1, "Test text should fill exactly one frame");

    echo(client, text).await?;
    ensure!(
        client.delegate().fragments.len() == 1,
        "Expected 1 notification, got {}",
        client.delegate().fragments.len()
    );
    Ok(())
}

async fn test_multi_frame(client: &mut EchoClient) -> Result<()> {
    let text = "The quick brown fox jumps over the lazy dog, twice over.";
    echo(client, text).await?;

    let expected = frames_for(text);
    let got = client.delegate().fragments.len();
    ensure!(got == expected, "Expected {} notifications, got {}", expected, got);
    print!("({} frames) ", got);
    Ok(())
}

async fn test_back_to_back(client: &mut EchoClient) -> Result<()> {
    for i in 0..5 {
        let text = format!("message number {} of five", i + 1);
        if let Err(e) = echo(client, &text).await {
            bail!("Message {} failed: {}", i + 1, e);
        }
    }
    Ok(())
}

async fn test_concurrent_send(client: &mut EchoClient) -> Result<()> {
    client.clear();
    client
        .start_send("first message spanning more than one frame")
        .map_err(|e| anyhow::anyhow!("First send rejected: {}", e))?;

    match client.start_send("second") {
        Err(SendError::TransferInFlight) => {}
        other => bail!("Expected TransferInFlight, got {:?}", other),
    }

    // Let the first transfer finish so later tests start clean
    let echoed = client.next_message(ECHO_TIMEOUT).await?;
    ensure!(
        echoed == "first message spanning more than one frame",
        "Unexpected echo {:?}",
        echoed
    );
    Ok(())
}

async fn test_read_outbox(client: &mut EchoClient) -> Result<()> {
    echo(client, "read me").await?;
    client.clear();

    client
        .session_mut()
        .read_outbox()
        .map_err(|e| anyhow::anyhow!("Read rejected: {}", e))?;
    client.settle(Duration::from_millis(500)).await;

    let fragments = &client.delegate().fragments;
    ensure!(
        fragments.last().map(String::as_str) == Some("read me\n\0"),
        "Expected outbox \"read me\\n\\0\", got {:?}",
        fragments
    );
    Ok(())
}

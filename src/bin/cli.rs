//! Interactive client for a kvrelay coordinator

use clap::Parser;
use kvrelay::common::parse_duration;
use kvrelay::{Client, Error};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "kvrelay")]
#[command(about = "kvrelay line-protocol client")]
#[command(version)]
struct Cli {
    /// Coordinator host
    #[arg(long, env = "HOST_IP_ADDR")]
    host: String,

    /// Coordinator port
    #[arg(long, env = "HOST_PORT")]
    port: u16,

    /// How long to wait for each response (e.g. 2s, 500ms)
    #[arg(long, default_value = "2s")]
    timeout: String,

    /// Commands to run instead of prompting
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let timeout = parse_duration(&cli.timeout)?;

    println!("Connecting to {}:{}", cli.host, cli.port);
    let mut client = Client::connect((cli.host.as_str(), cli.port), timeout).await?;
    println!("Connected successfully!");

    if !cli.commands.is_empty() {
        for command in &cli.commands {
            print_response(client.send(command).await)?;
        }
        return Ok(());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("Enter command (e.g., 'PUT key value', 'GET key', or type 'exit' to quit): ");
        std::io::stdout().flush()?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let command = line.trim();
        if command.eq_ignore_ascii_case("exit") {
            break;
        }
        if command.is_empty() {
            continue;
        }

        print_response(client.send(command).await)?;
    }

    println!("Closing connection.");
    Ok(())
}

/// Print a response; a missing response is reported, a dead connection is fatal
fn print_response(result: kvrelay::Result<String>) -> anyhow::Result<()> {
    match result {
        Ok(response) => println!("Server response: {}", response),
        Err(Error::Timeout(_)) => println!("No response received from server (timeout)."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

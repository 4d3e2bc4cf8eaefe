use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Line client for the Surge world server", long_about = None)]
struct Cli {
    /// Address of the world server.
    #[arg(long, default_value = "127.0.0.1:8080")]
    endpoint: String,
    /// Seconds to wait before reconnecting after a dropped connection.
    #[arg(long, default_value_t = 5)]
    retry_secs: u64,
}

enum SessionEnd {
    /// Stdin closed; nothing left to send.
    InputClosed,
    ServerClosed,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let retry = Duration::from_secs(cli.retry_secs);
    let mut input = spawn_stdin_reader();

    loop {
        match TcpStream::connect(&cli.endpoint).await {
            Ok(stream) => {
                info!("Connected to {}. Type HELP for commands.", cli.endpoint);
                match run_session(stream, &mut input).await {
                    Ok(SessionEnd::InputClosed) => break,
                    Ok(SessionEnd::ServerClosed) => warn!("Server closed the connection"),
                    Err(err) => warn!("Connection error: {}", err),
                }
            }
            Err(err) => warn!("Failed to connect to {}: {}", cli.endpoint, err),
        }
        info!("Reconnecting in {} seconds...", retry.as_secs());
        tokio::time::sleep(retry).await;
    }

    Ok(())
}

/// Forward stdin lines into a channel so they survive reconnects.
fn spawn_stdin_reader() -> UnboundedReceiver<String> {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if sender.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

async fn run_session(stream: TcpStream, input: &mut UnboundedReceiver<String>) -> Result<SessionEnd> {
    let (read_half, mut write_half) = stream.into_split();
    let mut server_lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = server_lines.next_line() => match line? {
                Some(line) => println!("{line}"),
                None => return Ok(SessionEnd::ServerClosed),
            },
            line = input.recv() => match line {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(request = line, "request.sent");
                    write_half.write_all(line.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                }
                None => {
                    write_half.shutdown().await?;
                    return Ok(SessionEnd::InputClosed);
                }
            },
        }
    }
}

//! Command line client for the ingestion node

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

use leafscan_node::client::Client;
use leafscan_node::codec::DEFAULT_MAX_FRAME_BYTES;
use leafscan_node::protocol::SubmitterId;

#[derive(Parser, Debug)]
#[command(name = "leafscan-client")]
#[command(about = "Upload leaf images for classification and query past results")]
#[command(version)]
struct Args {
    /// Ingestion server address
    #[arg(long, default_value = "127.0.0.1:5000", env = "LEAFSCAN_SERVER")]
    server: String,

    /// Must match the server's CHUNK_SIZE
    #[arg(long, default_value_t = 65536, env = "CHUNK_SIZE")]
    chunk_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload images over one connection and wait for each result
    Send {
        #[arg(long, num_args = 1.., required = true)]
        images: Vec<PathBuf>,

        /// Submitter id; a random numeric id is used when omitted
        #[arg(long)]
        submitter: Option<String>,
    },
    /// Show a submitter's past results
    History {
        #[arg(long)]
        submitter: String,
    },
    /// Check that the TCP front end and the health endpoint respond
    Check {
        #[arg(long, default_value = "http://127.0.0.1:9100/health")]
        health_url: String,
    },
}

/// Numeric ids stay numeric on the wire
fn parse_submitter(raw: &str) -> SubmitterId {
    match raw.parse::<i64>() {
        Ok(n) => SubmitterId::Number(n),
        Err(_) => SubmitterId::Text(raw.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Send { images, submitter } => {
            let submitter = match submitter {
                Some(raw) => parse_submitter(&raw),
                None => SubmitterId::Number(rand::rng().random_range(1..=i32::MAX as i64)),
            };
            let mut client = Client::connect(&args.server, args.chunk_size, DEFAULT_MAX_FRAME_BYTES).await?;

            let mut task_ids = Vec::new();
            for image in &images {
                if !image.exists() {
                    println!("Image {} does not exist, skipping", image.display());
                    continue;
                }
                let outcome = client.send_image(image, &submitter).await?;
                match outcome.task_id() {
                    Some(task_id) => {
                        println!("{} accepted, task {}", image.display(), task_id);
                        task_ids.push(task_id.to_string());
                    }
                    None => println!("{} rejected: {}", image.display(), outcome.reply),
                }
                if let Some(result) = outcome.result {
                    println!("Result: {}", serde_json::to_string_pretty(&result)?);
                }
            }

            println!("\nSubmitter: {}", submitter);
            if task_ids.is_empty() {
                println!("Tasks created: none");
            } else {
                println!("Tasks created: {}", task_ids.join(", "));
            }
        }
        Command::History { submitter } => {
            let mut client = Client::connect(&args.server, args.chunk_size, DEFAULT_MAX_FRAME_BYTES).await?;
            let reply = client.history(&parse_submitter(&submitter)).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Command::Check { health_url } => {
            let server_ok = tokio::time::timeout(
                Duration::from_secs(3),
                tokio::net::TcpStream::connect(&args.server),
            )
            .await
            .map(|connected| connected.is_ok())
            .unwrap_or(false);
            println!("Ingestion server {}: {}", args.server, if server_ok { "up" } else { "unreachable" });

            let health = check_health(&health_url).await;
            match &health {
                Ok(body) => println!("Health endpoint: {}", body),
                Err(e) => println!("Health endpoint: unreachable ({})", e),
            }

            if server_ok && health.is_ok() {
                println!("All systems operational");
            } else {
                println!("Some components are not responding");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// GET the health endpoint; non-2xx responses are errors
async fn check_health(url: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        anyhow::bail!("{} {}", status, body);
    }
    Ok(body)
}

//! Command-line driver for the X-ray chat orchestrator.
//!
//! Runs turns against the simulated detector and language model and
//! prints the SSE frames a client would receive.
//!
//! ```bash
//! xray-chat chat --message "Phân tích ảnh này" --image 2048x2048
//! xray-chat parse --text '{"tool_call": {"name": "generate_report", "args": {}}}'
//! RUST_LOG=debug XRAY_STREAM_HEARTBEAT_SECS=5 xray-chat status
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::info;
use xray_chat::mock::{MockDetector, MockLanguageModel};
use xray_chat::{ChatConfig, Orchestrator, Services, TurnRequest, XrayImage};
use xray_core::detection::Detection;
use xray_core::tool_call::ToolCallParser;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one turn and print the event stream as SSE
    Chat {
        /// The doctor's message
        #[arg(long)]
        message: String,

        /// Attach a blank image of this size, e.g. 2048x2048
        #[arg(long)]
        image: Option<String>,

        /// JSON file with detections already recorded for the study
        #[arg(long)]
        detections_json: Option<PathBuf>,

        /// Delay between generated chunks, in milliseconds
        #[arg(long, default_value_t = 0)]
        chunk_delay_ms: u64,
    },
    /// Print the effective configuration and breaker status as JSON
    Status,
    /// Run the tool-call parser on a piece of model output
    Parse {
        #[arg(long)]
        text: String,
    },
}

fn parse_dims(size: &str) -> Result<(u32, u32)> {
    let (w, h) = size
        .split_once(['x', 'X'])
        .with_context(|| format!("image size must look like WIDTHxHEIGHT, got {size:?}"))?;
    let width = w.trim().parse::<u32>().context("invalid image width")?;
    let height = h.trim().parse::<u32>().context("invalid image height")?;
    if width == 0 || height == 0 {
        bail!("image dimensions must be positive");
    }
    Ok((width, height))
}

fn build_services(config: &ChatConfig, chunk_delay: Duration) -> Services {
    Services::new(
        config,
        Arc::new(MockDetector::new()),
        Arc::new(MockLanguageModel::new().with_chunk_delay(chunk_delay)),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ChatConfig::from_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    match args.command {
        Command::Chat {
            message,
            image,
            detections_json,
            chunk_delay_ms,
        } => {
            let mut request = TurnRequest::new(uuid::Uuid::new_v4().to_string(), message);
            if let Some(size) = image {
                let (width, height) = parse_dims(&size)?;
                request = request.with_image(XrayImage::blank(width, height));
            }
            if let Some(path) = detections_json {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let detections: Vec<Detection> = serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse detections in {}", path.display()))?;
                request = request.with_detections(detections);
            }

            let services = build_services(&config, Duration::from_millis(chunk_delay_ms)).shared();
            let orchestrator = Orchestrator::new(services, config);
            info!(session_id = %request.session_id, "running turn");

            let (stream, turn) = orchestrator.stream_turn(request);
            let mut frames = std::pin::pin!(stream.into_sse());
            while let Some(frame) = frames.next().await {
                print!("{frame}");
            }
            let summary = turn.await.context("turn task failed")?;
            info!(
                outcome = ?summary.outcome,
                tool = ?summary.tool,
                detections = summary.detections.len(),
                total_tokens = summary.usage.total_tokens,
                "turn finished"
            );
        }
        Command::Status => {
            let services = build_services(&config, Duration::ZERO);
            let status = serde_json::json!({
                "model": config.model_label,
                "stream": {
                    "heartbeat_interval_secs": config.stream.heartbeat_interval.as_secs_f64(),
                    "timeout_secs": config.stream.timeout.as_secs_f64(),
                    "queue_capacity": config.stream.queue_capacity,
                },
                "fusion": config.fusion,
                "circuit_breakers": services.breakers().status_all(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Parse { text } => match ToolCallParser::parse_with_strategy(&text) {
            Some((call, strategy)) => {
                info!(?strategy, "tool call recognized");
                println!("{}", serde_json::to_string_pretty(&call)?);
            }
            None => println!("null"),
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dims() {
        assert_eq!(parse_dims("2048x1024").unwrap(), (2048, 1024));
        assert!(parse_dims("2048").is_err());
        assert!(parse_dims("0x10").is_err());
    }
}

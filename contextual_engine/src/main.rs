//! Main entry point for the contextual reasoning CLI.

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use contextual_engine::{
    batch, cli,
    orchestrator::{Orchestrator, ReasoningEvent},
    settings::Settings,
    telemetry,
    types::{Context, ReasoningOptions},
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let settings = Settings::load_from(args.config.as_deref())?;
    telemetry::init(&settings.logging)?;

    match args.command {
        cli::Commands::Reason {
            query,
            context,
            level,
            stream,
            json,
        } => {
            let context = parse_context(context.as_deref())?;
            let options = ReasoningOptions {
                task_type: None,
                complexity_preference: level,
            };
            let engine = Orchestrator::new(settings)?;
            let response = if stream {
                let mut events = engine.reason_stream(&query, context, options)?;
                let mut last = None;
                loop {
                    let event = tokio::select! {
                        event = events.next() => event,
                        _ = tokio::signal::ctrl_c() => {
                            warn!("Interrupted, finishing with completed subsystems");
                            events.cancel();
                            continue;
                        }
                    };
                    let Some(event) = event else { break };
                    match event {
                        ReasoningEvent::Assessed { level, .. } => println!("level: {level}"),
                        ReasoningEvent::Step(entry) => {
                            println!("[{}] {}", entry.step, entry.message)
                        }
                        ReasoningEvent::Completed(response) => last = Some(*response),
                        ReasoningEvent::Started { .. } => {}
                    }
                }
                last.ok_or_else(|| anyhow!("reasoning stream ended without a response"))?
            } else {
                let cancel = CancellationToken::new();
                let on_interrupt = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, finishing with completed subsystems");
                        on_interrupt.cancel();
                    }
                });
                engine
                    .reason_with_cancel(&query, context, options, cancel)
                    .await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.response);
                println!(
                    "\nconfidence {:.1} | {} components | {:.3}s",
                    response.confidence, response.components_used, response.processing_time
                );
            }
            Ok(())
        }
        cli::Commands::Batch { config } => batch::run(config, settings).await,
        cli::Commands::Status => {
            let engine = Orchestrator::new(settings)?;
            let status = engine.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn parse_context(raw: Option<&str>) -> Result<Context> {
    let Some(raw) = raw else {
        return Ok(Context::new());
    };
    let value: serde_json::Value = serde_json::from_str(raw).context("--context is not valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(anyhow!("--context must be a JSON object")),
    }
}

// Copyright (c) 2025 QA Platform Team
// SPDX-License-Identifier: Apache-2.0

//! Conductor process binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use conductor_broker::{
    BrokerError, InboundCommand, InboxConsumer, LapinInboxConsumer, LapinOutboxPublisher,
    OutboxTopology, QueueTopology, RawDelivery,
};
use conductor_core::{Config, EventRouter, WorkflowManager};
use conductor_state::SqliteGateway;
use tracing::{error, info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "QA case workflow orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without connecting to anything
    Validate {
        /// Path to the YAML configuration file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Connect the broker and store, and run the event loop until shutdown
    Run {
        /// Path to the YAML configuration file
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("conductor={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_config(&file),
        Commands::Run { file } => run(&file).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn validate_config(file_path: &str) -> Result<()> {
    println!("{} {}", "Validating configuration:".cyan().bold(), file_path);

    let config = Config::load(file_path)
        .with_context(|| format!("failed to load configuration from {file_path}"))?;

    println!("{}", "\u{2713} Configuration is valid".green().bold());
    println!("  Broker: {}", config.broker_url);
    println!("  Store: {}", config.store_path);
    println!(
        "  Workflow steps: {}",
        config.workflow.first_step().map_or(0, |_| 1)
    );

    Ok(())
}

async fn run(file_path: &str) -> Result<()> {
    info!(file_path, "loading configuration");
    let config = Config::load(file_path)
        .with_context(|| format!("failed to load configuration from {file_path}"))?;

    let gateway = Arc::new(
        SqliteGateway::connect(&config.store_path)
            .await
            .with_context(|| format!("failed to open store at {}", config.store_path))?,
    );

    let publisher = Arc::new(
        LapinOutboxPublisher::connect(
            &config.broker_url,
            OutboxTopology {
                file_transfer_queue: config.file_transfer_queue.clone(),
                remote_executor_queue: config.remote_executor_queue.clone(),
            },
        )
        .await
        .context("failed to connect outbox publisher")?,
    );

    let mut consumer = LapinInboxConsumer::connect(
        &config.broker_url,
        QueueTopology {
            queue: config.inbox_queue.clone(),
            dead_letter_exchange: config.dead_letter_exchange.clone(),
            dead_letter_queue: format!("{}.dlq", config.inbox_queue),
        },
        config.prefetch,
    )
    .await
    .context("failed to connect inbox consumer")?;

    let manager = Arc::new(WorkflowManager::new(
        gateway,
        publisher,
        config.workflow.clone(),
        config.transfer.clone(),
    ));

    let max_retry_count = config.max_retry_count;

    info!("conductor event loop starting");
    println!("{}", "Conductor running. Press Ctrl+C to stop.".cyan());

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, stopping consumer");
                break;
            }
            delivery = consumer.recv() => {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        error!(error = %e, "consumer stream failed, stopping");
                        break;
                    }
                };
                handle_delivery(&mut consumer, &manager, delivery, max_retry_count).await;
            }
        }
    }

    info!("conductor event loop stopped");
    Ok(())
}

async fn handle_delivery<G, P>(
    consumer: &mut LapinInboxConsumer,
    manager: &Arc<WorkflowManager<G, P>>,
    delivery: RawDelivery,
    max_retry_count: u32,
) where
    G: conductor_state::Gateway + Send + Sync + 'static,
    P: conductor_broker::OutboxPublisher + Send + Sync + 'static,
{
    let envelope = match delivery.decode() {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "malformed envelope, dead-lettering");
            let _ = consumer.dead_letter(delivery).await;
            return;
        }
    };

    let span = tracing::info_span!(
        "handle_envelope",
        command = %envelope.command,
        correlation_id = %envelope.correlation_id,
    );

    let command = match InboundCommand::try_from(&envelope) {
        Ok(command) => command,
        Err(BrokerError::UnknownCommand(name)) => {
            let _enter = span.enter();
            warn!(command = %name, "unknown command, acking and dropping");
            conductor_core::metrics::record_event_handled(&envelope.command, "ack", 0.0);
            drop(_enter);
            let _ = consumer.ack(delivery).await;
            return;
        }
        Err(e) => {
            let _enter = span.enter();
            warn!(error = %e, "malformed envelope payload, dead-lettering");
            drop(_enter);
            let _ = consumer.dead_letter(delivery).await;
            return;
        }
    };

    let event = EventRouter::route(command);
    let start = std::time::Instant::now();

    let manager = manager.clone();
    let outcome = tokio::spawn(async move { manager.handle(event).await })
        .instrument(span.clone())
        .await;
    let elapsed = start.elapsed().as_secs_f64();
    let _enter = span.enter();

    match outcome {
        Ok(Ok(())) => {
            conductor_core::metrics::record_event_handled(&envelope.command, "ack", elapsed);
            drop(_enter);
            let _ = consumer.ack(delivery).await;
        }
        Ok(Err(err)) => {
            let decision = err.ack_decision();
            warn!(error = %err, decision = ?decision, "handler returned an error");
            conductor_core::metrics::record_event_handled(
                &envelope.command,
                ack_decision_label(decision),
                elapsed,
            );
            drop(_enter);
            apply_ack_decision(consumer, delivery, decision).await;
        }
        Err(join_err) if join_err.is_panic() => {
            error!("handler panicked, treating as a poison message");
            match poison_message_decision(envelope.retry_count, max_retry_count) {
                PoisonDecision::Redeliver => {
                    conductor_core::metrics::record_event_handled(&envelope.command, "nack_requeue", elapsed);
                    drop(_enter);
                    let _ = consumer.redeliver_incremented(delivery).await;
                }
                PoisonDecision::DeadLetter => {
                    conductor_core::metrics::record_event_handled(&envelope.command, "dead_letter", elapsed);
                    drop(_enter);
                    let _ = consumer.dead_letter(delivery).await;
                }
            }
        }
        Err(_) => {
            warn!("handler task was cancelled before completing");
        }
    }
}

async fn apply_ack_decision(
    consumer: &mut LapinInboxConsumer,
    delivery: RawDelivery,
    decision: conductor_core::AckDecision,
) {
    let result = match decision {
        conductor_core::AckDecision::Ack => consumer.ack(delivery).await,
        conductor_core::AckDecision::NackRequeue => consumer.nack_requeue(delivery).await,
        conductor_core::AckDecision::DeadLetter => consumer.dead_letter(delivery).await,
    };
    if let Err(e) = result {
        error!(error = %e, "failed to apply ack decision to the broker");
    }
}

fn ack_decision_label(decision: conductor_core::AckDecision) -> &'static str {
    match decision {
        conductor_core::AckDecision::Ack => "ack",
        conductor_core::AckDecision::NackRequeue => "nack_requeue",
        conductor_core::AckDecision::DeadLetter => "dead_letter",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoisonDecision {
    Redeliver,
    DeadLetter,
}

/// §7's poison-message policy: redeliver with `retry_count` incremented
/// while the envelope's current `retry_count` is still under the ceiling;
/// once a delivery arrives with `retry_count >= max_retry_count`, dead-letter
/// instead of redelivering again.
fn poison_message_decision(retry_count: u32, max_retry_count: u32) -> PoisonDecision {
    if retry_count >= max_retry_count {
        PoisonDecision::DeadLetter
    } else {
        PoisonDecision::Redeliver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivers_while_under_the_retry_ceiling() {
        // Scenario E: max_retry=2 -> redeliver at retry_count 0 and 1.
        assert_eq!(poison_message_decision(0, 2), PoisonDecision::Redeliver);
        assert_eq!(poison_message_decision(1, 2), PoisonDecision::Redeliver);
    }

    #[test]
    fn dead_letters_the_delivery_that_reaches_the_ceiling() {
        // Scenario E: the third delivery arrives with retry_count == 2,
        // already at the ceiling, so it is dead-lettered instead.
        assert_eq!(poison_message_decision(2, 2), PoisonDecision::DeadLetter);
        assert_eq!(poison_message_decision(3, 2), PoisonDecision::DeadLetter);
    }

    #[test]
    fn a_two_retry_ceiling_redelivers_exactly_twice() {
        let mut retry_count = 0;
        let mut redeliveries = 0;
        loop {
            match poison_message_decision(retry_count, 2) {
                PoisonDecision::Redeliver => {
                    redeliveries += 1;
                    retry_count += 1;
                }
                PoisonDecision::DeadLetter => break,
            }
        }
        assert_eq!(redeliveries, 2);
    }
}

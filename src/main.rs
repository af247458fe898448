use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;

use ara_stream_messenger::config::{Settings, WorkerSettings};
use ara_stream_messenger::error::QueueError;
use ara_stream_messenger::queue::{create_connection, Connection, Envelope};
use ara_stream_messenger::redis::{BackoffConfig, ExponentialBackoff, StreamBackend};
use ara_stream_messenger::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(&settings.log)?;
    tracing::info!("Configuration loaded");

    let mut connection =
        create_connection(&settings.transport.dsn, &settings.transport.options).await?;
    connection.setup().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal_handler(shutdown_tx));

    let handled = consume(&mut connection, &settings.worker, shutdown_rx).await?;

    tracing::info!(handled = handled, "Worker shutdown complete");
    Ok(())
}

/// Receive, log and acknowledge messages until shutdown or `max_messages`.
async fn consume<B: StreamBackend>(
    connection: &mut Connection<B>,
    worker: &WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let idle = Duration::from_millis(worker.idle_sleep_ms);
    let mut backoff = ExponentialBackoff::new(BackoffConfig::from(worker));
    let mut handled = 0u64;

    while !*shutdown.borrow() {
        if worker.max_messages != 0 && handled >= worker.max_messages {
            tracing::info!(max_messages = worker.max_messages, "Message limit reached");
            break;
        }

        let pause = match handle_next(connection).await {
            Ok(true) => {
                backoff.reset();
                handled += 1;
                continue;
            }
            Ok(false) => {
                backoff.reset();
                idle
            }
            Err(e) if e.is_retryable() => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Queue call failed, backing off"
                );
                delay
            }
            Err(e @ QueueError::Purge { .. }) => {
                tracing::error!(error = %e, "Settled message left in the stream");
                handled += 1;
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker stopped on a non-retryable error");
                return Err(e.into());
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => {}
        }
    }

    Ok(handled)
}

/// Handle one message. Returns whether a message was available.
async fn handle_next<B: StreamBackend>(
    connection: &mut Connection<B>,
) -> Result<bool, QueueError> {
    let Some(received) = connection.get().await? else {
        return Ok(false);
    };

    match received.message().map(Envelope::from_json) {
        Some(Ok(envelope)) => {
            tracing::info!(
                id = %received.id,
                headers = ?envelope.headers,
                body = %envelope.body,
                "Message received"
            );
            connection.ack(&received.id).await?;
        }
        _ => {
            tracing::warn!(id = %received.id, "Rejecting message without a readable envelope");
            connection.reject(&received.id).await?;
        }
    }
    Ok(true)
}

async fn shutdown_signal_handler(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
}

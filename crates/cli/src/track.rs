//! Continuous tracking: conversion passes on a configurable interval with
//! graceful signal-driven shutdown between cycles.

use std::time::Duration;

use anyhow::Result;
use tokio::time;
use tracing::{error, info};

use accugit_core::config::AppConfig;
use accugit_core::engine::ConversionEngine;

/// Consecutive failed cycles tolerated before tracking aborts.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Run conversion passes forever, one per interval tick. A cycle in flight
/// always finishes; a shutdown signal takes effect at the next cycle
/// boundary.
pub async fn run_track(config: AppConfig) -> Result<()> {
    let interval_secs = config.track.interval_secs.max(1);
    let mut engine = ConversionEngine::new(config)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    let mut interval = time::interval(Duration::from_secs(interval_secs));
    let mut consecutive_failures = 0u32;

    info!(interval_secs, "tracking started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.run().await {
                    Ok(summary) => {
                        consecutive_failures = 0;
                        info!(
                            processed_through = summary.processed_through,
                            "tracking cycle complete"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            error = %format!("{:#}", e),
                            consecutive_failures,
                            "tracking cycle failed"
                        );
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            return Err(e.context("tracking aborted after repeated failures"));
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    info!("tracking stopped");
                    return Ok(());
                }
            }
            _ = shutdown_rx.changed() => {
                info!("tracking stopped");
                return Ok(());
            }
        }
    }
}

/// Wait for a shutdown signal (SIGTERM, SIGINT, or Ctrl+C).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

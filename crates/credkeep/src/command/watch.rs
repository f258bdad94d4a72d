// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! `credkeep watch`: run the monitor in the foreground until interrupted.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::RefreshCoordinator;
use crate::event::LifecycleEvent;
use crate::monitor::spawn_monitor;

pub async fn run(
    coordinator: Arc<RefreshCoordinator>,
    mut events: broadcast::Receiver<LifecycleEvent>,
) -> anyhow::Result<i32> {
    let shutdown = CancellationToken::new();
    let monitor = spawn_monitor(Arc::clone(&coordinator), shutdown.clone());
    info!(principal = ?coordinator.current_principal(), "watching credentials");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    shutdown.cancel();
    monitor.await?;
    Ok(0)
}

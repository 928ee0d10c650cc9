//! Background task that keeps the stored credential fresh
//!
//! Checks every `interval` and refreshes once the access token enters the
//! safety margin. After a transient failure the next check comes sooner
//! (`error_interval`). An invalid grant is logged loudly but the loop keeps
//! running so a later re-authorization is picked up without a restart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::manager::{CredentialManager, RefreshCheck};

type Running = (JoinHandle<()>, watch::Sender<bool>);

pub struct TokenMonitor {
    manager: Arc<CredentialManager>,
    interval: Duration,
    error_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl TokenMonitor {
    pub fn new(
        manager: Arc<CredentialManager>,
        interval: Duration,
        error_interval: Duration,
    ) -> Self {
        Self {
            manager,
            interval,
            error_interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the monitor loop. Returns false when it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((handle, _)) = running.as_ref() {
            if !handle.is_finished() {
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor_loop(
            self.manager.clone(),
            self.interval,
            self.error_interval,
            stop_rx,
        ));
        *running = Some((handle, stop_tx));
        log::info!(
            "Token monitor started (interval {:?}, error interval {:?})",
            self.interval,
            self.error_interval
        );
        true
    }

    /// Signal the loop to stop and wait for it. Returns false when it was not running.
    pub async fn stop(&self) -> bool {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some((handle, stop_tx)) = taken else {
            return false;
        };

        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            log::warn!("Token monitor task ended abnormally: {}", e);
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }
}

async fn monitor_loop(
    manager: Arc<CredentialManager>,
    interval: Duration,
    error_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let wait = match manager.check_and_refresh().await {
            Ok(RefreshCheck::Refreshed) => {
                log::info!("Token monitor refreshed the access token");
                interval
            }
            Ok(RefreshCheck::Fresh) => {
                log::debug!("Token monitor: access token still fresh");
                interval
            }
            Ok(RefreshCheck::NoCredential) => {
                log::warn!("Token monitor: no credential stored, waiting for authorization");
                interval
            }
            Err(e) if e.requires_reauthorization() => {
                log::error!("Token monitor: {}", e);
                interval
            }
            Err(e) => {
                log::warn!("Token monitor check failed ({}), retrying in {:?}", e, error_interval);
                error_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.changed() => break,
        }
    }
    log::info!("Token monitor stopped");
}

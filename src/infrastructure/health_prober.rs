//! Health Prober
//!
//! TCP-probes every backend address on a fixed interval and records
//! change-only availability transitions through the configuration store.
//! The next reconciliation tick picks the updated availability up.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::domain::entities::Address;
use crate::domain::ports::ConfigStore;
use crate::error::Error;
use crate::infrastructure::shutdown::ShutdownController;

/// Health probe configuration.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Interval between probe rounds
    pub interval: Duration,
    /// Timeout for each TCP dial
    pub timeout: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Probes backend addresses and records availability transitions.
pub struct HealthProber {
    store: Arc<dyn ConfigStore>,
    config: ProberConfig,
}

impl HealthProber {
    pub fn new(store: Arc<dyn ConfigStore>, config: ProberConfig) -> Self {
        Self { store, config }
    }

    /// Run until shutdown. A tick in progress finishes its in-flight
    /// dials (each bounded by the dial timeout) before the loop exits.
    pub async fn run(&self, shutdown: ShutdownController) {
        let mut rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        // the immediate first fire starts the first probe round right away
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = rx.recv() => break,
            }
            if shutdown.is_shutdown() {
                break;
            }
            if let Err(e) = self.tick_once().await {
                tracing::error!("error during health check: {}", e);
            }
        }
        tracing::info!("health prober stopped");
    }

    /// One probe round: fan out a concurrent dial per address, then apply
    /// change-only updates. All dials complete (or time out) before this
    /// returns.
    pub async fn tick_once(&self) -> Result<(), Error> {
        let backends = self.store.list_backends().await?;
        let timeout = self.config.timeout;

        let mut probes: JoinSet<(Address, Result<(), String>)> = JoinSet::new();
        for backend in backends {
            for address in backend.addresses {
                probes.spawn(async move {
                    let outcome = probe_endpoint(&address.ip, address.port, timeout).await;
                    (address, outcome)
                });
            }
        }

        while let Some(joined) = probes.join_next().await {
            let (address, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("probe task failed: {}", e);
                    continue;
                }
            };

            let available = outcome.is_ok();
            if available == address.available {
                // no transition, no write
                continue;
            }

            let error = outcome.err();
            if let Err(e) = self
                .store
                .record_transition(address.id, available, error.clone())
                .await
            {
                tracing::error!(
                    "failed to log availability change for address {}: {}",
                    address.id,
                    e
                );
                continue;
            }

            if available {
                tracing::info!("backend {}:{} is now available", address.ip, address.port);
            } else {
                tracing::warn!(
                    "backend {}:{} is now unavailable: {}",
                    address.ip,
                    address.port,
                    error.unwrap_or_default()
                );
            }
        }

        Ok(())
    }
}

/// Dial `ip:port`; a successful connect is closed immediately.
async fn probe_endpoint(ip: &str, port: u16, timeout: Duration) -> Result<(), String> {
    let endpoint = format!("{}:{}", ip, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&endpoint)).await {
        Ok(Ok(mut stream)) => {
            let _ = stream.shutdown().await;
            Ok(())
        }
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}

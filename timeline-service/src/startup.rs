//! Application wiring and lifecycle.
//!
//! [`Application`] is the surface an outer layer (HTTP, CLI, scheduler)
//! drives: `ingest()`, `accounts()` and `timeline()`. The binary uses
//! `run_until_stopped()` to ingest once or on a fixed interval.

use crate::config::{IngestionConfig, TimelineConfig};
use crate::error::TimelineError;
use crate::models::{Account, BatchId, TimelineEntry};
use crate::services::{
    AdatreeClient, BatchIdGenerator, BatchIngestor, IngestionReport, MongoConnector,
    StoreConnector, TimelineReconstructor,
};
use crate::services::store::with_session;
use chrono::{DateTime, Utc};
use secrecy::Secret;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct Application {
    banking: AdatreeClient,
    store: Arc<dyn StoreConnector>,
    ingestor: BatchIngestor,
    reconstructor: TimelineReconstructor,
    interval: Option<Duration>,
    shutdown: CancellationToken,
}

impl Application {
    /// Connect to MongoDB, make sure indexes exist and wire the provider
    /// client into the ingestor.
    pub async fn build(config: TimelineConfig) -> Result<Self, AppError> {
        let connector = MongoConnector::new(&config.mongodb);
        connector.ensure_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            AppError::DatabaseError(anyhow::Error::new(e))
        })?;

        let banking = AdatreeClient::new(config.banking.clone()).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to build banking client: {}", e))
        })?;
        if banking.is_configured() {
            tracing::info!(base_url = %config.banking.api_base_url, "Banking client initialized");
        } else {
            tracing::warn!(
                "BANKING_API_TOKEN not configured - only token-supplied ingestion will succeed"
            );
        }

        Ok(Self::from_parts(banking, Arc::new(connector), &config.ingestion))
    }

    pub fn from_parts(
        banking: AdatreeClient,
        store: Arc<dyn StoreConnector>,
        ingestion: &IngestionConfig,
    ) -> Self {
        let ingestor = BatchIngestor::new(
            Arc::new(banking.clone()),
            Arc::clone(&store),
            Arc::new(BatchIdGenerator::new()),
            ingestion.run_timeout,
        );

        Self {
            banking,
            ingestor,
            reconstructor: TimelineReconstructor::new(Arc::clone(&store)),
            store,
            interval: ingestion.interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// One ingestion cycle with the configured bearer token.
    pub async fn ingest(&self) -> Result<IngestionReport, TimelineError> {
        self.ingestor.ingest().await
    }

    /// One ingestion cycle authenticated with a caller-supplied token.
    pub async fn ingest_with_token(
        &self,
        token: Secret<String>,
    ) -> Result<IngestionReport, TimelineError> {
        let banking = Arc::new(self.banking.with_token(token));
        self.ingestor.with_banking(banking).ingest().await
    }

    /// Every account stored by past ingestion runs.
    pub async fn accounts(&self) -> Result<Vec<Account>, TimelineError> {
        with_session(self.store.as_ref(), |session| async move {
            Ok(session.find_accounts().await?)
        })
        .await
    }

    pub async fn timeline(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEntry>, TimelineError> {
        self.reconstructor
            .build(
                account_id,
                BatchId::from_chrono(start),
                BatchId::from_chrono(end),
            )
            .await
    }

    /// Cancelling this token stops `run_until_stopped` after the current run.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Without an interval, ingest once and return the outcome. With one,
    /// ingest on every tick until Ctrl-C, SIGTERM or the shutdown token.
    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        let Some(period) = self.interval else {
            self.ingest().await?;
            return Ok(());
        };

        let shutdown = self.shutdown.clone();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = shutdown_signal() => shutdown.cancel(),
                    _ = shutdown.cancelled() => {}
                }
            }
        });

        tracing::info!(interval_secs = period.as_secs(), "Starting periodic ingestion");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Failures are logged by the ingestor; the schedule keeps going.
            if let Err(e) = self.ingest().await {
                tracing::warn!(error = %e, "Periodic ingestion run failed, waiting for next tick");
            }
        }

        tracing::info!("Periodic ingestion stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

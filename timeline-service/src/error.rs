//! Error taxonomy for ingestion and timeline reconstruction.

use crate::services::banking::BankingError;
use crate::services::store::StoreError;
use service_core::error::AppError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimelineError {
    /// The provider reported no ACTIVE consent arrangement.
    #[error("No active consent found")]
    NoConsent,

    #[error("Upstream error: {0}")]
    Upstream(#[from] BankingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Ingestion run timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TimelineError> for AppError {
    fn from(err: TimelineError) -> Self {
        match err {
            TimelineError::NoConsent => AppError::PreconditionFailed(anyhow::anyhow!(
                TimelineError::NoConsent.to_string()
            )),
            TimelineError::Upstream(e) => AppError::BadGateway(e.to_string()),
            TimelineError::Storage(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            TimelineError::Timeout(limit) => {
                AppError::GatewayTimeout(format!("ingestion exceeded {:?}", limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_boundary_status() {
        let no_consent: AppError = TimelineError::NoConsent.into();
        assert_eq!(no_consent.status_code(), 412);
        assert!(no_consent.to_string().contains("No active consent found"));

        let upstream: AppError = TimelineError::Upstream(BankingError::Status {
            status: 503,
            body: "maintenance".to_string(),
        })
        .into();
        assert_eq!(upstream.status_code(), 502);
        assert!(upstream.to_string().contains("503"));

        let storage: AppError =
            TimelineError::Storage(StoreError::Backend("disk full".to_string())).into();
        assert_eq!(storage.status_code(), 500);

        let timeout: AppError = TimelineError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(timeout.status_code(), 504);
    }
}

//! Domain errors raised while computing a product's invoice rows.

use chrono::NaiveDate;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InvoicingError {
    /// Missing or inconsistent setup: unassigned assets, unknown entities, malformed credits.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A cost line item with unexpected or missing values.
    #[error("data quality error: {0}")]
    DataQuality(String),

    /// No contract charge interval covers the date. Callers keep the original cost.
    #[error("no suitable contract charge interval found for {0}")]
    NoSuitableInterval(NaiveDate),

    #[error("worker terminated abnormally: {0}")]
    WorkerPanicked(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl InvoicingError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::DataQuality(_) => "data_quality",
            Self::NoSuitableInterval(_) => "no_suitable_interval",
            Self::WorkerPanicked(_) => "worker_panicked",
            Self::Store(e) => e.code(),
        }
    }
}

impl From<InvoicingError> for AppError {
    fn from(err: InvoicingError) -> Self {
        match err {
            InvoicingError::Store(e) => e,
            InvoicingError::Configuration(_) | InvoicingError::DataQuality(_) => {
                AppError::BadRequest(anyhow::anyhow!(err.to_string()))
            }
            other => AppError::InternalError(anyhow::anyhow!(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_survives_conversion() {
        let err = InvoicingError::from(AppError::Conflict(anyhow::anyhow!("credit cr-1 changed")));
        assert_eq!(err.kind(), "conflict");
        assert!(matches!(AppError::from(err), AppError::Conflict(_)));
    }

    #[test]
    fn test_data_quality_maps_to_bad_request() {
        let err = InvoicingError::DataQuality("unexpected cost classification".to_string());
        assert!(matches!(AppError::from(err), AppError::BadRequest(_)));
    }
}

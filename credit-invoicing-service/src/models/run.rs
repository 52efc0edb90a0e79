//! Invoicing runs, per-product results and month errors.

use crate::error::InvoicingError;
use crate::models::{CreditUpdate, InvoiceMonth, InvoiceRow, ProductType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One customer invoicing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicingRun {
    pub run_id: Uuid,
    pub customer_id: String,
    pub month: InvoiceMonth,
    pub status: RunStatus,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub invoices_created: i32,
    pub documents_written: i32,
    pub products_failed: i32,
    pub error_message: Option<String>,
}

/// Rows and credit mutations computed by one product worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductOutput {
    pub rows: Vec<InvoiceRow>,
    pub credit_updates: Vec<CreditUpdate>,
    /// Credit consumed by this run, in USD.
    pub credit_consumed: Decimal,
}

/// The single result each product worker sends back to the coordinator.
#[derive(Debug)]
pub struct ProductInvoiceRows {
    pub product: ProductType,
    pub outcome: Result<ProductOutput, InvoicingError>,
}

/// A non-fatal problem recorded for operator review. `product` is `None`
/// for entity or invoice level problems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthError {
    pub error_id: Uuid,
    pub run_id: Uuid,
    pub customer_id: String,
    pub month: InvoiceMonth,
    pub product: Option<ProductType>,
    pub kind: String,
    pub error: String,
    pub details: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

/// Per-product totals of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductStats {
    pub total: Decimal,
    pub credits: Decimal,
    pub adjustments: Decimal,
    pub num_invoices: u32,
    pub num_credits: u32,
    pub num_adjustments: u32,
}

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: InvoicingRun,
    pub product_errors: Vec<MonthError>,
    pub stats: BTreeMap<ProductType, ProductStats>,
    pub credits_written: usize,
}

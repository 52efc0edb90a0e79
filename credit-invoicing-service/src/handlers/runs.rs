use crate::models::{Invoice, InvoiceMonth, InvoicingRun, RunSummary};
use crate::services::reassemble_chunks;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub customer_id: String,
    /// `YYYY-MM`
    pub invoice_month: String,
    #[serde(default)]
    pub time_index: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct InvoicesQuery {
    pub month: String,
}

fn parse_month(key: &str) -> Result<InvoiceMonth, AppError> {
    InvoiceMonth::parse(key).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!(
            "invalid invoice month '{}', expected YYYY-MM",
            key
        ))
    })
}

/// Past months get the closing run, the current month a partial one.
fn default_time_index(month: InvoiceMonth, now: DateTime<Utc>) -> i32 {
    if month < InvoiceMonth::containing(now.date_naive()) {
        -2
    } else {
        -1
    }
}

/// Run the invoicing of one customer month.
pub async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunSummary>), AppError> {
    let customer_id = req.customer_id.trim();
    if customer_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "customer_id is required"
        )));
    }
    let month = parse_month(&req.invoice_month)?;
    let now = Utc::now();
    let time_index = req
        .time_index
        .unwrap_or_else(|| default_time_index(month, now));

    let summary = state
        .coordinator
        .run(customer_id, month, time_index, now)
        .await?;

    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<InvoicingRun>, AppError> {
    state
        .store
        .get_run(run_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoicing run {} not found", run_id)))
}

/// Logical invoices of a customer month, with chunked invoices stitched back together.
pub async fn list_invoices(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<InvoicesQuery>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    let month = parse_month(&query.month)?;
    let documents = state
        .store
        .list_invoice_documents(&customer_id, &month)
        .await?;
    Ok(Json(reassemble_chunks(documents)))
}

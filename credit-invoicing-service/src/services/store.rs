//! Persistence seam between the invoicing run and its collaborators.

use crate::models::{
    AssetSettings, Contract, CostLineItemRecord, CreditRecord, CreditUpdate, CustomerSettings,
    Entity, InvoiceAdjustment, InvoiceDocument, InvoiceMonth, InvoicingRun, MonthError,
    ProductType,
};
use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

/// Reads the inputs of an invoicing run and persists its outputs.
#[async_trait]
pub trait InvoicingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    async fn get_entities(&self, customer_id: &str) -> Result<Vec<Entity>, AppError>;

    async fn get_customer_settings(&self, customer_id: &str)
        -> Result<CustomerSettings, AppError>;

    async fn get_asset_settings(
        &self,
        customer_id: &str,
        product: ProductType,
    ) -> Result<Vec<AssetSettings>, AppError>;

    /// Cost line items of the month in the order the query layer returns them.
    async fn get_cost_line_items(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CostLineItemRecord>, AppError>;

    /// Credits of the product whose end date is after the start of `month`,
    /// plus credits without an end date so the loader can reject them.
    async fn get_credits(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CreditRecord>, AppError>;

    async fn get_adjustments(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceAdjustment>, AppError>;

    async fn get_contracts(&self, customer_id: &str) -> Result<Vec<Contract>, AppError>;

    /// Apply all credit updates atomically. Fails with `AppError::Conflict`
    /// when any credit changed since it was read.
    async fn save_credit_updates(
        &self,
        customer_id: &str,
        updates: &[CreditUpdate],
    ) -> Result<(), AppError>;

    /// Replace the customer's documents of `month` for `products` with `documents`.
    async fn replace_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
        products: &[ProductType],
        documents: &[InvoiceDocument],
    ) -> Result<(), AppError>;

    async fn list_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceDocument>, AppError>;

    async fn record_month_errors(&self, errors: &[MonthError]) -> Result<(), AppError>;

    async fn create_run(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<InvoicingRun, AppError>;

    async fn update_run(&self, run: &InvoicingRun) -> Result<(), AppError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<InvoicingRun>, AppError>;
}

pub type DynStore = Arc<dyn InvoicingStore>;

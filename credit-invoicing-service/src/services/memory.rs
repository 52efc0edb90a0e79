//! In-memory store for tests and local runs.

use crate::models::{
    AssetSettings, Contract, CostLineItemRecord, CreditAlert, CreditAlertKind, CreditRecord,
    CreditUpdate, CustomerSettings, Entity, InvoiceAdjustment, InvoiceDocument, InvoiceMonth,
    InvoicingRun, MonthError, ProductType, RunStatus,
};
use crate::services::store::InvoicingStore;
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    entities: Vec<Entity>,
    customer_settings: HashMap<String, CustomerSettings>,
    asset_settings: Vec<AssetSettings>,
    cost_line_items: HashMap<(String, ProductType, InvoiceMonth), Vec<CostLineItemRecord>>,
    credits: BTreeMap<String, CreditRecord>,
    adjustments: HashMap<(String, ProductType, InvoiceMonth), Vec<InvoiceAdjustment>>,
    contracts: Vec<Contract>,
    documents: Vec<InvoiceDocument>,
    month_errors: Vec<MonthError>,
    runs: HashMap<Uuid, InvoicingRun>,
    failing_reads: HashMap<ProductType, String>,
}

/// `InvoicingStore` backed by process memory, with the same optimistic
/// version check on credit write-back as the database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_entity(&self, entity: Entity) {
        self.state.write().await.entities.push(entity);
    }

    pub async fn set_customer_settings(&self, customer_id: &str, settings: CustomerSettings) {
        self.state
            .write()
            .await
            .customer_settings
            .insert(customer_id.to_string(), settings);
    }

    pub async fn insert_asset_settings(&self, settings: AssetSettings) {
        self.state.write().await.asset_settings.push(settings);
    }

    pub async fn insert_cost_line_items(
        &self,
        customer_id: &str,
        product: ProductType,
        month: InvoiceMonth,
        records: Vec<CostLineItemRecord>,
    ) {
        self.state
            .write()
            .await
            .cost_line_items
            .entry((customer_id.to_string(), product, month))
            .or_default()
            .extend(records);
    }

    pub async fn insert_credit(&self, credit: CreditRecord) {
        self.state
            .write()
            .await
            .credits
            .insert(credit.id.clone(), credit);
    }

    pub async fn insert_adjustment(
        &self,
        customer_id: &str,
        month: InvoiceMonth,
        adjustment: InvoiceAdjustment,
    ) {
        self.state
            .write()
            .await
            .adjustments
            .entry((customer_id.to_string(), adjustment.product, month))
            .or_default()
            .push(adjustment);
    }

    pub async fn insert_contract(&self, contract: Contract) {
        self.state.write().await.contracts.push(contract);
    }

    /// Make every read for `product` fail, to exercise worker isolation.
    pub async fn fail_reads_for(&self, product: ProductType, message: &str) {
        self.state
            .write()
            .await
            .failing_reads
            .insert(product, message.to_string());
    }

    pub async fn credit(&self, credit_id: &str) -> Option<CreditRecord> {
        self.state.read().await.credits.get(credit_id).cloned()
    }

    /// Simulate a concurrent edit by an external credit administration process.
    pub async fn touch_credit(&self, credit_id: &str) {
        if let Some(credit) = self.state.write().await.credits.get_mut(credit_id) {
            credit.updated_utc = Utc::now() + chrono::Duration::milliseconds(1);
        }
    }

    pub async fn month_errors(&self) -> Vec<MonthError> {
        self.state.read().await.month_errors.clone()
    }

    pub async fn documents(&self) -> Vec<InvoiceDocument> {
        self.state.read().await.documents.clone()
    }

    async fn check_reads(&self, product: ProductType) -> Result<(), AppError> {
        match self.state.read().await.failing_reads.get(&product) {
            Some(message) => Err(AppError::DatabaseError(anyhow::anyhow!(message.clone()))),
            None => Ok(()),
        }
    }
}

fn apply_alert(alerts: &mut BTreeMap<CreditAlertKind, CreditAlert>, alert: &Option<CreditAlert>) {
    if let Some(alert) = alert {
        alerts.insert(alert.kind, alert.clone());
    }
}

#[async_trait]
impl InvoicingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_entities(&self, customer_id: &str) -> Result<Vec<Entity>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .entities
            .iter()
            .filter(|e| e.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn get_customer_settings(
        &self,
        customer_id: &str,
    ) -> Result<CustomerSettings, AppError> {
        Ok(self
            .state
            .read()
            .await
            .customer_settings
            .get(customer_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get_asset_settings(
        &self,
        customer_id: &str,
        product: ProductType,
    ) -> Result<Vec<AssetSettings>, AppError> {
        self.check_reads(product).await?;
        Ok(self
            .state
            .read()
            .await
            .asset_settings
            .iter()
            .filter(|a| a.customer_id == customer_id && a.product == product)
            .cloned()
            .collect())
    }

    async fn get_cost_line_items(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CostLineItemRecord>, AppError> {
        self.check_reads(product).await?;
        Ok(self
            .state
            .read()
            .await
            .cost_line_items
            .get(&(customer_id.to_string(), product, *month))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_credits(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CreditRecord>, AppError> {
        self.check_reads(product).await?;
        Ok(self
            .state
            .read()
            .await
            .credits
            .values()
            .filter(|c| c.customer_id == customer_id && c.product == product)
            .filter(|c| c.end_date.map_or(true, |end| end > month.first_day()))
            .cloned()
            .collect())
    }

    async fn get_adjustments(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceAdjustment>, AppError> {
        self.check_reads(product).await?;
        Ok(self
            .state
            .read()
            .await
            .adjustments
            .get(&(customer_id.to_string(), product, *month))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_contracts(&self, customer_id: &str) -> Result<Vec<Contract>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .contracts
            .iter()
            .filter(|c| c.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn save_credit_updates(
        &self,
        customer_id: &str,
        updates: &[CreditUpdate],
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;

        for update in updates {
            let current = state
                .credits
                .get(&update.credit_id)
                .filter(|c| c.customer_id == customer_id)
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!("Credit {} not found", update.credit_id))
                })?;
            if current.updated_utc != update.expected_version {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Credit {} was modified concurrently",
                    update.credit_id
                )));
            }
        }

        let now = Utc::now();
        for update in updates {
            if let Some(credit) = state.credits.get_mut(&update.credit_id) {
                credit.utilization = update.utilization.clone();
                credit.depletion_date = update.depletion_date;
                apply_alert(&mut credit.alerts, &update.alert);
                credit.updated_utc = now;
            }
        }

        Ok(())
    }

    async fn replace_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
        products: &[ProductType],
        documents: &[InvoiceDocument],
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        state.documents.retain(|d| {
            !(d.customer_id == customer_id && d.month == *month && products.contains(&d.product))
        });
        state.documents.extend(documents.iter().cloned());
        Ok(())
    }

    async fn list_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceDocument>, AppError> {
        Ok(self
            .state
            .read()
            .await
            .documents
            .iter()
            .filter(|d| d.customer_id == customer_id && d.month == *month)
            .cloned()
            .collect())
    }

    async fn record_month_errors(&self, errors: &[MonthError]) -> Result<(), AppError> {
        self.state
            .write()
            .await
            .month_errors
            .extend(errors.iter().cloned());
        Ok(())
    }

    async fn create_run(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<InvoicingRun, AppError> {
        let run = InvoicingRun {
            run_id: Uuid::new_v4(),
            customer_id: customer_id.to_string(),
            month: *month,
            status: RunStatus::Running,
            started_utc: Utc::now(),
            completed_utc: None,
            invoices_created: 0,
            documents_written: 0,
            products_failed: 0,
            error_message: None,
        };
        self.state
            .write()
            .await
            .runs
            .insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &InvoicingRun) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        match state.runs.get_mut(&run.run_id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Invoicing run {} not found",
                run.run_id
            ))),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<InvoicingRun>, AppError> {
        Ok(self.state.read().await.runs.get(&run_id).cloned())
    }
}

//! Test helper module for credit-invoicing-service integration tests.
//!
//! Seeds an in-memory store and runs the coordinator end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use credit_invoicing_service::models::{
    AssetSettings, Bucket, Contract, CostLineItemRecord, CreditRecord, CreditUpdate,
    CustomerSettings, Entity, EntityInvoicing, InvoiceAdjustment, InvoiceDocument, InvoiceMonth,
    InvoicingMode, InvoicingRun, MarketplaceSettings, MonthError, ProductType, RunSummary,
    Utilization,
};
use credit_invoicing_service::services::{FinalizePolicy, InvoicingStore, MemoryStore};
use credit_invoicing_service::workers::{CoordinatorSettings, InvoicingCoordinator};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::{Arc, Once};
use uuid::Uuid;

pub const CUSTOMER_ID: &str = "cust-1";
pub const ENTITY_ID: &str = "ent-1";

static TRACING: Once = Once::new();

/// Install the subscriber once per test binary. `RUST_LOG` controls output.
pub fn init_test_tracing() {
    TRACING.call_once(|| init_tracing("credit-invoicing-test", "warn", None));
}

pub fn month() -> InvoiceMonth {
    InvoiceMonth::new(2024, 5).unwrap()
}

/// A closing run on the 5th of the following month.
pub fn closing_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 5, 6, 0, 0).unwrap()
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
}

pub fn coordinator_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        max_invoice_rows: 500,
        default_max_line_items: 10,
        finalize: FinalizePolicy {
            low_cost_threshold: dec!(1.00),
            non_final_expiry: chrono::Duration::days(45),
        },
        plps_base_percent: dec!(3),
    }
}

pub fn entity(id: &str, mode: InvoicingMode) -> Entity {
    Entity {
        id: id.to_string(),
        customer_id: CUSTOMER_ID.to_string(),
        name: format!("{} Ltd", id),
        priority_id: "100100".to_string(),
        currency: "USD".to_string(),
        active: true,
        invoicing: EntityInvoicing {
            mode,
            default_bucket: None,
            marketplace: MarketplaceSettings::default(),
        },
        buckets: vec![],
    }
}

/// A CUSTOM entity whose default bucket is `bucket_id`.
pub fn bucketed_entity(id: &str, bucket_id: &str, bucket_name: &str) -> Entity {
    let bucket = Bucket {
        id: bucket_id.to_string(),
        name: bucket_name.to_string(),
    };
    let mut entity = entity(id, InvoicingMode::Custom);
    entity.invoicing.default_bucket = Some(bucket.clone());
    entity.buckets = vec![bucket];
    entity
}

pub fn asset(product: ProductType, account: &str, entity_id: &str) -> AssetSettings {
    AssetSettings {
        asset_id: format!("{}-{}", product, account),
        customer_id: CUSTOMER_ID.to_string(),
        product,
        entity_id: Some(entity_id.to_string()),
        bucket_id: None,
        tags: vec![],
    }
}

pub fn usage(product: ProductType, account: &str, day: u32, cost: Decimal) -> CostLineItemRecord {
    CostLineItemRecord {
        asset_id: format!("{}-{}", product, account),
        account_key: Some(account.to_string()),
        usage_date: date(day),
        cost,
        cost_type: "usage".to_string(),
        service_id: Some("compute".to_string()),
        sku_id: Some("vm".to_string()),
        is_marketplace: false,
        marketplace_descriptor: None,
        discount: None,
    }
}

pub fn marketplace_usage(account: &str, day: u32, cost: Decimal, descriptor: &str) -> CostLineItemRecord {
    CostLineItemRecord {
        is_marketplace: true,
        marketplace_descriptor: Some(descriptor.to_string()),
        ..usage(ProductType::AmazonWebServices, account, day, cost)
    }
}

pub fn credit(id: &str, product: ProductType, amount: Decimal) -> CreditRecord {
    CreditRecord {
        id: id.to_string(),
        customer_id: CUSTOMER_ID.to_string(),
        name: format!("Credit {}", id),
        product,
        entity_id: Some(ENTITY_ID.to_string()),
        assets: vec![],
        scope: vec![],
        amount,
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2025, 1, 1),
        utilization: Utilization::new(),
        depletion_date: None,
        alerts: Default::default(),
        updated_utc: Utc::now() - chrono::Duration::days(1),
    }
}

/// An in-memory store plus a coordinator running every product worker.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub coordinator: InvoicingCoordinator,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(coordinator_settings())
    }

    pub fn with_settings(settings: CoordinatorSettings) -> Self {
        init_test_tracing();
        let store = Arc::new(MemoryStore::new());
        let coordinator = InvoicingCoordinator::new(store.clone(), settings);
        Self { store, coordinator }
    }

    pub async fn run(&self) -> RunSummary {
        self.coordinator
            .run(CUSTOMER_ID, month(), -2, closing_now())
            .await
            .expect("invoicing run failed")
    }

    pub async fn documents_for(&self, product: ProductType) -> Vec<InvoiceDocument> {
        self.store
            .documents()
            .await
            .into_iter()
            .filter(|d| d.product == product)
            .collect()
    }
}

/// Delegates to a `MemoryStore` but lets another process edit every credit
/// right before the run writes it back.
pub struct ConcurrentEditStore {
    pub inner: Arc<MemoryStore>,
}

#[async_trait]
impl InvoicingStore for ConcurrentEditStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }

    async fn get_entities(&self, customer_id: &str) -> Result<Vec<Entity>, AppError> {
        self.inner.get_entities(customer_id).await
    }

    async fn get_customer_settings(
        &self,
        customer_id: &str,
    ) -> Result<CustomerSettings, AppError> {
        self.inner.get_customer_settings(customer_id).await
    }

    async fn get_asset_settings(
        &self,
        customer_id: &str,
        product: ProductType,
    ) -> Result<Vec<AssetSettings>, AppError> {
        self.inner.get_asset_settings(customer_id, product).await
    }

    async fn get_cost_line_items(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CostLineItemRecord>, AppError> {
        self.inner
            .get_cost_line_items(customer_id, product, month)
            .await
    }

    async fn get_credits(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CreditRecord>, AppError> {
        self.inner.get_credits(customer_id, product, month).await
    }

    async fn get_adjustments(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceAdjustment>, AppError> {
        self.inner.get_adjustments(customer_id, product, month).await
    }

    async fn get_contracts(&self, customer_id: &str) -> Result<Vec<Contract>, AppError> {
        self.inner.get_contracts(customer_id).await
    }

    async fn save_credit_updates(
        &self,
        customer_id: &str,
        updates: &[CreditUpdate],
    ) -> Result<(), AppError> {
        for update in updates {
            self.inner.touch_credit(&update.credit_id).await;
        }
        self.inner.save_credit_updates(customer_id, updates).await
    }

    async fn replace_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
        products: &[ProductType],
        documents: &[InvoiceDocument],
    ) -> Result<(), AppError> {
        self.inner
            .replace_invoice_documents(customer_id, month, products, documents)
            .await
    }

    async fn list_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceDocument>, AppError> {
        self.inner.list_invoice_documents(customer_id, month).await
    }

    async fn record_month_errors(&self, errors: &[MonthError]) -> Result<(), AppError> {
        self.inner.record_month_errors(errors).await
    }

    async fn create_run(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<InvoicingRun, AppError> {
        self.inner.create_run(customer_id, month).await
    }

    async fn update_run(&self, run: &InvoicingRun) -> Result<(), AppError> {
        self.inner.update_run(run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<InvoicingRun>, AppError> {
        self.inner.get_run(run_id).await
    }
}

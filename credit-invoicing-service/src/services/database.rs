//! Database service for credit-invoicing-service.

use crate::models::{
    AssetSettings, Bucket, Contract, CostLineItemRecord, CreditAlert, CreditAlertKind,
    CreditRecord, CreditUpdate, CustomerSettings, Entity, EntityInvoicing, InconclusiveReason,
    InvoiceAdjustment, InvoiceDocument, InvoiceMonth, InvoiceRow, InvoicingMode, InvoicingRun,
    MarketplaceSettings, MonthError, ProductType, RunStatus, Utilization,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::InvoicingStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn parse_product(value: &str) -> Result<ProductType, AppError> {
    ProductType::from_string(value).ok_or_else(|| {
        AppError::DatabaseError(anyhow::anyhow!("Unknown product type '{}'", value))
    })
}

fn parse_month(value: NaiveDate) -> InvoiceMonth {
    InvoiceMonth::containing(value)
}

#[derive(FromRow)]
struct EntityRow {
    entity_id: String,
    customer_id: String,
    name: String,
    priority_id: String,
    currency: String,
    active: bool,
    invoicing_mode: String,
    default_bucket_id: Option<String>,
    marketplace_separate_invoice: bool,
    marketplace_invoice_per_service: bool,
}

#[derive(FromRow)]
struct BucketRow {
    bucket_id: String,
    entity_id: String,
    name: String,
}

#[derive(FromRow)]
struct AssetSettingsRow {
    asset_id: String,
    customer_id: String,
    product: String,
    entity_id: Option<String>,
    bucket_id: Option<String>,
    tags: Vec<String>,
}

impl AssetSettingsRow {
    fn into_settings(self) -> Result<AssetSettings, AppError> {
        Ok(AssetSettings {
            asset_id: self.asset_id,
            customer_id: self.customer_id,
            product: parse_product(&self.product)?,
            entity_id: self.entity_id,
            bucket_id: self.bucket_id,
            tags: self.tags,
        })
    }
}

#[derive(FromRow)]
struct CostLineItemRow {
    asset_id: String,
    account_key: Option<String>,
    usage_date: NaiveDate,
    cost: Decimal,
    cost_type: String,
    service_id: Option<String>,
    sku_id: Option<String>,
    is_marketplace: bool,
    marketplace_descriptor: Option<String>,
    discount: Option<Decimal>,
}

impl From<CostLineItemRow> for CostLineItemRecord {
    fn from(row: CostLineItemRow) -> Self {
        Self {
            asset_id: row.asset_id,
            account_key: row.account_key,
            usage_date: row.usage_date,
            cost: row.cost,
            cost_type: row.cost_type,
            service_id: row.service_id,
            sku_id: row.sku_id,
            is_marketplace: row.is_marketplace,
            marketplace_descriptor: row.marketplace_descriptor,
            discount: row.discount,
        }
    }
}

#[derive(FromRow)]
struct CreditRow {
    credit_id: String,
    customer_id: String,
    name: String,
    product: String,
    entity_id: Option<String>,
    assets: Vec<String>,
    scope: Vec<String>,
    amount: Decimal,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    utilization: Json<Utilization>,
    depletion_date: Option<NaiveDate>,
    alerts: Json<BTreeMap<CreditAlertKind, CreditAlert>>,
    updated_utc: DateTime<Utc>,
}

impl CreditRow {
    fn into_record(self) -> Result<CreditRecord, AppError> {
        Ok(CreditRecord {
            id: self.credit_id,
            customer_id: self.customer_id,
            name: self.name,
            product: parse_product(&self.product)?,
            entity_id: self.entity_id,
            assets: self.assets,
            scope: self.scope,
            amount: self.amount,
            start_date: self.start_date,
            end_date: self.end_date,
            utilization: self.utilization.0,
            depletion_date: self.depletion_date,
            alerts: self.alerts.0,
            updated_utc: self.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct AdjustmentRow {
    adjustment_id: String,
    product: String,
    entity_id: String,
    description: String,
    details: String,
    amount: Decimal,
    currency: String,
    is_final: bool,
}

impl AdjustmentRow {
    fn into_adjustment(self) -> Result<InvoiceAdjustment, AppError> {
        Ok(InvoiceAdjustment {
            id: self.adjustment_id,
            product: parse_product(&self.product)?,
            entity_id: self.entity_id,
            description: self.description,
            details: self.details,
            amount: self.amount,
            currency: self.currency,
            is_final: self.is_final,
        })
    }
}

#[derive(FromRow)]
struct ContractRow {
    contract_id: String,
    customer_id: String,
    active: bool,
    assets: Vec<String>,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    plps_percent: Decimal,
}

impl From<ContractRow> for Contract {
    fn from(row: ContractRow) -> Self {
        Self {
            id: row.contract_id,
            customer_id: row.customer_id,
            active: row.active,
            assets: row.assets,
            start_date: row.start_date,
            end_date: row.end_date,
            plps_percent: row.plps_percent,
        }
    }
}

#[derive(FromRow)]
struct RunRow {
    run_id: Uuid,
    customer_id: String,
    invoice_month: NaiveDate,
    status: String,
    started_utc: DateTime<Utc>,
    completed_utc: Option<DateTime<Utc>>,
    invoices_created: i32,
    documents_written: i32,
    products_failed: i32,
    error_message: Option<String>,
}

impl From<RunRow> for InvoicingRun {
    fn from(row: RunRow) -> Self {
        Self {
            run_id: row.run_id,
            customer_id: row.customer_id,
            month: parse_month(row.invoice_month),
            status: RunStatus::from_string(&row.status),
            started_utc: row.started_utc,
            completed_utc: row.completed_utc,
            invoices_created: row.invoices_created,
            documents_written: row.documents_written,
            products_failed: row.products_failed,
            error_message: row.error_message,
        }
    }
}

#[derive(FromRow)]
struct DocumentRow {
    document_id: Uuid,
    run_id: Uuid,
    customer_id: String,
    entity_id: String,
    invoice_key: String,
    invoice_month: NaiveDate,
    product: String,
    details: String,
    currency: String,
    is_final: bool,
    inconclusive_reason: Option<String>,
    expire_by: Option<DateTime<Utc>>,
    group_id: Option<Uuid>,
    chunk_index: i32,
    rows: Json<Vec<InvoiceRow>>,
    created_utc: DateTime<Utc>,
}

impl DocumentRow {
    fn into_document(self) -> Result<InvoiceDocument, AppError> {
        Ok(InvoiceDocument {
            document_id: self.document_id,
            run_id: self.run_id,
            customer_id: self.customer_id,
            entity_id: self.entity_id,
            invoice_key: self.invoice_key,
            month: parse_month(self.invoice_month),
            product: parse_product(&self.product)?,
            details: self.details,
            currency: self.currency,
            is_final: self.is_final,
            inconclusive_reason: self
                .inconclusive_reason
                .as_deref()
                .and_then(InconclusiveReason::from_string),
            expire_by: self.expire_by,
            group_id: self.group_id,
            chunk_index: self.chunk_index,
            rows: self.rows.0,
            created_utc: self.created_utc,
        })
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "credit-invoicing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl InvoicingStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Entity and Settings Operations
    // =========================================================================

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn get_entities(&self, customer_id: &str) -> Result<Vec<Entity>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_entities"])
            .start_timer();

        let entities = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT entity_id, customer_id, name, priority_id, currency, active, invoicing_mode,
                   default_bucket_id, marketplace_separate_invoice, marketplace_invoice_per_service
            FROM entities
            WHERE customer_id = $1
            ORDER BY entity_id
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get entities: {}", e)))?;

        let buckets = sqlx::query_as::<_, BucketRow>(
            r#"
            SELECT b.bucket_id, b.entity_id, b.name
            FROM buckets b
            JOIN entities e ON e.entity_id = b.entity_id
            WHERE e.customer_id = $1
            ORDER BY b.entity_id, b.bucket_id
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get buckets: {}", e)))?;

        timer.observe_duration();

        let mut by_entity: HashMap<String, Vec<Bucket>> = HashMap::new();
        for row in buckets {
            by_entity.entry(row.entity_id).or_default().push(Bucket {
                id: row.bucket_id,
                name: row.name,
            });
        }

        Ok(entities
            .into_iter()
            .map(|row| {
                let buckets = by_entity.remove(&row.entity_id).unwrap_or_default();
                let default_bucket = row
                    .default_bucket_id
                    .as_deref()
                    .and_then(|id| buckets.iter().find(|b| b.id == id).cloned());
                Entity {
                    id: row.entity_id,
                    customer_id: row.customer_id,
                    name: row.name,
                    priority_id: row.priority_id,
                    currency: row.currency,
                    active: row.active,
                    invoicing: EntityInvoicing {
                        mode: InvoicingMode::from_string(&row.invoicing_mode),
                        default_bucket,
                        marketplace: MarketplaceSettings {
                            separate_invoice: row.marketplace_separate_invoice,
                            invoice_per_service: row.marketplace_invoice_per_service,
                        },
                    },
                    buckets,
                }
            })
            .collect())
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn get_customer_settings(
        &self,
        customer_id: &str,
    ) -> Result<CustomerSettings, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer_settings"])
            .start_timer();

        let max_line_items = sqlx::query_scalar::<_, Option<i32>>(
            "SELECT max_line_items FROM customer_settings WHERE customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get customer settings: {}", e))
        })?
        .flatten();

        timer.observe_duration();

        Ok(CustomerSettings {
            max_line_items: max_line_items.and_then(|v| usize::try_from(v).ok()),
        })
    }

    #[instrument(skip(self), fields(customer_id = %customer_id, product = %product))]
    async fn get_asset_settings(
        &self,
        customer_id: &str,
        product: ProductType,
    ) -> Result<Vec<AssetSettings>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_asset_settings"])
            .start_timer();

        let rows = sqlx::query_as::<_, AssetSettingsRow>(
            r#"
            SELECT asset_id, customer_id, product, entity_id, bucket_id, tags
            FROM asset_settings
            WHERE customer_id = $1 AND product = $2
            ORDER BY asset_id
            "#,
        )
        .bind(customer_id)
        .bind(product.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get asset settings: {}", e))
        })?;

        timer.observe_duration();
        rows.into_iter().map(AssetSettingsRow::into_settings).collect()
    }

    // =========================================================================
    // Cost, Credit and Contract Operations
    // =========================================================================

    #[instrument(skip(self), fields(customer_id = %customer_id, product = %product, month = %month))]
    async fn get_cost_line_items(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CostLineItemRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_cost_line_items"])
            .start_timer();

        let rows = sqlx::query_as::<_, CostLineItemRow>(
            r#"
            SELECT asset_id, account_key, usage_date, cost, cost_type, service_id, sku_id,
                   is_marketplace, marketplace_descriptor, discount
            FROM cost_line_items
            WHERE customer_id = $1 AND product = $2 AND usage_date >= $3 AND usage_date <= $4
            ORDER BY usage_date, line_item_id
            "#,
        )
        .bind(customer_id)
        .bind(product.as_str())
        .bind(month.first_day())
        .bind(month.last_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get cost line items: {}", e))
        })?;

        timer.observe_duration();
        Ok(rows.into_iter().map(CostLineItemRecord::from).collect())
    }

    #[instrument(skip(self), fields(customer_id = %customer_id, product = %product, month = %month))]
    async fn get_credits(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<CreditRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credits"])
            .start_timer();

        let rows = sqlx::query_as::<_, CreditRow>(
            r#"
            SELECT credit_id, customer_id, name, product, entity_id, assets, scope, amount,
                   start_date, end_date, utilization, depletion_date, alerts, updated_utc
            FROM credits
            WHERE customer_id = $1 AND product = $2 AND (end_date IS NULL OR end_date > $3)
            ORDER BY credit_id
            "#,
        )
        .bind(customer_id)
        .bind(product.as_str())
        .bind(month.first_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get credits: {}", e)))?;

        timer.observe_duration();
        rows.into_iter().map(CreditRow::into_record).collect()
    }

    #[instrument(skip(self), fields(customer_id = %customer_id, product = %product, month = %month))]
    async fn get_adjustments(
        &self,
        customer_id: &str,
        product: ProductType,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceAdjustment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_adjustments"])
            .start_timer();

        let rows = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            SELECT adjustment_id, product, entity_id, description, details, amount, currency, is_final
            FROM invoice_adjustments
            WHERE customer_id = $1 AND product = $2 AND invoice_month = $3
            ORDER BY created_utc, adjustment_id
            "#,
        )
        .bind(customer_id)
        .bind(product.as_str())
        .bind(month.first_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get adjustments: {}", e))
        })?;

        timer.observe_duration();
        rows.into_iter().map(AdjustmentRow::into_adjustment).collect()
    }

    #[instrument(skip(self), fields(customer_id = %customer_id))]
    async fn get_contracts(&self, customer_id: &str) -> Result<Vec<Contract>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_contracts"])
            .start_timer();

        let rows = sqlx::query_as::<_, ContractRow>(
            r#"
            SELECT contract_id, customer_id, active, assets, start_date, end_date, plps_percent
            FROM contracts
            WHERE customer_id = $1 AND contract_type = 'plps'
            ORDER BY start_date, contract_id
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get contracts: {}", e)))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Contract::from).collect())
    }

    /// Write back every touched credit in one transaction. Each update only
    /// applies if the credit still carries the version read at load time.
    #[instrument(skip(self, updates), fields(customer_id = %customer_id, count = updates.len()))]
    async fn save_credit_updates(
        &self,
        customer_id: &str,
        updates: &[CreditUpdate],
    ) -> Result<(), AppError> {
        if updates.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_credit_updates"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        for update in updates {
            let alert_kind = update.alert.as_ref().map(|a| match a.kind {
                CreditAlertKind::Depleted => "depleted",
                CreditAlertKind::BurnRate => "burn_rate",
            });

            let result = sqlx::query(
                r#"
                UPDATE credits
                SET utilization = $1,
                    depletion_date = $2,
                    alerts = CASE
                        WHEN $3::text IS NULL THEN alerts
                        ELSE jsonb_set(alerts, ARRAY[$3::text], $4::jsonb)
                    END,
                    updated_utc = NOW()
                WHERE credit_id = $5 AND customer_id = $6 AND updated_utc = $7
                "#,
            )
            .bind(Json(&update.utilization))
            .bind(update.depletion_date)
            .bind(alert_kind)
            .bind(Json(&update.alert))
            .bind(&update.credit_id)
            .bind(customer_id)
            .bind(update.expected_version)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to update credit {}: {}",
                    update.credit_id,
                    e
                ))
            })?;

            if result.rows_affected() == 0 {
                tx.rollback().await.ok();
                error!(
                    customer_id = %customer_id,
                    credit_id = %update.credit_id,
                    "Credit was modified concurrently, write-back rolled back"
                );
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Credit {} was modified concurrently",
                    update.credit_id
                )));
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(customer_id = %customer_id, count = updates.len(), "Credits written back");

        Ok(())
    }

    // =========================================================================
    // Invoice Document Operations
    // =========================================================================

    #[instrument(skip(self, documents), fields(customer_id = %customer_id, month = %month, count = documents.len()))]
    async fn replace_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
        products: &[ProductType],
        documents: &[InvoiceDocument],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["replace_invoice_documents"])
            .start_timer();

        let product_names: Vec<&str> = products.iter().map(|p| p.as_str()).collect();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            DELETE FROM invoice_documents
            WHERE customer_id = $1 AND invoice_month = $2 AND product = ANY($3)
            "#,
        )
        .bind(customer_id)
        .bind(month.first_day())
        .bind(&product_names)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to delete invoice documents: {}", e))
        })?;

        for document in documents {
            sqlx::query(
                r#"
                INSERT INTO invoice_documents (document_id, run_id, customer_id, entity_id, invoice_key, invoice_month, product, details, currency, is_final, inconclusive_reason, expire_by, group_id, chunk_index, rows, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(document.document_id)
            .bind(document.run_id)
            .bind(&document.customer_id)
            .bind(&document.entity_id)
            .bind(&document.invoice_key)
            .bind(document.month.first_day())
            .bind(document.product.as_str())
            .bind(&document.details)
            .bind(&document.currency)
            .bind(document.is_final)
            .bind(document.inconclusive_reason.map(|r| r.as_str()))
            .bind(document.expire_by)
            .bind(document.group_id)
            .bind(document.chunk_index)
            .bind(Json(&document.rows))
            .bind(document.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert invoice document: {}",
                    e
                ))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            customer_id = %customer_id,
            month = %month,
            documents = documents.len(),
            "Invoice documents replaced"
        );

        Ok(())
    }

    #[instrument(skip(self), fields(customer_id = %customer_id, month = %month))]
    async fn list_invoice_documents(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<Vec<InvoiceDocument>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoice_documents"])
            .start_timer();

        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT document_id, run_id, customer_id, entity_id, invoice_key, invoice_month, product,
                   details, currency, is_final, inconclusive_reason, expire_by, group_id, chunk_index,
                   rows, created_utc
            FROM invoice_documents
            WHERE customer_id = $1 AND invoice_month = $2
            ORDER BY invoice_key, chunk_index
            "#,
        )
        .bind(customer_id)
        .bind(month.first_day())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list invoice documents: {}", e))
        })?;

        timer.observe_duration();
        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    #[instrument(skip(self, errors), fields(count = errors.len()))]
    async fn record_month_errors(&self, errors: &[MonthError]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_month_errors"])
            .start_timer();

        for month_error in errors {
            sqlx::query(
                r#"
                INSERT INTO month_errors (error_id, run_id, customer_id, invoice_month, product, kind, error, details, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(month_error.error_id)
            .bind(month_error.run_id)
            .bind(&month_error.customer_id)
            .bind(month_error.month.first_day())
            .bind(month_error.product.map(|p| p.as_str()))
            .bind(&month_error.kind)
            .bind(&month_error.error)
            .bind(&month_error.details)
            .bind(month_error.created_utc)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to record month error: {}", e))
            })?;
        }

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Run Operations
    // =========================================================================

    #[instrument(skip(self), fields(customer_id = %customer_id, month = %month))]
    async fn create_run(
        &self,
        customer_id: &str,
        month: &InvoiceMonth,
    ) -> Result<InvoicingRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_run"])
            .start_timer();

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            INSERT INTO invoicing_runs (run_id, customer_id, invoice_month, status)
            VALUES ($1, $2, $3, $4)
            RETURNING run_id, customer_id, invoice_month, status, started_utc, completed_utc,
                      invoices_created, documents_written, products_failed, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(month.first_day())
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create run: {}", e)))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, status = %run.status))]
    async fn update_run(&self, run: &InvoicingRun) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_run"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoicing_runs
            SET status = $2, completed_utc = $3, invoices_created = $4, documents_written = $5,
                products_failed = $6, error_message = $7
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(run.completed_utc)
        .bind(run.invoices_created)
        .bind(run.documents_written)
        .bind(run.products_failed)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update run: {}", e)))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoicing run {} not found",
                run.run_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run(&self, run_id: Uuid) -> Result<Option<InvoicingRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_run"])
            .start_timer();

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, customer_id, invoice_month, status, started_utc, completed_utc,
                   invoices_created, documents_written, products_failed, error_message
            FROM invoicing_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get run: {}", e)))?;

        timer.observe_duration();
        Ok(row.map(InvoicingRun::from))
    }
}

use crate::error::InvoicingError;
use crate::models::{
    Entity, InvoiceDocument, InvoiceMonth, InvoiceRow, InvoicingMode, InvoicingRun, MonthError,
    ProductInvoiceRows, ProductStats, ProductType, RunStatus, RunSummary,
};
use crate::services::assembler::InvoiceAssembler;
use crate::services::invoices::{
    accumulate_stats, finalize, validate_rows, FinalizePolicy, InvoiceBuilder, InvoiceProblem,
};
use crate::services::metrics::{
    record_credit_consumed, record_error, record_run, record_worker_result,
};
use crate::services::store::DynStore;
use crate::workers::calculator::{CalculatorRegistry, WorkerContext};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Limits and thresholds applied to every customer run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorSettings {
    pub max_invoice_rows: usize,
    pub default_max_line_items: usize,
    pub finalize: FinalizePolicy,
    pub plps_base_percent: Decimal,
}

/// Runs every product worker of one customer month concurrently and turns
/// their rows into invoice documents.
#[derive(Clone)]
pub struct InvoicingCoordinator {
    store: DynStore,
    registry: Arc<CalculatorRegistry>,
    settings: CoordinatorSettings,
}

impl InvoicingCoordinator {
    pub fn new(store: DynStore, settings: CoordinatorSettings) -> Self {
        Self::with_registry(store, Arc::new(CalculatorRegistry::new()), settings)
    }

    pub fn with_registry(
        store: DynStore,
        registry: Arc<CalculatorRegistry>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    #[instrument(skip_all, fields(customer_id = %customer_id, month = %month, time_index = time_index))]
    pub async fn run(
        &self,
        customer_id: &str,
        month: InvoiceMonth,
        time_index: i32,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, AppError> {
        info!("Invoicing run started");

        let mut run = self.store.create_run(customer_id, &month).await?;

        let entities: HashMap<String, Entity> = self
            .store
            .get_entities(customer_id)
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let customer_settings = self.store.get_customer_settings(customer_id).await?;

        let setup_errors: Vec<MonthError> = entities
            .values()
            .filter(|e| {
                e.invoicing.mode == InvoicingMode::Custom && e.invoicing.default_bucket.is_none()
            })
            .map(|e| {
                month_error(
                    &run,
                    now,
                    InvoiceProblem {
                        product: None,
                        kind: "configuration",
                        message: format!(
                            "entity {} uses CUSTOM invoicing without a default bucket",
                            e.id
                        ),
                        details: Some(serde_json::json!({ "entity_id": e.id })),
                    },
                )
            })
            .collect();

        if !setup_errors.is_empty() {
            warn!(
                errors = setup_errors.len(),
                "Invoicing run stopped, entity configuration is incomplete"
            );
            self.store.record_month_errors(&setup_errors).await?;
            run.error_message = Some("entity configuration is incomplete".to_string());
            self.close_run(&mut run, RunStatus::Failed, now).await?;
            return Ok(RunSummary {
                run,
                product_errors: setup_errors,
                stats: BTreeMap::new(),
                credits_written: 0,
            });
        }

        let entities = Arc::new(entities);
        let ctx = WorkerContext {
            store: self.store.clone(),
            customer_id: customer_id.to_string(),
            month,
            time_index,
            now,
            entities: entities.clone(),
            plps_base_percent: self.settings.plps_base_percent,
        };

        let results = self.run_workers(ctx).await;

        let mut month_errors = Vec::new();
        let mut credit_updates = Vec::new();
        let mut completed_products = Vec::new();
        let mut rows_by_owner: BTreeMap<(String, ProductType), Vec<InvoiceRow>> = BTreeMap::new();

        for ProductInvoiceRows { product, outcome } in results {
            let output = match outcome {
                Ok(output) => output,
                Err(e) => {
                    error!(product = %product, error = %e, "Product worker failed");
                    record_worker_result(product.as_str(), "failed");
                    record_error(e.kind());
                    month_errors.push(worker_error(&run, now, product, &e));
                    run.products_failed += 1;
                    continue;
                }
            };

            if let Err(problem) = validate_rows(product, &output.rows, &entities) {
                warn!(product = %product, error = %problem.message, "Dropping invalid product rows");
                record_worker_result(product.as_str(), "invalid");
                month_errors.push(month_error(&run, now, problem));
                run.products_failed += 1;
                continue;
            }

            record_worker_result(product.as_str(), "succeeded");
            record_credit_consumed(product.as_str(), output.credit_consumed);
            credit_updates.extend(output.credit_updates);
            completed_products.push(product);

            for row in output.rows {
                let entity_id = row.entity_id.clone().unwrap_or_default();
                rows_by_owner
                    .entry((entity_id, product))
                    .or_default()
                    .push(row);
            }
        }

        let mut builder = InvoiceBuilder::new(month, &entities);
        for ((entity_id, product), rows) in rows_by_owner {
            builder.add(&entity_id, product, rows);
        }

        let assembler = InvoiceAssembler::for_customer(
            self.settings.default_max_line_items,
            &customer_settings,
            self.settings.max_invoice_rows,
        );

        let mut stats: BTreeMap<ProductType, ProductStats> = BTreeMap::new();
        let mut documents: Vec<InvoiceDocument> = Vec::new();
        let mut invoices_created = 0;

        for mut invoice in builder.into_invoices() {
            if let Err(problem) = finalize(&mut invoice, &self.settings.finalize, now) {
                warn!(invoice_key = %invoice.key, "Invoice not written: {}", problem.message);
                month_errors.push(month_error(&run, now, problem));
                continue;
            }
            assembler.assemble(&mut invoice);
            accumulate_stats(&mut stats, &invoice);
            documents.extend(assembler.documents(&invoice, run.run_id, customer_id, now));
            invoices_created += 1;
        }

        if !credit_updates.is_empty() {
            if let Err(e) = self
                .store
                .save_credit_updates(customer_id, &credit_updates)
                .await
            {
                error!(error = %e, "Credit write-back failed, invoices not written");
                record_error(e.code());
                run.error_message = Some(e.to_string());
                self.close_run(&mut run, RunStatus::Failed, now).await.ok();
                return Err(e);
            }
        }

        self.store
            .replace_invoice_documents(customer_id, &month, &completed_products, &documents)
            .await?;

        if !month_errors.is_empty() {
            self.store.record_month_errors(&month_errors).await?;
        }

        run.invoices_created = invoices_created;
        run.documents_written = documents.len() as i32;
        self.close_run(&mut run, RunStatus::Completed, now).await?;

        info!(
            run_id = %run.run_id,
            invoices = run.invoices_created,
            documents = run.documents_written,
            products_failed = run.products_failed,
            "Invoicing run finished"
        );

        Ok(RunSummary {
            run,
            product_errors: month_errors,
            stats,
            credits_written: credit_updates.len(),
        })
    }

    /// Start one task per product and wait for exactly one result from each.
    /// A panicking worker is reported as a failed product.
    async fn run_workers(&self, ctx: WorkerContext) -> Vec<ProductInvoiceRows> {
        let (tx, mut rx) = mpsc::channel(self.registry.len().max(1));

        for calculator in self.registry.calculators() {
            let calculator = calculator.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            let product = calculator.product();

            tokio::spawn(async move {
                let outcome =
                    match tokio::spawn(async move { calculator.calculate(&ctx).await }).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(InvoicingError::WorkerPanicked(e.to_string())),
                    };
                if tx.send(ProductInvoiceRows { product, outcome }).await.is_err() {
                    warn!(product = %product, "Coordinator stopped listening for worker results");
                }
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(self.registry.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        results.sort_by_key(|r| r.product);
        results
    }

    async fn close_run(
        &self,
        run: &mut InvoicingRun,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        run.status = status;
        run.completed_utc = Some(now);
        self.store.update_run(run).await?;
        record_run(status.as_str());
        Ok(())
    }
}

fn month_error(run: &InvoicingRun, now: DateTime<Utc>, problem: InvoiceProblem) -> MonthError {
    MonthError {
        error_id: Uuid::new_v4(),
        run_id: run.run_id,
        customer_id: run.customer_id.clone(),
        month: run.month,
        product: problem.product,
        kind: problem.kind.to_string(),
        error: problem.message,
        details: problem.details,
        created_utc: now,
    }
}

fn worker_error(
    run: &InvoicingRun,
    now: DateTime<Utc>,
    product: ProductType,
    err: &InvoicingError,
) -> MonthError {
    month_error(
        run,
        now,
        InvoiceProblem {
            product: Some(product),
            kind: err.kind(),
            message: err.to_string(),
            details: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityInvoicing, MarketplaceSettings, ProductOutput};
    use crate::services::memory::MemoryStore;
    use crate::workers::calculator::ProductCalculator;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct FixedCalculator {
        product: ProductType,
        amount: Decimal,
    }

    #[async_trait]
    impl ProductCalculator for FixedCalculator {
        fn product(&self) -> ProductType {
            self.product
        }

        async fn calculate(&self, ctx: &WorkerContext) -> Result<ProductOutput, InvoicingError> {
            Ok(ProductOutput {
                rows: vec![InvoiceRow::line_item(
                    self.product,
                    "Account #1",
                    self.amount,
                    "USD",
                    "e1",
                    None,
                    ctx.package_final(),
                )],
                ..Default::default()
            })
        }
    }

    struct PanickingCalculator;

    #[async_trait]
    impl ProductCalculator for PanickingCalculator {
        fn product(&self) -> ProductType {
            ProductType::Looker
        }

        async fn calculate(&self, _ctx: &WorkerContext) -> Result<ProductOutput, InvoicingError> {
            panic!("looker worker exploded");
        }
    }

    fn settings() -> CoordinatorSettings {
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

    fn entity(mode: InvoicingMode) -> Entity {
        Entity {
            id: "e1".to_string(),
            customer_id: "c1".to_string(),
            name: "Acme".to_string(),
            priority_id: "100".to_string(),
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

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_panicking_worker_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(entity(InvoicingMode::Group)).await;

        let registry = CalculatorRegistry::with_calculators(vec![
            Arc::new(PanickingCalculator),
            Arc::new(FixedCalculator {
                product: ProductType::Navigator,
                amount: dec!(300),
            }),
        ]);
        let coordinator =
            InvoicingCoordinator::with_registry(store.clone(), Arc::new(registry), settings());

        let summary = coordinator
            .run("c1", InvoiceMonth::new(2024, 5).unwrap(), -2, now())
            .await
            .unwrap();

        assert_eq!(summary.run.status, RunStatus::Completed);
        assert_eq!(summary.run.products_failed, 1);
        assert_eq!(summary.run.invoices_created, 1);
        assert_eq!(summary.product_errors.len(), 1);
        assert_eq!(summary.product_errors[0].kind, "worker_panicked");
        assert_eq!(summary.product_errors[0].product, Some(ProductType::Looker));

        let documents = store.documents().await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].product, ProductType::Navigator);
        assert!(documents[0].is_final);
    }

    #[tokio::test]
    async fn test_custom_entity_without_default_bucket_stops_run() {
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(entity(InvoicingMode::Custom)).await;

        let registry = CalculatorRegistry::with_calculators(vec![Arc::new(FixedCalculator {
            product: ProductType::Looker,
            amount: dec!(10),
        })]);
        let coordinator =
            InvoicingCoordinator::with_registry(store.clone(), Arc::new(registry), settings());

        let summary = coordinator
            .run("c1", InvoiceMonth::new(2024, 5).unwrap(), -2, now())
            .await
            .unwrap();

        assert_eq!(summary.run.status, RunStatus::Failed);
        assert!(store.documents().await.is_empty());
        assert_eq!(store.month_errors().await.len(), 1);
        assert_eq!(store.month_errors().await[0].kind, "configuration");
    }

    #[tokio::test]
    async fn test_low_cost_invoice_held_back() {
        let store = Arc::new(MemoryStore::new());
        store.insert_entity(entity(InvoicingMode::Group)).await;

        let registry = CalculatorRegistry::with_calculators(vec![Arc::new(FixedCalculator {
            product: ProductType::Looker,
            amount: dec!(0.50),
        })]);
        let coordinator =
            InvoicingCoordinator::with_registry(store.clone(), Arc::new(registry), settings());

        coordinator
            .run("c1", InvoiceMonth::new(2024, 5).unwrap(), -2, now())
            .await
            .unwrap();

        let documents = store.documents().await;
        assert!(!documents[0].is_final);
        assert_eq!(
            documents[0].inconclusive_reason,
            Some(crate::models::InconclusiveReason::LowCost)
        );
        assert_eq!(
            documents[0].expire_by,
            Some(now() + chrono::Duration::days(45))
        );
    }
}

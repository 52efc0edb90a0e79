use crate::error::InvoicingError;
use crate::models::{
    AssetSettings, CostClassification, CostLineItem, InvoiceRow, ProductOutput, ProductType,
};
use crate::services::allocation::{AllocationLedger, Charge};
use crate::services::marketplace::CreditBatchKey;
use crate::services::metrics::record_plps_miss;
use crate::services::plps::PlpsRecalculator;
use crate::workers::calculator::{
    credit_rows, AssetAssignments, CreditRoute, ProductCalculator, WorkerContext,
    SKIPPED_PRIORITY_ID,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, instrument, warn};

/// Billing state of one Google Cloud project during a run.
#[derive(Debug)]
struct ProjectState {
    entity_id: String,
    bucket_id: Option<String>,
    tags: Vec<String>,
    /// First contract discount seen on the project's costs.
    discount: Option<Decimal>,
}

/// Google Cloud usage: per-project spend, PLPS re-rating and credit redemption.
pub struct GoogleCloudCalculator {
    product: ProductType,
}

impl GoogleCloudCalculator {
    pub fn new(product: ProductType) -> Self {
        Self { product }
    }

    /// Projects may carry their own assignment; otherwise they follow their
    /// billing account.
    fn project_settings<'a>(
        &self,
        assignments: &'a AssetAssignments,
        item: &CostLineItem,
    ) -> Option<&'a AssetSettings> {
        assignments.get(&format!(
            "{}-project-{}",
            ProductType::GoogleCloud.as_str(),
            item.account_key
        ))
    }
}

/// Percent text shown after the project id, e.g. " with 12.50% discount".
fn discount_suffix(discount: Decimal) -> String {
    let percent = ((Decimal::ONE - discount) * dec!(100)).round_dp(2);
    format!(" with {:.2}% discount", percent)
}

#[async_trait]
impl ProductCalculator for GoogleCloudCalculator {
    fn product(&self) -> ProductType {
        self.product
    }

    #[instrument(skip(self, ctx), fields(customer_id = %ctx.customer_id, product = %self.product))]
    async fn calculate(&self, ctx: &WorkerContext) -> Result<ProductOutput, InvoicingError> {
        let product = self.product;
        let is_final = ctx.usage_final();

        let items = ctx.cost_line_items(product).await?;
        let assignments = ctx.asset_assignments(product).await?;

        let has_plps = items
            .iter()
            .any(|item| item.classification == CostClassification::PlpsCharge);
        let contracts = if has_plps {
            ctx.store.get_contracts(&ctx.customer_id).await?
        } else {
            Vec::new()
        };

        let project_keys: Vec<String> = items
            .iter()
            .map(|item| item.account_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut ledger = ctx.credit_ledger(product, &project_keys).await?;

        let mut allocations = AllocationLedger::new();
        let mut projects: BTreeMap<String, ProjectState> = BTreeMap::new();
        let mut recalculators: HashMap<String, PlpsRecalculator> = HashMap::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();

        for item in &items {
            let (settings, entity) = match self.project_settings(&assignments, item) {
                Some(project) if project.entity_id.is_some() => {
                    assignments.resolve(ctx, &project.asset_id)?
                }
                _ => assignments.resolve(ctx, &item.asset_id)?,
            };

            if entity.priority_id == SKIPPED_PRIORITY_ID {
                if skipped.insert(entity.id.clone()) {
                    info!(entity_id = %entity.id, "Skipping billing profile excluded from invoicing");
                }
                continue;
            }

            let project = projects
                .entry(item.account_key.clone())
                .or_insert_with(|| ProjectState {
                    entity_id: entity.id.clone(),
                    bucket_id: settings.bucket_id.clone(),
                    tags: settings.tags.clone(),
                    discount: None,
                });
            if project.discount.is_none() {
                project.discount = item.discount.filter(|d| *d < Decimal::ONE);
            }

            let mut cost = item.cost;
            if item.classification == CostClassification::PlpsCharge {
                let recalculator = recalculators
                    .entry(item.asset_id.clone())
                    .or_insert_with(|| {
                        PlpsRecalculator::from_contracts(
                            ctx.plps_base_percent,
                            &contracts,
                            &item.asset_id,
                            &ctx.month,
                        )
                    });
                match recalculator.recalculate(item.date, item.cost) {
                    Ok(rerated) => cost = rerated,
                    Err(InvoicingError::NoSuitableInterval(date)) => {
                        warn!(
                            account = %item.account_key,
                            date = %date,
                            "No suitable contract charge interval, keeping original cost"
                        );
                        record_plps_miss();
                    }
                    Err(e) => return Err(e),
                }
            }

            let charge = Charge {
                entity_id: &entity.id,
                asset_id: &item.asset_id,
                resource: &item.resource,
                account_key: &item.account_key,
                date: item.date,
                cost,
                discount: item.discount,
            };
            allocations.record(&charge, ledger.credits_mut());
        }

        let mut rows = Vec::new();
        for (project_id, project) in &projects {
            let spend = allocations.spend_for(project_id);
            if spend.is_zero() {
                continue;
            }
            let mut row = InvoiceRow::line_item(
                product,
                format!("Project '{}'", project_id),
                spend,
                "USD",
                &project.entity_id,
                project.bucket_id.clone(),
                is_final,
            )
            .with_tags(project.tags.clone());
            row.details_suffix = project.discount.map(discount_suffix);
            rows.push(row);
        }

        rows.extend(credit_rows(
            product,
            &ledger,
            &allocations,
            is_final,
            |project_id| {
                let project = projects.get(project_id)?;
                Some(CreditRoute {
                    entity_id: project.entity_id.clone(),
                    batch: CreditBatchKey::new(String::new(), project.bucket_id.clone()),
                })
            },
        ));

        ctx.append_adjustments(product, &mut rows).await?;

        let credit_consumed = allocations.total_consumed();
        info!(
            projects = projects.len(),
            rows = rows.len(),
            credit_consumed = %credit_consumed,
            "Google Cloud rows computed"
        );

        Ok(ProductOutput {
            rows,
            credit_updates: ledger.into_updates(),
            credit_consumed,
        })
    }
}

use crate::error::InvoicingError;
use crate::models::{InvoiceRow, ProductOutput, ProductType};
use crate::services::allocation::{AllocationLedger, Charge};
use crate::services::marketplace::{
    split_allocation_key, CreditBatchKey, MarketplaceMode, MarketplaceSplitter, MARKETPLACE_NONE,
};
use crate::workers::calculator::{
    credit_rows, CreditRoute, FlexsaveTotals, ProductCalculator, WorkerContext,
    SKIPPED_PRIORITY_ID,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, instrument};

/// Billing state of one cloud account during a run.
#[derive(Debug)]
struct AccountState {
    entity_id: String,
    bucket_id: Option<String>,
    tags: Vec<String>,
    mode: MarketplaceMode,
    /// Flexsave savings booked on the account's own key.
    negations: Decimal,
}

/// Amazon Web Services usage: per-account spend with marketplace splitting,
/// credit redemption and Flexsave rows.
pub struct AwsCalculator {
    product: ProductType,
}

impl AwsCalculator {
    pub fn new(product: ProductType) -> Self {
        Self { product }
    }
}

#[async_trait]
impl ProductCalculator for AwsCalculator {
    fn product(&self) -> ProductType {
        self.product
    }

    #[instrument(skip(self, ctx), fields(customer_id = %ctx.customer_id, product = %self.product))]
    async fn calculate(&self, ctx: &WorkerContext) -> Result<ProductOutput, InvoicingError> {
        let product = self.product;
        let is_final = ctx.usage_final();

        let items = ctx.cost_line_items(product).await?;
        let assignments = ctx.asset_assignments(product).await?;

        let account_keys: Vec<String> = items
            .iter()
            .map(|item| item.account_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut ledger = ctx.credit_ledger(product, &account_keys).await?;

        let mut allocations = AllocationLedger::new();
        let mut splitter = MarketplaceSplitter::new();
        let mut accounts: BTreeMap<String, AccountState> = BTreeMap::new();
        let mut flexsave = FlexsaveTotals::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();

        for item in &items {
            let (settings, entity) = assignments.resolve(ctx, &item.asset_id)?;

            if entity.priority_id == SKIPPED_PRIORITY_ID {
                if skipped.insert(entity.id.clone()) {
                    info!(entity_id = %entity.id, "Skipping billing profile excluded from invoicing");
                }
                continue;
            }

            let account = accounts
                .entry(item.account_key.clone())
                .or_insert_with(|| AccountState {
                    entity_id: entity.id.clone(),
                    bucket_id: settings.bucket_id.clone(),
                    tags: settings.tags.clone(),
                    mode: MarketplaceMode::None,
                    negations: Decimal::ZERO,
                });

            if item.classification.is_flexsave() {
                flexsave.add(
                    &entity.id,
                    settings.bucket_id.as_deref(),
                    item.classification,
                    item.cost,
                );
                if item.classification.is_flexsave_negation() {
                    allocations.record_uncovered(&item.account_key, item.cost);
                    account.negations += item.cost;
                }
                continue;
            }

            let key = splitter.allocation_key(&item.account_key, item.marketplace.as_deref());
            let charge = Charge {
                entity_id: &entity.id,
                asset_id: &item.asset_id,
                resource: &item.resource,
                account_key: &key,
                date: item.date,
                cost: item.cost,
                discount: item.discount,
            };
            allocations.record(&charge, ledger.credits_mut());
        }

        let mut rows = Vec::new();

        for (account_id, account) in accounts.iter_mut() {
            let entity = ctx.entity(&account.entity_id)?;
            account.mode = MarketplaceMode::for_account(
                &entity.invoicing.marketplace,
                splitter.has_constituents(account_id),
            );

            if account.mode == MarketplaceMode::None {
                let spend = splitter.account_spend(account_id, &allocations) - account.negations;
                if !spend.is_zero() {
                    rows.push(
                        InvoiceRow::line_item(
                            product,
                            format!("Account #{}", account_id),
                            spend,
                            "USD",
                            &account.entity_id,
                            account.bucket_id.clone(),
                            is_final,
                        )
                        .with_tags(account.tags.clone()),
                    );
                }
                continue;
            }

            for constituent in splitter.split(account_id, &allocations, account.negations) {
                if constituent.spend.is_zero() {
                    continue;
                }
                rows.push(
                    InvoiceRow::line_item(
                        product,
                        format!("Account #{} : {}", account_id, constituent.label),
                        constituent.spend,
                        "USD",
                        &account.entity_id,
                        account.bucket_id.clone(),
                        is_final,
                    )
                    .with_tags(account.tags.clone())
                    .with_category(account.mode.category(&constituent.key)),
                );
            }
        }

        rows.extend(credit_rows(
            product,
            &ledger,
            &allocations,
            is_final,
            |allocation_key| {
                let (account_id, constituent) = split_allocation_key(allocation_key);
                let account = accounts.get(account_id)?;
                let category = match account.mode {
                    MarketplaceMode::None => String::new(),
                    mode => mode.category(constituent.unwrap_or(MARKETPLACE_NONE)),
                };
                Some(CreditRoute {
                    entity_id: account.entity_id.clone(),
                    batch: CreditBatchKey::new(category, account.bucket_id.clone()),
                })
            },
        ));

        ctx.append_adjustments(product, &mut rows).await?;
        rows.extend(flexsave.rows(product, is_final));

        let credit_consumed = allocations.total_consumed();
        info!(
            accounts = accounts.len(),
            rows = rows.len(),
            credit_consumed = %credit_consumed,
            "Amazon Web Services rows computed"
        );

        Ok(ProductOutput {
            rows,
            credit_updates: ledger.into_updates(),
            credit_consumed,
        })
    }
}

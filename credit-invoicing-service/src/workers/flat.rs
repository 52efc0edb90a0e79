use crate::error::InvoicingError;
use crate::models::{InvoiceRow, ProductOutput, ProductType};
use crate::workers::calculator::{ProductCalculator, WorkerContext, SKIPPED_PRIORITY_ID};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{info, instrument};

#[derive(Debug)]
struct AssetSpend {
    entity_id: String,
    bucket_id: Option<String>,
    tags: Vec<String>,
    total: Decimal,
}

/// Azure subscriptions and package products: one spend row per billed asset
/// plus manual adjustments. No credits are redeemed.
pub struct FlatCalculator {
    product: ProductType,
}

impl FlatCalculator {
    pub fn new(product: ProductType) -> Self {
        Self { product }
    }

    fn details(&self, account_id: &str) -> String {
        match self.product {
            ProductType::MicrosoftAzure => format!("Subscription {}", account_id),
            ProductType::GSuite | ProductType::Office365 => format!("Domain {}", account_id),
            _ => format!("Account #{}", account_id),
        }
    }

    fn is_final(&self, ctx: &WorkerContext) -> bool {
        match self.product {
            ProductType::MicrosoftAzure => ctx.usage_final(),
            _ => ctx.package_final(),
        }
    }
}

#[async_trait]
impl ProductCalculator for FlatCalculator {
    fn product(&self) -> ProductType {
        self.product
    }

    #[instrument(skip(self, ctx), fields(customer_id = %ctx.customer_id, product = %self.product))]
    async fn calculate(&self, ctx: &WorkerContext) -> Result<ProductOutput, InvoicingError> {
        let product = self.product;
        let is_final = self.is_final(ctx);

        let items = ctx.cost_line_items(product).await?;
        let assignments = ctx.asset_assignments(product).await?;

        let mut assets: BTreeMap<String, AssetSpend> = BTreeMap::new();
        for item in &items {
            let (settings, entity) = assignments.resolve(ctx, &item.asset_id)?;
            if entity.priority_id == SKIPPED_PRIORITY_ID {
                continue;
            }
            assets
                .entry(item.account_key.clone())
                .or_insert_with(|| AssetSpend {
                    entity_id: entity.id.clone(),
                    bucket_id: settings.bucket_id.clone(),
                    tags: settings.tags.clone(),
                    total: Decimal::ZERO,
                })
                .total += item.cost * item.discount.unwrap_or(Decimal::ONE);
        }

        let mut rows: Vec<InvoiceRow> = assets
            .iter()
            .filter(|(_, spend)| !spend.total.is_zero())
            .map(|(account_id, spend)| {
                InvoiceRow::line_item(
                    product,
                    self.details(account_id),
                    spend.total,
                    "USD",
                    &spend.entity_id,
                    spend.bucket_id.clone(),
                    is_final,
                )
                .with_tags(spend.tags.clone())
            })
            .collect();

        ctx.append_adjustments(product, &mut rows).await?;

        info!(assets = assets.len(), rows = rows.len(), "Flat product rows computed");

        Ok(ProductOutput {
            rows,
            ..Default::default()
        })
    }
}

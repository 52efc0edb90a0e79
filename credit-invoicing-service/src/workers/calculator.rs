use crate::error::InvoicingError;
use crate::models::{
    AssetSettings, CostClassification, CostLineItem, Entity, InvoiceMonth, InvoiceRow,
    ProductOutput, ProductType,
};
use crate::services::allocation::AllocationLedger;
use crate::services::assembler::append_adjustments;
use crate::services::ledger::CreditLedger;
use crate::services::marketplace::CreditBatchKey;
use crate::services::store::DynStore;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Entities with this priority id are never invoiced.
pub const SKIPPED_PRIORITY_ID: &str = "999999";

/// Everything a product worker needs to compute its rows. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: DynStore,
    pub customer_id: String,
    pub month: InvoiceMonth,
    /// `-2` for the closing run of the previous month.
    pub time_index: i32,
    pub now: DateTime<Utc>,
    pub entities: Arc<HashMap<String, Entity>>,
    pub plps_base_percent: Decimal,
}

impl WorkerContext {
    /// Usage rows are final once the closing run happens on or after the 3rd.
    pub fn usage_final(&self) -> bool {
        self.time_index == -2 && self.now.day() >= 3
    }

    /// Package rows are final on any closing run.
    pub fn package_final(&self) -> bool {
        self.time_index == -2
    }

    pub fn entity(&self, entity_id: &str) -> Result<&Entity, InvoicingError> {
        self.entities.get(entity_id).ok_or_else(|| {
            InvoicingError::Configuration(format!(
                "entity {} not found on customer {}",
                entity_id, self.customer_id
            ))
        })
    }

    /// Read and validate the month's cost line items of `product`.
    pub async fn cost_line_items(
        &self,
        product: ProductType,
    ) -> Result<Vec<CostLineItem>, InvoicingError> {
        let records = self
            .store
            .get_cost_line_items(&self.customer_id, product, &self.month)
            .await?;
        CostLineItem::from_records(records)
    }

    pub async fn asset_assignments(
        &self,
        product: ProductType,
    ) -> Result<AssetAssignments, InvoicingError> {
        let settings = self
            .store
            .get_asset_settings(&self.customer_id, product)
            .await?;
        Ok(AssetAssignments::new(settings))
    }

    pub async fn credit_ledger(
        &self,
        product: ProductType,
        account_keys: &[String],
    ) -> Result<CreditLedger, InvoicingError> {
        let records = self
            .store
            .get_credits(&self.customer_id, product, &self.month)
            .await?;
        CreditLedger::load(records, self.month, account_keys)
    }

    /// Append the month's manual adjustments of `product` to `rows`.
    pub async fn append_adjustments(
        &self,
        product: ProductType,
        rows: &mut Vec<InvoiceRow>,
    ) -> Result<(), InvoicingError> {
        let adjustments = self
            .store
            .get_adjustments(&self.customer_id, product, &self.month)
            .await?;
        append_adjustments(product, rows, &adjustments, &self.entities)
    }
}

/// Computes the invoice rows of one product type for one customer month.
#[async_trait]
pub trait ProductCalculator: Send + Sync {
    fn product(&self) -> ProductType;

    async fn calculate(&self, ctx: &WorkerContext) -> Result<ProductOutput, InvoicingError>;
}

/// The product workers started for every customer run.
pub struct CalculatorRegistry {
    calculators: Vec<Arc<dyn ProductCalculator>>,
}

impl Default for CalculatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        use crate::workers::{AwsCalculator, FlatCalculator, GoogleCloudCalculator};

        let calculators = ProductType::ALL
            .into_iter()
            .map(|product| -> Arc<dyn ProductCalculator> {
                match product {
                    ProductType::AmazonWebServices | ProductType::AmazonWebServicesStandalone => {
                        Arc::new(AwsCalculator::new(product))
                    }
                    ProductType::GoogleCloud | ProductType::GoogleCloudStandalone => {
                        Arc::new(GoogleCloudCalculator::new(product))
                    }
                    _ => Arc::new(FlatCalculator::new(product)),
                }
            })
            .collect();

        Self { calculators }
    }

    pub fn with_calculators(calculators: Vec<Arc<dyn ProductCalculator>>) -> Self {
        Self { calculators }
    }

    pub fn calculators(&self) -> &[Arc<dyn ProductCalculator>] {
        &self.calculators
    }

    pub fn calculator(&self, product: ProductType) -> Option<Arc<dyn ProductCalculator>> {
        self.calculators
            .iter()
            .find(|c| c.product() == product)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.calculators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calculators.is_empty()
    }
}

/// Asset settings of one product, keyed by asset id.
#[derive(Debug, Clone, Default)]
pub struct AssetAssignments {
    by_asset: HashMap<String, AssetSettings>,
}

impl AssetAssignments {
    pub fn new(settings: Vec<AssetSettings>) -> Self {
        Self {
            by_asset: settings
                .into_iter()
                .map(|s| (s.asset_id.clone(), s))
                .collect(),
        }
    }

    pub fn get(&self, asset_id: &str) -> Option<&AssetSettings> {
        self.by_asset.get(asset_id)
    }

    /// The settings and entity an asset is billed to. Unassigned assets and
    /// unknown entities are configuration errors.
    pub fn resolve<'a>(
        &'a self,
        ctx: &'a WorkerContext,
        asset_id: &str,
    ) -> Result<(&'a AssetSettings, &'a Entity), InvoicingError> {
        let settings = self.by_asset.get(asset_id).ok_or_else(|| {
            InvoicingError::Configuration(format!(
                "{}: asset settings not found on customer {}",
                asset_id, ctx.customer_id
            ))
        })?;
        let entity_id = settings.entity_id.as_deref().ok_or_else(|| {
            InvoicingError::Configuration(format!(
                "{}: unassigned asset on customer {}",
                asset_id, ctx.customer_id
            ))
        })?;
        Ok((settings, ctx.entity(entity_id)?))
    }
}

/// Order in which Flexsave rows are emitted for one entity and bucket.
const FLEXSAVE_ROW_ORDER: [CostClassification; 7] = [
    CostClassification::FlexsaveComputeNegation,
    CostClassification::FlexsaveSagemakerNegation,
    CostClassification::FlexsaveRdsNegation,
    CostClassification::FlexsaveManagementCost,
    CostClassification::FlexsaveRdsCharges,
    CostClassification::FlexsaveCredits,
    CostClassification::FlexsaveAdjustment,
];

pub const FLEXSAVE_DESCRIPTION: &str = "Flexsave";

/// Flexsave amounts per entity and bucket, reported on their own rows.
#[derive(Debug, Clone, Default)]
pub struct FlexsaveTotals {
    totals: BTreeMap<(String, Option<String>), [Decimal; 7]>,
}

impl FlexsaveTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        entity_id: &str,
        bucket_id: Option<&str>,
        classification: CostClassification,
        amount: Decimal,
    ) {
        let Some(slot) = FLEXSAVE_ROW_ORDER.iter().position(|c| *c == classification) else {
            return;
        };
        let amounts = self
            .totals
            .entry((entity_id.to_string(), bucket_id.map(str::to_string)))
            .or_insert([Decimal::ZERO; 7]);
        amounts[slot] += amount;
    }

    pub fn rows(&self, product: ProductType, is_final: bool) -> Vec<InvoiceRow> {
        let mut rows = Vec::new();
        for (slot, classification) in FLEXSAVE_ROW_ORDER.iter().enumerate() {
            let Some(details) = classification.flexsave_details() else {
                continue;
            };
            for ((entity_id, bucket_id), amounts) in &self.totals {
                if amounts[slot].is_zero() {
                    continue;
                }
                rows.push(InvoiceRow::adjustment(
                    product,
                    FLEXSAVE_DESCRIPTION,
                    details,
                    amounts[slot],
                    "USD",
                    entity_id,
                    bucket_id.clone(),
                    is_final,
                ));
            }
        }
        rows
    }
}

/// Where the credit consumption of one allocation key is shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRoute {
    pub entity_id: String,
    pub batch: CreditBatchKey,
}

#[derive(Debug, Default)]
struct CreditBatch {
    consumed: Decimal,
    discount: Decimal,
}

/// Credit rows for everything consumed in `allocations`, batched per entity,
/// credit and [`CreditBatchKey`]. Discounted redemptions are followed by their
/// "(Adjustment for Discount)" row.
pub fn credit_rows<F>(
    product: ProductType,
    ledger: &CreditLedger,
    allocations: &AllocationLedger,
    is_final: bool,
    route: F,
) -> Vec<InvoiceRow>
where
    F: Fn(&str) -> Option<CreditRoute>,
{
    let mut batches: BTreeMap<(String, String, CreditBatchKey), CreditBatch> = BTreeMap::new();

    for (account_key, credits) in &allocations.credit_consumption {
        let Some(target) = route(account_key) else {
            continue;
        };
        for (credit_id, amount) in credits {
            batches
                .entry((target.entity_id.clone(), credit_id.clone(), target.batch.clone()))
                .or_default()
                .consumed += *amount;
        }
    }

    for (account_key, credits) in &allocations.discount_adjustments {
        let Some(target) = route(account_key) else {
            continue;
        };
        for (credit_id, amount) in credits {
            batches
                .entry((target.entity_id.clone(), credit_id.clone(), target.batch.clone()))
                .or_default()
                .discount += *amount;
        }
    }

    let mut rows = Vec::new();
    for ((entity_id, credit_id, batch), amounts) in batches {
        let name = ledger
            .get(&credit_id)
            .map_or(credit_id.as_str(), |c| c.name.as_str());

        if amounts.consumed > Decimal::ZERO {
            rows.push(InvoiceRow::credit(
                product,
                name,
                amounts.consumed,
                &entity_id,
                batch.bucket_id.clone(),
                batch.category.clone(),
                is_final,
            ));
        }
        if amounts.discount > Decimal::ZERO {
            rows.push(InvoiceRow::credit_discount_adjustment(
                product,
                name,
                amounts.discount,
                &entity_id,
                batch.bucket_id,
                batch.category,
                is_final,
            ));
        }
    }
    rows
}

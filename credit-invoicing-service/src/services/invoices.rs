//! Grouping validated product rows into logical invoices and finalizing them.

use crate::models::{
    Entity, InconclusiveReason, Invoice, InvoiceMonth, InvoiceRow, InvoicingMode, ProductStats,
    ProductType, RowRank,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

pub const BUCKET_HEADER_DESCRIPTION: &str = "Invoice Bucket";

/// A non-fatal problem found while building invoices, reported as a month error.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceProblem {
    pub product: Option<ProductType>,
    pub kind: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Check every row of a product against the customer's entities.
pub fn validate_rows(
    product: ProductType,
    rows: &[InvoiceRow],
    entities: &HashMap<String, Entity>,
) -> Result<(), InvoiceProblem> {
    for row in rows {
        let problem = match row.entity_id.as_deref() {
            None => Some(format!("{} row '{}' has no entity", product, row.details)),
            Some(entity_id) => match entities.get(entity_id) {
                None => Some(format!(
                    "{} row '{}' references unknown entity {}",
                    product, row.details, entity_id
                )),
                Some(entity) if !entity.active => Some(format!(
                    "{} row '{}' references inactive entity {}",
                    product, row.details, entity_id
                )),
                Some(_) => None,
            },
        };

        if let Some(message) = problem {
            return Err(InvoiceProblem {
                product: Some(product),
                kind: "invalid_row",
                message,
                details: serde_json::to_value(row).ok(),
            });
        }
    }
    Ok(())
}

/// Effective invoicing mode of one entity and product.
pub fn invoicing_mode(entity: &Entity, product: ProductType, rows: &[InvoiceRow]) -> InvoicingMode {
    let mut mode = entity.invoicing.mode;

    if product.lacks_buckets() && mode == InvoicingMode::Custom {
        mode = InvoicingMode::Group;
    }

    // Marketplace rows always go to their own invoice, even when the
    // account has no other spend.
    if product == ProductType::AmazonWebServices && rows.iter().any(|r| !r.category.is_empty()) {
        mode = InvoicingMode::Custom;
    }

    mode
}

/// Builds the logical invoices of one customer run.
#[derive(Debug)]
pub struct InvoiceBuilder<'a> {
    month: InvoiceMonth,
    entities: &'a HashMap<String, Entity>,
    invoices: BTreeMap<String, Invoice>,
}

impl<'a> InvoiceBuilder<'a> {
    pub fn new(month: InvoiceMonth, entities: &'a HashMap<String, Entity>) -> Self {
        Self {
            month,
            entities,
            invoices: BTreeMap::new(),
        }
    }

    /// Add the rows of one entity and product. Rows must already be validated.
    pub fn add(&mut self, entity_id: &str, product: ProductType, rows: Vec<InvoiceRow>) {
        let entities = self.entities;
        let Some(entity) = entities.get(entity_id) else {
            return;
        };

        match invoicing_mode(entity, product, &rows) {
            InvoicingMode::Single => self.push_rows(entity_id.to_string(), entity, rows),
            InvoicingMode::Group => {
                self.push_rows(format!("{}-{}", entity_id, product), entity, rows)
            }
            InvoicingMode::Custom => {
                for row in rows {
                    self.push_bucket_row(entity, product, row);
                }
            }
        }
    }

    fn push_rows(&mut self, key: String, entity: &Entity, rows: Vec<InvoiceRow>) {
        if rows.is_empty() {
            return;
        }
        self.invoice_entry(key, entity).rows.extend(rows);
    }

    fn push_bucket_row(&mut self, entity: &Entity, product: ProductType, row: InvoiceRow) {
        let bucket_id = row
            .bucket_id
            .clone()
            .or_else(|| entity.invoicing.default_bucket.as_ref().map(|b| b.id.clone()))
            .unwrap_or_default();

        let mut bucket_key = bucket_id.clone();
        if !row.category.is_empty() {
            bucket_key = format!("{}_{}", bucket_key, row.category);
        }
        let key = format!("{}-{}", entity.id, bucket_key);

        let is_new = !self.invoices.contains_key(&key);
        let invoice = self.invoice_entry(key, entity);

        if is_new {
            if let Some(bucket) = entity.bucket(&bucket_id).filter(|b| !b.name.is_empty()) {
                let mut name = bucket.name.clone();
                if !row.category.is_empty() {
                    name = format!("{}_{}", name, row.category);
                }
                invoice.rows.push(bucket_header(product, &name, &row.currency, entity, &bucket.id));
            }
        }

        invoice.rows.push(row);
    }

    fn invoice_entry(&mut self, key: String, entity: &Entity) -> &mut Invoice {
        let month = self.month;
        self.invoices.entry(key.clone()).or_insert_with(|| Invoice {
            key,
            entity_id: entity.id.clone(),
            product: ProductType::AmazonWebServices,
            month,
            details: month.covering_label(),
            currency: String::new(),
            rows: Vec::new(),
            is_final: false,
            inconclusive_reason: None,
            expire_by: None,
        })
    }

    pub fn into_invoices(self) -> Vec<Invoice> {
        self.invoices.into_values().collect()
    }
}

fn bucket_header(
    product: ProductType,
    name: &str,
    currency: &str,
    entity: &Entity,
    bucket_id: &str,
) -> InvoiceRow {
    InvoiceRow {
        description: BUCKET_HEADER_DESCRIPTION.to_string(),
        details: name.to_string(),
        details_suffix: None,
        tags: Vec::new(),
        quantity: 0,
        unit_price: Decimal::ZERO,
        currency: currency.to_string(),
        total: Decimal::ZERO,
        rank: RowRank::BucketHeader,
        product,
        is_final: true,
        entity_id: Some(entity.id.clone()),
        bucket_id: Some(bucket_id.to_string()),
        category: String::new(),
    }
}

/// Thresholds applied when finalizing invoices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizePolicy {
    pub low_cost_threshold: Decimal,
    pub non_final_expiry: Duration,
}

/// Set product, currency, `final` and hold reason of a grouped invoice.
///
/// Returns a problem when the invoice mixes product types; such invoices
/// must not be written.
pub fn finalize(
    invoice: &mut Invoice,
    policy: &FinalizePolicy,
    now: DateTime<Utc>,
) -> Result<(), InvoiceProblem> {
    let Some(first) = invoice.rows.first() else {
        return Ok(());
    };
    invoice.product = first.product;
    invoice.currency = first.currency.clone();

    let mut is_final = true;
    let mut currency_error = false;
    let mut type_error = false;

    for row in &invoice.rows {
        is_final = is_final && row.is_final;
        type_error = type_error || row.product != invoice.product;
        currency_error = currency_error
            || (row.rank != RowRank::Adjustment && row.currency != invoice.currency);
    }

    invoice.inconclusive_reason = None;

    if invoice.total() <= policy.low_cost_threshold
        && is_final
        && !invoice.product.skips_low_cost_hold()
    {
        is_final = false;
        invoice.inconclusive_reason = Some(InconclusiveReason::LowCost);
    }

    if currency_error {
        tracing::warn!(invoice_key = %invoice.key, "Invoice has multiple currencies");
        is_final = false;
        invoice.inconclusive_reason = Some(InconclusiveReason::CurrencyError);
    }

    invoice.is_final = is_final;
    invoice.expire_by = (!is_final).then(|| now + policy.non_final_expiry);

    if type_error {
        return Err(InvoiceProblem {
            product: None,
            kind: "invoice",
            message: format!("invoice {} has multiple product types", invoice.key),
            details: Some(serde_json::json!({
                "invoice_key": invoice.key,
                "entity_id": invoice.entity_id,
            })),
        });
    }

    Ok(())
}

/// Fold one invoice into the per-product statistics of the run.
pub fn accumulate_stats(stats: &mut BTreeMap<ProductType, ProductStats>, invoice: &Invoice) {
    let mut has_credit = false;
    let mut has_adjustment = false;

    for row in &invoice.rows {
        let entry = stats.entry(row.product).or_default();
        entry.total += row.total;
        match row.rank {
            RowRank::Credit => {
                has_credit = true;
                entry.credits += row.total;
            }
            RowRank::Adjustment => {
                has_adjustment = true;
                entry.adjustments += row.total;
            }
            RowRank::BucketHeader | RowRank::LineItem => {}
        }
    }

    let entry = stats.entry(invoice.product).or_default();
    entry.num_invoices += 1;
    if has_credit {
        entry.num_credits += 1;
    }
    if has_adjustment {
        entry.num_adjustments += 1;
    }
}

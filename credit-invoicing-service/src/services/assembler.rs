//! Ordering, folding, correcting and chunking invoice rows.

use crate::error::InvoicingError;
use crate::models::{
    quantity_and_value, CustomerSettings, Entity, Invoice, InvoiceAdjustment, InvoiceDocument,
    InvoiceRow, ProductType, RowRank,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use tracing::info;
use uuid::Uuid;

/// Totals strictly inside `(-MIN_TOTAL, MIN_TOTAL)` count as zero.
pub const MIN_TOTAL: Decimal = dec!(0.01);

/// The one adjustment description that is capped by the entity's outstanding spend.
pub const FLEXSAVE_SAVINGS_DESCRIPTION: &str = "Flexsave Savings";

pub const CORRECTION_DETAILS: &str = "Correction";

/// Rank ascending, then total descending. Stable, so equal rows keep their
/// original order.
pub fn sort_rows(rows: &mut [InvoiceRow]) {
    rows.sort_by(|a, b| {
        a.product
            .cmp(&b.product)
            .then_with(|| a.rank.cmp(&b.rank))
            .then_with(|| b.total.cmp(&a.total))
    });
}

/// Append one adjustment-rank row per manual adjustment.
///
/// A "Flexsave Savings" adjustment on an entity that already has credit rows
/// is capped so it never takes the entity's running total below zero, and is
/// dropped when credits already cover the spend.
pub fn append_adjustments(
    product: ProductType,
    rows: &mut Vec<InvoiceRow>,
    adjustments: &[InvoiceAdjustment],
    entities: &HashMap<String, Entity>,
) -> Result<(), InvoicingError> {
    for adjustment in adjustments {
        if !entities.contains_key(&adjustment.entity_id) {
            return Err(InvoicingError::Configuration(format!(
                "invalid entity {} for invoice adjustment {}",
                adjustment.entity_id, adjustment.id
            )));
        }

        if adjustment.amount.is_zero() {
            continue;
        }

        let mut amount = adjustment.amount;

        if adjustment.description == FLEXSAVE_SAVINGS_DESCRIPTION {
            let entity_rows = rows
                .iter()
                .filter(|r| r.entity_id.as_deref() == Some(adjustment.entity_id.as_str()));
            let (running_total, has_credits) = entity_rows.fold(
                (Decimal::ZERO, false),
                |(total, credits), row| (total + row.total, credits || row.rank == RowRank::Credit),
            );

            if has_credits {
                if running_total.abs() < MIN_TOTAL {
                    info!(
                        entity_id = %adjustment.entity_id,
                        adjustment_id = %adjustment.id,
                        "Skipping Flexsave Savings adjustment, spend is covered by credits"
                    );
                    continue;
                }
                if running_total > Decimal::ZERO {
                    amount = amount.max(-running_total);
                }
            }
        }

        rows.push(InvoiceRow::adjustment(
            product,
            &adjustment.description,
            &adjustment.details,
            amount,
            &adjustment.currency,
            &adjustment.entity_id,
            None,
            adjustment.is_final,
        ));
    }

    Ok(())
}

/// Builds the final row layout of logical invoices and splits oversized ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceAssembler {
    max_line_items: usize,
    max_invoice_rows: usize,
}

impl InvoiceAssembler {
    pub fn new(max_line_items: usize, max_invoice_rows: usize) -> Self {
        Self {
            max_line_items,
            max_invoice_rows: max_invoice_rows.max(1),
        }
    }

    /// A customer setting can raise the overflow threshold but never lower it.
    pub fn for_customer(
        default_max_line_items: usize,
        settings: &CustomerSettings,
        max_invoice_rows: usize,
    ) -> Self {
        let max_line_items = settings
            .max_line_items
            .map_or(default_max_line_items, |m| m.max(default_max_line_items));
        Self::new(max_line_items, max_invoice_rows)
    }

    pub fn max_line_items(&self) -> usize {
        self.max_line_items
    }

    pub fn max_invoice_rows(&self) -> usize {
        self.max_invoice_rows
    }

    /// Order the rows, fold overflowing line items and add a near-zero
    /// correction where needed. The invoice total is unchanged except for
    /// the correction row.
    pub fn assemble(&self, invoice: &mut Invoice) {
        let mut rows = std::mem::take(&mut invoice.rows);
        sort_rows(&mut rows);
        rows = self.fold_overflow(rows, &invoice.currency);

        if let Some(correction) = near_zero_correction(invoice, &rows) {
            rows.push(correction);
        }

        invoice.rows = rows;
    }

    /// Once `max_line_items` untagged line items of a product have been kept,
    /// further untagged line items of that product are summed into one
    /// "Additional ..." row placed right after the product's line items.
    pub fn fold_overflow(&self, rows: Vec<InvoiceRow>, currency: &str) -> Vec<InvoiceRow> {
        let mut output = Vec::with_capacity(rows.len());
        let mut extras: BTreeMap<ProductType, (Decimal, Option<String>, InvoiceRow)> =
            BTreeMap::new();
        let mut kept: HashMap<ProductType, usize> = HashMap::new();

        for row in rows {
            let folds = row.rank == RowRank::LineItem
                && !row.is_tagged()
                && row.product.overflow_details().is_some()
                && kept.get(&row.product).copied().unwrap_or(0) >= self.max_line_items;

            if folds {
                let entry = extras
                    .entry(row.product)
                    .or_insert_with(|| (Decimal::ZERO, None, row.clone()));
                entry.0 += row.total;
                if entry.1.is_none() {
                    entry.1 = row.details_suffix.clone();
                }
                continue;
            }

            if row.rank == RowRank::LineItem && !row.is_tagged() {
                *kept.entry(row.product).or_default() += 1;
            }
            output.push(row);
        }

        for (product, (sum, details_suffix, template)) in extras {
            if sum.abs() < MIN_TOTAL {
                continue;
            }
            let Some(details) = product.overflow_details() else {
                continue;
            };

            let (quantity, unit_price) = quantity_and_value(1, sum);
            let extras_row = InvoiceRow {
                description: product.description().to_string(),
                details: details.to_string(),
                details_suffix,
                tags: Vec::new(),
                quantity,
                unit_price,
                currency: currency.to_string(),
                total: sum,
                rank: RowRank::LineItem,
                product,
                is_final: template.is_final,
                entity_id: template.entity_id,
                bucket_id: template.bucket_id,
                category: template.category,
            };

            let position = output
                .iter()
                .rposition(|r| r.product == product && r.rank <= RowRank::LineItem)
                .map_or_else(
                    || {
                        output
                            .iter()
                            .position(|r| r.product > product)
                            .unwrap_or(output.len())
                    },
                    |i| i + 1,
                );
            output.insert(position, extras_row);
        }

        output
    }

    /// Split rows into physical chunks. Invoices below the ceiling stay whole.
    pub fn chunk(&self, rows: &[InvoiceRow]) -> Vec<Vec<InvoiceRow>> {
        if rows.len() < self.max_invoice_rows {
            return vec![rows.to_vec()];
        }
        rows.chunks(self.max_invoice_rows)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Physical documents for one logical invoice. Chunked invoices share a
    /// fresh group id.
    pub fn documents(
        &self,
        invoice: &Invoice,
        run_id: Uuid,
        customer_id: &str,
        created_utc: DateTime<Utc>,
    ) -> Vec<InvoiceDocument> {
        let chunks = self.chunk(&invoice.rows);
        let group_id = (invoice.rows.len() >= self.max_invoice_rows).then(Uuid::new_v4);

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, rows)| InvoiceDocument {
                document_id: Uuid::new_v4(),
                run_id,
                customer_id: customer_id.to_string(),
                entity_id: invoice.entity_id.clone(),
                invoice_key: invoice.key.clone(),
                month: invoice.month,
                product: invoice.product,
                details: invoice.details.clone(),
                currency: invoice.currency.clone(),
                is_final: invoice.is_final,
                inconclusive_reason: invoice.inconclusive_reason,
                expire_by: invoice.expire_by,
                group_id,
                chunk_index: index as i32,
                rows,
                created_utc,
            })
            .collect()
    }
}

/// The row that moves a near-zero AWS or GCP total just outside the zero band.
pub fn near_zero_correction(invoice: &Invoice, rows: &[InvoiceRow]) -> Option<InvoiceRow> {
    if !invoice.product.is_near_zero_corrected() {
        return None;
    }

    let total: Decimal = rows.iter().map(|r| r.total).sum();
    if total.abs() >= MIN_TOTAL {
        return None;
    }

    let has_credits = rows.iter().any(|r| r.rank == RowRank::Credit);
    let target = if has_credits || total < Decimal::ZERO {
        -MIN_TOTAL
    } else {
        MIN_TOTAL
    };

    let is_final = invoice.is_final && invoice.inconclusive_reason.is_none();
    let mut row = InvoiceRow::adjustment(
        invoice.product,
        invoice.product.description(),
        CORRECTION_DETAILS,
        target - total,
        &invoice.currency,
        &invoice.entity_id,
        None,
        is_final,
    );
    row.bucket_id = rows.iter().find_map(|r| r.bucket_id.clone());
    Some(row)
}

/// Rebuild logical invoices from stored documents. Chunks of one group are
/// concatenated in chunk-index order.
pub fn reassemble_chunks(documents: Vec<InvoiceDocument>) -> Vec<Invoice> {
    let mut standalone = Vec::new();
    let mut groups: BTreeMap<Uuid, Vec<InvoiceDocument>> = BTreeMap::new();

    for document in documents {
        match document.group_id {
            Some(group_id) => groups.entry(group_id).or_default().push(document),
            None => standalone.push(document),
        }
    }

    let mut invoices: Vec<Invoice> = standalone.into_iter().map(into_invoice).collect();

    for (_, mut chunks) in groups {
        chunks.sort_by_key(|d| d.chunk_index);
        let mut chunks = chunks.into_iter();
        let Some(first) = chunks.next() else {
            continue;
        };
        let mut invoice = into_invoice(first);
        for chunk in chunks {
            invoice.rows.extend(chunk.rows);
        }
        invoices.push(invoice);
    }

    invoices.sort_by(|a, b| a.key.cmp(&b.key));
    invoices
}

fn into_invoice(document: InvoiceDocument) -> Invoice {
    Invoice {
        key: document.invoice_key,
        entity_id: document.entity_id,
        product: document.product,
        month: document.month,
        details: document.details,
        currency: document.currency,
        rows: document.rows,
        is_final: document.is_final,
        inconclusive_reason: document.inconclusive_reason,
        expire_by: document.expire_by,
    }
}

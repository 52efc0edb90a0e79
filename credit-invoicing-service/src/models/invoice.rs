//! Invoice rows, manual adjustments and invoice documents.

use crate::models::{InvoiceMonth, ProductType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Ordering class of an invoice row. Declaration order is sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRank {
    BucketHeader,
    LineItem,
    Credit,
    Adjustment,
}

impl RowRank {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BucketHeader => "bucket_header",
            Self::LineItem => "line_item",
            Self::Credit => "credit",
            Self::Adjustment => "adjustment",
        }
    }
}

/// Split a signed amount into a signed quantity and a non-negative unit price.
pub fn quantity_and_value(quantity: i64, amount: Decimal) -> (i64, Decimal) {
    if amount < Decimal::ZERO {
        (-quantity, -amount)
    } else {
        (quantity, amount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRow {
    pub description: String,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_suffix: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub currency: String,
    pub total: Decimal,
    pub rank: RowRank,
    pub product: ProductType,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub entity_id: Option<String>,
    pub bucket_id: Option<String>,
    /// Marketplace sub-bucketing: "", `marketplace_aggregate` or `marketplace_<hash>`.
    #[serde(default)]
    pub category: String,
}

impl InvoiceRow {
    /// A spend row for `amount`, split into quantity and unit price.
    pub fn line_item(
        product: ProductType,
        details: impl Into<String>,
        amount: Decimal,
        currency: &str,
        entity_id: &str,
        bucket_id: Option<String>,
        is_final: bool,
    ) -> Self {
        let (quantity, unit_price) = quantity_and_value(1, amount);
        Self {
            description: product.description().to_string(),
            details: details.into(),
            details_suffix: None,
            tags: Vec::new(),
            quantity,
            unit_price,
            currency: currency.to_string(),
            total: Decimal::from(quantity) * unit_price,
            rank: RowRank::LineItem,
            product,
            is_final,
            entity_id: Some(entity_id.to_string()),
            bucket_id,
            category: String::new(),
        }
    }

    /// A negative credit redemption row netting `consumed` against spend.
    pub fn credit(
        product: ProductType,
        credit_name: &str,
        consumed: Decimal,
        entity_id: &str,
        bucket_id: Option<String>,
        category: String,
        is_final: bool,
    ) -> Self {
        Self {
            description: format!("{} Credit", product.description()),
            details: credit_name.to_string(),
            details_suffix: None,
            tags: Vec::new(),
            quantity: -1,
            unit_price: consumed,
            currency: "USD".to_string(),
            total: -consumed,
            rank: RowRank::Credit,
            product,
            is_final,
            entity_id: Some(entity_id.to_string()),
            bucket_id,
            category,
        }
    }

    /// Gives back the discount part of a credit redemption. Credits are
    /// consumed at list price while spend is billed discounted.
    pub fn credit_discount_adjustment(
        product: ProductType,
        credit_name: &str,
        amount: Decimal,
        entity_id: &str,
        bucket_id: Option<String>,
        category: String,
        is_final: bool,
    ) -> Self {
        Self {
            description: format!("{} Credit", product.description()),
            details: format!("{} (Adjustment for Discount)", credit_name),
            quantity: 1,
            unit_price: amount,
            total: amount,
            ..Self::credit(
                product,
                credit_name,
                amount,
                entity_id,
                bucket_id,
                category,
                is_final,
            )
        }
    }

    /// An adjustment-rank row for a signed amount.
    #[allow(clippy::too_many_arguments)]
    pub fn adjustment(
        product: ProductType,
        description: &str,
        details: &str,
        amount: Decimal,
        currency: &str,
        entity_id: &str,
        bucket_id: Option<String>,
        is_final: bool,
    ) -> Self {
        let (quantity, unit_price) = quantity_and_value(1, amount);
        Self {
            description: description.to_string(),
            details: details.to_string(),
            details_suffix: None,
            tags: Vec::new(),
            quantity,
            unit_price,
            currency: currency.to_string(),
            total: amount,
            rank: RowRank::Adjustment,
            product,
            is_final,
            entity_id: Some(entity_id.to_string()),
            bucket_id,
            category: String::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }
}

/// A manually entered invoice adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceAdjustment {
    pub id: String,
    pub product: ProductType,
    pub entity_id: String,
    pub description: String,
    pub details: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(rename = "final", default = "default_true")]
    pub is_final: bool,
}

fn default_true() -> bool {
    true
}

/// Why an invoice was held back as non-final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconclusiveReason {
    #[serde(rename = "lowCost")]
    LowCost,
    #[serde(rename = "currencyError")]
    CurrencyError,
}

impl InconclusiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowCost => "lowCost",
            Self::CurrencyError => "currencyError",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "lowCost" => Some(Self::LowCost),
            "currencyError" => Some(Self::CurrencyError),
            _ => None,
        }
    }
}

impl fmt::Display for InconclusiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A logical invoice for one entity/bucket/category key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub key: String,
    pub entity_id: String,
    pub product: ProductType,
    pub month: InvoiceMonth,
    pub details: String,
    pub currency: String,
    pub rows: Vec<InvoiceRow>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub inconclusive_reason: Option<InconclusiveReason>,
    pub expire_by: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn total(&self) -> Decimal {
        self.rows.iter().map(|r| r.total).sum()
    }
}

/// One physical invoice record. Oversized invoices are written as several
/// documents sharing a `group_id`, ordered by `chunk_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDocument {
    pub document_id: Uuid,
    pub run_id: Uuid,
    pub customer_id: String,
    pub entity_id: String,
    pub invoice_key: String,
    pub month: InvoiceMonth,
    pub product: ProductType,
    pub details: String,
    pub currency: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub inconclusive_reason: Option<InconclusiveReason>,
    pub expire_by: Option<DateTime<Utc>>,
    pub group_id: Option<Uuid>,
    pub chunk_index: i32,
    pub rows: Vec<InvoiceRow>,
    pub created_utc: DateTime<Utc>,
}

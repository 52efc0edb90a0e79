//! Daily cost line items produced by the analytics layer.

use crate::error::InvoicingError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a cost line item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClassification {
    Usage,
    /// Percentage-based partner charge, re-rated against contract intervals.
    PlpsCharge,
    FlexsaveComputeNegation,
    FlexsaveSagemakerNegation,
    FlexsaveRdsNegation,
    FlexsaveRdsCharges,
    FlexsaveManagementCost,
    FlexsaveCredits,
    FlexsaveAdjustment,
}

impl CostClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::PlpsCharge => "plps_charge",
            Self::FlexsaveComputeNegation => "flexsave_compute_negation",
            Self::FlexsaveSagemakerNegation => "flexsave_sagemaker_negation",
            Self::FlexsaveRdsNegation => "flexsave_rds_negation",
            Self::FlexsaveRdsCharges => "flexsave_rds_charges",
            Self::FlexsaveManagementCost => "flexsave_management_cost",
            Self::FlexsaveCredits => "flexsave_credits",
            Self::FlexsaveAdjustment => "flexsave_adjustment",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "usage" => Some(Self::Usage),
            "plps_charge" => Some(Self::PlpsCharge),
            "flexsave_compute_negation" => Some(Self::FlexsaveComputeNegation),
            "flexsave_sagemaker_negation" => Some(Self::FlexsaveSagemakerNegation),
            "flexsave_rds_negation" => Some(Self::FlexsaveRdsNegation),
            "flexsave_rds_charges" => Some(Self::FlexsaveRdsCharges),
            "flexsave_management_cost" => Some(Self::FlexsaveManagementCost),
            "flexsave_credits" => Some(Self::FlexsaveCredits),
            "flexsave_adjustment" => Some(Self::FlexsaveAdjustment),
            _ => None,
        }
    }

    pub fn is_flexsave(&self) -> bool {
        !matches!(self, Self::Usage | Self::PlpsCharge)
    }

    /// Flexsave negations are moved off the account row onto dedicated savings rows.
    pub fn is_flexsave_negation(&self) -> bool {
        matches!(
            self,
            Self::FlexsaveComputeNegation
                | Self::FlexsaveSagemakerNegation
                | Self::FlexsaveRdsNegation
                | Self::FlexsaveAdjustment
        )
    }

    /// Details text of the Flexsave row this classification is reported on.
    pub fn flexsave_details(&self) -> Option<&'static str> {
        match self {
            Self::FlexsaveComputeNegation => Some("DoiT Flexsave Compute Savings"),
            Self::FlexsaveSagemakerNegation => Some("DoiT Flexsave SageMaker Savings"),
            Self::FlexsaveRdsNegation => Some("DoiT Flexsave RDS Savings"),
            Self::FlexsaveManagementCost => Some("Customer incurred costs on Flexsave accounts"),
            Self::FlexsaveRdsCharges => Some("Flexsave RDS Charges"),
            Self::FlexsaveCredits => Some("AWS Credits for eligible Flexsave charges"),
            Self::FlexsaveAdjustment => Some("Flexsave Adjustments for Credits"),
            Self::Usage | Self::PlpsCharge => None,
        }
    }
}

impl fmt::Display for CostClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A cost line item as delivered by the analytics query layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLineItemRecord {
    pub asset_id: String,
    pub account_key: Option<String>,
    pub usage_date: NaiveDate,
    pub cost: Decimal,
    pub cost_type: String,
    pub service_id: Option<String>,
    pub sku_id: Option<String>,
    #[serde(default)]
    pub is_marketplace: bool,
    pub marketplace_descriptor: Option<String>,
    /// Contract discount multiplier, e.g. 0.9 for a 10% discount.
    pub discount: Option<Decimal>,
}

/// A validated cost line item. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CostLineItem {
    pub asset_id: String,
    pub account_key: String,
    pub date: NaiveDate,
    pub cost: Decimal,
    pub classification: CostClassification,
    /// `service/sku`, matched against credit scopes.
    pub resource: String,
    /// Marketplace service descriptor when the item is a marketplace purchase.
    pub marketplace: Option<String>,
    pub discount: Option<Decimal>,
}

impl CostLineItem {
    /// Validate the record at position `index` of the query result.
    pub fn from_record(index: usize, record: CostLineItemRecord) -> Result<Self, InvoicingError> {
        let classification = CostClassification::from_string(&record.cost_type).ok_or_else(|| {
            InvoicingError::DataQuality(format!(
                "unexpected cost classification '{}' in row[{}]",
                record.cost_type, index
            ))
        })?;

        let account_key = record
            .account_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                InvoicingError::DataQuality(format!("missing account key in row[{}]", index))
            })?;

        let marketplace = if record.is_marketplace {
            let descriptor = record
                .marketplace_descriptor
                .filter(|d| !d.trim().is_empty())
                .ok_or_else(|| {
                    InvoicingError::DataQuality(format!(
                        "marketplace row[{}] has no service descriptor",
                        index
                    ))
                })?;
            Some(descriptor)
        } else {
            None
        };

        if let Some(discount) = record.discount {
            if discount <= Decimal::ZERO || discount > Decimal::ONE {
                return Err(InvoicingError::DataQuality(format!(
                    "unexpected discount {} in row[{}], expected a proportion in (0, 1]",
                    discount, index
                )));
            }
        }

        let resource = format!(
            "{}/{}",
            record.service_id.unwrap_or_default(),
            record.sku_id.unwrap_or_default()
        );

        Ok(Self {
            asset_id: record.asset_id,
            account_key,
            date: record.usage_date,
            cost: record.cost,
            classification,
            resource,
            marketplace,
            discount: record.discount,
        })
    }

    /// Validate a whole query result and order it by date. Allocation is order
    /// sensitive, so ties keep the order the query layer returned.
    pub fn from_records(records: Vec<CostLineItemRecord>) -> Result<Vec<Self>, InvoicingError> {
        let mut items = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| Self::from_record(index, record))
            .collect::<Result<Vec<_>, _>>()?;
        items.sort_by_key(|item| item.date);
        Ok(items)
    }
}

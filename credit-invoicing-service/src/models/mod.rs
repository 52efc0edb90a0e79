//! Domain models for credit-invoicing-service.

mod contract;
mod cost;
mod credit;
mod entity;
mod invoice;
mod period;
mod product;
mod run;

pub use contract::{Contract, ContractChargeInterval};
pub use cost::{CostClassification, CostLineItem, CostLineItemRecord};
pub use credit::{Credit, CreditAlert, CreditAlertKind, CreditRecord, CreditUpdate, Utilization};
pub use entity::{
    AssetSettings, Bucket, CustomerSettings, Entity, EntityInvoicing, InvoicingMode,
    MarketplaceSettings,
};
pub use invoice::{
    quantity_and_value, InconclusiveReason, Invoice, InvoiceAdjustment, InvoiceDocument,
    InvoiceRow, RowRank,
};
pub use period::InvoiceMonth;
pub use product::ProductType;
pub use run::{
    InvoicingRun, MonthError, ProductInvoiceRows, ProductOutput, ProductStats, RunStatus,
    RunSummary,
};

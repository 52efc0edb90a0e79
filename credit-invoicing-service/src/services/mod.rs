//! Services module for credit-invoicing-service.

pub mod allocation;
pub mod assembler;
pub mod database;
pub mod invoices;
pub mod ledger;
pub mod marketplace;
pub mod memory;
pub mod metrics;
pub mod plps;
pub mod store;

pub use allocation::{allocate, Allocation, AllocationLedger, Charge};
pub use assembler::{reassemble_chunks, InvoiceAssembler};
pub use database::Database;
pub use invoices::{FinalizePolicy, InvoiceBuilder, InvoiceProblem};
pub use ledger::CreditLedger;
pub use marketplace::{MarketplaceMode, MarketplaceSplitter};
pub use memory::MemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_credit_consumed, record_error, record_plps_miss,
    record_run, record_worker_result,
};
pub use plps::PlpsRecalculator;
pub use store::{DynStore, InvoicingStore};

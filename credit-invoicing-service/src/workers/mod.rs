mod aws;
mod calculator;
mod coordinator;
mod flat;
mod gcp;

pub use aws::AwsCalculator;
pub use calculator::{
    credit_rows, AssetAssignments, CalculatorRegistry, CreditRoute, FlexsaveTotals,
    ProductCalculator, WorkerContext, SKIPPED_PRIORITY_ID,
};
pub use coordinator::{CoordinatorSettings, InvoicingCoordinator};
pub use flat::FlatCalculator;
pub use gcp::GoogleCloudCalculator;

#[path = "helmsman/server/convergence.rs"]
mod convergence;
#[path = "helmsman/server/operator_records.rs"]
mod operator_records;
#[path = "helmsman/store/records.rs"]
mod records;

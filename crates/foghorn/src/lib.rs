//! Status reconciliation: pipeline activity in, commit statuses and PR
//! comments out.

pub mod controller;
pub mod queue;
pub mod report;
pub mod reporter;

pub use controller::{Controller, DEFAULT_WORKERS};
pub use queue::WorkQueue;

//! Core building blocks: run parameters, partitioning, the batch registry and
//! its job tracker, result merging, cost accounting and cancellation. These
//! are consumed by the high-level `api` module.
pub mod cancel;
pub mod cost;
pub mod merge;
pub mod params;
pub mod partition;
pub mod registry;
pub mod tracker;

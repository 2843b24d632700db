//! Recurring regional KPI reporting pipeline.
//!
//! Pulls pre-computed analytical query results from a shared query-execution
//! service, reshapes them into per-market and per-vehicle-type KPI rows and
//! publishes the result as a file on a notification channel.
//!
//! The load-bearing pieces are [`client`], which drives batches of
//! asynchronous query jobs to completion by polling, and [`table`], which
//! extracts scalars from result tables whose schemas drift across markets.
//! Everything else is per-report glue in the bins.

pub mod client;
pub mod markets;
pub mod period;
pub mod slack;
pub mod table;

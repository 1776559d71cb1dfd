//! Delivery pipeline core: ledger, priority queue, rate limiter, ingestion,
//! interactions and recovery.

pub mod ingress;
pub mod interaction;
pub mod ledger;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod recovery;
pub mod routing;
pub mod source;

pub use pipeline::Pipeline;

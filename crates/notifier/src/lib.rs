//! Delivery side of the pipeline: the channel boundary, the webhook
//! transport, retry policy and the worker pool.

pub mod channel;
pub mod retry;
pub mod runtime;
pub mod webhook;
pub mod worker;

pub use channel::{ChannelClient, DeliveryResult};
pub use runtime::DeliveryRuntime;
pub use worker::{DeliveryWorker, DispatchOutcome, WorkerPool};

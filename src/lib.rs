//! Rate-limited evaluation of a vision classifier against annotated tongue images.
//!
//! Tasks flow through [`dispatcher::TaskDispatcher`], which gates every
//! classifier call through a shared [`rate_limiter::RateLimiter`]; completed
//! records are scored by [`metrics_engine::MetricsEngine`].

pub mod client;
pub mod collector;
pub mod config;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod label;
pub mod metrics_engine;
pub mod parser;
pub mod rate_limiter;
pub mod report;
pub mod types;

pub use collector::EvaluationRun;
pub use dispatcher::TaskDispatcher;
pub use metrics_engine::{MetricsEngine, MetricsReport};
pub use rate_limiter::RateLimiter;
pub use types::{EvaluationRecord, Indicator, Task, TaskOutcome};

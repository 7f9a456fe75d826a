//! # ticker-worker
//!
//! The broker-facing half of the ticker collector: the AMQP scheduler/
//! consumer, the batched fetch engine, the HTTP quote-source adapter, the
//! health-check endpoint, and the process wiring (`kernel`) that assembles
//! them from a `ticker_core::Settings` snapshot.
//!
//! `ticker-core` knows nothing about AMQP, HTTP, or axum; this crate is
//! where those concrete adapters live and get wired to the core traits.

pub mod fetch_engine;
pub mod health;
pub mod http_quote_source;
pub mod kernel;
pub mod queue;
pub mod scheduler;

pub use fetch_engine::{is_catastrophic, FetchEngine, FetchEngineConfig, FetchResult};
pub use http_quote_source::HttpQuoteSource;
pub use kernel::Kernel;
pub use queue::{AmqpQueue, Delivery, DeliveryHandle, JobMessage, JobQueue};
pub use scheduler::Scheduler;

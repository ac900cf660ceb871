#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Tickscan-Data
//! Adaptive market micro-event detection over streaming equity ticks.
//!
//! Ticks enter a [`ChannelRouter`](router::ChannelRouter) that validates them and shards them
//! by symbol onto per-kind worker pools. Each worker applies the tick to its symbol's
//! [`SymbolState`](state::SymbolState) and runs the session [`HighLowDetector`], the
//! multi-window [`TrendDetector`] and the [`SurgeDetector`] against thresholds resolved for the
//! current market period, price bucket and volatility regime.
//!
//! Detected [`DetectionEvent`]s are published on an [`EgressBus`](egress::EgressBus),
//! fanned out by the [`Broadcaster`](broadcast::Broadcaster) to every connection whose
//! subscriptions match, and accumulated for periodic flushing to a
//! [`StorageSink`](sink::StorageSink).
//!
//! The [`Pipeline`](pipeline::Pipeline) wires all of this together:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tickscan_data::{
//!     config::ScanConfig,
//!     event::{Tick, TickKind},
//!     pipeline::Pipeline,
//!     sink::LogSink,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = Pipeline::new(ScanConfig::default(), Arc::new(LogSink)).unwrap();
//!
//!     let tick = Tick::new("AAPL", TickKind::Trade, 190.25, 300.0, chrono::Utc::now());
//!     pipeline.ingest(tick).unwrap();
//!
//!     pipeline.shutdown().await;
//! }
//! ```
//!
//! [`HighLowDetector`]: detector::HighLowDetector
//! [`TrendDetector`]: detector::TrendDetector
//! [`SurgeDetector`]: detector::SurgeDetector
//! [`DetectionEvent`]: event::DetectionEvent

/// Batched, rate limited fan-out of [`DetectionEvent`](event::DetectionEvent)s to subscribed
/// connections through an [`EventTransport`](broadcast::EventTransport).
pub mod broadcast;

/// Validated [`ScanConfig`](config::ScanConfig) and its per-component sections.
pub mod config;

/// [`Detector`](detector::Detector) trait and the HighLow, Trend and Surge detectors.
pub mod detector;

/// Per-category in-process publish/subscribe bus for detection events.
pub mod egress;

/// All [`Error`](std::error::Error)s generated in Tickscan-Data.
pub mod error;

/// Shared data types: [`Tick`](event::Tick), [`DetectionEvent`](event::DetectionEvent) and
/// the threshold context events are detected under.
pub mod event;

/// Runs every detector over a tick under the symbol's lock.
pub mod orchestrator;

/// [`Pipeline`](pipeline::Pipeline) wiring and ordered shutdown.
pub mod pipeline;

/// Ingress validation, priority load shedding and per-kind worker pools.
pub mod router;

/// Periodic persistence of counters and events to a [`StorageSink`](sink::StorageSink).
pub mod sink;

/// Per-symbol detection state and bounded price history.
pub mod state;

/// Stream utilities used by feed consumers.
pub mod streams;

/// Copy-on-write inverted index from symbol and event kind to subscribers.
pub mod subscription;

/// Adaptive threshold resolution and the exchange trading clock.
pub mod threshold;

/// JSON frames for the tick feed and subscriber connections.
pub mod wire;

#[cfg(test)]
pub(crate) mod test_utils;

//! Async STTP subscriber for streaming time-series telemetry.
//!
//! This crate implements the client side of the Streaming Telemetry
//! Transport Protocol: a long-lived, stateful subscriber that connects
//! to a publisher, negotiates operational modes, requests measurement
//! streams by filter expression, and delivers decoded measurements to
//! the host application. Transient failures are absorbed by an
//! exponential-back-off reconnection supervisor.
//!
//! # Example
//!
//! ```ignore
//! use sttp::{Config, DataSubscriber, SubscriptionInfo};
//!
//! #[tokio::main]
//! async fn main() -> sttp::Result<()> {
//!     let subscriber = DataSubscriber::new(Config::default());
//!
//!     subscriber.on_status_message(|msg| println!("[status] {msg}"));
//!     subscriber.on_new_measurements(|measurements| {
//!         for m in measurements {
//!             println!("{} @ {:?} = {}", m.signal_id, m.time(), m.value);
//!         }
//!     });
//!
//!     subscriber.connect("localhost:7165").await?;
//!     subscriber
//!         .subscribe(SubscriptionInfo::with_filter(
//!             "FILTER ActiveMeasurements WHERE SignalType = 'FREQ'",
//!         ))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     subscriber.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Wire stack
//!
//! The command channel carries length-prefixed frames over TCP; data
//! packets arrive on the same channel or on an optional AES-encrypted
//! UDP data channel. Measurements travel in the compact per-measurement
//! form ([`compact`]) or through the stateful TSSC delta/XOR codec
//! ([`tssc`]); runtime ids resolve to signal GUIDs through the
//! [`SignalIndexCache`], of which two coexist to allow mid-stream
//! swaps.

pub mod cache;
pub mod compact;
mod error;
pub mod guid;
pub mod measurement;
pub mod protocol;
pub mod subscriber;
pub mod ticks;
pub mod tssc;
pub mod wire;

pub use cache::SignalIndexCache;
pub use error::{Error, Result};
pub use measurement::{Measurement, MeasurementMetadata, MeasurementRegistry};
pub use subscriber::{
    BufferBlock, Config, ConnectionState, DataSubscriber, RetryPolicy, SubscriptionInfo,
};
pub use ticks::Ticks;

//! link-core: Layered point-to-point links and a perfect failure detector.
//!
//! This crate provides:
//! - Fair-Loss Link: one TCP connection per message, best effort
//! - Stubborn Link: retransmits every message forever over a Fair-Loss Link
//! - Perfect Link: exactly-once delivery and per-tag demultiplexing
//! - Perfect Failure Detector: heartbeat exchange over a Perfect Link
//!
//! Every layer implements [`Link`]; [`LinkStack`] wires them together.

pub mod address;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod fair_loss;
pub mod message;
pub mod perfect;
pub mod process_id;
pub mod retention;
pub mod stack;
pub mod stubborn;
pub mod tasks;

pub use address::{AddressTable, DEFAULT_SERVICE_PORT};
pub use config::{
    ConfigError, DetectorConfig, FairLossConfig, LinkConfig, PerfectConfig, StubbornConfig,
};
pub use detector::{DetectorEvent, DetectorState, PerfectFailureDetector};
pub use dispatch::{Delivery, DeliveryReceiver, Link, handle_events, spawn_dispatch};
pub use error::{LinkError, Result};
pub use fair_loss::FairLossLink;
pub use message::{FrameError, Message, Tag, TagError, WireFrame};
pub use perfect::{Deduplicator, PerfectLink, Route, TagRouter};
pub use process_id::{ProcessId, ProcessIdError};
pub use retention::{KeepAll, MaxAge, Retention};
pub use stack::LinkStack;
pub use stubborn::{PendingSet, StubbornLink};
pub use tasks::TaskGroup;
